mod kubernetes;
pub(crate) mod store;

pub use kubernetes::{connect, KubeSecretBackend};
pub use store::{PollPolicy, SecretStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use std::collections::BTreeMap;

/// Secret type Kubernetes populates with a service-account token
pub const SERVICE_ACCOUNT_TOKEN_TYPE: &str = "kubernetes.io/service-account-token";
/// Annotation binding a token secret to its service account
pub const SERVICE_ACCOUNT_NAME_ANNOTATION: &str = "kubernetes.io/service-account.name";
/// Data key the token controller writes the token under
pub const TOKEN_DATA_KEY: &str = "token";

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The API server answered with an error status
    #[error("Kubernetes API error on '{resource}' (status {status}): {message}")]
    Api {
        status: u16,
        resource: String,
        message: String,
    },
    /// The request never produced an API response (connection, TLS, decoding)
    #[error("Kubernetes request for '{resource}' failed: {source}")]
    Client {
        resource: String,
        #[source]
        source: kube::Error,
    },
    #[error("Token for secret '{name}' not populated after {attempts} attempts")]
    TokenNotReady { name: String, attempts: u32 },
    #[error("Token in secret '{name}' is not valid UTF-8")]
    InvalidToken { name: String },
}

impl ClusterError {
    /// HTTP status of the failed API call, if the API server answered
    pub fn status(&self) -> Option<u16> {
        match self {
            ClusterError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Kind of a cluster secret
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretType {
    Opaque,
    ServiceAccountToken,
    Other(String),
}

impl SecretType {
    fn from_type(type_: Option<&str>) -> Self {
        match type_ {
            None | Some("Opaque") => SecretType::Opaque,
            Some(SERVICE_ACCOUNT_TOKEN_TYPE) => SecretType::ServiceAccountToken,
            Some(other) => SecretType::Other(other.to_string()),
        }
    }
}

/// Metadata view of a secret in the cluster. Values are never carried here.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterSecret {
    pub name: String,
    pub type_: SecretType,
    pub creation_timestamp: Option<DateTime<Utc>>,
    pub data_keys: Vec<String>,
}

impl From<&Secret> for ClusterSecret {
    fn from(secret: &Secret) -> Self {
        Self {
            name: secret.metadata.name.clone().unwrap_or_default(),
            type_: SecretType::from_type(secret.type_.as_deref()),
            creation_timestamp: secret.metadata.creation_timestamp.as_ref().map(|t| t.0),
            data_keys: secret
                .data
                .as_ref()
                .map(|data| data.keys().cloned().collect())
                .unwrap_or_default(),
        }
    }
}

/// One token issuance attempt
#[derive(Debug, Clone, PartialEq)]
pub struct TokenRequest {
    pub namespace: String,
    pub service_account: String,
    /// Name of the token secret, unique per rotation
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

/// Raw secret operations against one cluster
///
/// Implementations perform I/O only. Conflict and not-found handling is left
/// to the caller, which sees them as `ClusterError::Api` with status 409/404.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Secret, ClusterError>;

    async fn list(&self, namespace: &str) -> Result<Vec<Secret>, ClusterError>;

    async fn create(&self, namespace: &str, secret: &Secret) -> Result<(), ClusterError>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;
}

/// Cluster-side operations the rotation depends on
#[async_trait]
pub trait ClusterSecretStore: Send + Sync {
    /// List secrets whose name contains `search` (case-insensitive).
    /// An empty `search` matches every secret in the namespace.
    async fn list_secrets(
        &self,
        namespace: &str,
        search: &str,
    ) -> Result<Vec<ClusterSecret>, ClusterError>;

    /// Create a service-account token secret and wait until the token is populated
    ///
    /// Creating a secret whose name already exists is not an error: issuance is
    /// idempotent by name and proceeds straight to polling.
    ///
    /// # Returns
    /// The token material
    async fn create_service_account_token(
        &self,
        request: &TokenRequest,
    ) -> Result<String, ClusterError>;

    /// Delete a secret. A secret that is already gone counts as deleted.
    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;
}
