use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{
    ClusterError, ClusterSecret, ClusterSecretStore, SecretBackend, TokenRequest,
    SERVICE_ACCOUNT_NAME_ANNOTATION, SERVICE_ACCOUNT_TOKEN_TYPE, TOKEN_DATA_KEY,
};

/// How long to wait for the token controller to populate a new token secret
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay between two reads of the secret
    pub interval: Duration,
    /// Total number of reads before giving up
    pub max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: 10,
        }
    }
}

/// `ClusterSecretStore` on top of a raw `SecretBackend`
pub struct SecretStore {
    backend: Arc<dyn SecretBackend>,
    poll: PollPolicy,
}

impl SecretStore {
    pub fn new(backend: Arc<dyn SecretBackend>, poll: PollPolicy) -> Self {
        Self { backend, poll }
    }

    fn token_secret(request: &TokenRequest) -> Secret {
        let mut annotations = BTreeMap::new();
        annotations.insert(
            SERVICE_ACCOUNT_NAME_ANNOTATION.to_string(),
            request.service_account.clone(),
        );

        Secret {
            metadata: ObjectMeta {
                name: Some(request.name.clone()),
                annotations: Some(annotations),
                labels: Some(request.labels.clone()),
                ..Default::default()
            },
            type_: Some(SERVICE_ACCOUNT_TOKEN_TYPE.to_string()),
            ..Default::default()
        }
    }

    /// Token material of a secret, if the token controller has populated it yet
    fn token_of(secret: &Secret, name: &str) -> Result<Option<String>, ClusterError> {
        let Some(bytes) = secret
            .data
            .as_ref()
            .and_then(|data| data.get(TOKEN_DATA_KEY))
        else {
            return Ok(None);
        };

        String::from_utf8(bytes.0.clone())
            .map(Some)
            .map_err(|_| ClusterError::InvalidToken {
                name: name.to_string(),
            })
    }

    async fn wait_for_token(&self, namespace: &str, name: &str) -> Result<String, ClusterError> {
        for attempt in 1..=self.poll.max_attempts {
            let secret = self.backend.get(namespace, name).await?;
            if let Some(token) = Self::token_of(&secret, name)? {
                debug!("Token for secret {} ready after {} attempt(s)", name, attempt);
                return Ok(token);
            }

            debug!(
                "Token for secret {} not populated yet (attempt {}/{})",
                name, attempt, self.poll.max_attempts
            );
            if attempt < self.poll.max_attempts {
                tokio::time::sleep(self.poll.interval).await;
            }
        }

        Err(ClusterError::TokenNotReady {
            name: name.to_string(),
            attempts: self.poll.max_attempts,
        })
    }
}

#[async_trait]
impl ClusterSecretStore for SecretStore {
    async fn list_secrets(
        &self,
        namespace: &str,
        search: &str,
    ) -> Result<Vec<ClusterSecret>, ClusterError> {
        let search = search.to_lowercase();
        let secrets = self.backend.list(namespace).await?;

        Ok(secrets
            .iter()
            .map(ClusterSecret::from)
            .filter(|secret| search.is_empty() || secret.name.to_lowercase().contains(&search))
            .collect())
    }

    async fn create_service_account_token(
        &self,
        request: &TokenRequest,
    ) -> Result<String, ClusterError> {
        let secret = Self::token_secret(request);

        match self.backend.create(&request.namespace, &secret).await {
            Ok(()) => info!("Service account token secret '{}' created", request.name),
            Err(ClusterError::Api { status: 409, .. }) => {
                info!(
                    "Service account token secret '{}' already exists, reusing it",
                    request.name
                );
            }
            Err(e) => return Err(e),
        }

        self.wait_for_token(&request.namespace, &request.name).await
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        match self.backend.delete(namespace, name).await {
            Ok(()) => Ok(()),
            Err(ClusterError::Api { status: 404, .. }) => {
                debug!("Secret {} already absent from namespace {}", name, namespace);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
