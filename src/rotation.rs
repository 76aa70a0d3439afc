//! Rotation of a service-account token into Harness.
//!
//! One rotation runs five stages in a fixed order:
//!
//! 1. Discover the cluster secrets already issued for the service account
//! 2. Issue a new token secret and wait until the token is populated
//! 3. Publish the token to the Harness secret manager
//! 4. Delete the secrets found in step 1 (only when enabled)
//! 5. Report the result
//!
//! Stale secrets are only deleted once the new token is confirmed published,
//! so a consumer of the Harness secret always holds a credential that still
//! exists in the cluster. Any failure before step 4 aborts the run without
//! touching the old secrets.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::cluster::{ClusterError, ClusterSecret, ClusterSecretStore, TokenRequest};
use crate::harness::{RemoteError, RemoteSecret, SecretManager, UpsertOutcome};

const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
const LABEL_ACCOUNT: &str = "harness_account";
const LABEL_ORG: &str = "harness_org";
const LABEL_PROJECT: &str = "harness_project";
const MANAGED_BY: &str = env!("CARGO_PKG_NAME");

/// Maximum length of a Kubernetes label value
const LABEL_VALUE_MAX_LEN: usize = 63;

/// Who and where a rotation runs for. Fixed for the whole run.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub namespace: String,
    pub service_account: String,
    pub account: String,
    pub org: Option<String>,
    pub project: Option<String>,
    /// Identifier of the Harness secret the token is published under
    pub secret_identifier: String,
    pub secret_manager: String,
    pub tags: BTreeMap<String, String>,
    pub description: String,
}

#[derive(Debug, thiserror::Error)]
pub enum RotationError {
    #[error("Failed to list existing secrets for service account '{service_account}'")]
    Discover {
        service_account: String,
        #[source]
        source: ClusterError,
    },
    #[error("Failed to issue service account token '{token_name}'")]
    Issue {
        token_name: String,
        #[source]
        source: ClusterError,
    },
    #[error("Failed to publish Harness secret '{identifier}'")]
    Publish {
        identifier: String,
        #[source]
        source: RemoteError,
    },
}

/// A stale secret that could not be deleted
#[derive(Debug)]
pub struct CleanupFailure {
    pub name: String,
    pub error: ClusterError,
}

#[derive(Debug, Default)]
pub struct CleanupSummary {
    pub deleted: Vec<String>,
    pub failed: Vec<CleanupFailure>,
}

/// Outcome of a successful rotation
pub struct RotationResult {
    /// Name of the cluster secret holding the new token
    pub token_secret_name: String,
    /// Harness secret the token was written to
    pub secret_identifier: String,
    pub token: String,
    pub upsert: UpsertOutcome,
    /// `None` when cleanup of stale secrets is disabled
    pub cleanup: Option<CleanupSummary>,
}

impl fmt::Debug for RotationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RotationResult")
            .field("token_secret_name", &self.token_secret_name)
            .field("secret_identifier", &self.secret_identifier)
            .field("token", &"<redacted>")
            .field("upsert", &self.upsert)
            .field("cleanup", &self.cleanup)
            .finish()
    }
}

/// Name of the token secret issued at `issued_at`
///
/// Embeds the unix timestamp so rotations at different seconds never collide.
pub fn token_name(service_account: &str, issued_at: DateTime<Utc>) -> String {
    format!("{}-{}", service_account, issued_at.timestamp())
}

/// Sanitize a string to be a valid Kubernetes label value
/// Replaces sequences of invalid characters with '--' and caps the length at 63
fn sanitize_label_value(value: &str) -> String {
    let mut result = String::new();
    let mut last_was_invalid = false;

    for ch in value.chars() {
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
            result.push(ch);
            last_was_invalid = false;
        } else if !last_was_invalid {
            result.push_str("--");
            last_was_invalid = true;
        }
    }

    result.truncate(LABEL_VALUE_MAX_LEN);
    result
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

impl TokenRequest {
    /// Token request for `identity`, labelled so the secret can be traced back to its Harness scope
    pub fn for_identity(identity: &Identity, issued_at: DateTime<Utc>) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string());
        labels.insert(
            LABEL_ACCOUNT.to_string(),
            sanitize_label_value(&identity.account),
        );
        if let Some(org) = &identity.org {
            labels.insert(LABEL_ORG.to_string(), sanitize_label_value(org));
        }
        if let Some(project) = &identity.project {
            labels.insert(LABEL_PROJECT.to_string(), sanitize_label_value(project));
        }

        Self {
            namespace: identity.namespace.clone(),
            service_account: identity.service_account.clone(),
            name: token_name(&identity.service_account, issued_at),
            labels,
        }
    }
}

/// Runs rotations against a cluster and a secret manager
pub struct Rotator {
    cluster: Arc<dyn ClusterSecretStore>,
    secret_manager: Arc<dyn SecretManager>,
    delete_stale: bool,
}

impl Rotator {
    pub fn new(
        cluster: Arc<dyn ClusterSecretStore>,
        secret_manager: Arc<dyn SecretManager>,
    ) -> Self {
        Self {
            cluster,
            secret_manager,
            delete_stale: false,
        }
    }

    /// Delete previously issued secrets once the new token is published
    pub fn with_cleanup(mut self, delete_stale: bool) -> Self {
        self.delete_stale = delete_stale;
        self
    }

    /// Run one rotation, naming the new token after `issued_at`
    pub async fn rotate(
        &self,
        identity: &Identity,
        issued_at: DateTime<Utc>,
    ) -> Result<RotationResult, RotationError> {
        // Discover
        let stale = self
            .cluster
            .list_secrets(&identity.namespace, &identity.service_account)
            .await
            .map_err(|source| RotationError::Discover {
                service_account: identity.service_account.clone(),
                source,
            })?;
        info!(
            "Found {} existing secrets for service account {}",
            stale.len(),
            identity.service_account
        );

        // Issue
        let request = TokenRequest::for_identity(identity, issued_at);
        let token = self
            .cluster
            .create_service_account_token(&request)
            .await
            .map_err(|source| {
                error!("Failed to issue token {}: {}", request.name, source);
                RotationError::Issue {
                    token_name: request.name.clone(),
                    source,
                }
            })?;
        info!("Created service account token: {}", request.name);

        // Publish
        let remote = RemoteSecret {
            identifier: identity.secret_identifier.clone(),
            value: token.clone(),
            tags: identity.tags.clone(),
            description: identity.description.clone(),
            secret_manager: identity.secret_manager.clone(),
            org: identity.org.clone(),
            project: identity.project.clone(),
        };
        let upsert = self
            .secret_manager
            .upsert(&remote)
            .await
            .map_err(|source| {
                error!(
                    "Failed to update Harness secret {}, keeping existing secrets: {}",
                    identity.secret_identifier, source
                );
                RotationError::Publish {
                    identifier: identity.secret_identifier.clone(),
                    source,
                }
            })?;
        info!(
            "Harness secret {} {}",
            identity.secret_identifier, upsert
        );

        // Cleanup
        let cleanup = if self.delete_stale {
            Some(
                self.delete_stale_secrets(&identity.namespace, &stale, &request.name)
                    .await,
            )
        } else {
            None
        };

        // Report
        Ok(RotationResult {
            token_secret_name: request.name,
            secret_identifier: identity.secret_identifier.clone(),
            token,
            upsert,
            cleanup,
        })
    }

    /// Best-effort deletion of `stale`; a failure is recorded and the next secret is tried
    async fn delete_stale_secrets(
        &self,
        namespace: &str,
        stale: &[ClusterSecret],
        issued: &str,
    ) -> CleanupSummary {
        let mut summary = CleanupSummary::default();

        // The issued secret can show up in discovery when a run is repeated within the same second
        for secret in stale.iter().filter(|s| s.name != issued) {
            match self.cluster.delete_secret(namespace, &secret.name).await {
                Ok(()) => {
                    info!("Deleted k8s secret: {}", secret.name);
                    summary.deleted.push(secret.name.clone());
                }
                Err(e) => {
                    warn!(
                        status = ?e.status(),
                        "Failed to delete k8s secret {}: {}",
                        secret.name,
                        e
                    );
                    summary.failed.push(CleanupFailure {
                        name: secret.name.clone(),
                        error: e,
                    });
                }
            }
        }

        summary
    }
}
