//! Harness secret manager integration.
//!
//! Secrets are written through the Harness NG v2 secrets API. The only
//! operation the rotation needs is an idempotent upsert, exposed through the
//! [`SecretManager`] trait so the orchestrator can be exercised without HTTP.

mod client;

pub use client::HarnessClient;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// Credentials were rejected (401/403)
    #[error("Harness rejected the API key (status {status}): {body}")]
    Auth { status: u16, body: String },
    /// The secret does not exist. Only used to drive the update-then-create fallback.
    #[error("Harness secret not found: {body}")]
    NotFound { body: String },
    #[error("Harness API error (status {status}): {body}")]
    Api { status: u16, body: String },
    #[error("Failed to reach Harness: {0}")]
    Transport(#[from] reqwest::Error),
}

/// A text secret to publish in Harness
#[derive(Clone, PartialEq)]
pub struct RemoteSecret {
    pub identifier: String,
    pub value: String,
    pub tags: BTreeMap<String, String>,
    pub description: String,
    /// Secret manager holding the value (e.g. `harnessSecretManager`)
    pub secret_manager: String,
    pub org: Option<String>,
    pub project: Option<String>,
}

impl fmt::Debug for RemoteSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteSecret")
            .field("identifier", &self.identifier)
            .field("value", &"<redacted>")
            .field("tags", &self.tags)
            .field("description", &self.description)
            .field("secret_manager", &self.secret_manager)
            .field("org", &self.org)
            .field("project", &self.project)
            .finish()
    }
}

/// Which half of the upsert wrote the secret
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Updated,
    Created,
}

impl fmt::Display for UpsertOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpsertOutcome::Updated => write!(f, "updated"),
            UpsertOutcome::Created => write!(f, "created"),
        }
    }
}

/// External secret manager the rotated token is published to
#[async_trait]
pub trait SecretManager: Send + Sync {
    /// Create the secret, or replace its value if it already exists
    ///
    /// Never returns `RemoteError::NotFound`.
    async fn upsert(&self, secret: &RemoteSecret) -> Result<UpsertOutcome, RemoteError>;
}
