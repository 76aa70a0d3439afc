use anyhow::{Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use std::path::Path;
use tracing::debug;

use super::{ClusterError, SecretBackend};

/// Build a Kubernetes client
///
/// Uses the kubeconfig at `kubeconfig` when given, otherwise infers the
/// configuration (in-cluster service account first, then `~/.kube/config`).
pub async fn connect(kubeconfig: Option<&Path>) -> Result<Client> {
    // Install default CryptoProvider for rustls (required for kube-rs HTTPS connections)
    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let config = match kubeconfig {
        Some(path) => {
            debug!("Loading kubeconfig from {}", path.display());
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("Failed to load kubeconfig")?
        }
        None => kube::Config::infer()
            .await
            .context("Failed to infer Kubernetes configuration")?,
    };

    Client::try_from(config).context("Failed to create Kubernetes client")
}

/// `SecretBackend` talking to a real API server
pub struct KubeSecretBackend {
    kube_client: Client,
}

impl KubeSecretBackend {
    pub fn new(kube_client: Client) -> Self {
        Self { kube_client }
    }

    fn secrets(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.kube_client.clone(), namespace)
    }
}

/// Map a kube error onto the cluster error taxonomy, keeping the API status when there is one
fn cluster_error(resource: &str, error: kube::Error) -> ClusterError {
    match error {
        kube::Error::Api(ae) => ClusterError::Api {
            status: ae.code,
            resource: resource.to_string(),
            message: ae.message,
        },
        other => ClusterError::Client {
            resource: resource.to_string(),
            source: other,
        },
    }
}

#[async_trait]
impl SecretBackend for KubeSecretBackend {
    async fn get(&self, namespace: &str, name: &str) -> Result<Secret, ClusterError> {
        self.secrets(namespace)
            .get(name)
            .await
            .map_err(|e| cluster_error(name, e))
    }

    async fn list(&self, namespace: &str) -> Result<Vec<Secret>, ClusterError> {
        let list = self
            .secrets(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| cluster_error(&format!("secrets in namespace {}", namespace), e))?;
        Ok(list.items)
    }

    async fn create(&self, namespace: &str, secret: &Secret) -> Result<(), ClusterError> {
        let name = secret.metadata.name.as_deref().unwrap_or_default();
        self.secrets(namespace)
            .create(&PostParams::default(), secret)
            .await
            .map(|_| ())
            .map_err(|e| cluster_error(name, e))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        self.secrets(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|e| cluster_error(name, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::error::ErrorResponse;

    #[test]
    fn test_api_error_keeps_status_and_resource() {
        let err = cluster_error(
            "svc-a-1700000000",
            kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: "secrets \"svc-a-1700000000\" already exists".to_string(),
                reason: "AlreadyExists".to_string(),
                code: 409,
            }),
        );

        match err {
            ClusterError::Api {
                status,
                resource,
                message,
            } => {
                assert_eq!(status, 409);
                assert_eq!(resource, "svc-a-1700000000");
                assert!(message.contains("already exists"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_non_api_error_has_no_status() {
        let decode_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = cluster_error("svc-a", kube::Error::SerdeError(decode_error));
        assert_eq!(err.status(), None);
        assert!(err.to_string().contains("svc-a"));
    }

    #[tokio::test]
    async fn test_connect_with_missing_kubeconfig_fails() {
        let result = connect(Some(Path::new("/nonexistent/kubeconfig"))).await;
        assert!(result.is_err());
    }
}
