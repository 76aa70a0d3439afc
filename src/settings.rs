use config::{Config, Environment};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fmt;
use std::path::PathBuf;

use crate::rotation::Identity;

/// Prefix under which the CI system exposes plugin settings (`PLUGIN_NAMESPACE`, ...)
const ENV_PREFIX: &str = "PLUGIN";

const DEFAULT_NAMESPACE: &str = "harness-delegate-ng";
const DEFAULT_SERVICE_ACCOUNT: &str = "harness-delegate-ng";
const DEFAULT_HARNESS_URL: &str = "app.harness.io";
const DEFAULT_SECRET_DESCRIPTION: &str = "created by automation";
const DEFAULT_SECRET_MANAGER: &str = "harnessSecretManager";
const DEFAULT_OUTPUT_FILE: &str = "DRONE_OUTPUT.env";
const DEFAULT_SECRET_OUTPUT_FILE: &str = "HARNESS_OUTPUT_SECRET.env";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    /// A required setting was not provided. Carries the un-prefixed name.
    #[error("{0} required")]
    Missing(&'static str),
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("failed to read configuration: {0}")]
    Source(#[from] config::ConfigError),
}

/// Raw values as read from the environment, before defaults and validation
#[derive(Debug, Default, Deserialize)]
struct RawSettings {
    namespace: Option<String>,
    service_account_name: Option<String>,
    harness_account: Option<String>,
    harness_org: Option<String>,
    harness_project: Option<String>,
    harness_url: Option<String>,
    harness_platform_api_key: Option<String>,
    secret_identifier: Option<String>,
    secret_tags: Option<String>,
    secret_description: Option<String>,
    secret_manager: Option<String>,
    delete_k8s_secrets: Option<String>,
    kubeconfig: Option<String>,
}

#[derive(Clone)]
pub struct HarnessSettings {
    pub account: String,
    pub org: Option<String>,
    pub project: Option<String>,
    /// Host (or full base URL) of the Harness gateway
    pub url: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct SecretSettings {
    pub identifier: String,
    pub tags: BTreeMap<String, String>,
    pub description: String,
    pub manager: String,
}

#[derive(Debug, Clone)]
pub struct OutputSettings {
    /// Destination for non-sensitive step outputs
    pub path: PathBuf,
    /// Destination for sensitive step outputs, redacted by the CI system
    pub secret_path: PathBuf,
}

/// Fully resolved and validated settings for one rotation run.
///
/// Built once at startup; every required value is checked here so a
/// misconfiguration aborts the run before any cluster or Harness call.
#[derive(Debug, Clone)]
pub struct Settings {
    pub namespace: String,
    pub service_account_name: String,
    pub harness: HarnessSettings,
    pub secret: SecretSettings,
    pub delete_k8s_secrets: bool,
    pub kubeconfig: Option<PathBuf>,
    pub output: OutputSettings,
}

impl fmt::Debug for HarnessSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HarnessSettings")
            .field("account", &self.account)
            .field("org", &self.org)
            .field("project", &self.project)
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

impl Settings {
    /// Load settings from the process environment
    pub fn new() -> Result<Self, SettingsError> {
        Self::load(None)
    }

    /// Load settings from an explicit variable map instead of the process environment
    pub fn from_vars(vars: HashMap<String, String>) -> Result<Self, SettingsError> {
        Self::load(Some(vars))
    }

    fn load(vars: Option<HashMap<String, String>>) -> Result<Self, SettingsError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(false)
                    .ignore_empty(true)
                    .source(vars.clone()),
            )
            .build()?;

        let raw: RawSettings = config.try_deserialize()?;

        let lookup = |key: &str| -> Option<String> {
            let value = match &vars {
                Some(vars) => vars.get(key).cloned(),
                None => env::var(key).ok(),
            };
            value.filter(|v| !v.is_empty())
        };

        let output = OutputSettings {
            path: lookup("DRONE_OUTPUT")
                .unwrap_or_else(|| DEFAULT_OUTPUT_FILE.to_string())
                .into(),
            secret_path: lookup("HARNESS_OUTPUT_SECRET_FILE")
                .unwrap_or_else(|| DEFAULT_SECRET_OUTPUT_FILE.to_string())
                .into(),
        };

        Self::resolve(raw, output)
    }

    fn resolve(raw: RawSettings, output: OutputSettings) -> Result<Self, SettingsError> {
        let account = raw
            .harness_account
            .ok_or(SettingsError::Missing("HARNESS_ACCOUNT"))?;
        let api_key = raw
            .harness_platform_api_key
            .ok_or(SettingsError::Missing("HARNESS_PLATFORM_API_KEY"))?;

        let service_account_name = raw
            .service_account_name
            .unwrap_or_else(|| DEFAULT_SERVICE_ACCOUNT.to_string());

        let tags = match raw.secret_tags.as_deref() {
            Some(json) => parse_tags(json)?,
            None => BTreeMap::new(),
        };

        let delete_k8s_secrets = match raw.delete_k8s_secrets.as_deref() {
            Some(value) => parse_flag(value).ok_or_else(|| SettingsError::Invalid {
                key: "DELETE_K8S_SECRETS",
                reason: format!("expected a boolean, got '{}'", value),
            })?,
            None => false,
        };

        Ok(Self {
            namespace: raw
                .namespace
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            secret: SecretSettings {
                identifier: raw
                    .secret_identifier
                    .unwrap_or_else(|| service_account_name.clone()),
                tags,
                description: raw
                    .secret_description
                    .unwrap_or_else(|| DEFAULT_SECRET_DESCRIPTION.to_string()),
                manager: raw
                    .secret_manager
                    .unwrap_or_else(|| DEFAULT_SECRET_MANAGER.to_string()),
            },
            service_account_name,
            harness: HarnessSettings {
                account,
                org: raw.harness_org,
                project: raw.harness_project,
                url: raw
                    .harness_url
                    .unwrap_or_else(|| DEFAULT_HARNESS_URL.to_string()),
                api_key,
            },
            delete_k8s_secrets,
            kubeconfig: raw.kubeconfig.map(PathBuf::from),
            output,
        })
    }

    /// The immutable identity context the rotation runs under
    pub fn identity(&self) -> Identity {
        Identity {
            namespace: self.namespace.clone(),
            service_account: self.service_account_name.clone(),
            account: self.harness.account.clone(),
            org: self.harness.org.clone(),
            project: self.harness.project.clone(),
            secret_identifier: self.secret.identifier.clone(),
            secret_manager: self.secret.manager.clone(),
            tags: self.secret.tags.clone(),
            description: self.secret.description.clone(),
        }
    }
}

/// Parse the secret tags, given as a JSON object of string values
fn parse_tags(json: &str) -> Result<BTreeMap<String, String>, SettingsError> {
    serde_json::from_str(json).map_err(|e| SettingsError::Invalid {
        key: "SECRET_TAGS",
        reason: format!("expected a JSON object of strings: {}", e),
    })
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
