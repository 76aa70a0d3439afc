use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use reqwest::Client;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cluster;
mod harness;
mod output;
mod rotation;
mod settings;

use cluster::{ClusterSecretStore, KubeSecretBackend, PollPolicy, SecretStore};
use harness::HarnessClient;
use output::OutputWriter;
use rotation::Rotator;
use settings::Settings;

/// Rotate a Kubernetes service-account token and publish it as a Harness secret.
///
/// Settings are read from `PLUGIN_*` environment variables.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
enum Commands {
    /// Issue a new token, publish it and clean up stale token secrets (default)
    Rotate,
    /// Check configuration for errors without contacting any service
    CheckConfig,
    /// List the secrets in the configured namespace
    #[command(visible_alias = "ls")]
    ListSecrets {
        /// Only show secrets whose name contains this string (case-insensitive)
        #[arg(long, default_value = "")]
        search: String,
    },
}

async fn cluster_store(settings: &Settings) -> Result<SecretStore> {
    let kube_client = cluster::connect(settings.kubeconfig.as_deref()).await?;
    Ok(SecretStore::new(
        Arc::new(KubeSecretBackend::new(kube_client)),
        PollPolicy::default(),
    ))
}

async fn rotate(settings: Settings) -> Result<()> {
    let identity = settings.identity();
    let store = cluster_store(&settings).await?;
    let harness = HarnessClient::new(
        Client::new(),
        &settings.harness.url,
        &settings.harness.account,
        &settings.harness.api_key,
    );

    let rotator =
        Rotator::new(Arc::new(store), Arc::new(harness)).with_cleanup(settings.delete_k8s_secrets);
    let result = rotator
        .rotate(&identity, Utc::now())
        .await
        .context("Rotation failed")?;

    OutputWriter::new(&settings.output).write(&result)?;

    if let Some(cleanup) = &result.cleanup {
        info!(
            deleted = cleanup.deleted.len(),
            failed = cleanup.failed.len(),
            "Stale secret cleanup finished"
        );
        for failure in &cleanup.failed {
            warn!(
                "Secret {} was not deleted and must be removed manually: {}",
                failure.name, failure.error
            );
        }
    }
    info!(
        token_secret = %result.token_secret_name,
        secret_identifier = %result.secret_identifier,
        outcome = %result.upsert,
        "Rotation complete"
    );
    Ok(())
}

async fn list_secrets(settings: Settings, search: &str) -> Result<()> {
    let store = cluster_store(&settings).await?;
    let secrets = store
        .list_secrets(&settings.namespace, search)
        .await
        .with_context(|| format!("Failed to list secrets in namespace {}", settings.namespace))?;

    if secrets.is_empty() {
        println!("No matching secrets in namespace '{}'.", settings.namespace);
        return Ok(());
    }

    for secret in secrets {
        let created = secret
            .creation_timestamp
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}\t{:?}\t{}\t[{}]",
            secret.name,
            secret.type_,
            created,
            secret.data_keys.join(", ")
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing for all commands
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Rotate) {
        Commands::Rotate => {
            let settings = Settings::new().context("Invalid configuration")?;
            rotate(settings).await
        }
        Commands::CheckConfig => {
            println!("Checking configuration...");
            match Settings::new() {
                Ok(settings) => {
                    println!("✓ Configuration is valid");
                    println!("{:#?}", settings);
                    Ok(())
                }
                Err(e) => {
                    eprintln!("✗ Configuration error: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::ListSecrets { search } => {
            let settings = Settings::new().context("Invalid configuration")?;
            list_secrets(settings, &search).await
        }
    }
}
