//! Caravel operator - mirrors workload images into a cluster-local registry
//!
//! Watches pods to learn which external images the cluster depends on,
//! mirrors those images into a local cache registry, and expires cached
//! copies once no pod has referenced them for the configured delay.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures::future;
use kube::{Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use caravel_common::crd::CachedImage;
use caravel_registry::{
    AnonymousKeychain, Keychain, OciTransferClient, RegistryClient, RegistryConfig, StaticKeychain,
};

mod controller_runner;

/// Caravel - Kubernetes-native image cache operator
#[derive(Parser, Debug)]
#[command(name = "caravel", version, about, long_about = None)]
struct Cli {
    /// Print the CachedImage CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// host:port of the cluster-local cache registry
    #[arg(
        long,
        env = "CARAVEL_REGISTRY_ENDPOINT",
        default_value = "localhost:5000"
    )]
    registry_endpoint: String,

    /// How long a cached image may stay unreferenced before it is
    /// deleted (e.g. "30m", "24h")
    #[arg(
        long,
        env = "CARAVEL_EXPIRY_DELAY",
        default_value = "24h",
        value_parser = humantime::parse_duration
    )]
    expiry_delay: Duration,

    /// Deadline for a single registry operation
    #[arg(
        long,
        env = "CARAVEL_REGISTRY_TIMEOUT",
        default_value = "60s",
        value_parser = humantime::parse_duration
    )]
    registry_timeout: Duration,

    /// Basic credentials for an upstream registry, as HOST=USER:PASSWORD
    /// (repeatable)
    #[arg(long = "registry-credential", value_name = "HOST=USER:PASSWORD")]
    registry_credentials: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        println!("{}", serde_yaml::to_string(&CachedImage::crd())?);
        return Ok(());
    }

    let client = Client::try_default().await?;
    ensure_crd_installed(&client).await?;

    let keychain = build_keychain(&cli.registry_credentials)?;
    let registry_config = RegistryConfig::new(&cli.registry_endpoint)
        .with_operation_timeout(cli.registry_timeout);
    let registry: Arc<dyn RegistryClient> =
        Arc::new(OciTransferClient::new(registry_config, keychain)?);

    tracing::info!(
        endpoint = %cli.registry_endpoint,
        expiry_delay = %humantime::format_duration(cli.expiry_delay),
        "starting caravel controllers"
    );

    let controllers =
        controller_runner::build_cache_controllers(client, registry, cli.expiry_delay);
    future::join_all(controllers).await;

    Ok(())
}

/// Ensure the CachedImage CRD is installed
///
/// The operator installs its own CRD on startup using server-side apply,
/// so the installed schema always matches the operator version.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Api, Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(caravel_common::FIELD_MANAGER).force();

    tracing::info!("Installing CachedImage CRD...");
    crds.patch(
        "cachedimages.caravel.dev",
        &params,
        &Patch::Apply(&CachedImage::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install CachedImage CRD: {}", e))?;

    Ok(())
}

/// Build the upstream keychain from repeated HOST=USER:PASSWORD flags
fn build_keychain(entries: &[String]) -> anyhow::Result<Arc<dyn Keychain>> {
    if entries.is_empty() {
        return Ok(Arc::new(AnonymousKeychain));
    }

    let mut keychain = StaticKeychain::new();
    for entry in entries {
        let (host, credentials) = entry.split_once('=').ok_or_else(|| {
            anyhow::anyhow!("invalid --registry-credential {entry:?}, expected HOST=USER:PASSWORD")
        })?;
        let (username, password) = credentials.split_once(':').ok_or_else(|| {
            anyhow::anyhow!("invalid --registry-credential {entry:?}, expected HOST=USER:PASSWORD")
        })?;
        keychain = keychain.with_basic(host, username, password);
    }
    Ok(Arc::new(keychain))
}
