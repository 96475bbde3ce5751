//! Devbox SSH Gateway
//!
//! Terminates client SSH connections, identifies the target devbox from the
//! presented public key (or the username encoding), and transparently
//! proxies the session to the devbox pod over a second SSH connection.

mod auth;
mod config;
mod hostkey;
mod informer;
mod registry;
mod ssh;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use crate::config::GatewayConfig;
use crate::informer::Projector;
use crate::registry::Registry;

/// Devbox SSH Gateway - routes SSH sessions to devbox pods
#[derive(Parser, Debug)]
#[command(name = "devbox-gateway", version, about)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/devbox-gateway/gateway.toml")]
    config: PathBuf,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Override listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new(Level::DEBUG.to_string())
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    // Handle --generate-config
    if cli.generate_config {
        let config = GatewayConfig::default();
        let content = toml::to_string_pretty(&config)?;
        println!("{}", content);
        return Ok(());
    }

    // Load configuration
    let mut config = GatewayConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    // Apply CLI and environment overrides
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }
    if let Ok(seed) = std::env::var("SSH_HOST_KEY_SEED") {
        if !seed.is_empty() {
            config.host_key_seed = seed;
        }
    }

    info!("Starting devbox-gateway");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Devbox label: {}", config.label_selector());

    let config = Arc::new(config);

    // Create Kubernetes client (in-cluster, falling back to kubeconfig)
    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    // Create the routing registry and replay cluster state into it before
    // accepting any connections.
    let registry = Arc::new(Registry::new());
    let projector = Arc::new(Projector::new(config.clone(), registry.clone()));
    informer::start(client, projector)
        .await
        .context("Failed to sync informer caches")?;

    // Derive the shared host identity
    let host_key = hostkey::load(&config.host_key_seed).context("Failed to load host key")?;

    // Run SSH server
    ssh::run_server(config, registry, host_key).await?;

    Ok(())
}
