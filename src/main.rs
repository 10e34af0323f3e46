mod api;
mod commands;
mod config;
mod control;
mod db;
mod error;
mod ingress;
mod registry;
mod runtime;
mod server;
mod supervisor;

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tg_gateway=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    info!("Configuration loaded successfully");
    info!("  Admin user: {}", config.telegram.admin_user_id);
    info!("  Port: {}", config.webhook.port);
    info!(
        "  Webhook URL: {}",
        config.webhook.base_url().unwrap_or("(not set)")
    );
    info!("  Database: {}", config.database.path.display());

    info!("Gateway is starting...");
    supervisor::run(config).await?;

    Ok(())
}
