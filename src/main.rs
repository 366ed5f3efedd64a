use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::prelude::*;

use relaydb::{App, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Setup tracing/logging system.
    tracing_subscriber::registry()
        // Filter spans based on the RUST_LOG env var.
        .with(tracing_subscriber::EnvFilter::from_default_env())
        // Send a copy of all spans to stdout in compact form.
        .with(
            tracing_subscriber::fmt::layer()
                .with_thread_names(true)
                .with_target(false)
                .with_level(true)
                .with_ansi(true),
        )
        // Install this registry as the global tracing registry.
        .try_init()
        .context("error initializing logging/tracing system")?;

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.yaml".to_string());
    let config = Arc::new(Config::from_file(&config_path)?);
    tracing::info!(
        port = %config.port,
        db = %config.db_path,
        merkle_depth = %config.merkle_depth,
        peers = config.peers.len(),
        "starting relaydb",
    );

    let app_handle = App::new(config).await?.spawn();
    if let Err(err) = app_handle.await.context("error joining app handle").and_then(|res| res) {
        tracing::error!(error = ?err);
    }

    Ok(())
}
