//! Start command implementation.

use crate::capture::Capture;
use crate::coord::store::CoordStore;
use crate::core::config::Config;
use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// Start a capture server.
#[derive(Args, Debug)]
pub struct StartArgs {
    // No additional arguments; configuration is handled globally.
}

fn init_tracing(default_level: &str) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}

/// Run the start command with the given config path.
pub async fn run_start(config_path: &Path) -> Result<()> {
    let config = Config::from_file(config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    config.validate().context("invalid configuration")?;
    init_tracing(&config.telemetry.log_level);

    let store = CoordStore::new();
    let capture = Capture::new(config, store)
        .await
        .context("failed to create capture")?;

    let cancel = CancellationToken::new();
    let signal_capture = capture.clone();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("shutdown signal received (SIGINT)");
            let _ = signal_capture.drain().await;
            signal_capture.async_close();
            signal_cancel.cancel();
        }
    });

    capture.run(cancel).await?;
    Ok(())
}
