//! Castkeeper Daemon
//!
//! Background service that keeps creators' platform connections fresh and
//! serves access tokens over a local API.
//!
//! # Running
//!
//! ```bash
//! CASTKEEPER_TOKEN_ENCRYPTION_KEY=... cargo run -p castkeeper-daemon
//! # or after install:
//! castkeeperd
//! ```

use anyhow::Result;
use castkeeper_daemon::{api, config};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config()?;
    init_logging(&config.log_level);

    info!("Starting castkeeper daemon...");
    info!("Loaded configuration from {:?}", config.config_path);

    run_daemon(config).await
}

fn init_logging(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run_daemon(config: config::DaemonConfig) -> Result<()> {
    info!("Daemon starting on {:?}", config.socket_path);

    let state = api::ApiState::from_config(&config).inspect_err(|e| {
        error!("Failed to initialize daemon state: {:#}", e);
    })?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let scheduler = state.scheduler.clone().start(shutdown_rx);
    info!(
        "Health checks every {}h, renewing credentials within {} days of expiry",
        config.lifecycle.sweep_interval_hours, config.lifecycle.warning_threshold_days
    );

    let server_handle = api::start_server(&config.socket_path, state).await?;

    info!("Daemon running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping...");

    let _ = shutdown_tx.send(true);
    if let Err(e) = scheduler.await {
        error!("Health-check task ended abnormally: {}", e);
    }

    server_handle.stop().await?;

    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path)?;
        info!("Socket file removed");
    }

    info!("Daemon stopped");
    Ok(())
}
