//! # proxima-node
//!
//! One node of a proxima presence cluster.
//!
//! This binary:
//! - Scans for BLE advertisements (BlueZ, feature `bluetooth`)
//! - Runs the presence pipeline and fuses observations from every node
//! - Serves a read-only REST API with OpenAPI documentation
//! - Writes structured logs to file and stdout
//!
//! ## Running
//!
//! ```bash
//! # Development
//! cargo run --package proxima-node
//!
//! # Production
//! PROXIMA_ENV=production ./proxima-node
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::net::SocketAddr;

use anyhow::Context;
use proxima_core::Config;
use proxima_node::api;
use proxima_node::logging;
use proxima_node::state::{AppState, SharedState};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init(&logging::LogSettings::from_env())?;

    let config_path = Config::default_path();
    let config = Config::load_or_default(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;
    if !config_path.exists() {
        match config.save(&config_path) {
            Ok(()) => info!(path = %config_path.display(), "Wrote default configuration"),
            Err(e) => warn!(path = %config_path.display(), error = %e, "Could not write default configuration"),
        }
    }

    info!(
        instance_name = %config.instance_name,
        version = env!("CARGO_PKG_VERSION"),
        "Starting proxima-node"
    );

    let addr: SocketAddr = config
        .api
        .bind_address
        .parse()
        .with_context(|| format!("Invalid bind address '{}'", config.api.bind_address))?;

    let state = AppState::new(config)?.shared();
    let tasks = state.pipeline.start();
    start_radio(&state).await;

    let app = api::create_router(state.clone());
    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for task in tasks {
        task.abort();
    }
    info!("proxima-node stopped");
    Ok(())
}

/// Start BLE discovery and feed the pipeline. A missing adapter is logged;
/// the node keeps serving the API and aggregating remote observations.
#[cfg(feature = "bluetooth")]
async fn start_radio(state: &SharedState) {
    use proxima_core::radio::bluez::BluezScanner;

    let scanner = match BluezScanner::new().await {
        Ok(scanner) => scanner,
        Err(e) => {
            tracing::error!(error = %e, "Bluetooth unavailable, running without a radio");
            return;
        }
    };

    let (tx, rx) = tokio::sync::mpsc::channel(256);
    state.set_radio_available(true);
    let scanning = state.clone();
    tokio::spawn(async move {
        if let Err(e) = scanner.run(tx).await {
            tracing::error!(error = %e, "Bluetooth discovery failed");
        }
        scanning.set_radio_available(false);
    });
    tokio::spawn(state.pipeline.clone().run(rx));
}

#[cfg(not(feature = "bluetooth"))]
async fn start_radio(_state: &SharedState) {
    warn!("Built without the bluetooth feature, running without a radio");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
