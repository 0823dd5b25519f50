//! Standalone protocol server.
//!
//! Loads TOML configuration (path as the first argument, defaults
//! otherwise), wires the context together, and runs the listener until
//! SIGINT or SIGTERM, then drains under the shutdown deadline.

use realm_protocol::config::NetworkConfig;
use realm_protocol::error::Result;
use realm_protocol::service::server::{serve, ServerContext};
use realm_protocol::store::MemoryAccountStore;
use realm_protocol::utils::logging::init_logging;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => NetworkConfig::from_file(path)?,
        None => NetworkConfig::from_env()?,
    };
    config.validate_strict()?;

    let _log_guard = init_logging(&config.logging)?;
    info!(app = %config.logging.app_name, "Starting protocol server");

    let store = Arc::new(MemoryAccountStore::new());
    let ctx = ServerContext::new(config, store);

    let shutdown = ctx.shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.cancel();
    });

    serve(ctx).await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received CTRL+C, shutting down");
}
