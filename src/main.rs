//! SOL Gateway entry point
//!
//! 1. Loads `.env`, logging and configuration
//! 2. Binds the listening port (failure is fatal)
//! 3. Starts the upstream monitors and the broadcaster
//! 4. Serves HTTP/WS until SIGINT or SIGTERM, then drains and exits

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};

use sol_gateway::config::{self, init_logging};
use sol_gateway::core::Gateway;
use sol_gateway::server::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file (if it exists)
    dotenvy::dotenv().ok();
    init_logging();

    info!("=== SOL Gateway ===");

    let config = config::load_from_env()?;
    info!(
        port = config.port,
        instruments = ?config.instruments,
        wallets = config.balance_feed.wallets.len(),
        "Configuration loaded"
    );

    let address = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(address).await.map_err(|e| {
        error!(address = %address, error = %e, "Failed to bind listening port");
        e
    })?;

    let gateway = Arc::new(Gateway::from_config(config)?);
    let app = server::build_router(AppState::from_gateway(&gateway), axum::Router::new());

    gateway.serve(listener, app, shutdown_signal()).await?;

    info!("=== Shutdown complete ===");
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C signal");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(signal = "SIGINT", "Shutdown signal received"),
        _ = terminate => info!(signal = "SIGTERM", "Shutdown signal received"),
    }
}
