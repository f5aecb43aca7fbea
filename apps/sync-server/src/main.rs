//! # Folio Sync Server
//!
//! Line-protocol server that keeps a reader's devices on the same page.
//!
//! ## Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        Sync Server                                      │
//! │                                                                         │
//! │  Devices ───► TCP (8766) ───► SyncService ───► SQLite                  │
//! │                                   │                                     │
//! │                                   ▼                                     │
//! │                        Dispatcher · Deferred drain                      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The config file path may be passed as the first argument; otherwise the
//! platform config directory is used.

use std::path::PathBuf;

use tracing::info;
use tracing_subscriber::EnvFilter;

use folio_db::{Database, DbConfig};
use folio_sync::{SyncConfig, SyncService};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,folio=debug,sqlx=warn")),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    info!("Starting Folio sync server...");

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = SyncConfig::load(config_path)?;
    info!(
        addr = %config.server.bind_address(),
        db_path = %config.database.path.display(),
        "Configuration loaded"
    );

    // Open the database
    if let Some(parent) = config.database.path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Database::new(
        DbConfig::new(config.database.path.clone())
            .max_connections(config.database.max_connections),
    )
    .await?;
    info!("Database ready");

    // Start the sync service
    let service = SyncService::start(config, db.clone()).await?;
    info!(addr = %service.local_addr(), "Sync server running");

    shutdown_signal().await;

    service.shutdown().await;
    db.close().await;

    info!("Server shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown...");
}
