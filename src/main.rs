use std::path::PathBuf;

use anyhow::Context;
use herald_server::ServerConfig;
use herald_store::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting herald server");

    // Database path
    let db_path = match std::env::var("HERALD_DB_PATH") {
        Ok(path) => PathBuf::from(path),
        Err(_) => {
            let dir = dirs_home().join(".herald");
            std::fs::create_dir_all(&dir).context("failed to create database directory")?;
            dir.join("herald.db")
        }
    };

    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "Database opened");

    // The Prometheus recorder is installed once, before any metric is
    // touched, and its handle backs GET /metrics.
    let metrics_handle = herald_server::metrics::install_recorder();

    let config = ServerConfig::from_env();
    let handle = herald_server::start(config, db, Some(metrics_handle))
        .await
        .context("failed to start server")?;

    tracing::info!(port = handle.port, "Herald server ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("Shutting down");
    Ok(())
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
