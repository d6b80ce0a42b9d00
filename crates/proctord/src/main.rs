//! Exam Proctoring Daemon - Main Entry Point

use std::path::PathBuf;

use anyhow::Context;
use proctord::config::DEFAULT_CONFIG_PATH;
use proctord::{init_logging, install_metrics, run, AppConfig};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = AppConfig::load(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;

    init_logging(&config.logging)?;
    info!("=== Exam Proctoring Engine v{} ===", env!("CARGO_PKG_VERSION"));
    info!(config = %path.display(), mode = ?config.run.mode, "starting");

    install_metrics(&config.metrics)?;
    run(config).await
}
