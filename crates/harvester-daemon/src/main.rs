//! Harvester Daemon
//!
//! Background process that harvests workspace files on demand and emits
//! change batches for the catalogue pipeline.

mod daemon;
mod handler;
mod signals;

use anyhow::Result;
use harvester_core::HarvesterConfig;
use tracing_subscriber::EnvFilter;

pub use daemon::Daemon;

/// Run the daemon
pub async fn run(config: HarvesterConfig) -> Result<()> {
    let daemon = Daemon::new(config)?;
    daemon.run().await
}

fn main() -> Result<()> {
    let config = HarvesterConfig::load();

    // RUST_LOG wins over the configured level
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with_target(false)
        .init();

    tracing::info!("Starting harvester daemon v{}", env!("CARGO_PKG_VERSION"));

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(config))
}
