//! Local runner for the check-in sync engine.
//!
//! Opens a [`CheckinService`] over an in-memory sheet using the environment
//! configuration, pulls on the configured interval and persists the store
//! when interrupted.

use checkin_sync::{init_tracing, CheckinService, MemorySheet, SyncConfig};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let mut config = SyncConfig::load()?;
    if config.pull_interval.is_none() {
        config = config.with_pull_interval(Duration::from_secs(60));
    }

    tracing::info!(
        min_interval_ms = config.min_interval.as_millis() as u64,
        batch_delay_ms = config.batch_delay.as_millis() as u64,
        snapshot = ?config.snapshot_path,
        "starting check-in sync"
    );

    let sheet = Arc::new(MemorySheet::new());
    let service = CheckinService::open(sheet, config).await?;

    let stats = service.sync_stats();
    tracing::info!(
        records = service.list_records().len(),
        pending = stats.pending_count,
        "store ready"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    service.shutdown().await?;
    let stats = service.sync_stats();
    tracing::info!(
        pending = stats.pending_count,
        requests = stats.scheduler.requests,
        quota_errors = stats.quota_errors(),
        "stopped"
    );

    Ok(())
}
