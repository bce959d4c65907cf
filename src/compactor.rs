use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::engine::Engine;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background housekeeping: rewrites the WAL once enough appends have piled
/// up, and drops notification channels nobody listens to any more.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        tick(&engine, threshold).await;
    }
}

/// One housekeeping pass. Returns whether the WAL was compacted.
pub async fn tick(engine: &Engine, threshold: u64) -> bool {
    let before = engine.notify.channel_count();
    engine.notify.prune();
    let pruned = before.saturating_sub(engine.notify.channel_count());
    if pruned > 0 {
        debug!("pruned {pruned} idle notification channels");
    }
    compact_if_needed(engine, threshold).await
}

/// Compact when `threshold` appends have accumulated. Returns whether it ran.
pub async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
            info!("compacted WAL after {appends} appends");
            true
        }
        Err(e) => {
            tracing::error!("WAL compaction failed: {e}");
            false
        }
    }
}
