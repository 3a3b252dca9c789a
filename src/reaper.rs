use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{now_ms, Engine};

/// Background task that drops cached slot lists older than the TTL.
/// Stale entries are never served; this only bounds memory.
pub async fn run_cache_sweeper(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let removed = sweep_cache(&engine);
        if removed > 0 {
            debug!("evicted {removed} stale availability entries");
        }
    }
}

fn sweep_cache(engine: &Engine) -> usize {
    let removed = engine.cache().evict_stale(now_ms(), engine.settings().cache_ttl_ms);
    metrics::counter!(crate::observability::CACHE_EVICTIONS_TOTAL).increment(removed as u64);
    removed
}

/// Background task that rewrites the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
