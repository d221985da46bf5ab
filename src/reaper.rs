use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{now_ms, Engine};
use crate::model::Ms;

const COMPLETER_INTERVAL: Duration = Duration::from_secs(30);
const COMPACTOR_INTERVAL: Duration = Duration::from_secs(60);

/// One completer pass: every approved booking that has ended becomes completed.
/// Returns how many were completed.
pub async fn complete_finished(engine: &Engine, now: Ms) -> usize {
    let mut completed = 0;
    for (booking_id, _asset_id) in engine.collect_finished_bookings(now) {
        match engine.complete_booking(booking_id, now).await {
            Ok(_) => completed += 1,
            // cancelled or deleted since collection
            Err(e) => debug!("completer skip {booking_id}: {e}"),
        }
    }
    completed
}

/// Background task that closes out finished bookings.
pub async fn run_completer(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(COMPLETER_INTERVAL);
    loop {
        interval.tick().await;
        let n = complete_finished(&engine, now_ms()).await;
        if n > 0 {
            info!(completed = n, "completed finished bookings");
        }
    }
}

/// Background task that compacts the WAL once enough appends have piled up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACTOR_INTERVAL);
    loop {
        interval.tick().await;
        if engine.wal_appends_since_compact().await < threshold {
            continue;
        }
        if let Err(e) = engine.compact_wal().await {
            warn!("WAL compaction failed: {e}");
        }
    }
}
