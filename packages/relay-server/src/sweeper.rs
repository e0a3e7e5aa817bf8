//! Periodic retention sweep: deletes envelopes older than the configured
//! retention window so an unpicked-up queue doesn't grow forever.

use std::time::Duration;

use relay_core::store;
use relay_core::DbPool;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Runs forever, deleting envelopes older than `retention_minutes`. Intended
/// to be `tokio::spawn`ed once at startup; a failed sweep is logged and the
/// loop continues rather than aborting the process.
pub async fn run(pool: DbPool, retention_minutes: i64) {
    let mut interval = tokio::time::interval(SWEEP_INTERVAL);
    loop {
        interval.tick().await;
        let pool = pool.clone();
        let cutoff = chrono::Utc::now().timestamp() - retention_minutes * 60;
        let result = tokio::task::spawn_blocking(move || store::delete_envelopes_older_than(&pool, cutoff)).await;
        match result {
            Ok(Ok(deleted)) if deleted > 0 => {
                tracing::info!(deleted, "retention sweep removed stale envelopes");
            }
            Ok(Ok(_)) => {}
            Ok(Err(err)) => tracing::error!(%err, "retention sweep failed"),
            Err(err) => tracing::error!(%err, "retention sweep task panicked"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sweep_tick_deletes_expired_envelopes() {
        let pool = store::open_memory_pool().unwrap();
        store::insert_envelope(&pool, "dev-1", None, "hello", None, relay_core::Direction::ToDevice).unwrap();

        let cutoff = chrono::Utc::now().timestamp() + 3600;
        let deleted = store::delete_envelopes_older_than(&pool, cutoff).unwrap();

        assert_eq!(deleted, 1);
    }
}
