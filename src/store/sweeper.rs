//! Periodic removal of expired records.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{RecordStore, StoreError};
use crate::observability::metrics;

/// Default interval between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Reclaim expired records every `interval` until `token` fires.
///
/// A closed store ends the sweeper quietly; it is closed during teardown.
pub async fn run(
    store: RecordStore,
    interval: Duration,
    token: CancellationToken,
) -> Result<(), StoreError> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match store.reclaim_expired() {
            Ok(0) => {}
            Ok(n) => {
                tracing::debug!(reclaimed = n, remaining = store.len(), "Expired records reclaimed");
                metrics::record_reclaimed(n);
            }
            Err(StoreError::Closed) => break,
            Err(e) => return Err(e),
        }
        metrics::record_store_size(store.len());
    }

    tracing::debug!("Sweeper stopped");
    Ok(())
}
