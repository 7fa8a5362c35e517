//! Periodic hard-delete of messages whose purge deadline has passed

use std::sync::Arc;
use std::time::Duration;

use supportdesk_shared::StoreResult;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::store::ChatStore;

/// One sweep against the current clock
pub async fn purge_once(store: &dyn ChatStore) -> StoreResult<u64> {
    store.purge_expired(OffsetDateTime::now_utc()).await
}

/// Run [`purge_once`] every `interval` until the runtime shuts down
pub fn spawn_purge_sweeper(store: Arc<dyn ChatStore>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // Skip the first immediate tick
        ticker.tick().await;

        tracing::info!(interval_secs = interval.as_secs(), "Message purge sweeper started");

        loop {
            ticker.tick().await;
            match purge_once(store.as_ref()).await {
                Ok(0) => tracing::debug!("Purge sweep found nothing to delete"),
                Ok(purged) => tracing::info!(purged, "Purged expired messages"),
                Err(e) => tracing::error!(error = %e, "Purge sweep failed"),
            }
        }
    })
}
