//! Background maintenance: garbage collection of soft-deleted resources and
//! re-propagation of access changes left pending by a previous run.

use chrono::Utc;
use metrics::counter;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ResourceService;
use crate::{config::GarbageCollectionConfig, db::ResourceStore, errors::Result};

/// Purge resources soft-deleted more than `retention` ago, every `interval`, until shutdown.
pub async fn run_garbage_collector(
    store: Arc<dyn ResourceStore>,
    config: GarbageCollectionConfig,
    shutdown: CancellationToken,
) {
    info!(
        "Starting garbage collector with {:?} interval and {:?} retention",
        config.interval, config.retention
    );

    let mut interval = tokio::time::interval(config.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Garbage collector shutting down");
                break;
            }
            _ = interval.tick() => {
                if let Err(e) = collect_garbage(store.as_ref(), &config).await {
                    warn!(error = %e, "Garbage collection pass failed");
                }
            }
        }
    }
}

/// One purge pass. Returns the number of resources removed.
pub async fn collect_garbage(store: &dyn ResourceStore, config: &GarbageCollectionConfig) -> Result<u64> {
    let retention = chrono::Duration::from_std(config.retention)
        .map_err(|e| anyhow::anyhow!("garbage collection retention out of range: {e}"))?;
    let purged = store.purge_deleted(Utc::now() - retention).await?;
    if purged > 0 {
        counter!("resctl_gc_purged_total").increment(purged);
        info!(purged, "Purged soft-deleted resources");
    } else {
        debug!("Nothing to purge");
    }
    Ok(purged)
}

impl ResourceService {
    /// Re-enqueue invalidation for every access change still marked pending.
    ///
    /// Run once at startup; returns how many records were re-enqueued.
    pub async fn reconcile_pending_access(&self) -> Result<usize> {
        let pending = self.store.list_pending_access().await?;
        let count = pending.len();
        for record in pending {
            self.spawn_invalidation(record);
        }
        if count > 0 {
            info!(count, "Re-enqueued pending access changes");
        }
        Ok(count)
    }
}
