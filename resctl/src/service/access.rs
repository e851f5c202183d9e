//! Access changes and their propagation to the auth cache.
//!
//! An access change is committed to the store with `pending_access` set, then the
//! affected user's cached permissions are invalidated in the background. The marker
//! is cleared only once invalidation succeeds, so a crash or an auth-cache outage
//! leaves a record the reconciler (see [`super::background`]) picks up again.

use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

use super::{ResourceService, label_conflict};
use crate::{
    access::{AccessLevel, required},
    adapters::AuthCache,
    db::{ResourceStore, in_transaction, models::AccessRecord},
    errors::{Error, Result},
    types::{Caller, ResourceId, ResourceKind, UserId, abbrev_uuid},
};

/// Records that need invalidating when their resource goes away: everyone except the owner.
pub(super) fn revocations(records: &[AccessRecord]) -> Vec<AccessRecord> {
    records
        .iter()
        .filter(|r| r.access != AccessLevel::Owner && r.access > AccessLevel::None)
        .map(|r| AccessRecord::pending(r.kind, r.resource_id, r.user_id, r.access))
        .collect()
}

fn absent(kind: ResourceKind, resource_id: ResourceId, user_id: UserId) -> AccessRecord {
    AccessRecord {
        pending_access: None,
        ..AccessRecord::pending(kind, resource_id, user_id, AccessLevel::None)
    }
}

impl ResourceService {
    /// Set `target`'s level on a resource. `Owner` transfers ownership, demoting the
    /// current owner to `Write`; `None` revokes.
    ///
    /// Returns the target's record as it now stands; a user without one is reported at `None`.
    #[instrument(skip(self, caller), fields(caller = %abbrev_uuid(&caller.id)), err)]
    pub async fn change_access(
        &self,
        caller: &Caller,
        kind: ResourceKind,
        id: ResourceId,
        target: UserId,
        level: AccessLevel,
    ) -> Result<AccessRecord> {
        let meta = self.live_meta(kind, id).await?;
        self.authorize(caller.id, kind, id, required::CHANGE_ACCESS, "change access")
            .await?;

        let current = self
            .store
            .get_access(kind, id, target)
            .await?
            .unwrap_or_else(|| absent(kind, id, target));
        if target == meta.owner_user_id {
            if level == AccessLevel::Owner {
                return Ok(current);
            }
            return Err(Error::bad_input(
                "the owner's access cannot be lowered; transfer ownership to another user instead",
            ));
        }

        match level {
            AccessLevel::Owner => {
                self.ensure_label_free(kind, target, &meta.label).await?;
                let label = meta.label.clone();
                in_transaction(self.store.as_ref(), move |tx| {
                    Box::pin(async move {
                        tx.transfer_owner(kind, id, target)
                            .await
                            .map_err(|e| label_conflict(e, kind, &label))
                    })
                })
                .await?;

                info!(%kind, resource = %abbrev_uuid(&id), from = %abbrev_uuid(&meta.owner_user_id), to = %abbrev_uuid(&target), "Ownership transferred");
                for user in [meta.owner_user_id, target] {
                    if let Some(record) = self.store.get_access(kind, id, user).await? {
                        self.spawn_invalidation(record);
                    }
                }
            }
            _ => {
                if current.access == level {
                    return Ok(current);
                }

                let record = AccessRecord::pending(kind, id, target, level);
                let written = record.clone();
                in_transaction(self.store.as_ref(), move |tx| {
                    Box::pin(async move { Ok(tx.set_access(&written).await?) })
                })
                .await?;

                info!(%kind, resource = %abbrev_uuid(&id), user = %abbrev_uuid(&target), %level, "Access changed");
                self.spawn_invalidation(record);
            }
        }

        Ok(self
            .store
            .get_access(kind, id, target)
            .await?
            .unwrap_or_else(|| absent(kind, id, target)))
    }

    /// Remove `target`'s access entirely.
    #[instrument(skip(self, caller), fields(caller = %abbrev_uuid(&caller.id)), err)]
    pub async fn delete_access(&self, caller: &Caller, kind: ResourceKind, id: ResourceId, target: UserId) -> Result<()> {
        self.live_meta(kind, id).await?;
        self.authorize(caller.id, kind, id, required::CHANGE_ACCESS, "delete access")
            .await?;

        match self.store.get_access(kind, id, target).await? {
            Some(record) if record.access > AccessLevel::None => {
                self.change_access(caller, kind, id, target, AccessLevel::None).await?;
                Ok(())
            }
            _ => Err(Error::not_found("access record", format!("{kind} {id} user {target}"))),
        }
    }

    /// Invalidate the record's user in the background, retrying on the configured schedule.
    ///
    /// The handle resolves to whether the change was propagated.
    pub fn spawn_invalidation(&self, record: AccessRecord) -> JoinHandle<bool> {
        let auth_cache = self.auth_cache.clone();
        let store = self.store.clone();
        let schedule = self.retry_schedule.clone();
        let span = info_span!("invalidate_access", user = %abbrev_uuid(&record.user_id), resource = %abbrev_uuid(&record.resource_id));
        tokio::spawn(
            async move { propagate_access(auth_cache.as_ref(), store.as_ref(), &schedule, &record).await }.instrument(span),
        )
    }
}

/// Invalidate the user's cached access, then clear the pending marker.
///
/// The first attempt is immediate; each entry of `schedule` is the wait before one
/// more attempt. Returns false once the schedule is exhausted.
pub async fn propagate_access(
    auth_cache: &dyn AuthCache,
    store: &dyn ResourceStore,
    schedule: &[Duration],
    record: &AccessRecord,
) -> bool {
    let Some(level) = record.pending_access else {
        return true;
    };

    let waits = std::iter::once(None).chain(schedule.iter().copied().map(Some));
    for (attempt, wait) in waits.enumerate() {
        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
        }

        match auth_cache.invalidate_user_access(record.user_id).await {
            Ok(()) => {
                metrics::counter!("resctl_access_invalidations_total", "outcome" => "propagated").increment(1);
                match store
                    .clear_pending_access(record.kind, record.resource_id, record.user_id, level)
                    .await
                {
                    Ok(true) => debug!(attempt, "Access change propagated"),
                    // A newer change is pending and has its own invalidation
                    Ok(false) => debug!(attempt, "Access change superseded"),
                    Err(e) => warn!(error = %e, "Invalidated auth cache but could not clear pending marker"),
                }
                return true;
            }
            Err(e) => {
                metrics::counter!("resctl_access_invalidations_total", "outcome" => "retried").increment(1);
                warn!(attempt, error = %e, "Auth cache invalidation failed");
            }
        }
    }

    metrics::counter!("resctl_access_invalidations_total", "outcome" => "abandoned").increment(1);
    error!(
        attempts = schedule.len() + 1,
        "Giving up on auth cache invalidation; the change stays pending until the next reconcile"
    );
    false
}
