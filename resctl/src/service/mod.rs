//! Resource operations: permission checks, validation and the sagas behind them.
//!
//! [`ResourceService`] is the single entry point the HTTP layer and background
//! tasks call into. It owns no state of its own beyond a tariff cache; everything
//! else is injected through [`ResourceService::builder`].
//!
//! Every mutating operation follows the same shape:
//!
//! 1. Load the live resource (`NotFound` if absent or soft-deleted)
//! 2. Check the caller's access level against [`crate::access::required`]
//! 3. Validate input (labels, tariffs)
//! 4. Run a saga over the external systems, committing to the store on success
//! 5. Fire best-effort follow-ups (notifications, auth cache invalidation)

use bon::Builder;
use futures::{
    StreamExt, TryStreamExt,
    future::Future,
    stream::{self, BoxStream},
};
use moka::future::Cache;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, instrument, warn};

use crate::{
    access::{AccessLevel, check_permission},
    adapters::{
        AdapterError, AuthCache, Billing, ExternalSystem, NamespaceTariff, Notifier, Provisioner, SubscriptionHandle,
        Tariff, VolumeTariff,
    },
    db::{
        ResourceStore,
        errors::DbError,
        in_transaction,
        models::{Namespace, ResourceMeta, Volume},
    },
    errors::{Error, Result, TariffRejection},
    saga::{SagaCoordinator, steps::RestoredSubscription},
    types::{Caller, ResourceId, ResourceKind, TariffId, UserId},
};

pub mod access;
pub mod background;
pub mod namespaces;
pub mod volumes;

const DEFAULT_PAGE_SIZE: usize = 100;
const DEFAULT_TARIFF_TTL: Duration = Duration::from_secs(60);

/// Tariff lookups are cached per ID; entries expire after the configured TTL.
#[derive(Clone)]
pub struct TariffCache {
    namespaces: Cache<TariffId, NamespaceTariff>,
    volumes: Cache<TariffId, VolumeTariff>,
}

impl TariffCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            namespaces: Cache::builder().time_to_live(ttl).max_capacity(1_000).build(),
            volumes: Cache::builder().time_to_live(ttl).max_capacity(1_000).build(),
        }
    }
}

impl Default for TariffCache {
    fn default() -> Self {
        Self::new(DEFAULT_TARIFF_TTL)
    }
}

#[derive(Clone, Builder)]
pub struct ResourceService {
    store: Arc<dyn ResourceStore>,
    provisioner: Arc<dyn Provisioner>,
    billing: Arc<dyn Billing>,
    notifier: Arc<dyn Notifier>,
    auth_cache: Arc<dyn AuthCache>,
    #[builder(default)]
    sagas: SagaCoordinator,
    #[builder(default)]
    tariffs: TariffCache,
    /// Delays between auth cache invalidation attempts
    #[builder(default = vec![Duration::from_secs(1), Duration::from_secs(5), Duration::from_secs(30)])]
    retry_schedule: Vec<Duration>,
    #[builder(default = DEFAULT_PAGE_SIZE)]
    page_size: usize,
}

impl ResourceService {
    pub fn store(&self) -> &Arc<dyn ResourceStore> {
        &self.store
    }

    /// Page size for a list request: the requested limit capped at the configured page size.
    pub fn page_limit(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.page_size).clamp(1, self.page_size.max(1))
    }

    /// Resolve the caller's level on a resource and fail unless it meets `required`.
    ///
    /// Admins get no bypass here; their extra powers are the target-user override
    /// on reads and the admin-only listings.
    async fn authorize(
        &self,
        user: UserId,
        kind: ResourceKind,
        id: ResourceId,
        required: AccessLevel,
        action: &str,
    ) -> Result<AccessLevel> {
        let held = self
            .store
            .get_access(kind, id, user)
            .await?
            .map(|record| record.access)
            .unwrap_or(AccessLevel::None);

        if check_permission(held, required) {
            Ok(held)
        } else {
            Err(Error::PermissionDenied {
                action: action.to_string(),
                resource: format!("{kind} {id}"),
                required,
                held,
            })
        }
    }

    async fn live_namespace(&self, id: ResourceId) -> Result<Namespace> {
        self.store
            .get_namespace(id)
            .await?
            .ok_or_else(|| Error::not_found(ResourceKind::Namespace, id))
    }

    async fn live_volume(&self, id: ResourceId) -> Result<Volume> {
        self.store
            .get_volume(id)
            .await?
            .ok_or_else(|| Error::not_found(ResourceKind::Volume, id))
    }

    async fn live_meta(&self, kind: ResourceKind, id: ResourceId) -> Result<ResourceMeta> {
        match kind {
            ResourceKind::Namespace => self.live_namespace(id).await.map(|ns| ns.meta),
            ResourceKind::Volume => self.live_volume(id).await.map(|vol| vol.meta),
        }
    }

    async fn ensure_label_free(&self, kind: ResourceKind, owner: UserId, label: &str) -> Result<()> {
        if self.store.label_taken(kind, owner, label).await? {
            return Err(Error::AlreadyExists {
                resource: kind.to_string(),
                label: label.to_string(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn namespace_tariff(&self, id: TariffId) -> Result<NamespaceTariff> {
        let billing = self.billing.clone();
        cached_tariff(&self.tariffs.namespaces, id, || async move { billing.namespace_tariff(id).await }).await
    }

    #[instrument(skip(self), err)]
    pub async fn volume_tariff(&self, id: TariffId) -> Result<VolumeTariff> {
        let billing = self.billing.clone();
        cached_tariff(&self.tariffs.volumes, id, || async move { billing.volume_tariff(id).await }).await
    }

    /// Best effort: a failed notification is logged and never fails the operation.
    async fn notify_created(&self, user: UserId, label: &str, tariff: &str) {
        if let Err(e) = self.notifier.notify_created(user, label, tariff).await {
            warn!(error = %e, %user, label, "Failed to send creation notification");
        }
    }

    async fn notify_deleted(&self, user: UserId, label: &str) {
        if let Err(e) = self.notifier.notify_deleted(user, label).await {
            warn!(error = %e, %user, label, "Failed to send deletion notification");
        }
    }

    /// Store the handles of subscriptions a rolled-back deletion took out again, so a
    /// retried deletion cancels the live subscription rather than the stale one.
    async fn write_back_subscriptions(&self, restored: &[RestoredSubscription]) {
        let updates: Vec<(ResourceKind, ResourceId, SubscriptionHandle)> = restored
            .iter()
            .filter_map(|r| r.take().map(|handle| (r.kind, r.resource, handle)))
            .collect();
        if updates.is_empty() {
            return;
        }

        let count = updates.len();
        let result = in_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move {
                for (kind, id, handle) in &updates {
                    tx.set_subscription(*kind, *id, handle).await?;
                }
                Ok(())
            })
        })
        .await;
        match result {
            Ok(()) => debug!(count, "Restored subscriptions recorded"),
            Err(e) => error!(error = %e, count, "Failed to record restored subscriptions, stored handles are stale"),
        }
    }

    /// Lazily walk a listing page by page with keyset pagination.
    fn paged<T, F, Fut>(&self, fetch: F) -> BoxStream<'static, Result<T>>
    where
        T: Keyed + Send + 'static,
        F: Fn(Option<ResourceId>, usize) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Vec<T>>> + Send + 'static,
    {
        keyset_stream(self.page_size.max(1), fetch)
    }
}

async fn cached_tariff<T, F, Fut>(cache: &Cache<TariffId, T>, id: TariffId, lookup: F) -> Result<T>
where
    T: Clone + Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = std::result::Result<T, AdapterError>>,
{
    if let Some(tariff) = cache.get(&id).await {
        return Ok(tariff);
    }

    let tariff = lookup().await.map_err(|e| match e {
        AdapterError::NotFound { .. } => Error::not_found("tariff", id),
        source => Error::ExternalService {
            service: ExternalSystem::Billing,
            operation: "tariff lookup".to_string(),
            source,
        },
    })?;
    cache.insert(id, tariff.clone()).await;
    Ok(tariff)
}

/// A tariff is usable when active, public unless the caller is an admin, and
/// different from the one the resource is already on.
pub fn validate_tariff(tariff: &impl Tariff, caller: &Caller, current: Option<TariffId>) -> Result<()> {
    let reason = if !tariff.is_active() {
        Some(TariffRejection::Inactive)
    } else if !tariff.is_public() && !caller.is_admin() {
        Some(TariffRejection::NotPublic)
    } else if current == Some(tariff.id()) {
        Some(TariffRejection::Unchanged)
    } else {
        None
    };

    match reason {
        Some(reason) => Err(Error::TariffInvalid {
            tariff: tariff.label().to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Labels are DNS labels: 1 to 63 lowercase alphanumerics or '-', not starting or
/// ending with '-'.
pub fn validate_label(label: &str) -> Result<()> {
    let valid_chars = label.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-');
    if label.is_empty() || label.len() > 63 || !valid_chars || label.starts_with('-') || label.ends_with('-') {
        return Err(Error::bad_input(format!(
            "invalid label '{label}': expected 1-63 lowercase letters, digits or '-', starting and ending with an alphanumeric"
        )));
    }
    Ok(())
}

/// Classify a store failure hit while writing a labelled resource.
fn label_conflict(err: DbError, kind: ResourceKind, label: &str) -> Error {
    match err {
        DbError::UniqueViolation { .. } => Error::AlreadyExists {
            resource: kind.to_string(),
            label: label.to_string(),
        },
        other => Error::Database(other),
    }
}

fn require_self_or_admin(caller: &Caller, user: UserId, action: &str) -> Result<()> {
    if caller.is_admin() || caller.id == user {
        Ok(())
    } else {
        Err(Error::Forbidden { action: action.to_string() })
    }
}

fn require_admin(caller: &Caller, action: &str) -> Result<()> {
    if caller.is_admin() {
        Ok(())
    } else {
        Err(Error::Forbidden { action: action.to_string() })
    }
}

/// Items addressable by a keyset cursor.
pub trait Keyed {
    fn key(&self) -> ResourceId;
}

impl Keyed for Namespace {
    fn key(&self) -> ResourceId {
        self.meta.id
    }
}

impl Keyed for Volume {
    fn key(&self) -> ResourceId {
        self.meta.id
    }
}

/// Flatten pages fetched with `fetch(after, limit)` into one stream. A short page ends it.
fn keyset_stream<T, F, Fut>(page_size: usize, fetch: F) -> BoxStream<'static, Result<T>>
where
    T: Keyed + Send + 'static,
    F: Fn(Option<ResourceId>, usize) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Vec<T>>> + Send + 'static,
{
    // State: None once the last page has been read, otherwise the cursor to resume after
    stream::try_unfold(Some(None), move |cursor: Option<Option<ResourceId>>| {
        let page = cursor.map(|after| fetch(after, page_size));
        async move {
            let Some(page) = page else {
                return Ok::<_, Error>(None);
            };
            let items = page.await?;
            let next = if items.len() < page_size {
                None
            } else {
                items.last().map(|item| Some(item.key()))
            };
            Ok(Some((items, next)))
        }
    })
    .map_ok(|items| stream::iter(items.into_iter().map(Ok)))
    .try_flatten()
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::dummy::{BillingOp, DummyBilling};
    use uuid::Uuid;

    fn tariff(active: bool, public: bool) -> VolumeTariff {
        VolumeTariff {
            id: Uuid::new_v4(),
            label: "small".to_string(),
            storage_limit: 10,
            replicas: 1,
            is_active: active,
            is_public: public,
        }
    }

    #[test]
    fn test_label_validation() {
        for ok in ["a", "data-1", "x".repeat(63).as_str()] {
            assert!(validate_label(ok).is_ok(), "{ok} should be valid");
        }
        for bad in ["", "-a", "a-", "Upper", "under_score", "dot.ted", &"x".repeat(64)] {
            assert!(matches!(validate_label(bad), Err(Error::BadInput { .. })), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_tariff_validation() {
        let user = Caller::user(Uuid::new_v4());
        let admin = Caller::admin(Uuid::new_v4());

        let inactive = tariff(false, true);
        assert!(matches!(
            validate_tariff(&inactive, &admin, None),
            Err(Error::TariffInvalid { reason: TariffRejection::Inactive, .. })
        ));

        let private = tariff(true, false);
        assert!(matches!(
            validate_tariff(&private, &user, None),
            Err(Error::TariffInvalid { reason: TariffRejection::NotPublic, .. })
        ));
        assert!(validate_tariff(&private, &admin, None).is_ok());

        let public = tariff(true, true);
        assert!(matches!(
            validate_tariff(&public, &user, Some(public.id)),
            Err(Error::TariffInvalid { reason: TariffRejection::Unchanged, .. })
        ));
        assert!(validate_tariff(&public, &user, Some(Uuid::new_v4())).is_ok());
    }

    #[tokio::test]
    async fn test_tariff_lookups_are_cached() {
        let billing = DummyBilling::new();
        let known = tariff(true, true);
        billing.add_volume_tariff(known.clone());
        let cache = TariffCache::default();
        let id = known.id;

        for _ in 0..3 {
            let b = billing.clone();
            let found = cached_tariff(&cache.volumes, id, || async move { b.volume_tariff(id).await })
                .await
                .unwrap();
            assert_eq!(found, known);
        }
        assert_eq!(billing.tariff_lookups(), 1);
    }

    #[tokio::test]
    async fn test_tariff_lookup_errors() {
        let billing = DummyBilling::new();
        let cache = TariffCache::default();
        let missing = Uuid::new_v4();

        let b = billing.clone();
        let err = cached_tariff(&cache.volumes, missing, || async move { b.volume_tariff(missing).await })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        billing.fail_on(BillingOp::Tariffs);
        let b = billing.clone();
        let err = cached_tariff(&cache.volumes, missing, || async move { b.volume_tariff(missing).await })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExternalService { service: ExternalSystem::Billing, .. }));
    }

    #[derive(Debug)]
    struct Item(ResourceId);

    impl Keyed for Item {
        fn key(&self) -> ResourceId {
            self.0
        }
    }

    #[tokio::test]
    async fn test_keyset_stream_walks_every_page() {
        let mut ids: Vec<ResourceId> = (0..7).map(|_| Uuid::new_v4()).collect();
        ids.sort();
        let source = Arc::new(ids.clone());
        let fetches = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let counter = fetches.clone();
        let stream = keyset_stream(3, move |after, limit| {
            let source = source.clone();
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move {
                Ok(source
                    .iter()
                    .filter(|id| after.is_none_or(|cursor| **id > cursor))
                    .take(limit)
                    .map(|id| Item(*id))
                    .collect::<Vec<_>>())
            }
        });

        let seen: Vec<ResourceId> = stream.map_ok(|item| item.0).try_collect().await.unwrap();
        assert_eq!(seen, ids);
        // 3 + 3 + 1, the short page ends the walk
        assert_eq!(fetches.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_keyset_stream_is_lazy() {
        let fetches = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = fetches.clone();
        let _stream = keyset_stream(3, move |_, _| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            async move { Ok(Vec::<Item>::new()) }
        });
        assert_eq!(fetches.load(std::sync::atomic::Ordering::SeqCst), 0);
    }
}
