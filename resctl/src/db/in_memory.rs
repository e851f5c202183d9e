//! In-process store used for development setups without a database and in tests.
//!
//! Transactions take the state lock for their whole lifetime and work on a copy of
//! the state, which replaces the original on commit. Transactions are therefore
//! serialized, and readers wait for an open transaction to finish.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, HashMap},
    ops::Bound,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::instrument;

use crate::{
    access::AccessLevel,
    db::{
        errors::{DbError, Result},
        models::{AccessRecord, ListQuery, Namespace, NamespaceQuota, ResourceCount, ResourceMeta, Volume},
        store::{ResourceStore, StoreTx},
    },
    types::{ResourceId, ResourceKind, TariffId, UserId},
};

type AccessKey = (ResourceKind, ResourceId, UserId);

#[derive(Debug, Clone, Default)]
struct State {
    namespaces: BTreeMap<ResourceId, Namespace>,
    volumes: BTreeMap<ResourceId, Volume>,
    access: HashMap<AccessKey, AccessRecord>,
}

fn label_violation(kind: ResourceKind, label: &str) -> DbError {
    let table = match kind {
        ResourceKind::Namespace => "namespaces",
        ResourceKind::Volume => "volumes",
    };
    DbError::UniqueViolation {
        constraint: Some(format!("{table}_owner_label_live")),
        table: Some(table.to_string()),
        message: format!("label '{label}' is already in use"),
    }
}

impl State {
    fn access_for(&self, kind: ResourceKind, id: ResourceId) -> Vec<AccessRecord> {
        let mut records: Vec<AccessRecord> = self
            .access
            .values()
            .filter(|record| record.kind == kind && record.resource_id == id)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.access.cmp(&a.access).then(a.user_id.cmp(&b.user_id)));
        records
    }

    fn hydrate_volume(&self, volume: &Volume) -> Volume {
        let mut volume = volume.clone();
        volume.access = self.access_for(ResourceKind::Volume, volume.meta.id);
        volume
    }

    fn hydrate_namespace(&self, namespace: &Namespace) -> Namespace {
        let mut namespace = namespace.clone();
        namespace.volumes = self
            .volumes
            .values()
            .filter(|v| v.namespace_id == Some(namespace.meta.id) && !v.meta.deleted)
            .map(|v| self.hydrate_volume(v))
            .collect();
        namespace.access = self.access_for(ResourceKind::Namespace, namespace.meta.id);
        namespace
    }

    fn metas(&self, kind: ResourceKind) -> Box<dyn Iterator<Item = &ResourceMeta> + '_> {
        match kind {
            ResourceKind::Namespace => Box::new(self.namespaces.values().map(|n| &n.meta)),
            ResourceKind::Volume => Box::new(self.volumes.values().map(|v| &v.meta)),
        }
    }

    fn label_taken(&self, kind: ResourceKind, owner: UserId, label: &str, except: Option<ResourceId>) -> bool {
        self.metas(kind)
            .any(|m| !m.deleted && m.owner_user_id == owner && m.label == label && Some(m.id) != except)
    }

    fn visible_to(&self, kind: ResourceKind, id: ResourceId, user: Option<UserId>) -> bool {
        match user {
            None => true,
            Some(user) => self
                .access
                .get(&(kind, id, user))
                .is_some_and(|record| record.access > AccessLevel::None),
        }
    }

    fn live_meta_mut(&mut self, kind: ResourceKind, id: ResourceId) -> Result<&mut ResourceMeta> {
        let meta = match kind {
            ResourceKind::Namespace => self.namespaces.get_mut(&id).map(|n| &mut n.meta),
            ResourceKind::Volume => self.volumes.get_mut(&id).map(|v| &mut v.meta),
        };
        meta.filter(|m| !m.deleted).ok_or(DbError::NotFound)
    }

    fn insert_owner(&mut self, kind: ResourceKind, meta: &ResourceMeta) {
        let record = AccessRecord::owner(kind, meta.id, meta.owner_user_id);
        self.access.insert((kind, meta.id, meta.owner_user_id), record);
    }
}

/// Deterministic in-memory [`ResourceStore`].
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
    fail_next_commit: Arc<AtomicBool>,
    fail_next_rollback: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next transaction's commit fail.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Make the next transaction's rollback fail.
    pub fn fail_next_rollback(&self) {
        self.fail_next_rollback.store(true, Ordering::SeqCst);
    }

    /// Every stored namespace, including soft-deleted ones.
    pub async fn all_namespaces(&self) -> Vec<Namespace> {
        let state = self.state.lock().await;
        state.namespaces.values().map(|n| state.hydrate_namespace(n)).collect()
    }

    /// Every stored volume, including soft-deleted ones.
    pub async fn all_volumes(&self) -> Vec<Volume> {
        let state = self.state.lock().await;
        state.volumes.values().map(|v| state.hydrate_volume(v)).collect()
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(InMemoryTx {
            guard,
            working,
            fail_commit: self.fail_next_commit.swap(false, Ordering::SeqCst),
            fail_rollback: self.fail_next_rollback.swap(false, Ordering::SeqCst),
        }))
    }

    async fn get_namespace(&self, id: ResourceId) -> Result<Option<Namespace>> {
        let state = self.state.lock().await;
        Ok(state
            .namespaces
            .get(&id)
            .filter(|n| !n.meta.deleted)
            .map(|n| state.hydrate_namespace(n)))
    }

    async fn get_volume(&self, id: ResourceId) -> Result<Option<Volume>> {
        let state = self.state.lock().await;
        Ok(state
            .volumes
            .get(&id)
            .filter(|v| !v.meta.deleted)
            .map(|v| state.hydrate_volume(v)))
    }

    async fn get_access(&self, kind: ResourceKind, resource_id: ResourceId, user: UserId) -> Result<Option<AccessRecord>> {
        let state = self.state.lock().await;
        Ok(state.access.get(&(kind, resource_id, user)).cloned())
    }

    #[instrument(skip(self), err)]
    async fn list_namespaces(&self, query: &ListQuery) -> Result<Vec<Namespace>> {
        let state = self.state.lock().await;
        let filters = query.effective_filters(ResourceKind::Namespace);
        let lower = query.after.map_or(Bound::Unbounded, Bound::Excluded);

        Ok(state
            .namespaces
            .range((lower, Bound::Unbounded))
            .map(|(_, n)| n)
            .filter(|n| state.visible_to(ResourceKind::Namespace, n.meta.id, query.user))
            .filter(|n| filters.iter().all(|f| f.matches(&n.meta, None, query.user)))
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|n| state.hydrate_namespace(n))
            .collect())
    }

    #[instrument(skip(self), err)]
    async fn list_volumes(&self, query: &ListQuery) -> Result<Vec<Volume>> {
        let state = self.state.lock().await;
        let filters = query.effective_filters(ResourceKind::Volume);
        let lower = query.after.map_or(Bound::Unbounded, Bound::Excluded);

        Ok(state
            .volumes
            .range((lower, Bound::Unbounded))
            .map(|(_, v)| v)
            .filter(|v| query.namespace_id.is_none() || v.namespace_id == query.namespace_id)
            .filter(|v| state.visible_to(ResourceKind::Volume, v.meta.id, query.user))
            .filter(|v| filters.iter().all(|f| f.matches(&v.meta, Some(v.persistent), query.user)))
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|v| state.hydrate_volume(v))
            .collect())
    }

    async fn label_taken(&self, kind: ResourceKind, owner: UserId, label: &str) -> Result<bool> {
        Ok(self.state.lock().await.label_taken(kind, owner, label, None))
    }

    async fn list_pending_access(&self) -> Result<Vec<AccessRecord>> {
        let state = self.state.lock().await;
        let mut pending: Vec<AccessRecord> = state
            .access
            .values()
            .filter(|r| r.pending_access.is_some())
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.changed_at);
        Ok(pending)
    }

    async fn clear_pending_access(
        &self,
        kind: ResourceKind,
        resource_id: ResourceId,
        user: UserId,
        propagated: AccessLevel,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let key = (kind, resource_id, user);
        let Some(record) = state.access.get_mut(&key) else {
            return Ok(false);
        };
        if record.pending_access != Some(propagated) {
            return Ok(false);
        }
        if record.access == AccessLevel::None {
            state.access.remove(&key);
        } else {
            record.pending_access = None;
        }
        Ok(true)
    }

    #[instrument(skip(self), err)]
    async fn purge_deleted(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let expired = |meta: &ResourceMeta| meta.deleted && meta.delete_time.is_some_and(|t| t < before);

        let volumes: Vec<ResourceId> = state.volumes.values().filter(|v| expired(&v.meta)).map(|v| v.meta.id).collect();
        let namespaces: Vec<ResourceId> = state
            .namespaces
            .values()
            .filter(|n| expired(&n.meta))
            .map(|n| n.meta.id)
            .collect();

        for id in &volumes {
            state.volumes.remove(id);
        }
        for id in &namespaces {
            state.namespaces.remove(id);
        }
        for volume in state.volumes.values_mut() {
            if volume.namespace_id.is_some_and(|ns| namespaces.contains(&ns)) {
                volume.namespace_id = None;
            }
        }
        state.access.retain(|(kind, id, _), _| match kind {
            ResourceKind::Namespace => !namespaces.contains(id),
            ResourceKind::Volume => !volumes.contains(id),
        });

        Ok((volumes.len() + namespaces.len()) as u64)
    }

    async fn count_owned(&self, user: UserId) -> Result<ResourceCount> {
        let state = self.state.lock().await;
        let live_owned = |m: &ResourceMeta| !m.deleted && m.owner_user_id == user;
        Ok(ResourceCount {
            namespaces: state.namespaces.values().filter(|n| live_owned(&n.meta)).count() as i64,
            volumes: state.volumes.values().filter(|v| live_owned(&v.meta)).count() as i64,
        })
    }
}

pub struct InMemoryTx {
    guard: OwnedMutexGuard<State>,
    working: State,
    fail_commit: bool,
    fail_rollback: bool,
}

#[async_trait]
impl StoreTx for InMemoryTx {
    async fn create_namespace(&mut self, namespace: &Namespace) -> Result<()> {
        let meta = &namespace.meta;
        if self.working.namespaces.contains_key(&meta.id) {
            return Err(DbError::UniqueViolation {
                constraint: Some("namespaces_pkey".to_string()),
                table: Some("namespaces".to_string()),
                message: format!("namespace {} already exists", meta.id),
            });
        }
        if self.working.label_taken(ResourceKind::Namespace, meta.owner_user_id, &meta.label, None) {
            return Err(label_violation(ResourceKind::Namespace, &meta.label));
        }

        let mut stored = namespace.clone();
        stored.volumes.clear();
        stored.access.clear();
        self.working.namespaces.insert(meta.id, stored);
        self.working.insert_owner(ResourceKind::Namespace, meta);
        Ok(())
    }

    async fn create_volume(&mut self, volume: &Volume) -> Result<()> {
        let meta = &volume.meta;
        if self.working.volumes.contains_key(&meta.id) {
            return Err(DbError::UniqueViolation {
                constraint: Some("volumes_pkey".to_string()),
                table: Some("volumes".to_string()),
                message: format!("volume {} already exists", meta.id),
            });
        }
        if let Some(namespace_id) = volume.namespace_id
            && !self.working.namespaces.contains_key(&namespace_id)
        {
            return Err(DbError::ForeignKeyViolation {
                constraint: Some("volumes_namespace_id_fkey".to_string()),
                table: Some("volumes".to_string()),
                message: format!("namespace {namespace_id} does not exist"),
            });
        }
        if self.working.label_taken(ResourceKind::Volume, meta.owner_user_id, &meta.label, None) {
            return Err(label_violation(ResourceKind::Volume, &meta.label));
        }

        let mut stored = volume.clone();
        stored.access.clear();
        self.working.volumes.insert(meta.id, stored);
        self.working.insert_owner(ResourceKind::Volume, meta);
        Ok(())
    }

    async fn soft_delete(&mut self, kind: ResourceKind, id: ResourceId) -> Result<()> {
        let meta = self.working.live_meta_mut(kind, id)?;
        meta.deleted = true;
        meta.delete_time = Some(Utc::now());
        Ok(())
    }

    async fn rename(&mut self, kind: ResourceKind, id: ResourceId, label: &str) -> Result<()> {
        let owner = self.working.live_meta_mut(kind, id)?.owner_user_id;
        if self.working.label_taken(kind, owner, label, Some(id)) {
            return Err(label_violation(kind, label));
        }
        self.working.live_meta_mut(kind, id)?.label = label.to_string();
        Ok(())
    }

    async fn resize_namespace(
        &mut self,
        id: ResourceId,
        tariff_id: TariffId,
        quota: &NamespaceQuota,
        subscription: Option<&str>,
    ) -> Result<()> {
        let namespace = self
            .working
            .namespaces
            .get_mut(&id)
            .filter(|n| !n.meta.deleted)
            .ok_or(DbError::NotFound)?;
        namespace.meta.tariff_id = tariff_id;
        namespace.quota = *quota;
        if let Some(handle) = subscription {
            namespace.meta.subscription = Some(handle.to_string());
        }
        Ok(())
    }

    async fn resize_volume(
        &mut self,
        id: ResourceId,
        tariff_id: TariffId,
        storage_size: i32,
        replicas: i32,
        subscription: Option<&str>,
    ) -> Result<()> {
        let volume = self
            .working
            .volumes
            .get_mut(&id)
            .filter(|v| !v.meta.deleted)
            .ok_or(DbError::NotFound)?;
        volume.meta.tariff_id = tariff_id;
        volume.storage_size = storage_size;
        volume.replicas = replicas;
        if let Some(handle) = subscription {
            volume.meta.subscription = Some(handle.to_string());
        }
        Ok(())
    }

    async fn set_limited(&mut self, kind: ResourceKind, id: ResourceId, limited: bool) -> Result<()> {
        self.working.live_meta_mut(kind, id)?.limited = limited;
        Ok(())
    }

    async fn set_subscription(&mut self, kind: ResourceKind, id: ResourceId, subscription: &str) -> Result<()> {
        self.working.live_meta_mut(kind, id)?.subscription = Some(subscription.to_string());
        Ok(())
    }

    async fn set_access(&mut self, record: &AccessRecord) -> Result<()> {
        self.working.live_meta_mut(record.kind, record.resource_id)?;
        self.working
            .access
            .insert((record.kind, record.resource_id, record.user_id), record.clone());
        Ok(())
    }

    async fn transfer_owner(&mut self, kind: ResourceKind, id: ResourceId, new_owner: UserId) -> Result<()> {
        let meta = self.working.live_meta_mut(kind, id)?;
        let previous = meta.owner_user_id;
        if previous == new_owner {
            return Ok(());
        }
        let label = meta.label.clone();
        if self.working.label_taken(kind, new_owner, &label, Some(id)) {
            return Err(label_violation(kind, &label));
        }

        self.working.live_meta_mut(kind, id)?.owner_user_id = new_owner;
        self.working
            .access
            .insert((kind, id, new_owner), AccessRecord::pending(kind, id, new_owner, AccessLevel::Owner));
        self.working
            .access
            .insert((kind, id, previous), AccessRecord::pending(kind, id, previous, AccessLevel::Write));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let InMemoryTx {
            mut guard,
            working,
            fail_commit,
            ..
        } = *self;
        if fail_commit {
            return Err(DbError::Other(anyhow::anyhow!("commit rejected by store")));
        }
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        if self.fail_rollback {
            return Err(DbError::Other(anyhow::anyhow!("rollback rejected by store")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::ResourceFilter;
    use crate::db::store::in_transaction;
    use crate::errors::{Error, TransactionStage};
    use uuid::Uuid;

    fn namespace(owner: UserId, label: &str) -> Namespace {
        Namespace {
            meta: ResourceMeta::new(owner, Uuid::new_v4(), label),
            quota: NamespaceQuota {
                cpu_limit: 500,
                memory_limit: 512,
                max_external_services: 1,
                max_internal_services: 2,
                max_traffic: 10,
            },
            volumes: vec![],
            access: vec![],
        }
    }

    fn volume(owner: UserId, label: &str, namespace_id: Option<ResourceId>, persistent: bool) -> Volume {
        Volume {
            meta: ResourceMeta::new(owner, Uuid::new_v4(), label),
            storage_size: 1,
            replicas: 1,
            persistent,
            namespace_id,
            access: vec![],
        }
    }

    async fn insert_namespace(store: &InMemoryStore, ns: Namespace) {
        let mut tx = store.begin().await.unwrap();
        tx.create_namespace(&ns).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_create_adds_single_owner_record() {
        let store = InMemoryStore::new();
        let owner = Uuid::new_v4();
        let ns = namespace(owner, "demo");
        insert_namespace(&store, ns.clone()).await;

        let stored = store.get_namespace(ns.meta.id).await.unwrap().unwrap();
        assert_eq!(stored.access.len(), 1);
        assert_eq!(stored.access[0].user_id, owner);
        assert_eq!(stored.access[0].access, AccessLevel::Owner);
    }

    #[tokio::test]
    async fn test_rollback_discards_changes() {
        let store = InMemoryStore::new();
        let ns = namespace(Uuid::new_v4(), "demo");

        let mut tx = store.begin().await.unwrap();
        tx.create_namespace(&ns).await.unwrap();
        tx.rollback().await.unwrap();

        assert!(store.get_namespace(ns.meta.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_label_unique_among_live_resources() {
        let store = InMemoryStore::new();
        let owner = Uuid::new_v4();
        let first = namespace(owner, "demo");
        insert_namespace(&store, first.clone()).await;

        let mut tx = store.begin().await.unwrap();
        let err = tx.create_namespace(&namespace(owner, "demo")).await.unwrap_err();
        assert!(matches!(err, DbError::UniqueViolation { .. }));
        // Another owner may reuse the label
        tx.create_namespace(&namespace(Uuid::new_v4(), "demo")).await.unwrap();
        // Once deleted, the label is free again
        tx.soft_delete(ResourceKind::Namespace, first.meta.id).await.unwrap();
        tx.create_namespace(&namespace(owner, "demo")).await.unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_mutating_deleted_resource_is_not_found() {
        let store = InMemoryStore::new();
        let ns = namespace(Uuid::new_v4(), "demo");
        insert_namespace(&store, ns.clone()).await;

        let mut tx = store.begin().await.unwrap();
        tx.soft_delete(ResourceKind::Namespace, ns.meta.id).await.unwrap();
        let err = tx.rename(ResourceKind::Namespace, ns.meta.id, "other").await.unwrap_err();
        assert!(matches!(err, DbError::NotFound));
        let err = tx.soft_delete(ResourceKind::Namespace, ns.meta.id).await.unwrap_err();
        assert!(matches!(err, DbError::NotFound));
        tx.commit().await.unwrap();

        assert!(store.get_namespace(ns.meta.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_transaction_surfaces_commit_failure() {
        let store = InMemoryStore::new();
        let ns = namespace(Uuid::new_v4(), "demo");
        store.fail_next_commit();

        let result = in_transaction(&store, move |tx| {
            Box::pin(async move {
                tx.create_namespace(&ns).await?;
                Ok(())
            })
        })
        .await;

        assert!(matches!(result, Err(Error::TransactionFailure { .. })));
        assert!(store.all_namespaces().await.is_empty());
    }

    #[tokio::test]
    async fn test_in_transaction_rolls_back_on_error() {
        let store = InMemoryStore::new();
        let ns = namespace(Uuid::new_v4(), "demo");
        let id = ns.meta.id;

        let result: crate::errors::Result<()> = in_transaction(&store, move |tx| {
            Box::pin(async move {
                tx.create_namespace(&ns).await?;
                Err(Error::bad_input("changed my mind"))
            })
        })
        .await;

        assert!(matches!(result, Err(Error::BadInput { .. })));
        assert!(store.get_namespace(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_transaction_surfaces_rollback_failure() {
        let store = InMemoryStore::new();
        let ns = namespace(Uuid::new_v4(), "demo");
        let id = ns.meta.id;
        store.fail_next_rollback();

        let result: crate::errors::Result<()> = in_transaction(&store, move |tx| {
            Box::pin(async move {
                tx.create_namespace(&ns).await?;
                Err(Error::bad_input("changed my mind"))
            })
        })
        .await;

        assert!(
            matches!(
                result,
                Err(Error::TransactionFailure {
                    stage: TransactionStage::Rollback,
                    ..
                })
            ),
            "{result:?}"
        );
        assert!(store.get_namespace(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_filters_and_keyset_pages() {
        let store = InMemoryStore::new();
        let owner = Uuid::new_v4();
        let ns = namespace(owner, "demo");
        insert_namespace(&store, ns.clone()).await;

        let mut tx = store.begin().await.unwrap();
        for i in 0..5 {
            let persistent = i % 2 == 0;
            tx.create_volume(&volume(owner, &format!("vol-{i}"), Some(ns.meta.id), persistent))
                .await
                .unwrap();
        }
        tx.commit().await.unwrap();

        let persistent = store
            .list_volumes(&ListQuery::for_user(owner).with_filters([ResourceFilter::Persistent]))
            .await
            .unwrap();
        assert_eq!(persistent.len(), 3);

        let first = store.list_volumes(&ListQuery::for_user(owner).limit(2)).await.unwrap();
        let second = store
            .list_volumes(&ListQuery::for_user(owner).limit(2).after(first.last().map(|v| v.meta.id)))
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert!(first.iter().all(|a| second.iter().all(|b| a.meta.id < b.meta.id)));

        let stranger = store.list_volumes(&ListQuery::for_user(Uuid::new_v4())).await.unwrap();
        assert!(stranger.is_empty());

        let attached = store.get_namespace(ns.meta.id).await.unwrap().unwrap();
        assert_eq!(attached.volumes.len(), 5);
    }

    #[tokio::test]
    async fn test_transfer_owner_demotes_previous_owner() {
        let store = InMemoryStore::new();
        let owner = Uuid::new_v4();
        let heir = Uuid::new_v4();
        let ns = namespace(owner, "demo");
        insert_namespace(&store, ns.clone()).await;

        let mut tx = store.begin().await.unwrap();
        tx.transfer_owner(ResourceKind::Namespace, ns.meta.id, heir).await.unwrap();
        tx.commit().await.unwrap();

        let stored = store.get_namespace(ns.meta.id).await.unwrap().unwrap();
        assert_eq!(stored.meta.owner_user_id, heir);
        let owners: Vec<_> = stored.access.iter().filter(|r| r.access == AccessLevel::Owner).collect();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].user_id, heir);
        let previous = store.get_access(ResourceKind::Namespace, ns.meta.id, owner).await.unwrap().unwrap();
        assert_eq!(previous.access, AccessLevel::Write);
    }

    #[tokio::test]
    async fn test_clear_pending_removes_revocations() {
        let store = InMemoryStore::new();
        let owner = Uuid::new_v4();
        let guest = Uuid::new_v4();
        let ns = namespace(owner, "demo");
        insert_namespace(&store, ns.clone()).await;

        let mut tx = store.begin().await.unwrap();
        tx.set_access(&AccessRecord::pending(ResourceKind::Namespace, ns.meta.id, guest, AccessLevel::None))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.list_pending_access().await.unwrap().len(), 1);

        // A stale acknowledgement leaves the marker alone
        let cleared = store
            .clear_pending_access(ResourceKind::Namespace, ns.meta.id, guest, AccessLevel::Read)
            .await
            .unwrap();
        assert!(!cleared);

        let cleared = store
            .clear_pending_access(ResourceKind::Namespace, ns.meta.id, guest, AccessLevel::None)
            .await
            .unwrap();
        assert!(cleared);
        assert!(store.get_access(ResourceKind::Namespace, ns.meta.id, guest).await.unwrap().is_none());
        assert!(store.list_pending_access().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purge_deleted_respects_cutoff() {
        let store = InMemoryStore::new();
        let owner = Uuid::new_v4();
        let ns = namespace(owner, "demo");
        let kept = volume(owner, "data", Some(ns.meta.id), true);
        insert_namespace(&store, ns.clone()).await;

        let mut tx = store.begin().await.unwrap();
        tx.create_volume(&kept).await.unwrap();
        tx.soft_delete(ResourceKind::Namespace, ns.meta.id).await.unwrap();
        tx.commit().await.unwrap();

        let purged = store.purge_deleted(Utc::now() - chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(purged, 0);

        let purged = store.purge_deleted(Utc::now() + chrono::Duration::seconds(1)).await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.all_namespaces().await.is_empty());

        let survivor = store.get_volume(kept.meta.id).await.unwrap().unwrap();
        assert_eq!(survivor.namespace_id, None);
        assert_eq!(store.count_owned(owner).await.unwrap(), ResourceCount { namespaces: 0, volumes: 1 });
    }
}
