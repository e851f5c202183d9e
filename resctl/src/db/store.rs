//! The resource store seam.
//!
//! [`ResourceStore`] covers reads and the few maintenance writes that are not part of
//! a user operation. Every mutation a user operation makes goes through a
//! [`StoreTx`] obtained from [`ResourceStore::begin`], usually via [`in_transaction`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::{
    access::AccessLevel,
    db::{
        errors::Result,
        models::{AccessRecord, ListQuery, Namespace, NamespaceQuota, ResourceCount, Volume},
    },
    errors::{Error, TransactionStage},
    types::{ResourceId, ResourceKind, TariffId, UserId},
};

#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Start a transaction. The returned handle owns its connection.
    async fn begin(&self) -> Result<Box<dyn StoreTx>>;

    /// A live namespace with its live volumes and access records.
    async fn get_namespace(&self, id: ResourceId) -> Result<Option<Namespace>>;

    /// A live volume with its access records.
    async fn get_volume(&self, id: ResourceId) -> Result<Option<Volume>>;

    async fn get_access(&self, kind: ResourceKind, resource_id: ResourceId, user: UserId) -> Result<Option<AccessRecord>>;

    /// One keyset page of namespaces ordered by ID.
    async fn list_namespaces(&self, query: &ListQuery) -> Result<Vec<Namespace>>;

    /// One keyset page of volumes ordered by ID.
    async fn list_volumes(&self, query: &ListQuery) -> Result<Vec<Volume>>;

    /// Whether `owner` already has a live resource of `kind` labelled `label`.
    async fn label_taken(&self, kind: ResourceKind, owner: UserId, label: &str) -> Result<bool>;

    /// Access records whose change has not reached the auth cache yet.
    async fn list_pending_access(&self) -> Result<Vec<AccessRecord>>;

    /// Mark a pending change as propagated.
    ///
    /// Only clears the marker if it still equals `propagated`, so a newer change is
    /// never acknowledged by an older invalidation. Revocations (level `None`) are
    /// removed outright. Returns whether anything changed.
    async fn clear_pending_access(
        &self,
        kind: ResourceKind,
        resource_id: ResourceId,
        user: UserId,
        propagated: AccessLevel,
    ) -> Result<bool>;

    /// Physically remove resources soft-deleted before `before`, with their access records.
    async fn purge_deleted(&self, before: DateTime<Utc>) -> Result<u64>;

    async fn count_owned(&self, user: UserId) -> Result<ResourceCount>;
}

/// A store transaction, exclusively owned by one operation.
///
/// Mutations of missing or soft-deleted resources fail with `DbError::NotFound`;
/// label collisions fail with `DbError::UniqueViolation`.
#[async_trait]
pub trait StoreTx: Send {
    /// Insert a namespace and its Owner record.
    async fn create_namespace(&mut self, namespace: &Namespace) -> Result<()>;

    /// Insert a volume and its Owner record.
    async fn create_volume(&mut self, volume: &Volume) -> Result<()>;

    async fn soft_delete(&mut self, kind: ResourceKind, id: ResourceId) -> Result<()>;

    async fn rename(&mut self, kind: ResourceKind, id: ResourceId, label: &str) -> Result<()>;

    async fn resize_namespace(
        &mut self,
        id: ResourceId,
        tariff_id: TariffId,
        quota: &NamespaceQuota,
        subscription: Option<&str>,
    ) -> Result<()>;

    async fn resize_volume(
        &mut self,
        id: ResourceId,
        tariff_id: TariffId,
        storage_size: i32,
        replicas: i32,
        subscription: Option<&str>,
    ) -> Result<()>;

    async fn set_limited(&mut self, kind: ResourceKind, id: ResourceId, limited: bool) -> Result<()>;

    async fn set_subscription(&mut self, kind: ResourceKind, id: ResourceId, subscription: &str) -> Result<()>;

    /// Insert or overwrite the record for `(kind, resource_id, user_id)`.
    async fn set_access(&mut self, record: &AccessRecord) -> Result<()>;

    /// Make `new_owner` the owner. The previous owner keeps `Write` access.
    async fn transfer_owner(&mut self, kind: ResourceKind, id: ResourceId, new_owner: UserId) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Run `f` inside a transaction. Commits iff `f` returns `Ok`.
///
/// When `f` fails the transaction is rolled back and `f`'s error is returned. Begin,
/// commit and rollback failures surface as [`Error::TransactionFailure`]; a failed
/// rollback takes precedence over `f`'s error, which is logged.
pub async fn in_transaction<T, F>(store: &dyn ResourceStore, f: F) -> crate::errors::Result<T>
where
    T: Send,
    F: for<'t> FnOnce(&'t mut Box<dyn StoreTx>) -> BoxFuture<'t, crate::errors::Result<T>> + Send,
{
    let mut tx = store.begin().await.map_err(|source| Error::TransactionFailure {
        stage: TransactionStage::Begin,
        source,
    })?;

    match f(&mut tx).await {
        Ok(value) => {
            tx.commit().await.map_err(|source| Error::TransactionFailure {
                stage: TransactionStage::Commit,
                source,
            })?;
            Ok(value)
        }
        Err(e) => match tx.rollback().await {
            Ok(()) => Err(e),
            Err(source) => {
                tracing::error!(error = %source, original = %e, "Failed to roll back transaction");
                Err(Error::TransactionFailure {
                    stage: TransactionStage::Rollback,
                    source,
                })
            }
        },
    }
}
