//! PostgreSQL store built on sqlx.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Transaction, postgres::PgPoolOptions};
use std::collections::HashMap;
use tracing::instrument;

use crate::{
    access::AccessLevel,
    config::DatabaseConfig,
    db::{
        errors::{DbError, Result},
        models::{AccessRecord, ListQuery, Namespace, NamespaceQuota, ResourceCount, Volume},
        store::{ResourceStore, StoreTx},
    },
    types::{ResourceId, ResourceKind, TariffId, UserId},
};

const META_COLUMNS: &str =
    "r.id, r.owner_user_id, r.tariff_id, r.label, r.deleted, r.delete_time, r.limited, r.created_at, r.subscription";
const QUOTA_COLUMNS: &str = "r.cpu_limit, r.memory_limit, r.max_external_services, r.max_internal_services, r.max_traffic";
const VOLUME_COLUMNS: &str = "r.storage_size, r.replicas, r.persistent, r.namespace_id";
const ACCESS_COLUMNS: &str = "kind, resource_id, user_id, access, pending_access, changed_at";

fn table(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Namespace => "namespaces",
        ResourceKind::Volume => "volumes",
    }
}

fn select_namespaces() -> String {
    format!("SELECT {META_COLUMNS}, {QUOTA_COLUMNS} FROM namespaces r")
}

fn select_volumes() -> String {
    format!("SELECT {META_COLUMNS}, {VOLUME_COLUMNS} FROM volumes r")
}

/// Append the WHERE clause, ordering and limit of a list query.
fn push_list_conditions(qb: &mut QueryBuilder<'_, Postgres>, kind: ResourceKind, query: &ListQuery) {
    qb.push(" WHERE TRUE");

    if let Some(user) = query.user {
        qb.push(" AND EXISTS (SELECT 1 FROM access_records a WHERE a.kind = ");
        qb.push_bind(kind);
        qb.push(" AND a.resource_id = r.id AND a.user_id = ");
        qb.push_bind(user);
        qb.push(" AND a.access <> 'none')");
    }

    if kind == ResourceKind::Volume
        && let Some(namespace_id) = query.namespace_id
    {
        qb.push(" AND r.namespace_id = ");
        qb.push_bind(namespace_id);
    }

    for filter in query.effective_filters(kind) {
        qb.push(" AND ");
        qb.push(filter.sql_condition());
        if filter.binds_user() {
            qb.push(" ");
            qb.push_bind(query.user);
        }
    }

    if let Some(after) = query.after {
        qb.push(" AND r.id > ");
        qb.push_bind(after);
    }

    qb.push(" ORDER BY r.id");

    if let Some(limit) = query.limit {
        qb.push(" LIMIT ");
        qb.push_bind(limit as i64);
    }
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool from configuration. The URL must be set.
    pub async fn connect(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("database.url is not configured"))?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn access_for(&self, kind: ResourceKind, ids: &[ResourceId]) -> Result<HashMap<ResourceId, Vec<AccessRecord>>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let records = sqlx::query_as::<_, AccessRecord>(&format!(
            "SELECT {ACCESS_COLUMNS} FROM access_records WHERE kind = $1 AND resource_id = ANY($2) ORDER BY access DESC, user_id"
        ))
        .bind(kind)
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_resource: HashMap<ResourceId, Vec<AccessRecord>> = HashMap::new();
        for record in records {
            by_resource.entry(record.resource_id).or_default().push(record);
        }
        Ok(by_resource)
    }

    async fn hydrate_volumes(&self, mut volumes: Vec<Volume>) -> Result<Vec<Volume>> {
        let ids: Vec<ResourceId> = volumes.iter().map(|v| v.meta.id).collect();
        let mut access = self.access_for(ResourceKind::Volume, &ids).await?;
        for volume in &mut volumes {
            volume.access = access.remove(&volume.meta.id).unwrap_or_default();
        }
        Ok(volumes)
    }

    async fn hydrate_namespaces(&self, mut namespaces: Vec<Namespace>) -> Result<Vec<Namespace>> {
        if namespaces.is_empty() {
            return Ok(namespaces);
        }
        let ids: Vec<ResourceId> = namespaces.iter().map(|n| n.meta.id).collect();

        let volumes = sqlx::query_as::<_, Volume>(&format!(
            "{} WHERE r.namespace_id = ANY($1) AND NOT r.deleted ORDER BY r.id",
            select_volumes()
        ))
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;
        let mut volumes_by_namespace: HashMap<ResourceId, Vec<Volume>> = HashMap::new();
        for volume in self.hydrate_volumes(volumes).await? {
            if let Some(namespace_id) = volume.namespace_id {
                volumes_by_namespace.entry(namespace_id).or_default().push(volume);
            }
        }

        let mut access = self.access_for(ResourceKind::Namespace, &ids).await?;
        for namespace in &mut namespaces {
            namespace.volumes = volumes_by_namespace.remove(&namespace.meta.id).unwrap_or_default();
            namespace.access = access.remove(&namespace.meta.id).unwrap_or_default();
        }
        Ok(namespaces)
    }
}

#[async_trait]
impl ResourceStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn StoreTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTx { tx }))
    }

    #[instrument(skip(self), err)]
    async fn get_namespace(&self, id: ResourceId) -> Result<Option<Namespace>> {
        let namespace = sqlx::query_as::<_, Namespace>(&format!("{} WHERE r.id = $1 AND NOT r.deleted", select_namespaces()))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match namespace {
            Some(namespace) => Ok(self.hydrate_namespaces(vec![namespace]).await?.pop()),
            None => Ok(None),
        }
    }

    #[instrument(skip(self), err)]
    async fn get_volume(&self, id: ResourceId) -> Result<Option<Volume>> {
        let volume = sqlx::query_as::<_, Volume>(&format!("{} WHERE r.id = $1 AND NOT r.deleted", select_volumes()))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match volume {
            Some(volume) => Ok(self.hydrate_volumes(vec![volume]).await?.pop()),
            None => Ok(None),
        }
    }

    #[instrument(skip(self), err)]
    async fn get_access(&self, kind: ResourceKind, resource_id: ResourceId, user: UserId) -> Result<Option<AccessRecord>> {
        let record = sqlx::query_as::<_, AccessRecord>(&format!(
            "SELECT {ACCESS_COLUMNS} FROM access_records WHERE kind = $1 AND resource_id = $2 AND user_id = $3"
        ))
        .bind(kind)
        .bind(resource_id)
        .bind(user)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    #[instrument(skip(self), err)]
    async fn list_namespaces(&self, query: &ListQuery) -> Result<Vec<Namespace>> {
        let mut qb = QueryBuilder::<Postgres>::new(select_namespaces());
        push_list_conditions(&mut qb, ResourceKind::Namespace, query);
        let namespaces = qb.build_query_as::<Namespace>().fetch_all(&self.pool).await?;
        self.hydrate_namespaces(namespaces).await
    }

    #[instrument(skip(self), err)]
    async fn list_volumes(&self, query: &ListQuery) -> Result<Vec<Volume>> {
        let mut qb = QueryBuilder::<Postgres>::new(select_volumes());
        push_list_conditions(&mut qb, ResourceKind::Volume, query);
        let volumes = qb.build_query_as::<Volume>().fetch_all(&self.pool).await?;
        self.hydrate_volumes(volumes).await
    }

    async fn label_taken(&self, kind: ResourceKind, owner: UserId, label: &str) -> Result<bool> {
        let taken = sqlx::query_scalar::<_, bool>(&format!(
            "SELECT EXISTS(SELECT 1 FROM {} WHERE owner_user_id = $1 AND label = $2 AND NOT deleted)",
            table(kind)
        ))
        .bind(owner)
        .bind(label)
        .fetch_one(&self.pool)
        .await?;
        Ok(taken)
    }

    async fn list_pending_access(&self) -> Result<Vec<AccessRecord>> {
        let records = sqlx::query_as::<_, AccessRecord>(&format!(
            "SELECT {ACCESS_COLUMNS} FROM access_records WHERE pending_access IS NOT NULL ORDER BY changed_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    #[instrument(skip(self), err)]
    async fn clear_pending_access(
        &self,
        kind: ResourceKind,
        resource_id: ResourceId,
        user: UserId,
        propagated: AccessLevel,
    ) -> Result<bool> {
        let sql = if propagated == AccessLevel::None {
            "DELETE FROM access_records
             WHERE kind = $1 AND resource_id = $2 AND user_id = $3 AND pending_access = $4 AND access = 'none'"
        } else {
            "UPDATE access_records SET pending_access = NULL
             WHERE kind = $1 AND resource_id = $2 AND user_id = $3 AND pending_access = $4"
        };
        let result = sqlx::query(sql)
            .bind(kind)
            .bind(resource_id)
            .bind(user)
            .bind(propagated)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn purge_deleted(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        for kind in [ResourceKind::Volume, ResourceKind::Namespace] {
            sqlx::query(&format!(
                "DELETE FROM access_records a USING {} r
                 WHERE a.kind = $1 AND a.resource_id = r.id AND r.deleted AND r.delete_time < $2",
                table(kind)
            ))
            .bind(kind)
            .bind(before)
            .execute(&mut *tx)
            .await?;
        }

        let mut purged = 0;
        for kind in [ResourceKind::Volume, ResourceKind::Namespace] {
            let result = sqlx::query(&format!("DELETE FROM {} WHERE deleted AND delete_time < $1", table(kind)))
                .bind(before)
                .execute(&mut *tx)
                .await?;
            purged += result.rows_affected();
        }

        tx.commit().await?;
        Ok(purged)
    }

    async fn count_owned(&self, user: UserId) -> Result<ResourceCount> {
        let (namespaces, volumes) = sqlx::query_as::<_, (i64, i64)>(
            "SELECT
                (SELECT COUNT(*) FROM namespaces WHERE owner_user_id = $1 AND NOT deleted),
                (SELECT COUNT(*) FROM volumes WHERE owner_user_id = $1 AND NOT deleted)",
        )
        .bind(user)
        .fetch_one(&self.pool)
        .await?;
        Ok(ResourceCount { namespaces, volumes })
    }
}

pub struct PgTx {
    tx: Transaction<'static, Postgres>,
}

impl PgTx {
    async fn upsert_access(&mut self, record: &AccessRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO access_records (kind, resource_id, user_id, access, pending_access, changed_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (kind, resource_id, user_id) DO UPDATE
             SET access = EXCLUDED.access, pending_access = EXCLUDED.pending_access, changed_at = EXCLUDED.changed_at",
        )
        .bind(record.kind)
        .bind(record.resource_id)
        .bind(record.user_id)
        .bind(record.access)
        .bind(record.pending_access)
        .bind(record.changed_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    /// Lock a live resource row and return its owner.
    async fn lock_live(&mut self, kind: ResourceKind, id: ResourceId) -> Result<UserId> {
        let owner = sqlx::query_scalar::<_, UserId>(&format!(
            "SELECT owner_user_id FROM {} WHERE id = $1 AND NOT deleted FOR UPDATE",
            table(kind)
        ))
        .bind(id)
        .fetch_optional(&mut *self.tx)
        .await?;
        owner.ok_or(DbError::NotFound)
    }
}

fn expect_one_row(rows_affected: u64) -> Result<()> {
    if rows_affected == 0 { Err(DbError::NotFound) } else { Ok(()) }
}

#[async_trait]
impl StoreTx for PgTx {
    #[instrument(skip(self, namespace), fields(namespace_id = %namespace.meta.id, label = %namespace.meta.label), err)]
    async fn create_namespace(&mut self, namespace: &Namespace) -> Result<()> {
        let meta = &namespace.meta;
        let quota = &namespace.quota;
        sqlx::query(
            "INSERT INTO namespaces (
                id, owner_user_id, tariff_id, label, deleted, delete_time, limited, created_at, subscription,
                cpu_limit, memory_limit, max_external_services, max_internal_services, max_traffic
             )
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(meta.id)
        .bind(meta.owner_user_id)
        .bind(meta.tariff_id)
        .bind(&meta.label)
        .bind(meta.deleted)
        .bind(meta.delete_time)
        .bind(meta.limited)
        .bind(meta.created_at)
        .bind(&meta.subscription)
        .bind(quota.cpu_limit)
        .bind(quota.memory_limit)
        .bind(quota.max_external_services)
        .bind(quota.max_internal_services)
        .bind(quota.max_traffic)
        .execute(&mut *self.tx)
        .await?;

        self.upsert_access(&AccessRecord::owner(ResourceKind::Namespace, meta.id, meta.owner_user_id))
            .await
    }

    #[instrument(skip(self, volume), fields(volume_id = %volume.meta.id, label = %volume.meta.label), err)]
    async fn create_volume(&mut self, volume: &Volume) -> Result<()> {
        let meta = &volume.meta;
        sqlx::query(
            "INSERT INTO volumes (
                id, owner_user_id, tariff_id, label, deleted, delete_time, limited, created_at, subscription,
                storage_size, replicas, persistent, namespace_id
             )
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(meta.id)
        .bind(meta.owner_user_id)
        .bind(meta.tariff_id)
        .bind(&meta.label)
        .bind(meta.deleted)
        .bind(meta.delete_time)
        .bind(meta.limited)
        .bind(meta.created_at)
        .bind(&meta.subscription)
        .bind(volume.storage_size)
        .bind(volume.replicas)
        .bind(volume.persistent)
        .bind(volume.namespace_id)
        .execute(&mut *self.tx)
        .await?;

        self.upsert_access(&AccessRecord::owner(ResourceKind::Volume, meta.id, meta.owner_user_id))
            .await
    }

    #[instrument(skip(self), err)]
    async fn soft_delete(&mut self, kind: ResourceKind, id: ResourceId) -> Result<()> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET deleted = TRUE, delete_time = NOW() WHERE id = $1 AND NOT deleted",
            table(kind)
        ))
        .bind(id)
        .execute(&mut *self.tx)
        .await?;
        expect_one_row(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn rename(&mut self, kind: ResourceKind, id: ResourceId, label: &str) -> Result<()> {
        let result = sqlx::query(&format!("UPDATE {} SET label = $2 WHERE id = $1 AND NOT deleted", table(kind)))
            .bind(id)
            .bind(label)
            .execute(&mut *self.tx)
            .await?;
        expect_one_row(result.rows_affected())
    }

    #[instrument(skip(self, quota), err)]
    async fn resize_namespace(
        &mut self,
        id: ResourceId,
        tariff_id: TariffId,
        quota: &NamespaceQuota,
        subscription: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE namespaces
             SET tariff_id = $2, cpu_limit = $3, memory_limit = $4, max_external_services = $5,
                 max_internal_services = $6, max_traffic = $7, subscription = COALESCE($8, subscription)
             WHERE id = $1 AND NOT deleted",
        )
        .bind(id)
        .bind(tariff_id)
        .bind(quota.cpu_limit)
        .bind(quota.memory_limit)
        .bind(quota.max_external_services)
        .bind(quota.max_internal_services)
        .bind(quota.max_traffic)
        .bind(subscription)
        .execute(&mut *self.tx)
        .await?;
        expect_one_row(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn resize_volume(
        &mut self,
        id: ResourceId,
        tariff_id: TariffId,
        storage_size: i32,
        replicas: i32,
        subscription: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE volumes
             SET tariff_id = $2, storage_size = $3, replicas = $4, subscription = COALESCE($5, subscription)
             WHERE id = $1 AND NOT deleted",
        )
        .bind(id)
        .bind(tariff_id)
        .bind(storage_size)
        .bind(replicas)
        .bind(subscription)
        .execute(&mut *self.tx)
        .await?;
        expect_one_row(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn set_limited(&mut self, kind: ResourceKind, id: ResourceId, limited: bool) -> Result<()> {
        let result = sqlx::query(&format!("UPDATE {} SET limited = $2 WHERE id = $1 AND NOT deleted", table(kind)))
            .bind(id)
            .bind(limited)
            .execute(&mut *self.tx)
            .await?;
        expect_one_row(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn set_subscription(&mut self, kind: ResourceKind, id: ResourceId, subscription: &str) -> Result<()> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET subscription = $2 WHERE id = $1 AND NOT deleted",
            table(kind)
        ))
        .bind(id)
        .bind(subscription)
        .execute(&mut *self.tx)
        .await?;
        expect_one_row(result.rows_affected())
    }

    #[instrument(skip(self, record), fields(resource_id = %record.resource_id, user_id = %record.user_id, access = %record.access), err)]
    async fn set_access(&mut self, record: &AccessRecord) -> Result<()> {
        self.lock_live(record.kind, record.resource_id).await?;
        self.upsert_access(record).await
    }

    #[instrument(skip(self), err)]
    async fn transfer_owner(&mut self, kind: ResourceKind, id: ResourceId, new_owner: UserId) -> Result<()> {
        let previous = self.lock_live(kind, id).await?;
        if previous == new_owner {
            return Ok(());
        }

        sqlx::query(&format!("UPDATE {} SET owner_user_id = $2 WHERE id = $1", table(kind)))
            .bind(id)
            .bind(new_owner)
            .execute(&mut *self.tx)
            .await?;

        // Demote first: at most one owner record may exist at any point
        self.upsert_access(&AccessRecord::pending(kind, id, previous, AccessLevel::Write))
            .await?;
        self.upsert_access(&AccessRecord::pending(kind, id, new_owner, AccessLevel::Owner))
            .await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
