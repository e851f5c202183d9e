//! Store records for namespaces, volumes and access records, plus list queries.

use crate::{
    access::AccessLevel,
    adapters::{NamespaceTariff, SubscriptionHandle},
    types::{ResourceId, ResourceKind, TariffId, UserId},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{fmt, str::FromStr};

/// Fields shared by every resource kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ResourceMeta {
    pub id: ResourceId,
    pub owner_user_id: UserId,
    pub tariff_id: TariffId,
    pub label: String,
    pub deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete_time: Option<DateTime<Utc>>,
    /// Set when the resource exceeds its tariff or has been locked
    pub limited: bool,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionHandle>,
}

impl ResourceMeta {
    pub fn new(owner_user_id: UserId, tariff_id: TariffId, label: impl Into<String>) -> Self {
        Self {
            id: ResourceId::new_v4(),
            owner_user_id,
            tariff_id,
            label: label.into(),
            deleted: false,
            delete_time: None,
            limited: false,
            created_at: Utc::now(),
            subscription: None,
        }
    }
}

/// Namespace limits, copied from the tariff the namespace is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct NamespaceQuota {
    /// Millicores
    pub cpu_limit: i32,
    /// MiB
    pub memory_limit: i32,
    pub max_external_services: i32,
    pub max_internal_services: i32,
    /// GB
    pub max_traffic: i32,
}

impl From<&NamespaceTariff> for NamespaceQuota {
    fn from(tariff: &NamespaceTariff) -> Self {
        Self {
            cpu_limit: tariff.cpu_limit,
            memory_limit: tariff.memory_limit,
            max_external_services: tariff.max_external_services,
            max_internal_services: tariff.max_internal_services,
            max_traffic: tariff.max_traffic,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Namespace {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub meta: ResourceMeta,
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub quota: NamespaceQuota,
    /// Live volumes attached to this namespace
    #[sqlx(skip)]
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[sqlx(skip)]
    #[serde(default)]
    pub access: Vec<AccessRecord>,
}

impl Namespace {
    /// Volumes that came with the namespace tariff. They carry the namespace's tariff
    /// ID, which sets them apart from volumes attached with a tariff of their own.
    pub fn bundled_volumes(&self) -> impl Iterator<Item = &Volume> {
        self.volumes
            .iter()
            .filter(|v| !v.persistent && v.meta.tariff_id == self.meta.tariff_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Volume {
    #[serde(flatten)]
    #[sqlx(flatten)]
    pub meta: ResourceMeta,
    /// GiB
    pub storage_size: i32,
    pub replicas: i32,
    /// Persistent volumes outlive their namespace
    pub persistent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace_id: Option<ResourceId>,
    #[sqlx(skip)]
    #[serde(default)]
    pub access: Vec<AccessRecord>,
}

/// A user's access to one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct AccessRecord {
    pub kind: ResourceKind,
    pub resource_id: ResourceId,
    pub user_id: UserId,
    pub access: AccessLevel,
    /// Level written but not yet propagated to the auth cache
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_access: Option<AccessLevel>,
    pub changed_at: DateTime<Utc>,
}

impl AccessRecord {
    /// A record whose level is effective immediately but still awaits auth invalidation.
    pub fn pending(kind: ResourceKind, resource_id: ResourceId, user_id: UserId, access: AccessLevel) -> Self {
        Self {
            kind,
            resource_id,
            user_id,
            access,
            pending_access: Some(access),
            changed_at: Utc::now(),
        }
    }

    pub fn owner(kind: ResourceKind, resource_id: ResourceId, user_id: UserId) -> Self {
        Self {
            kind,
            resource_id,
            user_id,
            access: AccessLevel::Owner,
            pending_access: None,
            changed_at: Utc::now(),
        }
    }
}

/// Live resources owned by a user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCount {
    pub namespaces: i64,
    pub volumes: i64,
}

/// Closed set of list filters. Each maps to a record predicate and a SQL condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceFilter {
    Deleted,
    NotDeleted,
    Limited,
    NotLimited,
    /// Owned by the querying user, as opposed to shared with them
    Owned,
    NotOwned,
    /// Volumes only
    Persistent,
    NotPersistent,
}

impl ResourceFilter {
    const ALL: [ResourceFilter; 8] = [
        ResourceFilter::Deleted,
        ResourceFilter::NotDeleted,
        ResourceFilter::Limited,
        ResourceFilter::NotLimited,
        ResourceFilter::Owned,
        ResourceFilter::NotOwned,
        ResourceFilter::Persistent,
        ResourceFilter::NotPersistent,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            ResourceFilter::Deleted => "deleted",
            ResourceFilter::NotDeleted => "not_deleted",
            ResourceFilter::Limited => "limited",
            ResourceFilter::NotLimited => "not_limited",
            ResourceFilter::Owned => "owned",
            ResourceFilter::NotOwned => "not_owned",
            ResourceFilter::Persistent => "persistent",
            ResourceFilter::NotPersistent => "not_persistent",
        }
    }

    /// SQL condition over the resource table aliased as `r`. Ownership conditions
    /// end in a comparison operator and expect the querying user to be bound next.
    pub const fn sql_condition(self) -> &'static str {
        match self {
            ResourceFilter::Deleted => "r.deleted",
            ResourceFilter::NotDeleted => "NOT r.deleted",
            ResourceFilter::Limited => "r.limited",
            ResourceFilter::NotLimited => "NOT r.limited",
            ResourceFilter::Owned => "r.owner_user_id =",
            ResourceFilter::NotOwned => "r.owner_user_id <>",
            ResourceFilter::Persistent => "r.persistent",
            ResourceFilter::NotPersistent => "NOT r.persistent",
        }
    }

    pub const fn binds_user(self) -> bool {
        matches!(self, ResourceFilter::Owned | ResourceFilter::NotOwned)
    }

    pub const fn applies_to(self, kind: ResourceKind) -> bool {
        match self {
            ResourceFilter::Persistent | ResourceFilter::NotPersistent => matches!(kind, ResourceKind::Volume),
            _ => true,
        }
    }

    /// Evaluate the filter against a record. `persistent` is `None` for namespaces.
    ///
    /// Ownership filters never match without a querying user, like a SQL comparison
    /// against NULL.
    pub fn matches(self, meta: &ResourceMeta, persistent: Option<bool>, user: Option<UserId>) -> bool {
        match self {
            ResourceFilter::Deleted => meta.deleted,
            ResourceFilter::NotDeleted => !meta.deleted,
            ResourceFilter::Limited => meta.limited,
            ResourceFilter::NotLimited => !meta.limited,
            ResourceFilter::Owned => user.is_some_and(|user| meta.owner_user_id == user),
            ResourceFilter::NotOwned => user.is_some_and(|user| meta.owner_user_id != user),
            ResourceFilter::Persistent => persistent.unwrap_or(true),
            ResourceFilter::NotPersistent => !persistent.unwrap_or(false),
        }
    }
}

impl fmt::Display for ResourceFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        ResourceFilter::ALL
            .into_iter()
            .find(|filter| filter.as_str() == normalized)
            .ok_or_else(|| format!("unknown filter '{s}'"))
    }
}

/// Parse a comma separated filter list such as `limited,not_owned`.
pub fn parse_filters(raw: &str) -> Result<Vec<ResourceFilter>, String> {
    raw.split(',')
        .filter(|part| !part.trim().is_empty())
        .map(str::parse)
        .collect()
}

/// One page of a resource listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListQuery {
    /// Restrict to resources this user holds access to. `None` lists every user's resources.
    pub user: Option<UserId>,
    pub filters: Vec<ResourceFilter>,
    /// Volumes only: restrict to volumes attached to this namespace
    pub namespace_id: Option<ResourceId>,
    /// Keyset cursor: only resources with an ID strictly greater than this
    pub after: Option<ResourceId>,
    pub limit: Option<usize>,
}

impl ListQuery {
    pub fn for_user(user: UserId) -> Self {
        Self {
            user: Some(user),
            ..Default::default()
        }
    }

    pub fn everyone() -> Self {
        Self::default()
    }

    pub fn with_filters(mut self, filters: impl IntoIterator<Item = ResourceFilter>) -> Self {
        self.filters.extend(filters);
        self
    }

    pub fn in_namespace(mut self, namespace_id: ResourceId) -> Self {
        self.namespace_id = Some(namespace_id);
        self
    }

    pub fn after(mut self, cursor: Option<ResourceId>) -> Self {
        self.after = cursor;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Filters that apply to `kind`, with `not_deleted` added when the query says
    /// nothing about deletion.
    pub fn effective_filters(&self, kind: ResourceKind) -> Vec<ResourceFilter> {
        let mut filters: Vec<ResourceFilter> = self.filters.iter().copied().filter(|f| f.applies_to(kind)).collect();
        if !filters
            .iter()
            .any(|f| matches!(f, ResourceFilter::Deleted | ResourceFilter::NotDeleted))
        {
            filters.push(ResourceFilter::NotDeleted);
        }
        filters.dedup();
        filters
    }
}
