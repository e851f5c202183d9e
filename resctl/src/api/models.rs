//! Request and response bodies for the HTTP API.

use serde::{Deserialize, Serialize};

use crate::{
    access::AccessLevel,
    db::models::{ResourceFilter, parse_filters},
    errors::{Error, Result},
    service::Keyed,
    types::{ResourceId, TariffId, UserId},
};

/// Query parameters shared by the list endpoints.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListParams {
    /// Comma-separated filters, e.g. `owned,not_limited`
    pub filters: Option<String>,
    /// Keyset cursor: the last ID of the previous page
    pub after: Option<ResourceId>,
    pub limit: Option<usize>,
    /// List as another user sees it (admins only, ignored otherwise)
    pub user: Option<UserId>,
    pub namespace_id: Option<ResourceId>,
}

impl ListParams {
    pub fn filters(&self) -> Result<Vec<ResourceFilter>> {
        match self.filters.as_deref() {
            None => Ok(Vec::new()),
            Some(raw) => parse_filters(raw).map_err(Error::bad_input),
        }
    }
}

/// Admin stream parameters.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StreamParams {
    pub filters: Option<String>,
}

impl StreamParams {
    pub fn filters(&self) -> Result<Vec<ResourceFilter>> {
        match self.filters.as_deref() {
            None => Ok(Vec::new()),
            Some(raw) => parse_filters(raw).map_err(Error::bad_input),
        }
    }
}

/// Query parameters for single-resource reads.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GetParams {
    pub user: Option<UserId>,
}

/// One page of a keyset-paginated listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CursorPage<T> {
    pub data: Vec<T>,
    /// Pass as `after` to fetch the next page; absent on the last page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_after: Option<ResourceId>,
}

impl<T: Keyed> CursorPage<T> {
    /// A full page may have a successor; a short one is the last.
    pub fn new(data: Vec<T>, limit: usize) -> Self {
        let next_after = if data.len() >= limit && limit > 0 {
            data.last().map(Keyed::key)
        } else {
            None
        };
        Self { data, next_after }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NamespaceCreate {
    pub label: String,
    pub tariff_id: TariffId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolumeCreate {
    pub label: String,
    pub tariff_id: TariffId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_id: Option<ResourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LabelUpdate {
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TariffUpdate {
    pub tariff_id: TariffId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockUpdate {
    pub limited: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccessUpdate {
    pub access: AccessLevel,
}
