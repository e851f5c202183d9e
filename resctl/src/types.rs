//! Common type definitions shared across the crate.
//!
//! This module defines:
//! - Type aliases for entity IDs ([`UserId`], [`ResourceId`], [`TariffId`])
//! - [`ResourceKind`], the discriminator between namespaces and volumes
//! - [`Role`] and [`Caller`], the identity an operation is performed on behalf of
//!
//! # Utility Functions
//!
//! - [`abbrev_uuid`]: Abbreviate UUIDs to first 8 chars for logging

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// Type aliases for IDs
pub type UserId = Uuid;
pub type ResourceId = Uuid;
pub type TariffId = Uuid;

/// Abbreviate a UUID to its first 8 characters for more readable logs and traces
/// Example: "550e8400-e29b-41d4-a716-446655440000" -> "550e8400"
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}

/// The two kinds of resource the control layer provisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "resource_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Namespace,
    Volume,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Namespace => write!(f, "namespace"),
            ResourceKind::Volume => write!(f, "volume"),
        }
    }
}

// Platform role, independent of per-resource access levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Admin,
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// The authenticated identity an operation runs on behalf of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub id: UserId,
    pub role: Role,
}

impl Caller {
    pub fn user(id: UserId) -> Self {
        Self { id, role: Role::User }
    }

    pub fn admin(id: UserId) -> Self {
        Self { id, role: Role::Admin }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// The user an operation acts for. An override is only honored for admins.
    pub fn effective_user(&self, target: Option<UserId>) -> UserId {
        match target {
            Some(target) if self.is_admin() => target,
            _ => self.id,
        }
    }
}
