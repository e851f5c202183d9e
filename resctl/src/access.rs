//! Access levels and the permission check.
//!
//! Every user holds at most one [`AccessLevel`] per resource. The levels form a
//! chain in which each level contains the capabilities of the ones below it:
//!
//! ```text
//! Owner ⊇ Write ⊇ ReadDelete ⊇ Read ⊇ None
//! ```
//!
//! [`check_permission`] walks that chain downwards from the held level, so a caller
//! is granted an operation iff its level reaches the operation's required level.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A point on the capability scale a user holds over a resource.
///
/// Declaration order is the capability order, so the derived `Ord` can be used
/// directly for comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "access_level", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AccessLevel {
    None,
    Read,
    ReadDelete,
    Write,
    Owner,
}

impl AccessLevel {
    /// All levels, weakest first.
    pub const fn all() -> [AccessLevel; 5] {
        [
            AccessLevel::None,
            AccessLevel::Read,
            AccessLevel::ReadDelete,
            AccessLevel::Write,
            AccessLevel::Owner,
        ]
    }

    /// The next weaker level in the chain, if any.
    pub const fn lower(self) -> Option<AccessLevel> {
        match self {
            AccessLevel::Owner => Some(AccessLevel::Write),
            AccessLevel::Write => Some(AccessLevel::ReadDelete),
            AccessLevel::ReadDelete => Some(AccessLevel::Read),
            AccessLevel::Read => Some(AccessLevel::None),
            AccessLevel::None => None,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            AccessLevel::None => "none",
            AccessLevel::Read => "read",
            AccessLevel::ReadDelete => "read_delete",
            AccessLevel::Write => "write",
            AccessLevel::Owner => "owner",
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccessLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AccessLevel::all()
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown access level '{s}'"))
    }
}

/// Returns true iff `held` grants an operation that requires `required`.
///
/// The held level is degraded one step at a time until it either meets the
/// required level or falls off the bottom of the chain.
pub fn check_permission(held: AccessLevel, required: AccessLevel) -> bool {
    let mut level = Some(held);
    while let Some(current) = level {
        if current == required {
            return true;
        }
        level = current.lower();
    }
    false
}

/// Levels each operation requires on the target resource.
pub mod required {
    use super::AccessLevel;

    pub const READ: AccessLevel = AccessLevel::Read;
    pub const DELETE: AccessLevel = AccessLevel::ReadDelete;
    pub const RENAME: AccessLevel = AccessLevel::Write;
    pub const RESIZE: AccessLevel = AccessLevel::Write;
    pub const LOCK: AccessLevel = AccessLevel::Write;
    pub const CHANGE_ACCESS: AccessLevel = AccessLevel::Owner;
}
