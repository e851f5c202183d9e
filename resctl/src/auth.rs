//! Caller identity from trusted proxy headers.
//!
//! resctl sits behind an authenticating proxy which sets the user ID header (and,
//! for operators, the role header). Requests without a valid user ID are rejected
//! with 401 before reaching a handler.

use axum::{extract::FromRequestParts, http::request::Parts};
use tracing::{instrument, trace};
use uuid::Uuid;

use crate::{
    AppState,
    config::AuthConfig,
    errors::{Error, Result},
    types::{Caller, Role},
};

fn header<'a>(parts: &'a Parts, name: &str) -> Result<Option<&'a str>> {
    match parts.headers.get(name) {
        None => Ok(None),
        Some(value) => value.to_str().map(Some).map_err(|_| Error::Unauthenticated {
            message: Some(format!("header '{name}' is not valid ASCII")),
        }),
    }
}

/// Resolve the caller from request headers.
pub fn caller_from_headers(parts: &Parts, config: &AuthConfig) -> Result<Caller> {
    let raw_id = header(parts, &config.user_header)?.ok_or_else(|| Error::Unauthenticated { message: None })?;
    let id = Uuid::parse_str(raw_id.trim()).map_err(|_| Error::Unauthenticated {
        message: Some(format!("header '{}' is not a valid user ID", config.user_header)),
    })?;

    let role = match header(parts, &config.role_header)? {
        None => Role::User,
        Some(raw) => raw.trim().parse::<Role>().map_err(|e| Error::Unauthenticated { message: Some(e) })?,
    };

    trace!(user = %id, ?role, "Resolved caller from proxy headers");
    Ok(Caller { id, role })
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = Error;

    #[instrument(skip(parts, state))]
    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        caller_from_headers(parts, &state.config.auth)
    }
}
