use crate::access::AccessLevel;
use crate::adapters::{AdapterError, ExternalSystem};
use crate::db::errors::DbError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::fmt;
use thiserror::Error as ThisError;

/// Transaction phase that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStage {
    Begin,
    Commit,
    Rollback,
}

impl fmt::Display for TransactionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionStage::Begin => write!(f, "begin"),
            TransactionStage::Commit => write!(f, "commit"),
            TransactionStage::Rollback => write!(f, "rollback"),
        }
    }
}

/// Why a tariff was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TariffRejection {
    Inactive,
    NotPublic,
    Unchanged,
}

impl fmt::Display for TariffRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TariffRejection::Inactive => write!(f, "is not active"),
            TariffRejection::NotPublic => write!(f, "is not public"),
            TariffRejection::Unchanged => write!(f, "is already in use"),
        }
    }
}

#[derive(ThisError, Debug)]
pub enum Error {
    /// Caller identity missing or malformed
    #[error("Not authenticated")]
    Unauthenticated { message: Option<String> },

    /// Requested resource not found (or soft-deleted)
    #[error("{resource} {id} not found")]
    NotFound { resource: String, id: String },

    /// A live resource of the same kind and owner already uses the label
    #[error("{resource} with label '{label}' already exists")]
    AlreadyExists { resource: String, label: String },

    /// Caller's access level does not reach the one the operation requires
    #[error("{action} on {resource} requires {required} access, caller holds {held}")]
    PermissionDenied {
        action: String,
        resource: String,
        required: AccessLevel,
        held: AccessLevel,
    },

    /// Operation reserved to admins or to the user it concerns
    #[error("{action} is not permitted for this caller")]
    Forbidden { action: String },

    /// Malformed label, tariff or request
    #[error("{message}")]
    BadInput { message: String },

    /// Tariff exists but cannot be used
    #[error("Tariff {tariff} {reason}")]
    TariffInvalid { tariff: String, reason: TariffRejection },

    /// An external collaborator failed and the operation was rolled back
    #[error("{service} failure during {operation}: {source}")]
    ExternalService {
        service: ExternalSystem,
        operation: String,
        #[source]
        source: AdapterError,
    },

    /// The store could not begin, commit or roll back a transaction
    #[error("Failed to {stage} transaction: {source}")]
    TransactionFailure {
        stage: TransactionStage,
        #[source]
        source: DbError,
    },

    /// The operation failed and so did part of its rollback
    #[error("{operation} failed ({trigger}) and {} compensation(s) failed", failures.len())]
    SagaPartialRollback {
        operation: String,
        trigger: String,
        failures: Vec<String>,
    },

    /// Other store errors
    #[error(transparent)]
    Database(#[from] DbError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Vec<String>>,
}

impl Error {
    pub fn not_found(resource: impl fmt::Display, id: impl fmt::Display) -> Self {
        Error::NotFound {
            resource: resource.to_string(),
            id: id.to_string(),
        }
    }

    pub fn bad_input(message: impl Into<String>) -> Self {
        Error::BadInput { message: message.into() }
    }

    /// Stable symbolic code callers can branch on.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Unauthenticated { .. } => "unauthenticated",
            Error::NotFound { .. } => "not_found",
            Error::AlreadyExists { .. } => "already_exists",
            Error::PermissionDenied { .. } | Error::Forbidden { .. } => "permission_denied",
            Error::BadInput { .. } => "bad_input",
            Error::TariffInvalid { .. } => "tariff_invalid",
            Error::ExternalService { .. } => "external_service_failure",
            Error::TransactionFailure { .. } => "transaction_failure",
            Error::SagaPartialRollback { .. } => "saga_partial_rollback",
            Error::Database(DbError::NotFound) => "not_found",
            Error::Database(DbError::UniqueViolation { .. }) => "already_exists",
            Error::Database(DbError::ForeignKeyViolation { .. }) => "bad_input",
            Error::Database(DbError::Other(_)) | Error::Other(_) => "internal",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::AlreadyExists { .. } => StatusCode::CONFLICT,
            Error::PermissionDenied { .. } | Error::Forbidden { .. } => StatusCode::FORBIDDEN,
            Error::BadInput { .. } => StatusCode::BAD_REQUEST,
            Error::TariffInvalid { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Error::ExternalService { .. } => StatusCode::BAD_GATEWAY,
            Error::TransactionFailure { .. } | Error::SagaPartialRollback { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Database(db_err) => match db_err {
                DbError::NotFound => StatusCode::NOT_FOUND,
                DbError::UniqueViolation { .. } => StatusCode::CONFLICT,
                DbError::ForeignKeyViolation { .. } => StatusCode::BAD_REQUEST,
                DbError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::Unauthenticated { message } => message.clone().unwrap_or_else(|| "Authentication required".to_string()),
            Error::ExternalService { service, operation, .. } => {
                format!("{operation} failed because the {service} service is unavailable")
            }
            Error::TransactionFailure { .. } | Error::Database(DbError::Other(_)) | Error::Other(_) => {
                "Internal server error".to_string()
            }
            Error::SagaPartialRollback { operation, .. } => {
                format!("{operation} failed and could not be fully rolled back; an operator has been alerted")
            }
            Error::Database(DbError::NotFound) => "Resource not found".to_string(),
            Error::Database(DbError::UniqueViolation { .. }) => "Resource already exists".to_string(),
            Error::Database(DbError::ForeignKeyViolation { .. }) => "Invalid reference to related resource".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match &self {
            Error::SagaPartialRollback { .. } => {
                tracing::error!(error = ?self, "Rollback incomplete, manual reconciliation required");
            }
            Error::Database(DbError::Other(_)) | Error::TransactionFailure { .. } | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::ExternalService { .. } => {
                tracing::warn!("External service error: {}", self);
            }
            Error::Database(_) | Error::AlreadyExists { .. } => {
                tracing::warn!("Conflict error: {}", self);
            }
            Error::Unauthenticated { .. } | Error::PermissionDenied { .. } | Error::Forbidden { .. } => {
                tracing::info!("Authorization error: {}", self);
            }
            Error::BadInput { .. } | Error::NotFound { .. } | Error::TariffInvalid { .. } => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let details = match &self {
            Error::SagaPartialRollback { failures, .. } => Some(failures.clone()),
            _ => None,
        };
        let body = ErrorBody {
            code: self.code(),
            message: self.user_message(),
            details,
        };

        (self.status_code(), Json(body)).into_response()
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;
