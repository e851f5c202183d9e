//! HTTP surface: request/response models and axum handlers.
//!
//! Every route under `/api/v1` resolves a [`crate::types::Caller`] from proxy
//! headers first; handlers then delegate to [`crate::service::ResourceService`].

pub mod handlers;
pub mod models;
