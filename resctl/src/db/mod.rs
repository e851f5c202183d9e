//! Resource metadata persistence.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │ ResourceService  │  (service - permission checks, sagas)
//! └────────┬─────────┘
//!          │  ResourceStore / StoreTx
//!          ↓
//! ┌──────────────────┐      ┌──────────────────┐
//! │     PgStore      │  or  │  InMemoryStore   │
//! └────────┬─────────┘      └──────────────────┘
//!          ↓
//! ┌──────────────────┐
//! │    PostgreSQL    │
//! └──────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`store`]: the [`ResourceStore`](store::ResourceStore) and [`StoreTx`](store::StoreTx)
//!   traits and the [`in_transaction`](store::in_transaction) helper
//! - [`models`]: namespace, volume and access records, list queries and filters
//! - [`postgres`]: sqlx implementation
//! - [`in_memory`]: deterministic implementation for tests and local development
//! - [`errors`]: store error type
//!
//! # Transactions
//!
//! Every mutation happens inside a transaction owned by a single operation:
//!
//! ```ignore
//! in_transaction(store.as_ref(), move |tx| {
//!     Box::pin(async move {
//!         tx.rename(ResourceKind::Namespace, id, &label).await?;
//!         Ok(())
//!     })
//! })
//! .await?;
//! ```
//!
//! # Migrations
//!
//! The PostgreSQL schema lives in `migrations/` and is applied with [`crate::migrator`].

pub mod errors;
pub mod in_memory;
pub mod models;
pub mod postgres;
pub mod store;

pub use in_memory::InMemoryStore;
pub use postgres::PgStore;
pub use store::{ResourceStore, StoreTx, in_transaction};
