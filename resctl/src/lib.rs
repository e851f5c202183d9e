//! # resctl: resource provisioning control layer
//!
//! `resctl` provisions namespaces and volumes on behalf of users. One user-facing
//! operation touches several independent systems (the cluster provisioner, billing,
//! a mailer and the platform auth cache) plus its own metadata store, and has to
//! leave all of them consistent when any one fails.
//!
//! ## Architecture
//!
//! ```text
//! HTTP (axum, /api/v1)
//!   └─ api::handlers ─ Caller from proxy headers (auth)
//!        └─ service::ResourceService ─ permission checks (access), validation
//!             ├─ saga::SagaCoordinator ─ concurrent forward steps, reverse-order compensation
//!             │    └─ adapters::{Provisioner, Billing}
//!             ├─ db::ResourceStore ─ PostgreSQL (sqlx) or in-memory
//!             └─ adapters::{Notifier, AuthCache} ─ best effort / retried in background
//! ```
//!
//! Background tasks (garbage collection of soft-deleted resources, re-propagation of
//! pending access changes) share a [`CancellationToken`] with the server and stop
//! with it.
//!
//! ## Configuration
//!
//! See [`config`]. With no `database.url` the store is kept in memory; with all
//! adapters left at `dummy` the process runs without any external dependency.

pub mod access;
pub mod adapters;
pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod errors;
pub mod saga;
pub mod service;
pub mod telemetry;
pub mod types;

#[cfg(test)]
mod test;

use axum::{
    Router,
    routing::{delete, get, put},
};
use bon::Builder;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

pub use config::Config;

use crate::{
    db::{InMemoryStore, PgStore, ResourceStore},
    saga::SagaCoordinator,
    service::{ResourceService, TariffCache, background},
};

/// Schema migrations, applied at startup unless `database.run_migrations` is off.
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub service: ResourceService,
}

/// Build the service from configuration: adapters from their factories, the saga
/// deadlines and the tariff cache TTL.
pub fn build_service(config: &Config, store: Arc<dyn ResourceStore>) -> anyhow::Result<ResourceService> {
    Ok(ResourceService::builder()
        .store(store)
        .provisioner(adapters::create_provisioner(&config.provisioner)?)
        .billing(adapters::create_billing(&config.billing)?)
        .notifier(adapters::create_notifier(&config.mailer)?)
        .auth_cache(adapters::create_auth_cache(&config.auth_cache)?)
        .sagas(SagaCoordinator::new(&config.saga))
        .tariffs(TariffCache::new(config.tariff_cache_ttl))
        .retry_schedule(config.invalidation.retry_schedule())
        .page_size(config.list_page_size)
        .build())
}

pub fn build_router(state: AppState) -> Router {
    use api::handlers::{access, namespaces, users, volumes};

    let api_routes = Router::new()
        // Namespaces
        .route("/namespaces", get(namespaces::list_namespaces).post(namespaces::create_namespace))
        .route(
            "/namespaces/{id}",
            get(namespaces::get_namespace).delete(namespaces::delete_namespace),
        )
        .route("/namespaces/{id}/label", put(namespaces::rename_namespace))
        .route("/namespaces/{id}/tariff", put(namespaces::resize_namespace))
        .route("/namespaces/{id}/lock", put(namespaces::lock_namespace))
        .route(
            "/namespaces/{id}/access/{user_id}",
            put(access::change_namespace_access).delete(access::delete_namespace_access),
        )
        // Volumes
        .route("/volumes", get(volumes::list_volumes).post(volumes::create_volume))
        .route("/volumes/{id}", get(volumes::get_volume).delete(volumes::delete_volume))
        .route("/volumes/{id}/label", put(volumes::rename_volume))
        .route("/volumes/{id}/tariff", put(volumes::resize_volume))
        .route("/volumes/{id}/lock", put(volumes::lock_volume))
        .route(
            "/volumes/{id}/access/{user_id}",
            put(access::change_volume_access).delete(access::delete_volume_access),
        )
        // Per-user operations
        .route("/users/{user_id}/volumes", delete(users::delete_user_volumes))
        .route("/users/{user_id}/resources/count", get(users::count_user_resources))
        // Admin streams
        .route("/admin/namespaces", get(namespaces::stream_all_namespaces))
        .route("/admin/volumes", get(volumes::stream_all_volumes))
        .with_state(state);

    Router::new()
        .route("/healthz", get(api::handlers::healthz))
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
}

/// Background tasks and the token that stops them.
pub struct BackgroundServices {
    background_tasks: Vec<tokio::task::JoinHandle<()>>,
    shutdown_token: CancellationToken,
}

impl BackgroundServices {
    pub async fn shutdown(self) {
        self.shutdown_token.cancel();
        for handle in self.background_tasks {
            let _ = handle.await;
        }
    }
}

async fn setup_background_services(
    config: &Config,
    service: &ResourceService,
    shutdown_token: CancellationToken,
) -> anyhow::Result<BackgroundServices> {
    let mut background_tasks = Vec::new();

    if config.garbage_collection.enabled {
        background_tasks.push(tokio::spawn(background::run_garbage_collector(
            service.store().clone(),
            config.garbage_collection.clone(),
            shutdown_token.clone(),
        )));
    } else {
        info!("Garbage collection disabled");
    }

    match service.reconcile_pending_access().await {
        Ok(count) => debug!(count, "Pending access reconciled"),
        Err(e) => warn!(error = %e, "Failed to reconcile pending access changes"),
    }

    Ok(BackgroundServices {
        background_tasks,
        shutdown_token,
    })
}

async fn setup_store(config: &Config) -> anyhow::Result<(Arc<dyn ResourceStore>, Option<PgStore>)> {
    if config.database.url.is_none() {
        warn!("No database configured, resource metadata is kept in memory and lost on exit");
        return Ok((Arc::new(InMemoryStore::new()), None));
    }

    let store = PgStore::connect(&config.database).await?;
    if config.database.run_migrations {
        info!("Running database migrations...");
        migrator().run(store.pool()).await?;
    }
    Ok((Arc::new(store.clone()), Some(store)))
}

pub struct Application {
    router: Router,
    config: Config,
    pg: Option<PgStore>,
    bg_services: BackgroundServices,
}

impl Application {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting resctl with configuration: {:#?}", config);

        let (store, pg) = setup_store(&config).await?;
        let service = build_service(&config, store)?;

        let shutdown_token = CancellationToken::new();
        let bg_services = setup_background_services(&config, &service, shutdown_token).await?;

        let state = AppState::builder().config(config.clone()).service(service).build();
        let router = build_router(state);

        Ok(Self {
            router,
            config,
            pg,
            bg_services,
        })
    }

    #[cfg(test)]
    pub fn into_test_server(self) -> (axum_test::TestServer, BackgroundServices) {
        let server = axum_test::TestServer::new(self.router.into_make_service()).expect("Failed to create test server");
        (server, self.bg_services)
    }

    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("resctl listening on http://{}", bind_addr);

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        self.bg_services.shutdown().await;

        if let Some(pg) = self.pg {
            info!("Closing database connections...");
            pg.pool().close().await;
        }

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();
        Ok(())
    }
}
