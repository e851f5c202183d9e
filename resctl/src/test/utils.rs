//! Fixtures for service and API tests: a [`ResourceService`] wired to the in-memory
//! store and dummy adapters, with handles on every collaborator for assertions.
use std::{sync::Arc, time::Duration};

use axum_test::TestServer;
use uuid::Uuid;

use crate::{
    AppState,
    adapters::{
        NamespaceTariff, VolumeTariff,
        dummy::{DummyAuthCache, DummyBilling, DummyNotifier, DummyProvisioner},
    },
    build_router,
    config::{BillingConfig, Config, DummyBillingConfig, SagaConfig},
    db::{InMemoryStore, ResourceStore},
    saga::SagaCoordinator,
    service::ResourceService,
};

pub struct Harness {
    pub service: ResourceService,
    pub store: InMemoryStore,
    pub provisioner: DummyProvisioner,
    pub billing: DummyBilling,
    pub notifier: DummyNotifier,
    pub auth_cache: DummyAuthCache,
}

pub fn create_harness() -> Harness {
    create_harness_with_saga(SagaConfig::default())
}

pub fn create_harness_with_saga(saga: SagaConfig) -> Harness {
    let store = InMemoryStore::new();
    let provisioner = DummyProvisioner::new();
    let billing = DummyBilling::new();
    let notifier = DummyNotifier::new();
    let auth_cache = DummyAuthCache::new();

    let service = ResourceService::builder()
        .store(Arc::new(store.clone()))
        .provisioner(Arc::new(provisioner.clone()))
        .billing(Arc::new(billing.clone()))
        .notifier(Arc::new(notifier.clone()))
        .auth_cache(Arc::new(auth_cache.clone()))
        .sagas(SagaCoordinator::new(&saga))
        .retry_schedule(vec![Duration::from_millis(10), Duration::from_millis(20)])
        .page_size(2)
        .build();

    Harness {
        service,
        store,
        provisioner,
        billing,
        notifier,
        auth_cache,
    }
}

pub fn namespace_tariff(volume_size: i32) -> NamespaceTariff {
    NamespaceTariff {
        id: Uuid::new_v4(),
        label: format!("ns-{volume_size}"),
        cpu_limit: 500,
        memory_limit: 512,
        max_external_services: 1,
        max_internal_services: 5,
        max_traffic: 10,
        volume_size,
        volume_replicas: 1,
        is_active: true,
        is_public: true,
    }
}

pub fn volume_tariff(storage_limit: i32) -> VolumeTariff {
    VolumeTariff {
        id: Uuid::new_v4(),
        label: format!("vol-{storage_limit}"),
        storage_limit,
        replicas: 2,
        is_active: true,
        is_public: true,
    }
}

/// Poll `condition` until it holds; background invalidations run on spawned tasks.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Poll the store until no access change is left pending.
pub async fn pending_cleared(store: &InMemoryStore) -> bool {
    for _ in 0..100 {
        if store.list_pending_access().await.is_ok_and(|pending| pending.is_empty()) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// A test server on the full router, with the given tariffs served by dummy billing.
pub fn create_test_server(namespace_tariffs: Vec<NamespaceTariff>, volume_tariffs: Vec<VolumeTariff>) -> TestServer {
    let config = Config {
        billing: BillingConfig::Dummy(DummyBillingConfig {
            namespace_tariffs,
            volume_tariffs,
        }),
        ..Config::default()
    };
    let service =
        crate::build_service(&config, Arc::new(InMemoryStore::new())).expect("Failed to build resource service");
    let state = AppState::builder().config(config).service(service).build();
    TestServer::new(build_router(state).into_make_service()).expect("Failed to create test server")
}

pub fn user_header(id: Uuid) -> (String, String) {
    ("x-resctl-user-id".to_string(), id.to_string())
}
