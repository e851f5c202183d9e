//! Deterministic in-process adapters.
//!
//! These stand-ins keep their state in memory, record every call they receive and
//! can be told to fail specific operations. They back the test suite and the
//! `dummy` configuration used for local development.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use crate::{
    adapters::{
        AdapterError, AuthCache, Billing, ExternalSystem, NamespaceTariff, Notifier, Provisioner, Result, SubscriptionHandle,
        VolumeTariff,
    },
    config::DummyBillingConfig,
    types::{ResourceId, TariffId, UserId},
};

fn injected(system: ExternalSystem, operation: &str) -> AdapterError {
    AdapterError::Status {
        system,
        status: 503,
        message: format!("injected failure for {operation}"),
    }
}

/// Provisioner operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProvisionerOp {
    CreateNamespace,
    DeleteNamespace,
    ResizeNamespace,
    CreateVolume,
    DeleteVolume,
    ResizeVolume,
}

/// A call received by [`DummyProvisioner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionerCall {
    CreateNamespace { id: ResourceId, cpu: i32, memory: i32 },
    DeleteNamespace { id: ResourceId },
    ResizeNamespace { id: ResourceId, cpu: i32, memory: i32 },
    CreateVolume { id: ResourceId, size: i32, replicas: i32 },
    DeleteVolume { id: ResourceId },
    ResizeVolume { id: ResourceId, size: i32, replicas: i32 },
}

#[derive(Default)]
struct ProvisionerState {
    namespaces: HashMap<ResourceId, (i32, i32)>,
    volumes: HashMap<ResourceId, (i32, i32)>,
    calls: Vec<ProvisionerCall>,
    failing: HashSet<ProvisionerOp>,
    delays: HashMap<ProvisionerOp, Duration>,
}

/// In-memory cluster provisioner.
#[derive(Clone, Default)]
pub struct DummyProvisioner {
    state: Arc<Mutex<ProvisionerState>>,
}

impl DummyProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call of `op` fail.
    pub fn fail_on(&self, op: ProvisionerOp) {
        self.state.lock().failing.insert(op);
    }

    pub fn recover(&self, op: ProvisionerOp) {
        self.state.lock().failing.remove(&op);
    }

    /// Delay every subsequent call of `op` before it takes effect.
    pub fn delay(&self, op: ProvisionerOp, delay: Duration) {
        self.state.lock().delays.insert(op, delay);
    }

    pub fn calls(&self) -> Vec<ProvisionerCall> {
        self.state.lock().calls.clone()
    }

    pub fn namespace(&self, id: ResourceId) -> Option<(i32, i32)> {
        self.state.lock().namespaces.get(&id).copied()
    }

    pub fn volume(&self, id: ResourceId) -> Option<(i32, i32)> {
        self.state.lock().volumes.get(&id).copied()
    }

    /// Record the call, then sleep and check for injected failures.
    async fn enter(&self, op: ProvisionerOp, call: ProvisionerCall) -> Result<()> {
        let delay = {
            let mut state = self.state.lock();
            state.calls.push(call);
            state.delays.get(&op).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.lock().failing.contains(&op) {
            return Err(injected(ExternalSystem::Provisioner, &format!("{op:?}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Provisioner for DummyProvisioner {
    async fn create_namespace(&self, id: ResourceId, cpu: i32, memory: i32) -> Result<()> {
        self.enter(ProvisionerOp::CreateNamespace, ProvisionerCall::CreateNamespace { id, cpu, memory })
            .await?;
        self.state.lock().namespaces.insert(id, (cpu, memory));
        Ok(())
    }

    async fn delete_namespace(&self, id: ResourceId) -> Result<()> {
        self.enter(ProvisionerOp::DeleteNamespace, ProvisionerCall::DeleteNamespace { id })
            .await?;
        self.state.lock().namespaces.remove(&id);
        Ok(())
    }

    async fn resize_namespace(&self, id: ResourceId, cpu: i32, memory: i32) -> Result<()> {
        self.enter(ProvisionerOp::ResizeNamespace, ProvisionerCall::ResizeNamespace { id, cpu, memory })
            .await?;
        let mut state = self.state.lock();
        match state.namespaces.get_mut(&id) {
            Some(quota) => {
                *quota = (cpu, memory);
                Ok(())
            }
            None => Err(AdapterError::NotFound {
                system: ExternalSystem::Provisioner,
                what: format!("namespace {id}"),
            }),
        }
    }

    async fn create_volume(&self, id: ResourceId, size: i32, replicas: i32) -> Result<()> {
        self.enter(ProvisionerOp::CreateVolume, ProvisionerCall::CreateVolume { id, size, replicas })
            .await?;
        self.state.lock().volumes.insert(id, (size, replicas));
        Ok(())
    }

    async fn delete_volume(&self, id: ResourceId) -> Result<()> {
        self.enter(ProvisionerOp::DeleteVolume, ProvisionerCall::DeleteVolume { id }).await?;
        self.state.lock().volumes.remove(&id);
        Ok(())
    }

    async fn resize_volume(&self, id: ResourceId, size: i32, replicas: i32) -> Result<()> {
        self.enter(ProvisionerOp::ResizeVolume, ProvisionerCall::ResizeVolume { id, size, replicas })
            .await?;
        let mut state = self.state.lock();
        match state.volumes.get_mut(&id) {
            Some(spec) => {
                *spec = (size, replicas);
                Ok(())
            }
            None => Err(AdapterError::NotFound {
                system: ExternalSystem::Provisioner,
                what: format!("volume {id}"),
            }),
        }
    }
}

/// Billing operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BillingOp {
    Subscribe,
    Unsubscribe,
    Tariffs,
}

/// A live subscription held by [`DummyBilling`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub user: UserId,
    pub tariff: TariffId,
    pub resource: ResourceId,
}

/// A call received by [`DummyBilling`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BillingCall {
    Subscribe { user: UserId, tariff: TariffId, resource: ResourceId },
    Unsubscribe { handle: SubscriptionHandle },
}

#[derive(Default)]
struct BillingState {
    namespace_tariffs: HashMap<TariffId, NamespaceTariff>,
    volume_tariffs: HashMap<TariffId, VolumeTariff>,
    subscriptions: HashMap<SubscriptionHandle, Subscription>,
    calls: Vec<BillingCall>,
    tariff_lookups: usize,
    failing: HashSet<BillingOp>,
    rotate_handles: bool,
    issued: u64,
}

/// In-memory billing service with a fixed tariff catalogue.
#[derive(Clone, Default)]
pub struct DummyBilling {
    state: Arc<Mutex<BillingState>>,
}

impl From<DummyBillingConfig> for DummyBilling {
    fn from(config: DummyBillingConfig) -> Self {
        let billing = Self::default();
        for tariff in config.namespace_tariffs {
            billing.add_namespace_tariff(tariff);
        }
        for tariff in config.volume_tariffs {
            billing.add_volume_tariff(tariff);
        }
        billing
    }
}

impl DummyBilling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_namespace_tariff(&self, tariff: NamespaceTariff) {
        self.state.lock().namespace_tariffs.insert(tariff.id, tariff);
    }

    pub fn add_volume_tariff(&self, tariff: VolumeTariff) {
        self.state.lock().volume_tariffs.insert(tariff.id, tariff);
    }

    pub fn fail_on(&self, op: BillingOp) {
        self.state.lock().failing.insert(op);
    }

    pub fn recover(&self, op: BillingOp) {
        self.state.lock().failing.remove(&op);
    }

    pub fn calls(&self) -> Vec<BillingCall> {
        self.state.lock().calls.clone()
    }

    /// Number of tariff lookups that reached the service.
    pub fn tariff_lookups(&self) -> usize {
        self.state.lock().tariff_lookups
    }

    /// Issue a fresh handle whenever a resource without a live subscription is
    /// subscribed, the way a real billing service does after a cancellation.
    pub fn rotate_handles(&self) {
        self.state.lock().rotate_handles = true;
    }

    pub fn subscription(&self, resource: ResourceId) -> Option<Subscription> {
        self.state
            .lock()
            .subscriptions
            .values()
            .find(|s| s.resource == resource)
            .cloned()
    }

    /// Handle of the live subscription for `resource`.
    pub fn handle_of(&self, resource: ResourceId) -> Option<SubscriptionHandle> {
        self.state
            .lock()
            .subscriptions
            .iter()
            .find(|(_, s)| s.resource == resource)
            .map(|(handle, _)| handle.clone())
    }

    /// Handles are derived from the resource unless [`rotate_handles`](Self::rotate_handles) is set.
    pub fn handle_for(resource: ResourceId) -> SubscriptionHandle {
        format!("sub-{resource}")
    }

    fn check(&self, op: BillingOp) -> Result<()> {
        if self.state.lock().failing.contains(&op) {
            return Err(injected(ExternalSystem::Billing, &format!("{op:?}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Billing for DummyBilling {
    async fn subscribe(&self, user: UserId, tariff: TariffId, resource: ResourceId) -> Result<SubscriptionHandle> {
        self.state.lock().calls.push(BillingCall::Subscribe { user, tariff, resource });
        self.check(BillingOp::Subscribe)?;
        let mut state = self.state.lock();
        let existing = state
            .subscriptions
            .iter()
            .find(|(_, s)| s.resource == resource)
            .map(|(handle, _)| handle.clone());
        let handle = match existing {
            Some(handle) => handle,
            None if state.rotate_handles => {
                state.issued += 1;
                format!("sub-{resource}-{}", state.issued)
            }
            None => Self::handle_for(resource),
        };
        state
            .subscriptions
            .insert(handle.clone(), Subscription { user, tariff, resource });
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: &str) -> Result<()> {
        self.state.lock().calls.push(BillingCall::Unsubscribe {
            handle: handle.to_string(),
        });
        self.check(BillingOp::Unsubscribe)?;
        self.state.lock().subscriptions.remove(handle);
        Ok(())
    }

    async fn namespace_tariff(&self, id: TariffId) -> Result<NamespaceTariff> {
        self.check(BillingOp::Tariffs)?;
        let mut state = self.state.lock();
        state.tariff_lookups += 1;
        state.namespace_tariffs.get(&id).cloned().ok_or_else(|| AdapterError::NotFound {
            system: ExternalSystem::Billing,
            what: format!("namespace tariff {id}"),
        })
    }

    async fn volume_tariff(&self, id: TariffId) -> Result<VolumeTariff> {
        self.check(BillingOp::Tariffs)?;
        let mut state = self.state.lock();
        state.tariff_lookups += 1;
        state.volume_tariffs.get(&id).cloned().ok_or_else(|| AdapterError::NotFound {
            system: ExternalSystem::Billing,
            what: format!("volume tariff {id}"),
        })
    }
}

/// A notification delivered through [`DummyNotifier`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Created { user: UserId, label: String, tariff: String },
    Deleted { user: UserId, label: String },
}

/// Notifier that keeps delivered notifications in memory.
#[derive(Clone, Default)]
pub struct DummyNotifier {
    sent: Arc<Mutex<Vec<Notification>>>,
    failing: Arc<Mutex<bool>>,
}

impl DummyNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    fn deliver(&self, notification: Notification) -> Result<()> {
        if *self.failing.lock() {
            return Err(injected(ExternalSystem::Mailer, "notification"));
        }
        self.sent.lock().push(notification);
        Ok(())
    }
}

#[async_trait]
impl Notifier for DummyNotifier {
    async fn notify_created(&self, user: UserId, label: &str, tariff: &str) -> Result<()> {
        self.deliver(Notification::Created {
            user,
            label: label.to_string(),
            tariff: tariff.to_string(),
        })
    }

    async fn notify_deleted(&self, user: UserId, label: &str) -> Result<()> {
        self.deliver(Notification::Deleted {
            user,
            label: label.to_string(),
        })
    }
}

#[derive(Default)]
struct AuthCacheState {
    invalidated: Vec<UserId>,
    attempts: usize,
    failures_left: usize,
}

/// Auth cache that can fail a fixed number of times before succeeding.
#[derive(Clone, Default)]
pub struct DummyAuthCache {
    state: Arc<Mutex<AuthCacheState>>,
}

impl DummyAuthCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` invalidation attempts.
    pub fn fail_times(&self, times: usize) {
        self.state.lock().failures_left = times;
    }

    /// Users whose cache was invalidated successfully, in order.
    pub fn invalidated(&self) -> Vec<UserId> {
        self.state.lock().invalidated.clone()
    }

    pub fn attempts(&self) -> usize {
        self.state.lock().attempts
    }
}

#[async_trait]
impl AuthCache for DummyAuthCache {
    async fn invalidate_user_access(&self, user: UserId) -> Result<()> {
        let mut state = self.state.lock();
        state.attempts += 1;
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(injected(ExternalSystem::AuthCache, "invalidation"));
        }
        state.invalidated.push(user);
        Ok(())
    }
}
