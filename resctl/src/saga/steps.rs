//! Provisioner and billing actions used by the resource sagas.
//!
//! Forward actions check the cancellation token before calling out but never abort
//! a call in flight, since the remote side may already have acted on it.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::{
    adapters::{AdapterError, Billing, ExternalSystem, Provisioner, SubscriptionHandle},
    saga::{Action, Step},
    types::{ResourceId, ResourceKind, TariffId, UserId},
};

fn ensure_not_cancelled(cancel: &CancellationToken, system: ExternalSystem) -> Result<(), AdapterError> {
    if cancel.is_cancelled() {
        Err(AdapterError::Cancelled { system })
    } else {
        Ok(())
    }
}

/// CPU (millicores) and memory (MiB) of a namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Compute {
    pub cpu: i32,
    pub memory: i32,
}

/// Size (GiB) and replica count of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Storage {
    pub size: i32,
    pub replicas: i32,
}

pub struct CreateNamespace {
    pub provisioner: Arc<dyn Provisioner>,
    pub id: ResourceId,
    pub compute: Compute,
}

#[async_trait]
impl Action for CreateNamespace {
    type Output = ();

    fn system(&self) -> ExternalSystem {
        ExternalSystem::Provisioner
    }

    async fn forward(&self, cancel: CancellationToken) -> Result<(), AdapterError> {
        ensure_not_cancelled(&cancel, ExternalSystem::Provisioner)?;
        self.provisioner
            .create_namespace(self.id, self.compute.cpu, self.compute.memory)
            .await
    }

    async fn compensate(&self, _: ()) -> Result<(), AdapterError> {
        self.provisioner.delete_namespace(self.id).await
    }
}

/// Deletes a namespace; undone by re-creating it with its previous limits.
pub struct DeleteNamespace {
    pub provisioner: Arc<dyn Provisioner>,
    pub id: ResourceId,
    pub previous: Compute,
}

#[async_trait]
impl Action for DeleteNamespace {
    type Output = ();

    fn system(&self) -> ExternalSystem {
        ExternalSystem::Provisioner
    }

    async fn forward(&self, cancel: CancellationToken) -> Result<(), AdapterError> {
        ensure_not_cancelled(&cancel, ExternalSystem::Provisioner)?;
        self.provisioner.delete_namespace(self.id).await
    }

    async fn compensate(&self, _: ()) -> Result<(), AdapterError> {
        self.provisioner
            .create_namespace(self.id, self.previous.cpu, self.previous.memory)
            .await
    }
}

pub struct ResizeNamespace {
    pub provisioner: Arc<dyn Provisioner>,
    pub id: ResourceId,
    pub from: Compute,
    pub to: Compute,
}

#[async_trait]
impl Action for ResizeNamespace {
    type Output = ();

    fn system(&self) -> ExternalSystem {
        ExternalSystem::Provisioner
    }

    async fn forward(&self, cancel: CancellationToken) -> Result<(), AdapterError> {
        ensure_not_cancelled(&cancel, ExternalSystem::Provisioner)?;
        self.provisioner
            .resize_namespace(self.id, self.to.cpu, self.to.memory)
            .await
    }

    async fn compensate(&self, _: ()) -> Result<(), AdapterError> {
        self.provisioner
            .resize_namespace(self.id, self.from.cpu, self.from.memory)
            .await
    }
}

pub struct CreateVolume {
    pub provisioner: Arc<dyn Provisioner>,
    pub id: ResourceId,
    pub storage: Storage,
}

#[async_trait]
impl Action for CreateVolume {
    type Output = ();

    fn system(&self) -> ExternalSystem {
        ExternalSystem::Provisioner
    }

    async fn forward(&self, cancel: CancellationToken) -> Result<(), AdapterError> {
        ensure_not_cancelled(&cancel, ExternalSystem::Provisioner)?;
        self.provisioner
            .create_volume(self.id, self.storage.size, self.storage.replicas)
            .await
    }

    async fn compensate(&self, _: ()) -> Result<(), AdapterError> {
        self.provisioner.delete_volume(self.id).await
    }
}

pub struct DeleteVolume {
    pub provisioner: Arc<dyn Provisioner>,
    pub id: ResourceId,
    pub previous: Storage,
}

#[async_trait]
impl Action for DeleteVolume {
    type Output = ();

    fn system(&self) -> ExternalSystem {
        ExternalSystem::Provisioner
    }

    async fn forward(&self, cancel: CancellationToken) -> Result<(), AdapterError> {
        ensure_not_cancelled(&cancel, ExternalSystem::Provisioner)?;
        self.provisioner.delete_volume(self.id).await
    }

    async fn compensate(&self, _: ()) -> Result<(), AdapterError> {
        self.provisioner
            .create_volume(self.id, self.previous.size, self.previous.replicas)
            .await
    }
}

pub struct ResizeVolume {
    pub provisioner: Arc<dyn Provisioner>,
    pub id: ResourceId,
    pub from: Storage,
    pub to: Storage,
}

#[async_trait]
impl Action for ResizeVolume {
    type Output = ();

    fn system(&self) -> ExternalSystem {
        ExternalSystem::Provisioner
    }

    async fn forward(&self, cancel: CancellationToken) -> Result<(), AdapterError> {
        ensure_not_cancelled(&cancel, ExternalSystem::Provisioner)?;
        self.provisioner
            .resize_volume(self.id, self.to.size, self.to.replicas)
            .await
    }

    async fn compensate(&self, _: ()) -> Result<(), AdapterError> {
        self.provisioner
            .resize_volume(self.id, self.from.size, self.from.replicas)
            .await
    }
}

/// Subscribes a resource to a tariff.
///
/// For a new resource the compensation cancels the subscription. When the resource
/// was already subscribed (`previous_tariff` is set) the compensation moves it back
/// to the previous tariff instead.
pub struct Subscribe {
    pub billing: Arc<dyn Billing>,
    pub user: UserId,
    pub tariff: TariffId,
    pub resource: ResourceId,
    pub previous_tariff: Option<TariffId>,
}

#[async_trait]
impl Action for Subscribe {
    type Output = SubscriptionHandle;

    fn system(&self) -> ExternalSystem {
        ExternalSystem::Billing
    }

    async fn forward(&self, cancel: CancellationToken) -> Result<SubscriptionHandle, AdapterError> {
        ensure_not_cancelled(&cancel, ExternalSystem::Billing)?;
        self.billing.subscribe(self.user, self.tariff, self.resource).await
    }

    async fn compensate(&self, handle: SubscriptionHandle) -> Result<(), AdapterError> {
        match self.previous_tariff {
            Some(previous) => self.billing.subscribe(self.user, previous, self.resource).await.map(|_| ()),
            None => self.billing.unsubscribe(&handle).await,
        }
    }
}

/// Subscription handle issued while undoing an [`Unsubscribe`].
///
/// Billing may hand out a new handle when a cancelled subscription is taken out
/// again, so the resource record has to be updated once the saga has rolled back.
#[derive(Debug, Clone)]
pub struct RestoredSubscription {
    pub kind: ResourceKind,
    pub resource: ResourceId,
    handle: Arc<Mutex<Option<SubscriptionHandle>>>,
}

impl RestoredSubscription {
    pub fn new(kind: ResourceKind, resource: ResourceId) -> Self {
        Self {
            kind,
            resource,
            handle: Arc::default(),
        }
    }

    /// The handle recorded by the compensation, if it ran and succeeded.
    pub fn take(&self) -> Option<SubscriptionHandle> {
        self.handle.lock().take()
    }
}

/// Cancels a subscription; undone by subscribing the resource again.
pub struct Unsubscribe {
    pub billing: Arc<dyn Billing>,
    pub handle: SubscriptionHandle,
    pub user: UserId,
    pub tariff: TariffId,
    pub restored: RestoredSubscription,
}

#[async_trait]
impl Action for Unsubscribe {
    type Output = ();

    fn system(&self) -> ExternalSystem {
        ExternalSystem::Billing
    }

    async fn forward(&self, cancel: CancellationToken) -> Result<(), AdapterError> {
        ensure_not_cancelled(&cancel, ExternalSystem::Billing)?;
        self.billing.unsubscribe(&self.handle).await
    }

    async fn compensate(&self, _: ()) -> Result<(), AdapterError> {
        let handle = self
            .billing
            .subscribe(self.user, self.tariff, self.restored.resource)
            .await?;
        *self.restored.handle.lock() = Some(handle);
        Ok(())
    }
}

/// Step names, shared between saga construction and output lookups.
pub mod names {
    pub const PROVISION_NAMESPACE: &str = "provisioner-create-namespace";
    pub const DEPROVISION_NAMESPACE: &str = "provisioner-delete-namespace";
    pub const RESIZE_NAMESPACE: &str = "provisioner-resize-namespace";
    pub const PROVISION_VOLUME: &str = "provisioner-create-volume";
    pub const DEPROVISION_VOLUME: &str = "provisioner-delete-volume";
    pub const RESIZE_VOLUME: &str = "provisioner-resize-volume";
    pub const SUBSCRIBE: &str = "billing-subscribe";
    pub const UNSUBSCRIBE: &str = "billing-unsubscribe";
}

impl Step {
    /// Step name for an action on one of several volumes in the same saga.
    pub fn volume_scoped(base: &str, id: ResourceId) -> String {
        format!("{base}-{}", crate::types::abbrev_uuid(&id))
    }
}
