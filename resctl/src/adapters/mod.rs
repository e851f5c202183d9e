//! External service adapters.
//!
//! The control layer never talks to the systems it coordinates directly. Each
//! system sits behind a small capability trait:
//!
//! - [`Provisioner`]: the cluster provisioner that materializes namespaces and volumes
//! - [`Billing`]: the subscription service, also the source of tariffs
//! - [`Notifier`]: best-effort user notifications
//! - [`AuthCache`]: the auth service whose per-user access cache must be invalidated
//!
//! Every trait has a live implementation ([`http`], [`mailer`]) and a deterministic
//! stand-in ([`dummy`]) used in tests and local development. The factory functions
//! below are the single place where configuration turns into adapter instances.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};

use crate::{
    config::{AuthCacheConfig, BillingConfig, MailTransportConfig, MailerConfig, ProvisionerConfig},
    types::{ResourceId, TariffId, UserId},
};

pub mod dummy;
pub mod http;
pub mod mailer;

/// Build the provisioner adapter from configuration.
pub fn create_provisioner(config: &ProvisionerConfig) -> anyhow::Result<Arc<dyn Provisioner>> {
    Ok(match config {
        ProvisionerConfig::Http(http_config) => Arc::new(http::HttpProvisioner::new(http_config)?),
        ProvisionerConfig::Dummy => Arc::new(dummy::DummyProvisioner::new()),
    })
}

/// Build the billing adapter from configuration.
pub fn create_billing(config: &BillingConfig) -> anyhow::Result<Arc<dyn Billing>> {
    Ok(match config {
        BillingConfig::Http(http_config) => Arc::new(http::HttpBilling::new(http_config)?),
        BillingConfig::Dummy(dummy_config) => Arc::new(dummy::DummyBilling::from(dummy_config.clone())),
    })
}

/// Build the notifier from configuration.
pub fn create_notifier(config: &MailerConfig) -> anyhow::Result<Arc<dyn Notifier>> {
    Ok(match config.transport {
        MailTransportConfig::Dummy => Arc::new(dummy::DummyNotifier::new()),
        _ => Arc::new(mailer::MailNotifier::new(config)?),
    })
}

/// Build the auth cache adapter from configuration.
pub fn create_auth_cache(config: &AuthCacheConfig) -> anyhow::Result<Arc<dyn AuthCache>> {
    Ok(match config {
        AuthCacheConfig::Http(http_config) => Arc::new(http::HttpAuthCache::new(http_config)?),
        AuthCacheConfig::Dummy => Arc::new(dummy::DummyAuthCache::new()),
    })
}

/// The external systems a saga step can touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExternalSystem {
    Provisioner,
    Billing,
    Mailer,
    AuthCache,
}

impl fmt::Display for ExternalSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternalSystem::Provisioner => write!(f, "provisioner"),
            ExternalSystem::Billing => write!(f, "billing"),
            ExternalSystem::Mailer => write!(f, "mailer"),
            ExternalSystem::AuthCache => write!(f, "auth"),
        }
    }
}

/// Result type for adapter operations
pub type Result<T> = std::result::Result<T, AdapterError>;

/// Errors an external system can report.
///
/// Messages are captured as strings so the error can be cloned into saga reports.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error("{system} request failed: {message}")]
    Request { system: ExternalSystem, message: String },

    #[error("{system} responded with status {status}: {message}")]
    Status {
        system: ExternalSystem,
        status: u16,
        message: String,
    },

    #[error("{what} not found in {system}")]
    NotFound { system: ExternalSystem, what: String },

    #[error("{system} call cancelled")]
    Cancelled { system: ExternalSystem },

    #[error("{system} call timed out")]
    Timeout { system: ExternalSystem },
}

impl AdapterError {
    pub fn system(&self) -> ExternalSystem {
        match self {
            AdapterError::Request { system, .. }
            | AdapterError::Status { system, .. }
            | AdapterError::NotFound { system, .. }
            | AdapterError::Cancelled { system }
            | AdapterError::Timeout { system } => *system,
        }
    }
}

/// Opaque subscription reference returned by the billing service.
pub type SubscriptionHandle = String;

/// Common view over namespace and volume tariffs used for validation.
pub trait Tariff {
    fn id(&self) -> TariffId;
    fn label(&self) -> &str;
    fn is_active(&self) -> bool;
    fn is_public(&self) -> bool;
}

/// A billing plan for namespaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceTariff {
    pub id: TariffId,
    pub label: String,
    /// CPU limit in millicores
    pub cpu_limit: i32,
    /// Memory limit in MiB
    pub memory_limit: i32,
    pub max_external_services: i32,
    pub max_internal_services: i32,
    /// Traffic limit in GB
    pub max_traffic: i32,
    /// Size in GiB of the volume created together with the namespace, 0 for none
    #[serde(default)]
    pub volume_size: i32,
    #[serde(default = "default_replicas")]
    pub volume_replicas: i32,
    pub is_active: bool,
    pub is_public: bool,
}

/// A billing plan for standalone volumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeTariff {
    pub id: TariffId,
    pub label: String,
    /// Storage limit in GiB
    pub storage_limit: i32,
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    pub is_active: bool,
    pub is_public: bool,
}

fn default_replicas() -> i32 {
    1
}

macro_rules! impl_tariff {
    ($ty:ty) => {
        impl Tariff for $ty {
            fn id(&self) -> TariffId {
                self.id
            }
            fn label(&self) -> &str {
                &self.label
            }
            fn is_active(&self) -> bool {
                self.is_active
            }
            fn is_public(&self) -> bool {
                self.is_public
            }
        }
    };
}

impl_tariff!(NamespaceTariff);
impl_tariff!(VolumeTariff);

/// Cluster provisioner: materializes namespaces and volumes.
///
/// Creation is expected to be idempotent keyed on the resource ID and deletion of
/// something that does not exist succeeds, so compensations can be replayed safely.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn create_namespace(&self, id: ResourceId, cpu: i32, memory: i32) -> Result<()>;

    async fn delete_namespace(&self, id: ResourceId) -> Result<()>;

    async fn resize_namespace(&self, id: ResourceId, cpu: i32, memory: i32) -> Result<()>;

    async fn create_volume(&self, id: ResourceId, size: i32, replicas: i32) -> Result<()>;

    async fn delete_volume(&self, id: ResourceId) -> Result<()>;

    async fn resize_volume(&self, id: ResourceId, size: i32, replicas: i32) -> Result<()>;
}

/// Subscription service.
#[async_trait]
pub trait Billing: Send + Sync {
    /// Subscribe a user to a tariff for a resource.
    ///
    /// Subscribing the same resource twice returns the existing handle, moved to the
    /// new tariff.
    async fn subscribe(&self, user: UserId, tariff: TariffId, resource: ResourceId) -> Result<SubscriptionHandle>;

    /// Cancel a subscription. Unknown handles are not an error.
    async fn unsubscribe(&self, handle: &str) -> Result<()>;

    async fn namespace_tariff(&self, id: TariffId) -> Result<NamespaceTariff>;

    async fn volume_tariff(&self, id: TariffId) -> Result<VolumeTariff>;
}

/// Best-effort user notifications. Failures are logged, never rolled back.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_created(&self, user: UserId, label: &str, tariff: &str) -> Result<()>;

    async fn notify_deleted(&self, user: UserId, label: &str) -> Result<()>;
}

/// Auth service access cache.
#[async_trait]
pub trait AuthCache: Send + Sync {
    async fn invalidate_user_access(&self, user: UserId) -> Result<()>;
}
