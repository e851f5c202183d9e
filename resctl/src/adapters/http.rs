//! Live adapters that talk to the external services over HTTP.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{
    adapters::{
        AdapterError, AuthCache, Billing, ExternalSystem, NamespaceTariff, Provisioner, Result, SubscriptionHandle, VolumeTariff,
    },
    config::HttpServiceConfig,
    types::{ResourceId, TariffId, UserId},
};

/// Shared plumbing for a JSON-over-HTTP service.
struct ServiceClient {
    system: ExternalSystem,
    client: Client,
    base_url: String,
}

impl ServiceClient {
    fn new(system: ExternalSystem, config: &HttpServiceConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self {
            system,
            client,
            base_url: config.url.as_str().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Send a request and map transport failures and non-success statuses.
    ///
    /// Statuses in `tolerated` are treated as success, which is how idempotent
    /// creates (409) and deletes (404) are expressed.
    async fn send(&self, request: RequestBuilder, tolerated: &[StatusCode]) -> Result<Response> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AdapterError::Timeout { system: self.system }
            } else {
                AdapterError::Request {
                    system: self.system,
                    message: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if status.is_success() || tolerated.contains(&status) {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        Err(AdapterError::Status {
            system: self.system,
            status: status.as_u16(),
            message,
        })
    }

    async fn json<T: for<'de> Deserialize<'de>>(&self, response: Response) -> Result<T> {
        response.json::<T>().await.map_err(|e| AdapterError::Request {
            system: self.system,
            message: format!("invalid response body: {e}"),
        })
    }
}

#[derive(Serialize)]
struct NamespaceSpec {
    id: ResourceId,
    cpu: i32,
    memory: i32,
}

#[derive(Serialize)]
struct VolumeSpec {
    id: ResourceId,
    size: i32,
    replicas: i32,
}

/// Cluster provisioner client.
pub struct HttpProvisioner {
    inner: ServiceClient,
}

impl HttpProvisioner {
    pub fn new(config: &HttpServiceConfig) -> anyhow::Result<Self> {
        Ok(Self {
            inner: ServiceClient::new(ExternalSystem::Provisioner, config)?,
        })
    }
}

#[async_trait]
impl Provisioner for HttpProvisioner {
    #[instrument(skip(self), err)]
    async fn create_namespace(&self, id: ResourceId, cpu: i32, memory: i32) -> Result<()> {
        let request = self
            .inner
            .client
            .post(self.inner.url("namespaces"))
            .json(&NamespaceSpec { id, cpu, memory });
        self.inner.send(request, &[StatusCode::CONFLICT]).await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete_namespace(&self, id: ResourceId) -> Result<()> {
        let request = self.inner.client.delete(self.inner.url(&format!("namespaces/{id}")));
        self.inner.send(request, &[StatusCode::NOT_FOUND]).await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn resize_namespace(&self, id: ResourceId, cpu: i32, memory: i32) -> Result<()> {
        let request = self
            .inner
            .client
            .put(self.inner.url(&format!("namespaces/{id}")))
            .json(&NamespaceSpec { id, cpu, memory });
        self.inner.send(request, &[]).await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn create_volume(&self, id: ResourceId, size: i32, replicas: i32) -> Result<()> {
        let request = self
            .inner
            .client
            .post(self.inner.url("volumes"))
            .json(&VolumeSpec { id, size, replicas });
        self.inner.send(request, &[StatusCode::CONFLICT]).await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete_volume(&self, id: ResourceId) -> Result<()> {
        let request = self.inner.client.delete(self.inner.url(&format!("volumes/{id}")));
        self.inner.send(request, &[StatusCode::NOT_FOUND]).await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn resize_volume(&self, id: ResourceId, size: i32, replicas: i32) -> Result<()> {
        let request = self
            .inner
            .client
            .put(self.inner.url(&format!("volumes/{id}")))
            .json(&VolumeSpec { id, size, replicas });
        self.inner.send(request, &[]).await?;
        Ok(())
    }
}

#[derive(Serialize)]
struct SubscribeRequest {
    user_id: UserId,
    tariff_id: TariffId,
    resource_id: ResourceId,
}

#[derive(Deserialize)]
struct SubscribeResponse {
    id: SubscriptionHandle,
}

/// Billing service client.
pub struct HttpBilling {
    inner: ServiceClient,
}

impl HttpBilling {
    pub fn new(config: &HttpServiceConfig) -> anyhow::Result<Self> {
        Ok(Self {
            inner: ServiceClient::new(ExternalSystem::Billing, config)?,
        })
    }

    async fn tariff<T: for<'de> Deserialize<'de>>(&self, path: String, what: String) -> Result<T> {
        let request = self.inner.client.get(self.inner.url(&path));
        let response = self.inner.send(request, &[StatusCode::NOT_FOUND]).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(AdapterError::NotFound {
                system: ExternalSystem::Billing,
                what,
            });
        }
        self.inner.json(response).await
    }
}

#[async_trait]
impl Billing for HttpBilling {
    #[instrument(skip(self), err)]
    async fn subscribe(&self, user: UserId, tariff: TariffId, resource: ResourceId) -> Result<SubscriptionHandle> {
        let request = self.inner.client.post(self.inner.url("subscriptions")).json(&SubscribeRequest {
            user_id: user,
            tariff_id: tariff,
            resource_id: resource,
        });
        let response = self.inner.send(request, &[]).await?;
        let body: SubscribeResponse = self.inner.json(response).await?;
        debug!(handle = %body.id, "Subscribed resource");
        Ok(body.id)
    }

    #[instrument(skip(self), err)]
    async fn unsubscribe(&self, handle: &str) -> Result<()> {
        let request = self.inner.client.delete(self.inner.url(&format!("subscriptions/{handle}")));
        self.inner.send(request, &[StatusCode::NOT_FOUND]).await?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn namespace_tariff(&self, id: TariffId) -> Result<NamespaceTariff> {
        self.tariff(format!("tariffs/namespaces/{id}"), format!("namespace tariff {id}"))
            .await
    }

    #[instrument(skip(self), err)]
    async fn volume_tariff(&self, id: TariffId) -> Result<VolumeTariff> {
        self.tariff(format!("tariffs/volumes/{id}"), format!("volume tariff {id}")).await
    }
}

/// Auth service client.
pub struct HttpAuthCache {
    inner: ServiceClient,
}

impl HttpAuthCache {
    pub fn new(config: &HttpServiceConfig) -> anyhow::Result<Self> {
        Ok(Self {
            inner: ServiceClient::new(ExternalSystem::AuthCache, config)?,
        })
    }
}

#[async_trait]
impl AuthCache for HttpAuthCache {
    #[instrument(skip(self), err)]
    async fn invalidate_user_access(&self, user: UserId) -> Result<()> {
        let request = self
            .inner
            .client
            .post(self.inner.url(&format!("users/{user}/access/invalidate")));
        self.inner.send(request, &[]).await?;
        Ok(())
    }
}
