//! Namespace lifecycle.

use futures::stream::BoxStream;
use tracing::{info, instrument};

use super::{ResourceService, label_conflict, require_admin, validate_label, validate_tariff};
use crate::{
    access::required,
    adapters::SubscriptionHandle,
    db::{
        in_transaction,
        models::{ListQuery, Namespace, NamespaceQuota, ResourceFilter, ResourceMeta, Volume},
    },
    errors::Result,
    saga::{
        Step,
        steps::{
            Compute, CreateNamespace, CreateVolume, DeleteNamespace, DeleteVolume, ResizeNamespace, ResizeVolume,
            RestoredSubscription, Storage, Subscribe, Unsubscribe, names,
        },
    },
    types::{Caller, ResourceId, ResourceKind, TariffId, UserId, abbrev_uuid},
};

impl From<&NamespaceQuota> for Compute {
    fn from(quota: &NamespaceQuota) -> Self {
        Compute {
            cpu: quota.cpu_limit,
            memory: quota.memory_limit,
        }
    }
}

impl From<&Volume> for Storage {
    fn from(volume: &Volume) -> Self {
        Storage {
            size: volume.storage_size,
            replicas: volume.replicas,
        }
    }
}

impl ResourceService {
    /// Create a namespace owned by the caller, plus its bundled volume when the
    /// tariff includes storage.
    #[instrument(skip(self, caller), fields(caller = %abbrev_uuid(&caller.id)), err)]
    pub async fn create_namespace(&self, caller: &Caller, label: &str, tariff_id: TariffId) -> Result<Namespace> {
        validate_label(label)?;
        let tariff = self.namespace_tariff(tariff_id).await?;
        validate_tariff(&tariff, caller, None)?;
        self.ensure_label_free(ResourceKind::Namespace, caller.id, label).await?;

        let mut namespace = Namespace {
            meta: ResourceMeta::new(caller.id, tariff.id, label),
            quota: NamespaceQuota::from(&tariff),
            volumes: Vec::new(),
            access: Vec::new(),
        };
        let id = namespace.meta.id;

        let bundled = if tariff.volume_size > 0 {
            self.ensure_label_free(ResourceKind::Volume, caller.id, label).await?;
            Some(Volume {
                meta: ResourceMeta::new(caller.id, tariff.id, label),
                storage_size: tariff.volume_size,
                replicas: tariff.volume_replicas,
                persistent: false,
                namespace_id: Some(id),
                access: Vec::new(),
            })
        } else {
            None
        };

        let mut steps = vec![
            Step::new(
                names::PROVISION_NAMESPACE,
                CreateNamespace {
                    provisioner: self.provisioner.clone(),
                    id,
                    compute: Compute::from(&namespace.quota),
                },
            ),
            Step::new(
                names::SUBSCRIBE,
                Subscribe {
                    billing: self.billing.clone(),
                    user: caller.id,
                    tariff: tariff.id,
                    resource: id,
                    previous_tariff: None,
                },
            ),
        ];
        if let Some(volume) = &bundled {
            steps.push(Step::new(
                names::PROVISION_VOLUME,
                CreateVolume {
                    provisioner: self.provisioner.clone(),
                    id: volume.meta.id,
                    storage: Storage::from(volume),
                },
            ));
        }

        let store = self.store.clone();
        let commit_label = label.to_string();
        self.sagas
            .saga("create namespace")
            .steps(steps)
            .commit(move |output| {
                namespace.meta.subscription = output.get::<SubscriptionHandle>(names::SUBSCRIBE).cloned();
                Box::pin(async move {
                    in_transaction(store.as_ref(), move |tx| {
                        Box::pin(async move {
                            tx.create_namespace(&namespace)
                                .await
                                .map_err(|e| label_conflict(e, ResourceKind::Namespace, &commit_label))?;
                            if let Some(volume) = &bundled {
                                tx.create_volume(volume)
                                    .await
                                    .map_err(|e| label_conflict(e, ResourceKind::Volume, &commit_label))?;
                            }
                            Ok(())
                        })
                    })
                    .await
                })
            })
            .run()
            .await?;

        info!(namespace = %abbrev_uuid(&id), label, tariff = %tariff.label, "Namespace created");
        self.notify_created(caller.id, label, &tariff.label).await;
        self.live_namespace(id).await
    }

    /// Fetch a namespace. Admins may view it as `target` sees it.
    #[instrument(skip(self, caller), fields(caller = %abbrev_uuid(&caller.id)), err)]
    pub async fn get_namespace(&self, caller: &Caller, id: ResourceId, target: Option<UserId>) -> Result<Namespace> {
        let namespace = self.live_namespace(id).await?;
        self.authorize(caller.effective_user(target), ResourceKind::Namespace, id, required::READ, "get namespace")
            .await?;
        Ok(namespace)
    }

    /// One page of the namespaces a user has access to.
    #[instrument(skip(self, caller), fields(caller = %abbrev_uuid(&caller.id)), err)]
    pub async fn list_namespaces(
        &self,
        caller: &Caller,
        target: Option<UserId>,
        filters: Vec<ResourceFilter>,
        after: Option<ResourceId>,
        limit: Option<usize>,
    ) -> Result<Vec<Namespace>> {
        let query = ListQuery::for_user(caller.effective_user(target))
            .with_filters(filters)
            .after(after)
            .limit(self.page_limit(limit));
        Ok(self.store.list_namespaces(&query).await?)
    }

    /// Every namespace in the system, admins only.
    pub fn stream_all_namespaces(
        &self,
        caller: &Caller,
        filters: Vec<ResourceFilter>,
    ) -> Result<BoxStream<'static, Result<Namespace>>> {
        require_admin(caller, "list all namespaces")?;
        let store = self.store.clone();
        Ok(self.paged(move |after, limit| {
            let store = store.clone();
            let query = ListQuery::everyone().with_filters(filters.clone()).after(after).limit(limit);
            async move { Ok(store.list_namespaces(&query).await?) }
        }))
    }

    /// Delete a namespace together with its non-persistent volumes.
    #[instrument(skip(self, caller), fields(caller = %abbrev_uuid(&caller.id)), err)]
    pub async fn delete_namespace(&self, caller: &Caller, id: ResourceId) -> Result<()> {
        let namespace = self.live_namespace(id).await?;
        self.authorize(caller.id, ResourceKind::Namespace, id, required::DELETE, "delete namespace")
            .await?;

        let owner = namespace.meta.owner_user_id;
        let cascaded: Vec<Volume> = namespace.volumes.iter().filter(|v| !v.persistent).cloned().collect();

        let mut steps = vec![Step::new(
            names::DEPROVISION_NAMESPACE,
            DeleteNamespace {
                provisioner: self.provisioner.clone(),
                id,
                previous: Compute::from(&namespace.quota),
            },
        )];
        let mut restored = Vec::new();
        if let Some(handle) = &namespace.meta.subscription {
            let slot = RestoredSubscription::new(ResourceKind::Namespace, id);
            restored.push(slot.clone());
            steps.push(Step::new(
                names::UNSUBSCRIBE,
                Unsubscribe {
                    billing: self.billing.clone(),
                    handle: handle.clone(),
                    user: owner,
                    tariff: namespace.meta.tariff_id,
                    restored: slot,
                },
            ));
        }
        for volume in &cascaded {
            steps.push(Step::new(
                Step::volume_scoped(names::DEPROVISION_VOLUME, volume.meta.id),
                DeleteVolume {
                    provisioner: self.provisioner.clone(),
                    id: volume.meta.id,
                    previous: Storage::from(volume),
                },
            ));
            if let Some(handle) = &volume.meta.subscription {
                let slot = RestoredSubscription::new(ResourceKind::Volume, volume.meta.id);
                restored.push(slot.clone());
                steps.push(Step::new(
                    Step::volume_scoped(names::UNSUBSCRIBE, volume.meta.id),
                    Unsubscribe {
                        billing: self.billing.clone(),
                        handle: handle.clone(),
                        user: volume.meta.owner_user_id,
                        tariff: volume.meta.tariff_id,
                        restored: slot,
                    },
                ));
            }
        }

        let mut revoked = super::access::revocations(&namespace.access);
        for volume in &cascaded {
            revoked.extend(super::access::revocations(&volume.access));
        }

        let store = self.store.clone();
        let marked = revoked.clone();
        let volume_ids: Vec<ResourceId> = cascaded.iter().map(|v| v.meta.id).collect();
        let outcome = self
            .sagas
            .saga("delete namespace")
            .steps(steps)
            .commit(move |_| {
                Box::pin(async move {
                    in_transaction(store.as_ref(), move |tx| {
                        Box::pin(async move {
                            // Access records must be marked while the resources are still live
                            for record in &marked {
                                tx.set_access(record).await?;
                            }
                            for volume in volume_ids {
                                tx.soft_delete(ResourceKind::Volume, volume).await?;
                            }
                            tx.soft_delete(ResourceKind::Namespace, id).await?;
                            Ok(())
                        })
                    })
                    .await
                })
            })
            .run()
            .await;
        if outcome.is_err() {
            self.write_back_subscriptions(&restored).await;
        }
        outcome?;

        info!(
            namespace = %abbrev_uuid(&id),
            label = %namespace.meta.label,
            volumes = cascaded.len(),
            "Namespace deleted"
        );
        self.notify_deleted(owner, &namespace.meta.label).await;
        for record in revoked {
            self.spawn_invalidation(record);
        }
        Ok(())
    }

    #[instrument(skip(self, caller), fields(caller = %abbrev_uuid(&caller.id)), err)]
    pub async fn rename_namespace(&self, caller: &Caller, id: ResourceId, label: &str) -> Result<Namespace> {
        validate_label(label)?;
        let namespace = self.live_namespace(id).await?;
        self.authorize(caller.id, ResourceKind::Namespace, id, required::RENAME, "rename namespace")
            .await?;
        if namespace.meta.label == label {
            return Ok(namespace);
        }

        let new_label = label.to_string();
        in_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move {
                tx.rename(ResourceKind::Namespace, id, &new_label)
                    .await
                    .map_err(|e| label_conflict(e, ResourceKind::Namespace, &new_label))
            })
        })
        .await?;

        info!(namespace = %abbrev_uuid(&id), from = %namespace.meta.label, to = label, "Namespace renamed");
        self.live_namespace(id).await
    }

    /// Move a namespace to another tariff. Its bundled volumes follow the tariff's storage.
    #[instrument(skip(self, caller), fields(caller = %abbrev_uuid(&caller.id)), err)]
    pub async fn resize_namespace(&self, caller: &Caller, id: ResourceId, tariff_id: TariffId) -> Result<Namespace> {
        let namespace = self.live_namespace(id).await?;
        self.authorize(caller.id, ResourceKind::Namespace, id, required::RESIZE, "resize namespace")
            .await?;
        let tariff = self.namespace_tariff(tariff_id).await?;
        validate_tariff(&tariff, caller, Some(namespace.meta.tariff_id))?;

        let quota = NamespaceQuota::from(&tariff);
        // A tariff without storage leaves bundled volumes at their current size
        let target_storage = (tariff.volume_size > 0).then_some(Storage {
            size: tariff.volume_size,
            replicas: tariff.volume_replicas,
        });
        let bundled: Vec<(ResourceId, Storage, Storage)> = namespace
            .bundled_volumes()
            .map(|v| {
                let from = Storage::from(v);
                (v.meta.id, from, target_storage.unwrap_or(from))
            })
            .collect();

        let mut steps = vec![
            Step::new(
                names::RESIZE_NAMESPACE,
                ResizeNamespace {
                    provisioner: self.provisioner.clone(),
                    id,
                    from: Compute::from(&namespace.quota),
                    to: Compute::from(&quota),
                },
            ),
            Step::new(
                names::SUBSCRIBE,
                Subscribe {
                    billing: self.billing.clone(),
                    user: namespace.meta.owner_user_id,
                    tariff: tariff.id,
                    resource: id,
                    previous_tariff: Some(namespace.meta.tariff_id),
                },
            ),
        ];
        for (volume, from, to) in bundled.iter().filter(|(_, from, to)| from != to) {
            steps.push(Step::new(
                Step::volume_scoped(names::RESIZE_VOLUME, *volume),
                ResizeVolume {
                    provisioner: self.provisioner.clone(),
                    id: *volume,
                    from: *from,
                    to: *to,
                },
            ));
        }

        let store = self.store.clone();
        let new_tariff = tariff.id;
        self.sagas
            .saga("resize namespace")
            .steps(steps)
            .commit(move |output| {
                let handle = output.get::<SubscriptionHandle>(names::SUBSCRIBE).cloned();
                Box::pin(async move {
                    in_transaction(store.as_ref(), move |tx| {
                        Box::pin(async move {
                            tx.resize_namespace(id, new_tariff, &quota, handle.as_deref()).await?;
                            // Bundled volumes move to the new tariff even when their size stays
                            for (volume, _, to) in bundled {
                                tx.resize_volume(volume, new_tariff, to.size, to.replicas, None).await?;
                            }
                            Ok(())
                        })
                    })
                    .await
                })
            })
            .run()
            .await?;

        info!(namespace = %abbrev_uuid(&id), tariff = %tariff.label, "Namespace resized");
        self.live_namespace(id).await
    }

    /// Flip the `limited` flag. Locking an already locked namespace is a no-op.
    #[instrument(skip(self, caller), fields(caller = %abbrev_uuid(&caller.id)), err)]
    pub async fn set_namespace_limited(&self, caller: &Caller, id: ResourceId, limited: bool) -> Result<Namespace> {
        let namespace = self.live_namespace(id).await?;
        self.authorize(caller.id, ResourceKind::Namespace, id, required::LOCK, "lock namespace")
            .await?;
        if namespace.meta.limited == limited {
            return Ok(namespace);
        }

        in_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move { Ok(tx.set_limited(ResourceKind::Namespace, id, limited).await?) })
        })
        .await?;

        info!(namespace = %abbrev_uuid(&id), limited, "Namespace lock changed");
        self.live_namespace(id).await
    }
}

