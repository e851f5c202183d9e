//! Volume lifecycle, plus the per-user bulk operations.

use futures::{StreamExt, TryStreamExt, stream::BoxStream};
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::{ResourceService, label_conflict, require_admin, require_self_or_admin, validate_label, validate_tariff};
use crate::{
    access::required,
    adapters::SubscriptionHandle,
    db::{
        in_transaction,
        models::{ListQuery, ResourceCount, ResourceFilter, ResourceMeta, Volume},
    },
    errors::{Error, Result},
    saga::{
        Step,
        steps::{CreateVolume, DeleteVolume, ResizeVolume, RestoredSubscription, Storage, Subscribe, Unsubscribe, names},
    },
    types::{Caller, ResourceId, ResourceKind, TariffId, UserId, abbrev_uuid},
};

/// Where a new volume goes and whether it outlives its namespace.
#[derive(Debug, Clone, Copy, Default)]
pub struct VolumePlacement {
    pub namespace_id: Option<ResourceId>,
    /// Defaults to persistent; only volumes inside a namespace may be non-persistent
    pub persistent: Option<bool>,
}

/// Outcome of one deletion in a bulk delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeDeletion {
    pub id: ResourceId,
    pub label: String,
    pub deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<DeletionError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletionError {
    pub code: &'static str,
    pub message: String,
}

fn managed_by_namespace(volume: &Volume) -> Option<Error> {
    match (volume.persistent, volume.namespace_id) {
        (false, Some(namespace)) => Some(Error::bad_input(format!(
            "volume {} is managed by namespace {namespace}; resize or delete the namespace instead",
            volume.meta.id
        ))),
        _ => None,
    }
}

impl ResourceService {
    #[instrument(skip(self, caller), fields(caller = %abbrev_uuid(&caller.id)), err)]
    pub async fn create_volume(
        &self,
        caller: &Caller,
        label: &str,
        tariff_id: TariffId,
        placement: VolumePlacement,
    ) -> Result<Volume> {
        validate_label(label)?;
        let persistent = placement.persistent.unwrap_or(true);
        if let Some(namespace) = placement.namespace_id {
            self.live_namespace(namespace).await?;
            self.authorize(caller.id, ResourceKind::Namespace, namespace, required::RESIZE, "attach volume")
                .await?;
        } else if !persistent {
            return Err(Error::bad_input("a non-persistent volume must belong to a namespace"));
        }

        let tariff = self.volume_tariff(tariff_id).await?;
        validate_tariff(&tariff, caller, None)?;
        self.ensure_label_free(ResourceKind::Volume, caller.id, label).await?;

        let mut volume = Volume {
            meta: ResourceMeta::new(caller.id, tariff.id, label),
            storage_size: tariff.storage_limit,
            replicas: tariff.replicas,
            persistent,
            namespace_id: placement.namespace_id,
            access: Vec::new(),
        };
        let id = volume.meta.id;

        let steps = [
            Step::new(
                names::PROVISION_VOLUME,
                CreateVolume {
                    provisioner: self.provisioner.clone(),
                    id,
                    storage: Storage::from(&volume),
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

        let store = self.store.clone();
        let commit_label = label.to_string();
        self.sagas
            .saga("create volume")
            .steps(steps)
            .commit(move |output| {
                volume.meta.subscription = output.get::<SubscriptionHandle>(names::SUBSCRIBE).cloned();
                Box::pin(async move {
                    in_transaction(store.as_ref(), move |tx| {
                        Box::pin(async move {
                            tx.create_volume(&volume)
                                .await
                                .map_err(|e| label_conflict(e, ResourceKind::Volume, &commit_label))
                        })
                    })
                    .await
                })
            })
            .run()
            .await?;

        info!(volume = %abbrev_uuid(&id), label, tariff = %tariff.label, "Volume created");
        self.notify_created(caller.id, label, &tariff.label).await;
        self.live_volume(id).await
    }

    /// Fetch a volume. Admins may view it as `target` sees it.
    #[instrument(skip(self, caller), fields(caller = %abbrev_uuid(&caller.id)), err)]
    pub async fn get_volume(&self, caller: &Caller, id: ResourceId, target: Option<UserId>) -> Result<Volume> {
        let volume = self.live_volume(id).await?;
        self.authorize(caller.effective_user(target), ResourceKind::Volume, id, required::READ, "get volume")
            .await?;
        Ok(volume)
    }

    /// One page of the volumes a user has access to, optionally within one namespace.
    #[instrument(skip(self, caller), fields(caller = %abbrev_uuid(&caller.id)), err)]
    pub async fn list_volumes(
        &self,
        caller: &Caller,
        target: Option<UserId>,
        filters: Vec<ResourceFilter>,
        namespace_id: Option<ResourceId>,
        after: Option<ResourceId>,
        limit: Option<usize>,
    ) -> Result<Vec<Volume>> {
        let mut query = ListQuery::for_user(caller.effective_user(target))
            .with_filters(filters)
            .after(after)
            .limit(self.page_limit(limit));
        if let Some(namespace) = namespace_id {
            query = query.in_namespace(namespace);
        }
        Ok(self.store.list_volumes(&query).await?)
    }

    /// Every volume in the system, admins only.
    pub fn stream_all_volumes(
        &self,
        caller: &Caller,
        filters: Vec<ResourceFilter>,
    ) -> Result<BoxStream<'static, Result<Volume>>> {
        require_admin(caller, "list all volumes")?;
        let store = self.store.clone();
        Ok(self.paged(move |after, limit| {
            let store = store.clone();
            let query = ListQuery::everyone().with_filters(filters.clone()).after(after).limit(limit);
            async move { Ok(store.list_volumes(&query).await?) }
        }))
    }

    /// Delete a standalone or persistent volume. Volumes bundled with a namespace go
    /// away with it instead.
    #[instrument(skip(self, caller), fields(caller = %abbrev_uuid(&caller.id)), err)]
    pub async fn delete_volume(&self, caller: &Caller, id: ResourceId) -> Result<()> {
        let volume = self.live_volume(id).await?;
        self.authorize(caller.id, ResourceKind::Volume, id, required::DELETE, "delete volume")
            .await?;
        if let Some(err) = managed_by_namespace(&volume) {
            return Err(err);
        }
        self.delete_volume_unchecked(volume).await
    }

    async fn delete_volume_unchecked(&self, volume: Volume) -> Result<()> {
        let id = volume.meta.id;
        let owner = volume.meta.owner_user_id;

        let mut steps = vec![Step::new(
            names::DEPROVISION_VOLUME,
            DeleteVolume {
                provisioner: self.provisioner.clone(),
                id,
                previous: Storage::from(&volume),
            },
        )];
        let mut restored = Vec::new();
        if let Some(handle) = &volume.meta.subscription {
            let slot = RestoredSubscription::new(ResourceKind::Volume, id);
            restored.push(slot.clone());
            steps.push(Step::new(
                names::UNSUBSCRIBE,
                Unsubscribe {
                    billing: self.billing.clone(),
                    handle: handle.clone(),
                    user: owner,
                    tariff: volume.meta.tariff_id,
                    restored: slot,
                },
            ));
        }

        let revoked = super::access::revocations(&volume.access);
        let marked = revoked.clone();
        let store = self.store.clone();
        let outcome = self
            .sagas
            .saga("delete volume")
            .steps(steps)
            .commit(move |_| {
                Box::pin(async move {
                    in_transaction(store.as_ref(), move |tx| {
                        Box::pin(async move {
                            for record in &marked {
                                tx.set_access(record).await?;
                            }
                            Ok(tx.soft_delete(ResourceKind::Volume, id).await?)
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

        info!(volume = %abbrev_uuid(&id), label = %volume.meta.label, "Volume deleted");
        self.notify_deleted(owner, &volume.meta.label).await;
        for record in revoked {
            self.spawn_invalidation(record);
        }
        Ok(())
    }

    /// Delete every standalone volume a user owns, one at a time as the stream is
    /// polled. A failed deletion is reported in its item and does not stop the rest.
    pub fn delete_all_volumes(
        &self,
        caller: &Caller,
        user: UserId,
    ) -> Result<BoxStream<'static, Result<VolumeDeletion>>> {
        require_self_or_admin(caller, user, "delete all volumes")?;
        info!(user = %abbrev_uuid(&user), by = %abbrev_uuid(&caller.id), "Deleting all volumes");

        let store = self.store.clone();
        let service = self.clone();
        let owned = self.paged(move |after, limit| {
            let store = store.clone();
            let query = ListQuery::for_user(user)
                .with_filters([ResourceFilter::Owned, ResourceFilter::Persistent])
                .after(after)
                .limit(limit);
            async move { Ok(store.list_volumes(&query).await?) }
        });

        Ok(owned
            .and_then(move |volume| {
                let service = service.clone();
                async move {
                    let id = volume.meta.id;
                    let label = volume.meta.label.clone();
                    let outcome = match service.delete_volume_unchecked(volume).await {
                        Ok(()) => VolumeDeletion {
                            id,
                            label,
                            deleted: true,
                            error: None,
                        },
                        Err(e) => {
                            warn!(volume = %abbrev_uuid(&id), error = %e, "Bulk volume deletion failed");
                            VolumeDeletion {
                                id,
                                label,
                                deleted: false,
                                error: Some(DeletionError {
                                    code: e.code(),
                                    message: e.user_message(),
                                }),
                            }
                        }
                    };
                    Ok(outcome)
                }
            })
            .boxed())
    }

    #[instrument(skip(self, caller), fields(caller = %abbrev_uuid(&caller.id)), err)]
    pub async fn rename_volume(&self, caller: &Caller, id: ResourceId, label: &str) -> Result<Volume> {
        validate_label(label)?;
        let volume = self.live_volume(id).await?;
        self.authorize(caller.id, ResourceKind::Volume, id, required::RENAME, "rename volume")
            .await?;
        if volume.meta.label == label {
            return Ok(volume);
        }

        let new_label = label.to_string();
        in_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move {
                tx.rename(ResourceKind::Volume, id, &new_label)
                    .await
                    .map_err(|e| label_conflict(e, ResourceKind::Volume, &new_label))
            })
        })
        .await?;

        info!(volume = %abbrev_uuid(&id), from = %volume.meta.label, to = label, "Volume renamed");
        self.live_volume(id).await
    }

    #[instrument(skip(self, caller), fields(caller = %abbrev_uuid(&caller.id)), err)]
    pub async fn resize_volume(&self, caller: &Caller, id: ResourceId, tariff_id: TariffId) -> Result<Volume> {
        let volume = self.live_volume(id).await?;
        self.authorize(caller.id, ResourceKind::Volume, id, required::RESIZE, "resize volume")
            .await?;
        if let Some(err) = managed_by_namespace(&volume) {
            return Err(err);
        }
        let tariff = self.volume_tariff(tariff_id).await?;
        validate_tariff(&tariff, caller, Some(volume.meta.tariff_id))?;

        let to = Storage {
            size: tariff.storage_limit,
            replicas: tariff.replicas,
        };
        let steps = [
            Step::new(
                names::RESIZE_VOLUME,
                ResizeVolume {
                    provisioner: self.provisioner.clone(),
                    id,
                    from: Storage::from(&volume),
                    to,
                },
            ),
            Step::new(
                names::SUBSCRIBE,
                Subscribe {
                    billing: self.billing.clone(),
                    user: volume.meta.owner_user_id,
                    tariff: tariff.id,
                    resource: id,
                    previous_tariff: Some(volume.meta.tariff_id),
                },
            ),
        ];

        let store = self.store.clone();
        let new_tariff = tariff.id;
        self.sagas
            .saga("resize volume")
            .steps(steps)
            .commit(move |output| {
                let handle = output.get::<SubscriptionHandle>(names::SUBSCRIBE).cloned();
                Box::pin(async move {
                    in_transaction(store.as_ref(), move |tx| {
                        Box::pin(async move {
                            Ok(tx
                                .resize_volume(id, new_tariff, to.size, to.replicas, handle.as_deref())
                                .await?)
                        })
                    })
                    .await
                })
            })
            .run()
            .await?;

        info!(volume = %abbrev_uuid(&id), tariff = %tariff.label, "Volume resized");
        self.live_volume(id).await
    }

    #[instrument(skip(self, caller), fields(caller = %abbrev_uuid(&caller.id)), err)]
    pub async fn set_volume_limited(&self, caller: &Caller, id: ResourceId, limited: bool) -> Result<Volume> {
        let volume = self.live_volume(id).await?;
        self.authorize(caller.id, ResourceKind::Volume, id, required::LOCK, "lock volume")
            .await?;
        if volume.meta.limited == limited {
            return Ok(volume);
        }

        in_transaction(self.store.as_ref(), move |tx| {
            Box::pin(async move { Ok(tx.set_limited(ResourceKind::Volume, id, limited).await?) })
        })
        .await?;

        info!(volume = %abbrev_uuid(&id), limited, "Volume lock changed");
        self.live_volume(id).await
    }

    /// Live namespaces and volumes a user owns.
    #[instrument(skip(self, caller), fields(caller = %abbrev_uuid(&caller.id)), err)]
    pub async fn count_resources(&self, caller: &Caller, user: UserId) -> Result<ResourceCount> {
        require_self_or_admin(caller, user, "count resources")?;
        Ok(self.store.count_owned(user).await?)
    }
}
