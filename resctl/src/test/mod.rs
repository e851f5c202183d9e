pub mod utils;

use futures::TryStreamExt;
use std::time::Duration;
use uuid::Uuid;

use crate::{
    access::AccessLevel,
    adapters::{
        ExternalSystem,
        dummy::{BillingCall, BillingOp, DummyBilling, Notification, ProvisionerCall, ProvisionerOp},
    },
    config::SagaConfig,
    db::{ResourceStore, models::ResourceFilter},
    errors::{Error, TariffRejection},
    service::volumes::VolumePlacement,
    types::{Caller, ResourceKind},
};
use utils::{create_harness, create_harness_with_saga, eventually, namespace_tariff, pending_cleared, volume_tariff};

/// Creating a namespace provisions it, subscribes the owner and leaves exactly one
/// access record: the owner's.
#[test_log::test(tokio::test)]
async fn test_create_namespace_commits_everywhere() {
    let h = create_harness();
    let tariff = namespace_tariff(0);
    h.billing.add_namespace_tariff(tariff.clone());
    let owner = Caller::user(Uuid::new_v4());

    let namespace = h.service.create_namespace(&owner, "demo", tariff.id).await.unwrap();

    assert_eq!(namespace.meta.owner_user_id, owner.id);
    assert_eq!(namespace.quota.cpu_limit, 500);
    assert_eq!(namespace.access.len(), 1);
    assert_eq!(namespace.access[0].user_id, owner.id);
    assert_eq!(namespace.access[0].access, AccessLevel::Owner);
    assert!(namespace.volumes.is_empty());

    assert_eq!(h.provisioner.namespace(namespace.meta.id), Some((500, 512)));
    let subscription = h.billing.subscription(namespace.meta.id).expect("owner should be subscribed");
    assert_eq!(subscription.user, owner.id);
    assert_eq!(
        namespace.meta.subscription,
        Some(DummyBilling::handle_for(namespace.meta.id))
    );
    assert_eq!(
        h.notifier.sent(),
        vec![Notification::Created {
            user: owner.id,
            label: "demo".to_string(),
            tariff: tariff.label.clone(),
        }]
    );
}

#[test_log::test(tokio::test)]
async fn test_create_namespace_with_bundled_volume() {
    let h = create_harness();
    let tariff = namespace_tariff(5);
    h.billing.add_namespace_tariff(tariff.clone());
    let owner = Caller::user(Uuid::new_v4());

    let namespace = h.service.create_namespace(&owner, "bundle", tariff.id).await.unwrap();

    assert_eq!(namespace.volumes.len(), 1);
    let volume = &namespace.volumes[0];
    assert!(!volume.persistent);
    assert_eq!(volume.namespace_id, Some(namespace.meta.id));
    assert_eq!(volume.meta.label, "bundle");
    assert_eq!(h.provisioner.volume(volume.meta.id), Some((5, 1)));

    // The bundled volume follows its namespace, it cannot be deleted on its own
    let result = h.service.delete_volume(&owner, volume.meta.id).await;
    assert!(matches!(result, Err(Error::BadInput { .. })), "{result:?}");
}

/// Billing refuses the subscription: the provisioned namespace is torn down again
/// and nothing is written to the store.
#[test_log::test(tokio::test)]
async fn test_billing_failure_compensates_provisioner() {
    let h = create_harness();
    let tariff = namespace_tariff(0);
    h.billing.add_namespace_tariff(tariff.clone());
    h.billing.fail_on(BillingOp::Subscribe);
    let owner = Caller::user(Uuid::new_v4());

    let result = h.service.create_namespace(&owner, "demo", tariff.id).await;

    assert!(
        matches!(
            result,
            Err(Error::ExternalService {
                service: ExternalSystem::Billing,
                ..
            })
        ),
        "{result:?}"
    );
    let calls = h.provisioner.calls();
    let created = calls
        .iter()
        .find_map(|call| match call {
            ProvisionerCall::CreateNamespace { id, .. } => Some(*id),
            _ => None,
        })
        .expect("namespace should have been provisioned before rollback");
    assert!(calls.contains(&ProvisionerCall::DeleteNamespace { id: created }));
    assert_eq!(h.provisioner.namespace(created), None);
    assert!(h.store.all_namespaces().await.is_empty());
    assert!(h.notifier.sent().is_empty());
}

/// The store refuses to commit after every external step succeeded: all of them are undone.
#[test_log::test(tokio::test)]
async fn test_commit_failure_rolls_back_external_steps() {
    let h = create_harness();
    let tariff = volume_tariff(10);
    h.billing.add_volume_tariff(tariff.clone());
    h.store.fail_next_commit();
    let owner = Caller::user(Uuid::new_v4());

    let result = h
        .service
        .create_volume(&owner, "data", tariff.id, VolumePlacement::default())
        .await;

    assert!(matches!(result, Err(Error::TransactionFailure { .. })), "{result:?}");
    assert!(h.store.all_volumes().await.is_empty());
    assert!(
        h.billing
            .calls()
            .iter()
            .any(|call| matches!(call, BillingCall::Unsubscribe { .. }))
    );
    assert!(
        h.provisioner
            .calls()
            .iter()
            .any(|call| matches!(call, ProvisionerCall::DeleteVolume { .. }))
    );
}

#[test_log::test(tokio::test)]
async fn test_slow_provisioner_hits_forward_deadline() {
    let h = create_harness_with_saga(SagaConfig {
        forward_timeout: Duration::from_millis(50),
        compensation_timeout: Duration::from_secs(1),
    });
    let tariff = namespace_tariff(0);
    h.billing.add_namespace_tariff(tariff.clone());
    h.provisioner
        .delay(ProvisionerOp::CreateNamespace, Duration::from_millis(200));
    let owner = Caller::user(Uuid::new_v4());

    let result = h.service.create_namespace(&owner, "slow", tariff.id).await;

    assert!(
        matches!(
            result,
            Err(Error::ExternalService {
                service: ExternalSystem::Provisioner,
                ..
            })
        ),
        "{result:?}"
    );
    assert!(h.store.all_namespaces().await.is_empty());
    assert!(
        h.billing
            .calls()
            .iter()
            .any(|call| matches!(call, BillingCall::Unsubscribe { .. }))
    );
}

#[test_log::test(tokio::test)]
async fn test_duplicate_label_rejected_before_any_side_effect() {
    let h = create_harness();
    let tariff = namespace_tariff(0);
    h.billing.add_namespace_tariff(tariff.clone());
    let owner = Caller::user(Uuid::new_v4());

    h.service.create_namespace(&owner, "demo", tariff.id).await.unwrap();
    let result = h.service.create_namespace(&owner, "demo", tariff.id).await;

    assert!(matches!(result, Err(Error::AlreadyExists { .. })), "{result:?}");
    assert_eq!(h.provisioner.calls().len(), 1);

    // Labels are scoped per owner
    let other = Caller::user(Uuid::new_v4());
    h.service.create_namespace(&other, "demo", tariff.id).await.unwrap();
}

/// A Write holder may not manage access: the check fails and nothing changes.
#[test_log::test(tokio::test)]
async fn test_writer_cannot_change_access() {
    let h = create_harness();
    let tariff = namespace_tariff(0);
    h.billing.add_namespace_tariff(tariff.clone());
    let owner = Caller::user(Uuid::new_v4());
    let writer = Caller::user(Uuid::new_v4());
    let bystander = Uuid::new_v4();

    let namespace = h.service.create_namespace(&owner, "shared", tariff.id).await.unwrap();
    let id = namespace.meta.id;
    h.service
        .change_access(&owner, ResourceKind::Namespace, id, writer.id, AccessLevel::Write)
        .await
        .unwrap();

    let result = h
        .service
        .change_access(&writer, ResourceKind::Namespace, id, bystander, AccessLevel::Read)
        .await;

    assert!(
        matches!(
            result,
            Err(Error::PermissionDenied {
                required: AccessLevel::Owner,
                held: AccessLevel::Write,
                ..
            })
        ),
        "{result:?}"
    );
    assert_eq!(
        h.store
            .get_access(ResourceKind::Namespace, id, bystander)
            .await
            .unwrap(),
        None
    );

    // Writers can still do what Write allows
    h.service.rename_namespace(&writer, id, "renamed").await.unwrap();
}

#[test_log::test(tokio::test)]
async fn test_access_change_is_effective_then_propagated() {
    let h = create_harness();
    let tariff = volume_tariff(10);
    h.billing.add_volume_tariff(tariff.clone());
    let owner = Caller::user(Uuid::new_v4());
    let reader = Caller::user(Uuid::new_v4());

    let volume = h
        .service
        .create_volume(&owner, "data", tariff.id, VolumePlacement::default())
        .await
        .unwrap();
    let id = volume.meta.id;

    let record = h
        .service
        .change_access(&owner, ResourceKind::Volume, id, reader.id, AccessLevel::Read)
        .await
        .unwrap();
    assert_eq!(record.access, AccessLevel::Read);

    // Effective immediately, before the auth cache has heard of it
    h.service.get_volume(&reader, id, None).await.unwrap();
    let rename = h.service.rename_volume(&reader, id, "mine").await;
    assert!(matches!(rename, Err(Error::PermissionDenied { .. })), "{rename:?}");

    let auth_cache = h.auth_cache.clone();
    assert!(eventually(|| auth_cache.invalidated().contains(&reader.id)).await);
    assert!(pending_cleared(&h.store).await);

    // Revoking removes visibility right away
    h.service
        .delete_access(&owner, ResourceKind::Volume, id, reader.id)
        .await
        .unwrap();
    let result = h.service.get_volume(&reader, id, None).await;
    assert!(matches!(result, Err(Error::PermissionDenied { .. })), "{result:?}");

    let result = h
        .service
        .delete_access(&owner, ResourceKind::Volume, id, reader.id)
        .await;
    assert!(matches!(result, Err(Error::NotFound { .. })), "{result:?}");
}

/// Invalidation gives up after its schedule; the record stays pending until reconciled.
#[test_log::test(tokio::test)]
async fn test_failed_invalidation_is_reconciled() {
    let h = create_harness();
    let tariff = volume_tariff(10);
    h.billing.add_volume_tariff(tariff.clone());
    let owner = Caller::user(Uuid::new_v4());
    let reader = Uuid::new_v4();
    let volume = h
        .service
        .create_volume(&owner, "data", tariff.id, VolumePlacement::default())
        .await
        .unwrap();

    // One immediate attempt plus two retries
    h.auth_cache.fail_times(3);
    h.service
        .change_access(&owner, ResourceKind::Volume, volume.meta.id, reader, AccessLevel::Read)
        .await
        .unwrap();
    let auth_cache = h.auth_cache.clone();
    assert!(eventually(|| auth_cache.attempts() == 3).await);

    let pending = h.store.list_pending_access().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].user_id, reader);
    assert!(auth_cache.invalidated().is_empty());

    assert_eq!(h.service.reconcile_pending_access().await.unwrap(), 1);
    assert!(eventually(|| auth_cache.invalidated() == vec![reader]).await);
    assert!(pending_cleared(&h.store).await);
}

#[test_log::test(tokio::test)]
async fn test_owner_cannot_lower_own_access() {
    let h = create_harness();
    let tariff = volume_tariff(10);
    h.billing.add_volume_tariff(tariff.clone());
    let owner = Caller::user(Uuid::new_v4());
    let volume = h
        .service
        .create_volume(&owner, "data", tariff.id, VolumePlacement::default())
        .await
        .unwrap();

    let result = h
        .service
        .change_access(&owner, ResourceKind::Volume, volume.meta.id, owner.id, AccessLevel::Read)
        .await;
    assert!(matches!(result, Err(Error::BadInput { .. })), "{result:?}");

    let unchanged = h
        .service
        .change_access(&owner, ResourceKind::Volume, volume.meta.id, owner.id, AccessLevel::Owner)
        .await
        .unwrap();
    assert_eq!(unchanged.access, AccessLevel::Owner);
}

#[test_log::test(tokio::test)]
async fn test_ownership_transfer_demotes_previous_owner() {
    let h = create_harness();
    let tariff = volume_tariff(10);
    h.billing.add_volume_tariff(tariff.clone());
    let owner = Caller::user(Uuid::new_v4());
    let heir = Caller::user(Uuid::new_v4());
    let volume = h
        .service
        .create_volume(&owner, "data", tariff.id, VolumePlacement::default())
        .await
        .unwrap();
    let id = volume.meta.id;

    let record = h
        .service
        .change_access(&owner, ResourceKind::Volume, id, heir.id, AccessLevel::Owner)
        .await
        .unwrap();
    assert_eq!(record.access, AccessLevel::Owner);

    let volume = h.service.get_volume(&heir, id, None).await.unwrap();
    assert_eq!(volume.meta.owner_user_id, heir.id);
    let owners: Vec<_> = volume
        .access
        .iter()
        .filter(|r| r.access == AccessLevel::Owner)
        .collect();
    assert_eq!(owners.len(), 1);
    let previous = h
        .store
        .get_access(ResourceKind::Volume, id, owner.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(previous.access, AccessLevel::Write);

    // The previous owner can no longer manage access
    let result = h
        .service
        .change_access(&owner, ResourceKind::Volume, id, owner.id, AccessLevel::Owner)
        .await;
    assert!(matches!(result, Err(Error::PermissionDenied { .. })), "{result:?}");

    let auth_cache = h.auth_cache.clone();
    assert!(
        eventually(|| {
            let invalidated = auth_cache.invalidated();
            invalidated.contains(&owner.id) && invalidated.contains(&heir.id)
        })
        .await
    );
}

#[test_log::test(tokio::test)]
async fn test_ownership_transfer_rejects_label_clash() {
    let h = create_harness();
    let tariff = volume_tariff(10);
    h.billing.add_volume_tariff(tariff.clone());
    let owner = Caller::user(Uuid::new_v4());
    let heir = Caller::user(Uuid::new_v4());

    let volume = h
        .service
        .create_volume(&owner, "data", tariff.id, VolumePlacement::default())
        .await
        .unwrap();
    h.service
        .create_volume(&heir, "data", tariff.id, VolumePlacement::default())
        .await
        .unwrap();

    let result = h
        .service
        .change_access(&owner, ResourceKind::Volume, volume.meta.id, heir.id, AccessLevel::Owner)
        .await;
    assert!(matches!(result, Err(Error::AlreadyExists { .. })), "{result:?}");
}

/// Resizing to an inactive tariff is rejected before any external call.
#[test_log::test(tokio::test)]
async fn test_resize_to_inactive_tariff_rejected() {
    let h = create_harness();
    let tariff = namespace_tariff(0);
    let mut retired = namespace_tariff(0);
    retired.is_active = false;
    h.billing.add_namespace_tariff(tariff.clone());
    h.billing.add_namespace_tariff(retired.clone());
    let owner = Caller::user(Uuid::new_v4());
    let namespace = h.service.create_namespace(&owner, "demo", tariff.id).await.unwrap();
    let calls_before = (h.provisioner.calls().len(), h.billing.calls().len());

    let result = h.service.resize_namespace(&owner, namespace.meta.id, retired.id).await;

    assert!(
        matches!(
            result,
            Err(Error::TariffInvalid {
                reason: TariffRejection::Inactive,
                ..
            })
        ),
        "{result:?}"
    );
    assert_eq!((h.provisioner.calls().len(), h.billing.calls().len()), calls_before);
    let stored = h.service.get_namespace(&owner, namespace.meta.id, None).await.unwrap();
    assert_eq!(stored.meta.tariff_id, tariff.id);

    let same = h.service.resize_namespace(&owner, namespace.meta.id, tariff.id).await;
    assert!(
        matches!(
            same,
            Err(Error::TariffInvalid {
                reason: TariffRejection::Unchanged,
                ..
            })
        ),
        "{same:?}"
    );
}

#[test_log::test(tokio::test)]
async fn test_resize_namespace_resizes_bundled_volume() {
    let h = create_harness();
    let small = namespace_tariff(5);
    let mut large = namespace_tariff(20);
    large.cpu_limit = 2000;
    h.billing.add_namespace_tariff(small.clone());
    h.billing.add_namespace_tariff(large.clone());
    let owner = Caller::user(Uuid::new_v4());

    let namespace = h.service.create_namespace(&owner, "grow", small.id).await.unwrap();
    let resized = h.service.resize_namespace(&owner, namespace.meta.id, large.id).await.unwrap();

    assert_eq!(resized.meta.tariff_id, large.id);
    assert_eq!(resized.quota.cpu_limit, 2000);
    assert_eq!(resized.volumes[0].storage_size, 20);
    assert_eq!(h.provisioner.namespace(namespace.meta.id), Some((2000, 512)));
    assert_eq!(h.provisioner.volume(resized.volumes[0].meta.id), Some((20, 1)));
    assert_eq!(h.billing.subscription(namespace.meta.id).unwrap().tariff, large.id);
}

/// Only the volume that came with the namespace tariff follows it; a volume attached
/// with its own tariff keeps that tariff and size.
#[test_log::test(tokio::test)]
async fn test_resize_namespace_leaves_attached_volumes_alone() {
    let h = create_harness();
    let small = namespace_tariff(5);
    let large = namespace_tariff(20);
    let vol_tariff = volume_tariff(10);
    h.billing.add_namespace_tariff(small.clone());
    h.billing.add_namespace_tariff(large.clone());
    h.billing.add_volume_tariff(vol_tariff.clone());
    let owner = Caller::user(Uuid::new_v4());

    let namespace = h.service.create_namespace(&owner, "app", small.id).await.unwrap();
    let bundled = namespace.volumes[0].meta.id;
    let scratch = h
        .service
        .create_volume(
            &owner,
            "scratch",
            vol_tariff.id,
            VolumePlacement {
                namespace_id: Some(namespace.meta.id),
                persistent: Some(false),
            },
        )
        .await
        .unwrap();

    let resized = h.service.resize_namespace(&owner, namespace.meta.id, large.id).await.unwrap();

    let volume = |id| resized.volumes.iter().find(|v| v.meta.id == id).cloned().unwrap();
    assert_eq!(volume(bundled).meta.tariff_id, large.id);
    assert_eq!(volume(bundled).storage_size, 20);
    let attached = volume(scratch.meta.id);
    assert_eq!(attached.meta.tariff_id, vol_tariff.id);
    assert_eq!(attached.storage_size, 10);
    assert_eq!(attached.meta.subscription, scratch.meta.subscription);
    assert_eq!(h.provisioner.volume(scratch.meta.id), Some((10, 2)));
    assert_eq!(h.billing.subscription(scratch.meta.id).unwrap().tariff, vol_tariff.id);
    h.service.volume_tariff(attached.meta.tariff_id).await.unwrap();
    assert!(
        !h.provisioner
            .calls()
            .iter()
            .any(|call| matches!(call, ProvisionerCall::ResizeVolume { id, .. } if *id == scratch.meta.id))
    );
}

/// The bundled volume moves to the new tariff even when its storage does not change.
#[test_log::test(tokio::test)]
async fn test_resize_namespace_retags_unchanged_bundled_volume() {
    let h = create_harness();
    let first = namespace_tariff(20);
    let mut same_storage = namespace_tariff(20);
    same_storage.cpu_limit = 1000;
    let no_storage = namespace_tariff(0);
    for tariff in [&first, &same_storage, &no_storage] {
        h.billing.add_namespace_tariff(tariff.clone());
    }
    let owner = Caller::user(Uuid::new_v4());

    let namespace = h.service.create_namespace(&owner, "app", first.id).await.unwrap();
    let bundled = namespace.volumes[0].meta.id;

    let resized = h
        .service
        .resize_namespace(&owner, namespace.meta.id, same_storage.id)
        .await
        .unwrap();
    assert_eq!(resized.volumes[0].meta.tariff_id, same_storage.id);
    assert_eq!(resized.volumes[0].storage_size, 20);

    let resized = h
        .service
        .resize_namespace(&owner, namespace.meta.id, no_storage.id)
        .await
        .unwrap();
    assert_eq!(resized.volumes[0].meta.id, bundled);
    assert_eq!(resized.volumes[0].meta.tariff_id, no_storage.id);
    assert_eq!(resized.volumes[0].storage_size, 20);

    assert!(
        !h.provisioner
            .calls()
            .iter()
            .any(|call| matches!(call, ProvisionerCall::ResizeVolume { .. }))
    );
    assert_eq!(h.provisioner.volume(bundled), Some((20, 1)));
}

/// A deletion that rolls back leaves the volume live, billed under the handle billing
/// issued when the subscription was restored, so a retry cancels the right one.
#[test_log::test(tokio::test)]
async fn test_failed_volume_delete_keeps_live_subscription() {
    let h = create_harness();
    h.billing.rotate_handles();
    let tariff = volume_tariff(10);
    h.billing.add_volume_tariff(tariff.clone());
    let owner = Caller::user(Uuid::new_v4());

    let volume = h
        .service
        .create_volume(&owner, "data", tariff.id, VolumePlacement::default())
        .await
        .unwrap();
    let id = volume.meta.id;
    let original = volume.meta.subscription.clone().expect("volume should be subscribed");

    // The unsubscribe completes before the provisioner gives up
    h.provisioner
        .delay(ProvisionerOp::DeleteVolume, Duration::from_millis(50));
    h.provisioner.fail_on(ProvisionerOp::DeleteVolume);
    let result = h.service.delete_volume(&owner, id).await;
    assert!(
        matches!(
            result,
            Err(Error::ExternalService {
                service: ExternalSystem::Provisioner,
                ..
            })
        ),
        "{result:?}"
    );
    assert!(
        h.billing
            .calls()
            .contains(&BillingCall::Unsubscribe { handle: original.clone() })
    );

    let stored = h.service.get_volume(&owner, id, None).await.unwrap();
    let live = h.billing.handle_of(id).expect("subscription should be restored");
    assert_ne!(live, original);
    assert_eq!(stored.meta.subscription, Some(live));
    assert_eq!(h.provisioner.volume(id), Some((10, 2)));

    h.provisioner.recover(ProvisionerOp::DeleteVolume);
    h.service.delete_volume(&owner, id).await.unwrap();
    assert_eq!(h.billing.subscription(id), None);
}

#[test_log::test(tokio::test)]
async fn test_failed_namespace_delete_keeps_live_subscription() {
    let h = create_harness();
    h.billing.rotate_handles();
    let tariff = namespace_tariff(5);
    h.billing.add_namespace_tariff(tariff.clone());
    let owner = Caller::user(Uuid::new_v4());

    let namespace = h.service.create_namespace(&owner, "app", tariff.id).await.unwrap();
    let id = namespace.meta.id;
    let bundled = namespace.volumes[0].meta.id;
    let original = namespace.meta.subscription.clone().expect("namespace should be subscribed");

    h.provisioner
        .delay(ProvisionerOp::DeleteNamespace, Duration::from_millis(50));
    h.provisioner.fail_on(ProvisionerOp::DeleteNamespace);
    let result = h.service.delete_namespace(&owner, id).await;
    assert!(matches!(result, Err(Error::ExternalService { .. })), "{result:?}");

    let stored = h.service.get_namespace(&owner, id, None).await.unwrap();
    assert_eq!(stored.volumes.len(), 1);
    assert_eq!(stored.volumes[0].meta.id, bundled);
    assert_eq!(h.provisioner.volume(bundled), Some((5, 1)));
    let live = h.billing.handle_of(id).expect("subscription should be restored");
    assert_ne!(live, original);
    assert_eq!(stored.meta.subscription, Some(live));
    assert!(h.notifier.sent().iter().all(|n| !matches!(n, Notification::Deleted { .. })));

    h.provisioner.recover(ProvisionerOp::DeleteNamespace);
    h.service.delete_namespace(&owner, id).await.unwrap();
    assert_eq!(h.billing.subscription(id), None);
    assert_eq!(h.provisioner.namespace(id), None);
}

#[test_log::test(tokio::test)]
async fn test_delete_namespace_cascades_to_bundled_volumes_only() {
    let h = create_harness();
    let ns_tariff = namespace_tariff(5);
    let vol_tariff = volume_tariff(10);
    h.billing.add_namespace_tariff(ns_tariff.clone());
    h.billing.add_volume_tariff(vol_tariff.clone());
    let owner = Caller::user(Uuid::new_v4());
    let reader = Uuid::new_v4();

    let namespace = h.service.create_namespace(&owner, "app", ns_tariff.id).await.unwrap();
    let bundled = namespace.volumes[0].meta.id;
    let attached = h
        .service
        .create_volume(
            &owner,
            "keep",
            vol_tariff.id,
            VolumePlacement {
                namespace_id: Some(namespace.meta.id),
                persistent: Some(true),
            },
        )
        .await
        .unwrap();
    h.service
        .change_access(&owner, ResourceKind::Namespace, namespace.meta.id, reader, AccessLevel::Read)
        .await
        .unwrap();

    h.service.delete_namespace(&owner, namespace.meta.id).await.unwrap();

    let result = h.service.get_namespace(&owner, namespace.meta.id, None).await;
    assert!(matches!(result, Err(Error::NotFound { .. })), "{result:?}");
    let result = h.service.get_volume(&owner, bundled, None).await;
    assert!(matches!(result, Err(Error::NotFound { .. })), "{result:?}");
    h.service.get_volume(&owner, attached.meta.id, None).await.unwrap();

    assert_eq!(h.provisioner.namespace(namespace.meta.id), None);
    assert_eq!(h.provisioner.volume(bundled), None);
    assert!(h.provisioner.volume(attached.meta.id).is_some());
    assert_eq!(h.billing.subscription(namespace.meta.id), None);
    assert!(h.notifier.sent().contains(&Notification::Deleted {
        user: owner.id,
        label: "app".to_string(),
    }));

    let auth_cache = h.auth_cache.clone();
    assert!(eventually(|| auth_cache.invalidated().contains(&reader)).await);
}

#[test_log::test(tokio::test)]
async fn test_volume_placement_rules() {
    let h = create_harness();
    let ns_tariff = namespace_tariff(0);
    let vol_tariff = volume_tariff(10);
    h.billing.add_namespace_tariff(ns_tariff.clone());
    h.billing.add_volume_tariff(vol_tariff.clone());
    let owner = Caller::user(Uuid::new_v4());
    let reader = Caller::user(Uuid::new_v4());

    let orphan = h
        .service
        .create_volume(
            &owner,
            "orphan",
            vol_tariff.id,
            VolumePlacement {
                namespace_id: None,
                persistent: Some(false),
            },
        )
        .await;
    assert!(matches!(orphan, Err(Error::BadInput { .. })), "{orphan:?}");

    let namespace = h.service.create_namespace(&owner, "app", ns_tariff.id).await.unwrap();
    h.service
        .change_access(&owner, ResourceKind::Namespace, namespace.meta.id, reader.id, AccessLevel::Read)
        .await
        .unwrap();
    let intruder = h
        .service
        .create_volume(
            &reader,
            "sneaky",
            vol_tariff.id,
            VolumePlacement {
                namespace_id: Some(namespace.meta.id),
                persistent: None,
            },
        )
        .await;
    assert!(matches!(intruder, Err(Error::PermissionDenied { .. })), "{intruder:?}");
    assert!(h.provisioner.calls().iter().all(|call| !matches!(call, ProvisionerCall::CreateVolume { .. })));
}

#[test_log::test(tokio::test)]
async fn test_list_filters_shared_resources() {
    let h = create_harness();
    let tariff = namespace_tariff(0);
    h.billing.add_namespace_tariff(tariff.clone());
    let alice = Caller::user(Uuid::new_v4());
    let bob = Caller::user(Uuid::new_v4());

    let shared = h.service.create_namespace(&alice, "shared", tariff.id).await.unwrap();
    h.service.create_namespace(&alice, "private", tariff.id).await.unwrap();
    let own = h.service.create_namespace(&bob, "own", tariff.id).await.unwrap();
    h.service
        .change_access(&alice, ResourceKind::Namespace, shared.meta.id, bob.id, AccessLevel::Read)
        .await
        .unwrap();
    h.service.set_namespace_limited(&bob, own.meta.id, true).await.unwrap();

    let visible = h.service.list_namespaces(&bob, None, vec![], None, None).await.unwrap();
    let mut labels: Vec<_> = visible.iter().map(|n| n.meta.label.as_str()).collect();
    labels.sort_unstable();
    assert_eq!(labels, vec!["own", "shared"]);

    let not_owned = h
        .service
        .list_namespaces(&bob, None, vec![ResourceFilter::NotOwned], None, None)
        .await
        .unwrap();
    assert_eq!(not_owned.len(), 1);
    assert_eq!(not_owned[0].meta.id, shared.meta.id);

    let limited = h
        .service
        .list_namespaces(&bob, None, vec![ResourceFilter::Limited], None, None)
        .await
        .unwrap();
    assert_eq!(limited.len(), 1);
    assert!(limited[0].meta.limited);

    // Only admins may look through someone else's eyes
    let ignored = h.service.list_namespaces(&bob, Some(alice.id), vec![], None, None).await.unwrap();
    assert!(ignored.iter().any(|n| n.meta.id == own.meta.id));
    let admin = Caller::admin(Uuid::new_v4());
    let through_admin = h.service.list_namespaces(&admin, Some(alice.id), vec![], None, None).await.unwrap();
    assert_eq!(through_admin.len(), 2);
    assert!(through_admin.iter().all(|n| n.meta.owner_user_id == alice.id));
    let own_view = h.service.list_namespaces(&admin, None, vec![], None, None).await.unwrap();
    assert!(own_view.is_empty());
}

#[test_log::test(tokio::test)]
async fn test_delete_all_volumes_streams_outcomes() {
    let h = create_harness();
    let tariff = volume_tariff(10);
    h.billing.add_volume_tariff(tariff.clone());
    let owner = Caller::user(Uuid::new_v4());
    for label in ["one", "two", "three"] {
        h.service
            .create_volume(&owner, label, tariff.id, VolumePlacement::default())
            .await
            .unwrap();
    }

    let stranger = Caller::user(Uuid::new_v4());
    let result = h.service.delete_all_volumes(&stranger, owner.id);
    assert!(matches!(result, Err(Error::Forbidden { .. })));

    h.provisioner.fail_on(ProvisionerOp::DeleteVolume);
    let failed: Vec<_> = h
        .service
        .delete_all_volumes(&owner, owner.id)
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(failed.len(), 3);
    for outcome in &failed {
        assert!(!outcome.deleted);
        assert_eq!(outcome.error.as_ref().map(|e| e.code), Some("external_service_failure"));
    }

    h.provisioner.recover(ProvisionerOp::DeleteVolume);
    let admin = Caller::admin(Uuid::new_v4());
    let deleted: Vec<_> = h
        .service
        .delete_all_volumes(&admin, owner.id)
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(deleted.len(), 3);
    assert!(deleted.iter().all(|outcome| outcome.deleted));

    let count = h.service.count_resources(&owner, owner.id).await.unwrap();
    assert_eq!(count.volumes, 0);
}

#[test_log::test(tokio::test)]
async fn test_admin_stream_covers_every_page() {
    let h = create_harness();
    let tariff = volume_tariff(10);
    h.billing.add_volume_tariff(tariff.clone());
    for i in 0..5 {
        let owner = Caller::user(Uuid::new_v4());
        h.service
            .create_volume(&owner, &format!("vol-{i}"), tariff.id, VolumePlacement::default())
            .await
            .unwrap();
    }

    let user = Caller::user(Uuid::new_v4());
    assert!(matches!(
        h.service.stream_all_volumes(&user, vec![]),
        Err(Error::Forbidden { .. })
    ));

    let admin = Caller::admin(Uuid::new_v4());
    let all: Vec<_> = h
        .service
        .stream_all_volumes(&admin, vec![])
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(all.len(), 5);
}

#[test_log::test(tokio::test)]
async fn test_lock_requires_write() {
    let h = create_harness();
    let tariff = volume_tariff(10);
    h.billing.add_volume_tariff(tariff.clone());
    let owner = Caller::user(Uuid::new_v4());
    let deleter = Caller::user(Uuid::new_v4());
    let volume = h
        .service
        .create_volume(&owner, "data", tariff.id, VolumePlacement::default())
        .await
        .unwrap();
    h.service
        .change_access(&owner, ResourceKind::Volume, volume.meta.id, deleter.id, AccessLevel::ReadDelete)
        .await
        .unwrap();

    let result = h.service.set_volume_limited(&deleter, volume.meta.id, true).await;
    assert!(matches!(result, Err(Error::PermissionDenied { .. })), "{result:?}");

    let locked = h.service.set_volume_limited(&owner, volume.meta.id, true).await.unwrap();
    assert!(locked.meta.limited);

    // ReadDelete is enough to delete
    h.service.delete_volume(&deleter, volume.meta.id).await.unwrap();
}
