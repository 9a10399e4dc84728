//! Normalizing requests that arrive in canonical form is free and lossless.


use cirrus_conductor::coordinator::{
    MigrateServer, MigrateServerBody, RebuildInstanceBody, SchedulerHint,
};
use cirrus_conductor::model::FilterProperties;
use harness::{flavor, instance, Harness};
use serde_json::json;

fn canonical() -> MigrateServer {
    MigrateServer {
        instance: instance("src"),
        scheduler_hint: SchedulerHint {
            host: None,
            filter_properties: FilterProperties::ignoring(["bad-host"]),
        },
        live: false,
        rebuild: false,
        flavor: Some(flavor(7)),
        block_migration: false,
        disk_over_commit: false,
        reservations: vec!["r1".to_string()],
        clean_shutdown: false,
    }
}

#[tokio::test]
async fn test_canonical_request_is_unchanged_without_lookups() {
    let h = Harness::new(&[]);
    let request = canonical();

    let normalized = MigrateServerBody::from(request.clone())
        .normalize(&*h.store, &*h.store)
        .await
        .unwrap();

    assert_eq!(normalized, request);
    assert_eq!(h.store.instance_lookups(), 0);
    assert_eq!(h.store.flavor_lookups(), 0);
}

#[tokio::test]
async fn test_canonical_json_is_unchanged_without_lookups() {
    let h = Harness::new(&[]);
    let request = canonical();

    let body: MigrateServerBody =
        serde_json::from_value(serde_json::to_value(&request).unwrap()).unwrap();
    let normalized = body.normalize(&*h.store, &*h.store).await.unwrap();

    assert_eq!(normalized, request);
    assert_eq!(h.store.instance_lookups(), 0);
    assert_eq!(h.store.flavor_lookups(), 0);
}

#[tokio::test]
async fn test_references_are_resolved_once() {
    let h = Harness::new(&[]);
    let stored = h.add(instance("src"));

    let body: MigrateServerBody = serde_json::from_value(json!({
        "instance": stored.uuid.to_string(),
        "flavor": { "id": 7 },
        "live": false,
        "rebuild": false,
    }))
    .unwrap();
    let normalized = body.normalize(&*h.store, &*h.store).await.unwrap();

    assert_eq!(normalized.instance, stored);
    assert_eq!(normalized.flavor, Some(flavor(7)));
    assert!(normalized.clean_shutdown);
    assert_eq!(h.store.instance_lookups(), 1);
    assert_eq!(h.store.flavor_lookups(), 1);
}

#[tokio::test]
async fn test_unknown_instance_reference_is_not_found() {
    let h = Harness::new(&[]);
    let body: RebuildInstanceBody = serde_json::from_value(json!({
        "instance": { "uuid": cirrus_id::InstanceId::new().to_string() },
    }))
    .unwrap();

    let err = body.normalize(&*h.store).await.unwrap_err();

    assert!(matches!(
        err,
        cirrus_conductor::error::ConductorError::InstanceNotFound(_)
    ));
}
