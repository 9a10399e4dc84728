//! HTTP API tests against the in-memory collaborators.


use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use cirrus_conductor::api;
use cirrus_conductor::compute::ComputeOperation;
use cirrus_conductor::model::{MigrationStatus, TaskState, VmState};
use cirrus_conductor::state::AppState;
use harness::{instance, Harness};
use serde_json::{json, Value};
use tower::ServiceExt;

fn router(h: &Harness) -> Router {
    api::create_router(AppState::new(h.manager.clone(), None))
}

async fn send(app: Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(json) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Body::from(json.to_string())
        }
        None => Body::empty(),
    };
    let response = app.oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_health_endpoints() {
    let h = Harness::new(&[]);

    let (status, body) = send(router(&h), Method::GET, "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "conductor");

    let (status, body) = send(router(&h), Method::GET, "/readyz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, _) = send(router(&h), Method::GET, "/livez", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_live_migrate_by_uuid_returns_migration_id() {
    let h = Harness::new(&["src", "dst"]);
    let mut inst = instance("src");
    inst.task_state = Some(TaskState::Migrating);
    let inst = h.add(inst);

    let (status, body) = send(
        router(&h),
        Method::POST,
        "/v1/compute-task/migrate-server",
        Some(json!({
            "instance": inst.uuid.to_string(),
            "scheduler_hint": { "host": "dst" },
            "live": true,
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    let id = body["migration_id"].as_str().unwrap();
    let record = h
        .store
        .migration(cirrus_id::MigrationId::parse(id).unwrap())
        .unwrap();
    assert_eq!(record.status, MigrationStatus::Running);
}

#[tokio::test]
async fn test_unsupported_migration_is_501_problem() {
    let h = Harness::new(&["src"]);
    let inst = h.add(instance("src"));

    let request = Request::builder()
        .method(Method::POST)
        .uri("/v1/compute-task/migrate-server")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-request-id", "8d4e5b7a-0c1f-4a53-9a57-3f2d1c0b9e6a")
        .body(Body::from(
            json!({ "instance": inst.uuid.to_string(), "live": true, "rebuild": true }).to_string(),
        ))
        .unwrap();
    let response = router(&h).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/problem+json"
    );
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["code"], "not_implemented");
    assert_eq!(body["kind"], "not_implemented");
    assert_eq!(body["request_id"], "8d4e5b7a-0c1f-4a53-9a57-3f2d1c0b9e6a");
}

#[tokio::test]
async fn test_unknown_instance_is_404() {
    let h = Harness::new(&["src"]);

    let (status, body) = send(
        router(&h),
        Method::POST,
        "/v1/compute-task/migrate-server",
        Some(json!({ "instance": cirrus_id::InstanceId::new().to_string(), "live": true })),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "instance_not_found");
}

#[tokio::test]
async fn test_invalid_request_id_is_rejected() {
    let h = Harness::new(&[]);
    let request = Request::builder()
        .uri("/v1/migrations/not-a-uuid/progress")
        .method(Method::POST)
        .header("x-request-id", "nope")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "status": "running" }).to_string()))
        .unwrap();

    let response = router(&h).oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_build_instances_is_accepted_and_runs() {
    let h = Harness::new(&["a"]);
    let mut inst = instance("unassigned");
    inst.host = None;
    inst.vm_state = Some(VmState::Building);
    let inst = h.add(inst);

    let (status, body) = send(
        router(&h),
        Method::POST,
        "/v1/compute-task/build-instances",
        Some(json!({
            "instances": [inst.uuid.to_string()],
            "filter_properties": { "instance_type": { "id": 5 } },
            "requested_networks": [["net-1", null, null]],
        })),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED, "{body}");
    assert!(body["request_id"].is_string());

    for _ in 0..50 {
        if !h.rpc.calls_for(ComputeOperation::BUILD_AND_RUN_INSTANCE).is_empty() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    let calls = h.rpc.calls_for(ComputeOperation::BUILD_AND_RUN_INSTANCE);
    assert_eq!(calls.len(), 1);
    match &calls[0].operation {
        ComputeOperation::BuildAndRunInstance(req) => {
            assert_eq!(req.requested_networks[0].network_id.as_deref(), Some("net-1"));
            assert_eq!(req.request_spec.instance_type.id, 5);
        }
        other => panic!("unexpected operation {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_build_is_rejected_before_scheduling() {
    let h = Harness::new(&["a"]);
    let inst = h.add(instance("a"));

    let (status, body) = send(
        router(&h),
        Method::POST,
        "/v1/compute-task/build-instances",
        Some(json!({
            "instances": [inst.uuid.to_string()],
            "filter_properties": { "ignore_hosts": "not-a-list" },
        })),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_request");
    assert!(h.rpc.calls().is_empty());
}

#[tokio::test]
async fn test_migration_progress() {
    let h = Harness::new(&["src", "dst"]);
    let mut inst = instance("src");
    inst.task_state = Some(TaskState::Migrating);
    let inst = h.add(inst);
    let id = h
        .manager
        .migrate_server(
            &h.ctx(),
            cirrus_conductor::coordinator::MigrateServer {
                instance: inst,
                scheduler_hint: cirrus_conductor::coordinator::SchedulerHint {
                    host: Some("dst".to_string()),
                    ..Default::default()
                },
                live: true,
                rebuild: false,
                flavor: None,
                block_migration: false,
                disk_over_commit: false,
                reservations: Vec::new(),
                clean_shutdown: true,
            },
        )
        .await
        .unwrap()
        .unwrap();
    let uri = format!("/v1/migrations/{id}/progress");

    let (status, body) = send(
        router(&h),
        Method::POST,
        &uri,
        Some(json!({ "status": "post-migrating" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["status"], "post-migrating");

    // A repeated report is accepted and not written again.
    let writes = h.store.migration_history(id).len();
    let (status, _) = send(
        router(&h),
        Method::POST,
        &uri,
        Some(json!({ "status": "post-migrating" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(h.store.migration_history(id).len(), writes);

    let (status, body) = send(
        router(&h),
        Method::POST,
        &uri,
        Some(json!({ "status": "running" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_migration_transition");

    let (status, body) = send(
        router(&h),
        Method::POST,
        &format!("/v1/migrations/{}/progress", cirrus_id::MigrationId::new()),
        Some(json!({ "status": "running" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "migration_not_found");
}

#[tokio::test]
async fn test_instance_update() {
    let h = Harness::new(&["a"]);
    let mut inst = instance("a");
    inst.task_state = Some(TaskState::Migrating);
    let inst = h.add(inst);
    let uri = format!("/v1/instances/{}", inst.uuid);

    let (status, body) = send(
        router(&h),
        Method::PATCH,
        &uri,
        Some(json!({ "task_state": null, "expected_task_state": "migrating" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["task_state"], Value::Null);
    assert_eq!(h.current(inst.uuid).task_state, None);

    let (status, body) = send(
        router(&h),
        Method::PATCH,
        &uri,
        Some(json!({ "task_state": "rebuilding", "expected_task_state": "migrating" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "unexpected_task_state");

    let (status, body) = send(router(&h), Method::PATCH, &uri, Some(json!({ "flavor": 7 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_request");
}
