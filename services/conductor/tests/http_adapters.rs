//! HTTP adapters for placement, compute agents and the image service.


use std::sync::Arc;
use std::time::Duration;

use cirrus_conductor::compute::{
    CheckCanLiveMigrateDestination, ComputeAgentClient, ComputeRpcError, HttpComputeRpc,
};
use cirrus_conductor::config::{ComputeAgentConfig, ImageConfig, SchedulerConfig};
use cirrus_conductor::error::{ConductorError, ErrorKind, PreCheckError};
use cirrus_conductor::images::{HttpImageService, ImageError, ImageService};
use cirrus_conductor::model::{FilterProperties, RequestSpec};
use cirrus_conductor::scheduler::{HttpSchedulerClient, SchedulerClient, SchedulerError};
use harness::instance;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn compute_client(server: &MockServer) -> ComputeAgentClient {
    compute_client_with(server, Duration::from_secs(5), Duration::from_secs(5))
}

fn compute_client_with(
    server: &MockServer,
    request_timeout: Duration,
    call_timeout: Duration,
) -> ComputeAgentClient {
    let rpc = HttpComputeRpc::new(
        ComputeAgentConfig {
            url_template: server.uri(),
            request_timeout,
        },
        call_timeout,
    )
    .unwrap();
    ComputeAgentClient::new(Arc::new(rpc), call_timeout)
}

fn check_request() -> CheckCanLiveMigrateDestination {
    CheckCanLiveMigrateDestination {
        instance: instance("src"),
        block_migration: false,
        disk_over_commit: false,
    }
}

#[tokio::test]
async fn test_placement_returns_destinations() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/select-destinations"))
        .and(body_partial_json(json!({ "request_spec": { "num_instances": 1 } })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "destinations": [{ "host": "a", "nodename": "a-node" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = HttpSchedulerClient::new(&SchedulerConfig {
        placement_url: server.uri(),
        ..Default::default()
    })
    .unwrap();
    let spec = RequestSpec::for_instance(None, &instance("src"), None);

    let hosts = client
        .select_destinations(&spec, &FilterProperties::default())
        .await
        .unwrap();

    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].host, "a");
    assert_eq!(hosts[0].nodename, "a-node");
}

#[tokio::test]
async fn test_placement_conflict_is_no_valid_host() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/select-destinations"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({ "reason": "all hosts full" })))
        .mount(&server)
        .await;

    let client = HttpSchedulerClient::new(&SchedulerConfig {
        placement_url: server.uri(),
        ..Default::default()
    })
    .unwrap();
    let spec = RequestSpec::for_instance(None, &instance("src"), None);

    let err = client
        .select_destinations(&spec, &FilterProperties::default())
        .await
        .unwrap_err();

    assert!(matches!(err, SchedulerError::NoValidHost { ref reason } if reason == "all hosts full"));
}

#[tokio::test]
async fn test_compute_cast_is_accepted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/compute/start_instance"))
        .and(body_partial_json(json!({ "method": "start_instance" })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    compute_client(&server)
        .start_instance("src", instance("src"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_compute_call_returns_migrate_data() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/compute/check_can_live_migrate_destination"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "reply": "migrate_data",
            "data": { "block_migration": false }
        })))
        .mount(&server)
        .await;

    let data = compute_client(&server)
        .check_can_live_migrate_destination("dst", check_request())
        .await
        .unwrap();

    assert_eq!(data, json!({ "block_migration": false }));
}

#[tokio::test]
async fn test_compute_precheck_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/compute/check_can_live_migrate_destination"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "code": "invalid_shared_storage",
            "path": "/var/lib/instances",
            "reason": "not shared"
        })))
        .mount(&server)
        .await;

    let err = compute_client(&server)
        .check_can_live_migrate_destination("dst", check_request())
        .await
        .unwrap_err();

    match err {
        ComputeRpcError::PreCheck { host, failure } => {
            assert_eq!(host, "dst");
            assert!(matches!(failure, PreCheckError::InvalidSharedStorage { .. }));
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn test_compute_server_error_is_remote() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let err = compute_client(&server)
        .start_instance("src", instance("src"))
        .await
        .unwrap_err();

    assert!(matches!(err, ComputeRpcError::Remote { ref message, .. } if message.contains("boom")));
}

#[tokio::test]
async fn test_slow_compute_call_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_millis(500))
                .set_body_json(json!({ "reply": "accepted" })),
        )
        .mount(&server)
        .await;
    let client = compute_client_with(&server, Duration::from_secs(5), Duration::from_millis(50));

    let err = client
        .check_can_live_migrate_destination("dst", check_request())
        .await
        .unwrap_err();

    assert!(matches!(err, ComputeRpcError::Timeout { .. }));
}

#[tokio::test]
async fn test_short_transport_timeout_does_not_cut_calls() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/compute/check_can_live_migrate_destination"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_millis(300))
                .set_body_json(json!({ "reply": "migrate_data", "data": { "dst": "ok" } })),
        )
        .mount(&server)
        .await;
    let client = compute_client_with(&server, Duration::from_millis(100), Duration::from_secs(2));

    let data = client
        .check_can_live_migrate_destination("dst", check_request())
        .await
        .unwrap();

    assert_eq!(data, json!({ "dst": "ok" }));
}

#[tokio::test]
async fn test_slow_call_is_precheck_timeout_with_short_transport_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_delay(Duration::from_millis(1500))
                .set_body_json(json!({ "reply": "accepted" })),
        )
        .mount(&server)
        .await;
    let client = compute_client_with(&server, Duration::from_millis(100), Duration::from_millis(300));

    let err = client
        .check_can_live_migrate_destination("dst", check_request())
        .await
        .unwrap_err();

    let err = ConductorError::from(err);
    assert_eq!(err.kind(), ErrorKind::PreCheck);
    assert!(matches!(err, ConductorError::PreCheck(PreCheckError::Timeout { .. })));
}

#[tokio::test]
async fn test_transport_timeout_on_cast_is_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(202).set_delay(Duration::from_millis(1500)))
        .mount(&server)
        .await;
    let client = compute_client_with(&server, Duration::from_millis(100), Duration::from_secs(5));

    let err = client
        .start_instance("dst", instance("dst"))
        .await
        .unwrap_err();

    assert!(matches!(err, ComputeRpcError::Timeout { .. }));
}

#[tokio::test]
async fn test_image_lookup() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/images/snap-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": "snapshot" })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/images/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let images = HttpImageService::new(&ImageConfig {
        url: server.uri(),
        request_timeout: Duration::from_secs(5),
    })
    .unwrap();

    let image = images.get("snap-1").await.unwrap();
    assert_eq!(image.id.as_deref(), Some("snap-1"));
    assert_eq!(image.name.as_deref(), Some("snapshot"));

    let err = images.get("gone").await.unwrap_err();
    assert!(matches!(err, ImageError::NotFound { ref image_id } if image_id == "gone"));
}
