//! `unshelve_instance` and `rebuild_instance`.


use std::collections::BTreeMap;

use cirrus_conductor::compute::ComputeOperation;
use cirrus_conductor::coordinator::RebuildInstance;
use cirrus_conductor::error::{ConductorError, ErrorKind, PreCheckError};
use cirrus_conductor::model::{ImageMeta, Instance, TaskState, VmState, SHELVED_IMAGE_ID_KEY};
use cirrus_conductor::notifier::events;
use cirrus_conductor::scheduler::HostState;
use cirrus_events::event_types;
use cirrus_id::RequestId;
use harness::{instance, Harness};

fn shelved(h: &Harness) -> Instance {
    let mut inst = instance("src");
    inst.vm_state = Some(VmState::Shelved);
    inst.task_state = Some(TaskState::Unshelving);
    h.add(inst)
}

fn offloaded(h: &Harness, image_id: &str) -> Instance {
    let mut inst = instance("src");
    inst.vm_state = Some(VmState::ShelvedOffloaded);
    inst.task_state = Some(TaskState::Unshelving);
    inst.host = None;
    inst.node = None;
    inst.system_metadata
        .insert(SHELVED_IMAGE_ID_KEY.to_string(), image_id.to_string());
    h.add(inst)
}

#[tokio::test]
async fn test_shelved_instance_is_powered_on_in_place() {
    let h = Harness::new(&["src"]);
    let inst = shelved(&h);

    h.manager.unshelve_instance(&h.ctx(), inst.clone()).await.unwrap();

    let calls = h.rpc.calls_for(ComputeOperation::START_INSTANCE);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].host, "src");
    assert_eq!(
        h.current(inst.uuid).task_state,
        Some(TaskState::PoweringOn)
    );
}

#[tokio::test]
async fn test_shelved_instance_in_wrong_task_state_is_rejected() {
    let h = Harness::new(&["src"]);
    let mut inst = instance("src");
    inst.vm_state = Some(VmState::Shelved);
    inst.task_state = Some(TaskState::Shelving);
    let inst = h.add(inst);

    let err = h
        .manager
        .unshelve_instance(&h.ctx(), inst)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Concurrency);
    assert!(h.rpc.calls().is_empty());
}

#[tokio::test]
async fn test_offloaded_instance_is_scheduled_with_its_image() {
    let mut h = Harness::new(&["a"]);
    h.images.insert(
        "snap-1",
        ImageMeta {
            name: Some("shelved snapshot".to_string()),
            ..Default::default()
        },
    );
    let inst = offloaded(&h, "snap-1");
    let request_id = RequestId::new();
    let ctx = cirrus_conductor::context::RequestContext::with_request_id(request_id);

    h.manager.unshelve_instance(&ctx, inst.clone()).await.unwrap();

    let calls = h.rpc.calls_for(ComputeOperation::UNSHELVE_INSTANCE);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].host, "a");
    match &calls[0].operation {
        ComputeOperation::UnshelveInstance(req) => {
            assert_eq!(req.node, "a");
            assert_eq!(req.image.as_ref().and_then(|i| i.id.as_deref()), Some("snap-1"));
        }
        other => panic!("unexpected operation {other:?}"),
    }

    let steps: Vec<(String, String)> = h
        .drain_notifications()
        .into_iter()
        .filter(|n| n.event_type.starts_with("instance.action_event"))
        .map(|n| {
            assert_eq!(n.payload["request_id"], request_id.to_string());
            (
                n.payload["event"].as_str().unwrap().to_string(),
                n.payload["phase"].as_str().unwrap().to_string(),
            )
        })
        .collect();
    assert_eq!(
        steps,
        vec![
            (events::GET_IMAGE_INFO.to_string(), "start".to_string()),
            (events::GET_IMAGE_INFO.to_string(), "finish".to_string()),
            (events::SCHEDULE_INSTANCES.to_string(), "start".to_string()),
            (events::SCHEDULE_INSTANCES.to_string(), "finish".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_missing_image_fails_unshelve() {
    let h = Harness::new(&["a"]);
    let inst = offloaded(&h, "gone");

    let err = h
        .manager
        .unshelve_instance(&h.ctx(), inst.clone())
        .await
        .unwrap_err();

    match err {
        ConductorError::UnshelveFailed { reason, .. } => {
            assert_eq!(reason, "Unshelve attempted but the image gone cannot be found.");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(h.current(inst.uuid).vm_state, Some(VmState::Error));
    assert!(h.rpc.calls().is_empty());
}

#[tokio::test]
async fn test_no_host_for_unshelve_clears_task_state() {
    let h = Harness::builder()
        .hosts(&["a"])
        .placement(vec![HostState::new("a", 256, 1, 1)])
        .build();
    h.images.insert("snap-1", ImageMeta::default());
    let inst = offloaded(&h, "snap-1");

    h.manager.unshelve_instance(&h.ctx(), inst.clone()).await.unwrap();

    let current = h.current(inst.uuid);
    assert_eq!(current.task_state, None);
    assert_eq!(current.vm_state, Some(VmState::ShelvedOffloaded));
    assert!(h.rpc.calls().is_empty());
}

#[tokio::test]
async fn test_unshelve_of_active_instance_is_rejected() {
    let mut h = Harness::new(&["src"]);
    let inst = h.add(instance("src"));

    let err = h
        .manager
        .unshelve_instance(&h.ctx(), inst.clone())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ConductorError::PreCheck(PreCheckError::InstanceInvalidState { ref state, .. }) if state == "active"
    ));
    assert_eq!(h.current(inst.uuid).vm_state, Some(VmState::Error));
    assert_eq!(h.store.faults().len(), 1);
    assert!(h
        .drain_notifications()
        .iter()
        .any(|n| n.event_type == event_types::UNSHELVE_INSTANCE));
}

fn rebuild(instance: Instance, host: Option<&str>) -> RebuildInstance {
    RebuildInstance {
        instance,
        orig_image_ref: Some("img-1".to_string()),
        image_ref: Some("img-2".to_string()),
        injected_files: Vec::new(),
        new_pass: None,
        orig_sys_metadata: BTreeMap::new(),
        block_device_mappings: Vec::new(),
        recreate: host.is_none(),
        on_shared_storage: false,
        preserve_ephemeral: false,
        host: host.map(str::to_string),
        scheduler_hints: BTreeMap::new(),
    }
}

#[tokio::test]
async fn test_rebuild_on_given_host() {
    let mut h = Harness::new(&["src"]);
    let mut inst = instance("src");
    inst.task_state = Some(TaskState::Rebuilding);
    let inst = h.add(inst);

    h.manager
        .rebuild_instance(&h.ctx(), rebuild(inst.clone(), Some("src")))
        .await
        .unwrap();

    let calls = h.rpc.calls_for(ComputeOperation::REBUILD_INSTANCE);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].host, "src");

    let types: Vec<_> = h
        .drain_notifications()
        .into_iter()
        .map(|n| n.event_type)
        .collect();
    assert!(types.contains(&event_types::REBUILD_SCHEDULED.to_string()));
}

#[tokio::test]
async fn test_evacuate_schedules_away_from_current_host() {
    let h = Harness::new(&["src", "dst"]);
    let mut inst = instance("src");
    inst.task_state = Some(TaskState::Rebuilding);
    let inst = h.add(inst);

    h.manager
        .rebuild_instance(&h.ctx(), rebuild(inst, None))
        .await
        .unwrap();

    let calls = h.rpc.calls_for(ComputeOperation::REBUILD_INSTANCE);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].host, "dst");
    match &calls[0].operation {
        ComputeOperation::RebuildInstance(req) => {
            assert_eq!(req.host, "dst");
            assert!(req.recreate);
        }
        other => panic!("unexpected operation {other:?}"),
    }
}

#[tokio::test]
async fn test_evacuate_without_hosts_restores_state() {
    let h = Harness::new(&["src"]);
    let mut inst = instance("src");
    inst.task_state = Some(TaskState::Rebuilding);
    let inst = h.add(inst);

    let err = h
        .manager
        .rebuild_instance(&h.ctx(), rebuild(inst.clone(), None))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Placement);
    let current = h.current(inst.uuid);
    assert_eq!(current.vm_state, Some(VmState::Active));
    assert_eq!(current.task_state, None);
    assert!(h.rpc.calls().is_empty());
}

#[tokio::test]
async fn test_rebuild_with_unsupported_group_policy_restores_state() {
    let h = Harness::new(&["src", "dst"]);
    let mut inst = instance("src");
    inst.task_state = Some(TaskState::Rebuilding);
    let inst = h.add(inst);
    let mut request = rebuild(inst.clone(), None);
    request.scheduler_hints = h.unsupported_group("batch");

    let err = h
        .manager
        .rebuild_instance(&h.ctx(), request)
        .await
        .unwrap_err();

    assert!(matches!(err, ConductorError::UnsupportedPolicy { .. }));
    let current = h.current(inst.uuid);
    assert_eq!(current.vm_state, Some(VmState::Active));
    assert_eq!(current.task_state, None);
    assert!(h.rpc.calls().is_empty());
    assert_eq!(h.store.faults().len(), 1);
}
