//! Notification type names and payloads.

use cirrus_id::{InstanceId, RequestId};
use serde::{Deserialize, Serialize};

// =============================================================================
// Event Type Constants
// =============================================================================

/// All event type names as constants.
pub mod event_types {
    // Orchestration failures, `compute_task.<method>`
    pub const MIGRATE_SERVER: &str = "compute_task.migrate_server";
    pub const BUILD_INSTANCES: &str = "compute_task.build_instances";
    pub const REBUILD_SERVER: &str = "compute_task.rebuild_server";
    pub const UNSHELVE_INSTANCE: &str = "compute_task.unshelve_instance";

    // Instance action events
    pub const ACTION_EVENT_START: &str = "instance.action_event.start";
    pub const ACTION_EVENT_FINISH: &str = "instance.action_event.finish";

    // Instance usage
    pub const REBUILD_SCHEDULED: &str = "compute.instance.rebuild.scheduled";
}

/// Service names used as the publisher prefix.
pub mod publishers {
    pub const COMPUTE_TASK: &str = "compute_task";
    pub const COMPUTE: &str = "compute";
}

// =============================================================================
// Payloads
// =============================================================================

/// Emitted whenever the conductor forces an instance into a new state
/// because an orchestration step failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangePayload {
    pub instance_id: InstanceId,
    /// Entry point that failed, e.g. `migrate_server`.
    pub method: String,
    /// vm_state the instance was set to.
    pub state: String,
    /// Display form of the error that caused the change.
    pub reason: String,
    /// Snapshot of the placement request being served.
    pub request_spec: serde_json::Value,
    /// Instance properties from the request spec.
    pub instance_properties: serde_json::Value,
}

/// Phase of an instance action event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionPhase {
    Start,
    Finish,
}

/// Outcome of a finished action event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionResult {
    Success,
    Error,
}

/// Start/finish record of one step of an instance action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionEventPayload {
    pub instance_id: InstanceId,
    /// Step name, e.g. `cold_migrate` or `schedule_instances`.
    pub event: String,
    pub phase: ActionPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ActionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
}

/// Usage snapshot of an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceUsagePayload {
    pub instance_id: InstanceId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    pub vm_state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_state: Option<String>,
    pub flavor_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<String>,
}
