//! Notifications and failure-state recording.
//!
//! [`Notifier`] is a sink that never blocks and never fails. The
//! [`InstanceStateNotifier`] on top of it is what orchestration code uses
//! to force an instance into a state after a failure, record the fault,
//! and tell the outside world about it.

use std::future::Future;
use std::sync::Arc;

use cirrus_events::{
    event_types, publishers, ActionEventPayload, ActionPhase, ActionResult,
    InstanceUsagePayload, Notification, Priority, StateChangePayload,
};
use cirrus_id::InstanceId;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

use crate::context::RequestContext;
use crate::db::{InstanceFault, InstanceStore, InstanceUpdate};
use crate::error::{ConductorError, ErrorKind};
use crate::model::{Instance, RequestSpec};

/// Action event step names.
pub mod events {
    pub const COLD_MIGRATE: &str = "cold_migrate";
    pub const GET_IMAGE_INFO: &str = "get_image_info";
    pub const SCHEDULE_INSTANCES: &str = "schedule_instances";
    pub const REBUILD_SERVER: &str = "rebuild_server";
}

/// Fire-and-forget notification sink.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification<serde_json::Value>);
}

/// Writes notifications to the tracing log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification<serde_json::Value>) {
        let payload = notification.payload.to_string();
        match notification.priority {
            Priority::Error => error!(
                event_type = %notification.event_type,
                publisher = %notification.publisher_id,
                payload = %payload,
                "Notification"
            ),
            Priority::Warn => warn!(
                event_type = %notification.event_type,
                publisher = %notification.publisher_id,
                payload = %payload,
                "Notification"
            ),
            Priority::Info => info!(
                event_type = %notification.event_type,
                publisher = %notification.publisher_id,
                payload = %payload,
                "Notification"
            ),
        }
    }
}

/// Forwards notifications to a bounded channel, dropping them when full.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<Notification<serde_json::Value>>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Notification<serde_json::Value>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification<serde_json::Value>) {
        match self.tx.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(n)) => {
                warn!(event_type = %n.event_type, "Notification channel full, dropping")
            }
            Err(TrySendError::Closed(n)) => {
                debug!(event_type = %n.event_type, "Notification channel closed, dropping")
            }
        }
    }
}

fn fault_code(kind: ErrorKind) -> u16 {
    match kind {
        ErrorKind::NotFound => 404,
        ErrorKind::Invalid => 400,
        ErrorKind::Concurrency => 409,
        ErrorKind::NotImplemented => 501,
        ErrorKind::Placement | ErrorKind::PreCheck | ErrorKind::Unexpected => 500,
    }
}

/// Records failure states and emits orchestration notifications.
#[derive(Clone)]
pub struct InstanceStateNotifier {
    instances: Arc<dyn InstanceStore>,
    sink: Arc<dyn Notifier>,
    host: String,
}

impl InstanceStateNotifier {
    pub fn new(instances: Arc<dyn InstanceStore>, sink: Arc<dyn Notifier>, host: impl Into<String>) -> Self {
        Self {
            instances,
            sink,
            host: host.into(),
        }
    }

    fn emit<P: Serialize>(&self, publisher: &str, event_type: &str, priority: Priority, payload: P) {
        let built = Notification::builder()
            .publisher(publisher, &self.host)
            .priority(priority)
            .event_type(event_type)
            .payload(payload)
            .build()
            .and_then(Notification::into_json);
        match built {
            Ok(notification) => self.sink.notify(notification),
            Err(e) => warn!(error = %e, event_type, "Failed to build notification"),
        }
    }

    /// Applies `update` after a failed `method`, records a fault and emits
    /// `compute_task.<method>`.
    ///
    /// Never fails: a write that cannot be applied is logged so the caller
    /// can still propagate the original error.
    pub async fn set_vm_state_and_notify(
        &self,
        instance_id: InstanceId,
        method: &str,
        update: InstanceUpdate,
        cause: &ConductorError,
        request_spec: Option<&RequestSpec>,
    ) {
        let state = update
            .vm_state
            .map_or_else(|| "unchanged".to_string(), |s| s.to_string());
        warn!(
            instance_id = %instance_id,
            method,
            vm_state = %state,
            error = %cause,
            "Failed to compute_task_{method}: {cause}. Setting instance to {state} state."
        );

        if let Err(e) = self.instances.update_instance(instance_id, &update).await {
            error!(instance_id = %instance_id, method, error = %e, "Failed to record instance state");
        }

        let fault = InstanceFault::new(instance_id, fault_code(cause.kind()), cause.to_string())
            .with_details(format!("{:?}", cause.kind()));
        if let Err(e) = self.instances.add_fault(fault).await {
            warn!(instance_id = %instance_id, error = %e, "Failed to record instance fault");
        }

        let (spec_json, properties) = request_spec
            .map(|spec| {
                let json = spec.to_json();
                let properties = json
                    .get("instance_properties")
                    .cloned()
                    .unwrap_or(serde_json::Value::Null);
                (json, properties)
            })
            .unwrap_or((serde_json::Value::Null, serde_json::Value::Null));

        self.emit(
            publishers::COMPUTE_TASK,
            &format!("{}.{method}", publishers::COMPUTE_TASK),
            Priority::Error,
            StateChangePayload {
                instance_id,
                method: method.to_string(),
                state,
                reason: cause.to_string(),
                request_spec: spec_json,
                instance_properties: properties,
            },
        );
    }

    fn action_event(
        &self,
        ctx: &RequestContext,
        instance_id: InstanceId,
        event: &str,
        phase: ActionPhase,
        outcome: Option<(ActionResult, Option<String>)>,
    ) {
        let (event_type, result, message) = match outcome {
            None => (event_types::ACTION_EVENT_START, None, None),
            Some((result, message)) => (event_types::ACTION_EVENT_FINISH, Some(result), message),
        };
        self.emit(
            publishers::COMPUTE_TASK,
            event_type,
            Priority::Info,
            ActionEventPayload {
                instance_id,
                event: event.to_string(),
                phase,
                result,
                message,
                request_id: Some(ctx.request_id),
            },
        );
    }

    /// Brackets `step` with start and finish action events for `event`.
    pub async fn report<T, F>(
        &self,
        ctx: &RequestContext,
        instance_id: InstanceId,
        event: &str,
        step: F,
    ) -> Result<T, ConductorError>
    where
        F: Future<Output = Result<T, ConductorError>>,
    {
        self.action_event(ctx, instance_id, event, ActionPhase::Start, None);
        let result = step.await;
        let outcome = match &result {
            Ok(_) => (ActionResult::Success, None),
            Err(e) => (ActionResult::Error, Some(e.to_string())),
        };
        self.action_event(ctx, instance_id, event, ActionPhase::Finish, Some(outcome));
        result
    }

    /// Emits a usage snapshot of `instance` as `event_type`.
    pub fn instance_usage(&self, instance: &Instance, event_type: &str) {
        self.emit(
            publishers::COMPUTE,
            event_type,
            Priority::Info,
            InstanceUsagePayload {
                instance_id: instance.uuid,
                host: instance.host.clone(),
                node: instance.node.clone(),
                vm_state: instance.stable_vm_state().to_string(),
                task_state: instance.task_state.map(|s| s.to_string()),
                flavor_id: instance.flavor.id,
                image_ref: instance.image_ref.clone(),
            },
        );
    }
}
