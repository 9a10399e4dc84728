//! In-process compute transport that records what it was asked to do.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::{ComputeOperation, ComputeReply, ComputeRpc, ComputeRpcError};

/// One dispatched operation.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub host: String,
    pub operation: ComputeOperation,
}

type Observer = Box<dyn Fn(&str, &ComputeOperation) + Send + Sync>;

#[derive(Default)]
struct Script {
    failures: HashMap<&'static str, VecDeque<ComputeRpcError>>,
    delays: HashMap<&'static str, Duration>,
}

/// Compute transport used by dev mode and tests.
///
/// Accepts every operation unless a failure was scripted for it, and keeps
/// the calls in dispatch order.
#[derive(Default)]
pub struct RecordingComputeRpc {
    calls: Mutex<Vec<RecordedCall>>,
    script: Mutex<Script>,
    observer: Option<Observer>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RecordingComputeRpc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `observer` on every dispatch, before it is recorded.
    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: Fn(&str, &ComputeOperation) + Send + Sync + 'static,
    {
        self.observer = Some(Box::new(observer));
        self
    }

    /// Fails the next dispatch of `operation` with `error`.
    pub fn fail_next(&self, operation: &'static str, error: ComputeRpcError) {
        lock(&self.script)
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Delays every dispatch of `operation`.
    pub fn delay(&self, operation: &'static str, delay: Duration) {
        lock(&self.script).delays.insert(operation, delay);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    /// Calls of one operation, in order.
    pub fn calls_for(&self, operation: &str) -> Vec<RecordedCall> {
        lock(&self.calls)
            .iter()
            .filter(|c| c.operation.name() == operation)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ComputeRpc for RecordingComputeRpc {
    async fn dispatch(
        &self,
        host: &str,
        operation: ComputeOperation,
    ) -> Result<ComputeReply, ComputeRpcError> {
        let name = operation.name();
        if let Some(observer) = &self.observer {
            observer(host, &operation);
        }
        info!(host, method = name, instance_id = %operation.instance_uuid(), "Compute operation dispatched");

        let (failure, delay) = {
            let mut script = lock(&self.script);
            let failure = script
                .failures
                .get_mut(name)
                .and_then(VecDeque::pop_front);
            (failure, script.delays.get(name).copied())
        };

        lock(&self.calls).push(RecordedCall {
            host: host.to_string(),
            operation,
        });

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = failure {
            return Err(error);
        }

        Ok(match name {
            ComputeOperation::CHECK_CAN_LIVE_MIGRATE_DESTINATION => {
                ComputeReply::MigrateData(serde_json::json!({ "dest": host }))
            }
            _ => ComputeReply::Accepted,
        })
    }
}
