//! Conductor error taxonomy.
//!
//! Every collaborator has its own error type; [`ConductorError`] folds them
//! into the families callers act on (see [`ErrorKind`]). The `From` impls
//! perform that classification once, so task code can use `?` freely.

use std::time::Duration;

use cirrus_id::{InstanceId, MigrationId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compute::ComputeRpcError;
use crate::db::StoreError;
use crate::images::ImageError;
use crate::model::{InvalidTransition, TaskState};
use crate::scheduler::SchedulerError;

/// Broad family of a [`ConductorError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No host satisfies the request, or its group policy is unsupported.
    Placement,
    /// A validated precondition of the operation does not hold.
    PreCheck,
    /// Anything outside the closed failure sets.
    Unexpected,
    /// The instance changed or vanished underneath the operation.
    Concurrency,
    NotFound,
    Invalid,
    NotImplemented,
}

/// Live-migration precondition failures.
///
/// Raised locally by the live-migration checks or returned by a compute
/// agent's pre-check call; both travel the same path.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum PreCheckError {
    #[error("compute service of {host} is unavailable at this time")]
    ComputeServiceUnavailable { host: String },

    #[error("hypervisor on {host} is unavailable")]
    HypervisorUnavailable { host: String },

    #[error("the supplied hypervisor type of {dest} does not match {source_type}")]
    InvalidHypervisorType { source_type: String, dest: String },

    #[error("unacceptable CPU info: {reason}")]
    InvalidCpuInfo { reason: String },

    #[error("unable to migrate instance {instance} to current host ({host})")]
    UnableToMigrateToSelf { instance: InstanceId, host: String },

    #[error("the instance requires a newer hypervisor version than {dest} provides ({dest_version} < {source_version})")]
    DestinationHypervisorTooOld {
        dest: String,
        source_version: u64,
        dest_version: u64,
    },

    #[error("{path} is not on local storage: {reason}")]
    InvalidLocalStorage { path: String, reason: String },

    #[error("{path} is not on shared storage: {reason}")]
    InvalidSharedStorage { path: String, reason: String },

    #[error("instance {instance} in {attr} {state}; cannot {method} while the instance is in this state")]
    InstanceInvalidState {
        instance: InstanceId,
        attr: String,
        state: String,
        method: String,
    },

    #[error("migration pre-check error: {reason}")]
    MigrationPreCheck { reason: String },

    #[error("live migration with older compute {server} is not safe")]
    LiveMigrationWithOldVersionNotSafe { server: String },

    #[error("pre-check call to {host} timed out after {timeout:?}")]
    Timeout {
        host: String,
        #[serde(with = "duration_secs")]
        timeout: Duration,
    },
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Errors surfaced by the compute task manager.
#[derive(Debug, Error)]
pub enum ConductorError {
    #[error("No valid host was found. {reason}")]
    NoValidHost { reason: String },

    #[error("Instance group policy is not supported: {reason}")]
    UnsupportedPolicy { reason: String },

    #[error(transparent)]
    PreCheck(#[from] PreCheckError),

    /// An unexpected failure during live migration, wrapping its cause.
    #[error("Migration error: {reason}")]
    Migration {
        reason: String,
        #[source]
        source: Box<ConductorError>,
    },

    #[error("unexpected task state for instance {instance}: expected {expected}, found {actual}")]
    UnexpectedTaskState {
        instance: InstanceId,
        expected: String,
        actual: String,
    },

    #[error("instance {0} could not be found")]
    InstanceNotFound(InstanceId),

    #[error("image {image_id} could not be found")]
    ImageNotFound { image_id: String },

    #[error("error during unshelve of instance {instance}: {reason}")]
    UnshelveFailed { instance: InstanceId, reason: String },

    #[error("flavor {0} could not be found")]
    FlavorNotFound(i64),

    #[error("instance group {0} could not be found")]
    GroupNotFound(String),

    #[error("migration {0} could not be found")]
    MigrationNotFound(MigrationId),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("not implemented: live={live} rebuild={rebuild} flavor={flavor}")]
    NotImplemented {
        live: bool,
        rebuild: bool,
        flavor: bool,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("scheduler failure: {0}")]
    Scheduler(#[source] SchedulerError),

    #[error("compute rpc failure: {0}")]
    Compute(#[source] ComputeRpcError),

    #[error("persistence failure: {0}")]
    Store(#[source] StoreError),

    #[error("image service failure: {0}")]
    Image(#[source] ImageError),
}

impl ConductorError {
    pub fn no_valid_host(reason: impl Into<String>) -> Self {
        Self::NoValidHost {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoValidHost { .. } | Self::UnsupportedPolicy { .. } => ErrorKind::Placement,
            Self::PreCheck(_) => ErrorKind::PreCheck,
            Self::UnexpectedTaskState { .. } | Self::InstanceNotFound(_) => {
                ErrorKind::Concurrency
            }
            Self::ImageNotFound { .. }
            | Self::UnshelveFailed { .. }
            | Self::FlavorNotFound(_)
            | Self::GroupNotFound(_)
            | Self::MigrationNotFound(_) => ErrorKind::NotFound,
            Self::InvalidTransition(_) | Self::InvalidRequest(_) => ErrorKind::Invalid,
            Self::NotImplemented { .. } => ErrorKind::NotImplemented,
            Self::Migration { .. }
            | Self::Scheduler(_)
            | Self::Compute(_)
            | Self::Store(_)
            | Self::Image(_) => ErrorKind::Unexpected,
        }
    }

    /// Placement and pre-check failures are rejections of a request;
    /// live migration resets state and marks the record `error` for them.
    pub fn is_expected_live_migration_failure(&self) -> bool {
        matches!(self.kind(), ErrorKind::Placement | ErrorKind::PreCheck)
    }
}

fn describe_task_state(state: Option<TaskState>) -> String {
    state.map_or_else(|| "none".to_string(), |s| s.to_string())
}

impl From<StoreError> for ConductorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InstanceNotFound(id) => Self::InstanceNotFound(id),
            StoreError::MigrationNotFound(id) => Self::MigrationNotFound(id),
            StoreError::FlavorNotFound(id) => Self::FlavorNotFound(id),
            StoreError::UnexpectedTaskState {
                instance,
                expected,
                actual,
            } => Self::UnexpectedTaskState {
                instance,
                expected: describe_task_state(expected),
                actual: describe_task_state(actual),
            },
            other => Self::Store(other),
        }
    }
}

impl From<SchedulerError> for ConductorError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::NoValidHost { reason } => Self::NoValidHost { reason },
            other => Self::Scheduler(other),
        }
    }
}

impl From<ComputeRpcError> for ConductorError {
    fn from(err: ComputeRpcError) -> Self {
        match err.into_precheck() {
            Ok(precheck) => Self::PreCheck(precheck),
            Err(other) => Self::Compute(other),
        }
    }
}

impl From<ImageError> for ConductorError {
    fn from(err: ImageError) -> Self {
        match err {
            ImageError::NotFound { image_id } => Self::ImageNotFound { image_id },
            other => Self::Image(other),
        }
    }
}
