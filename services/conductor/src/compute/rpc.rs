//! Compute agent operations and the typed client over them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cirrus_id::{InstanceId, MigrationId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::error::PreCheckError;
use crate::model::{
    BlockDeviceMapping, FilterProperties, Flavor, ImageMeta, Instance, RequestSpec,
    ResourceLimits,
};

/// File injected into a new instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectedFile {
    pub path: String,
    pub contents: String,
}

/// Network requested for a new instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedNetwork {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildAndRunInstance {
    pub instance: Instance,
    pub image: Option<ImageMeta>,
    pub request_spec: RequestSpec,
    pub filter_properties: FilterProperties,
    pub admin_password: Option<String>,
    pub injected_files: Vec<InjectedFile>,
    pub requested_networks: Vec<RequestedNetwork>,
    pub security_groups: Vec<String>,
    pub block_device_mappings: Vec<BlockDeviceMapping>,
    pub node: String,
    pub limits: ResourceLimits,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebuildInstance {
    pub instance: Instance,
    pub orig_image_ref: Option<String>,
    pub image_ref: Option<String>,
    pub injected_files: Vec<InjectedFile>,
    pub new_pass: Option<String>,
    pub orig_sys_metadata: BTreeMap<String, String>,
    pub block_device_mappings: Vec<BlockDeviceMapping>,
    pub recreate: bool,
    pub on_shared_storage: bool,
    pub preserve_ephemeral: bool,
    pub host: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnshelveInstance {
    pub instance: Instance,
    pub image: Option<ImageMeta>,
    pub filter_properties: FilterProperties,
    pub node: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartInstance {
    pub instance: Instance,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrepResize {
    pub instance: Instance,
    pub image: Option<ImageMeta>,
    pub instance_type: Flavor,
    /// Quota reservations, passed through untouched.
    pub reservations: Vec<String>,
    pub request_spec: RequestSpec,
    pub filter_properties: FilterProperties,
    pub node: String,
    pub clean_shutdown: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckCanLiveMigrateDestination {
    pub instance: Instance,
    pub block_migration: bool,
    pub disk_over_commit: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveMigration {
    pub instance: Instance,
    pub dest: String,
    pub block_migration: bool,
    pub migration_id: MigrationId,
    pub migrate_data: Option<serde_json::Value>,
}

/// Every operation the conductor can ask a compute agent to perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "args", rename_all = "snake_case")]
pub enum ComputeOperation {
    BuildAndRunInstance(BuildAndRunInstance),
    RebuildInstance(RebuildInstance),
    UnshelveInstance(UnshelveInstance),
    StartInstance(StartInstance),
    PrepResize(PrepResize),
    CheckCanLiveMigrateDestination(CheckCanLiveMigrateDestination),
    LiveMigration(LiveMigration),
}

impl ComputeOperation {
    pub const BUILD_AND_RUN_INSTANCE: &'static str = "build_and_run_instance";
    pub const REBUILD_INSTANCE: &'static str = "rebuild_instance";
    pub const UNSHELVE_INSTANCE: &'static str = "unshelve_instance";
    pub const START_INSTANCE: &'static str = "start_instance";
    pub const PREP_RESIZE: &'static str = "prep_resize";
    pub const CHECK_CAN_LIVE_MIGRATE_DESTINATION: &'static str =
        "check_can_live_migrate_destination";
    pub const LIVE_MIGRATION: &'static str = "live_migration";

    /// Method name on the agent.
    pub fn name(&self) -> &'static str {
        match self {
            ComputeOperation::BuildAndRunInstance(_) => Self::BUILD_AND_RUN_INSTANCE,
            ComputeOperation::RebuildInstance(_) => Self::REBUILD_INSTANCE,
            ComputeOperation::UnshelveInstance(_) => Self::UNSHELVE_INSTANCE,
            ComputeOperation::StartInstance(_) => Self::START_INSTANCE,
            ComputeOperation::PrepResize(_) => Self::PREP_RESIZE,
            ComputeOperation::CheckCanLiveMigrateDestination(_) => {
                Self::CHECK_CAN_LIVE_MIGRATE_DESTINATION
            }
            ComputeOperation::LiveMigration(_) => Self::LIVE_MIGRATION,
        }
    }

    /// Whether the conductor waits for this operation's reply.
    pub fn is_call(&self) -> bool {
        matches!(self, ComputeOperation::CheckCanLiveMigrateDestination(_))
    }

    pub fn instance(&self) -> &Instance {
        match self {
            ComputeOperation::BuildAndRunInstance(op) => &op.instance,
            ComputeOperation::RebuildInstance(op) => &op.instance,
            ComputeOperation::UnshelveInstance(op) => &op.instance,
            ComputeOperation::StartInstance(op) => &op.instance,
            ComputeOperation::PrepResize(op) => &op.instance,
            ComputeOperation::CheckCanLiveMigrateDestination(op) => &op.instance,
            ComputeOperation::LiveMigration(op) => &op.instance,
        }
    }

    pub fn instance_uuid(&self) -> InstanceId {
        self.instance().uuid
    }
}

/// Agent reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", content = "data", rename_all = "snake_case")]
pub enum ComputeReply {
    /// Operation accepted; completion is reported out of band.
    Accepted,
    /// Result of a live-migration destination check.
    MigrateData(serde_json::Value),
}

/// Compute agent transport and remote failures.
#[derive(Debug, Clone, Error)]
pub enum ComputeRpcError {
    #[error("compute agent on {host} is unreachable: {message}")]
    Unreachable { host: String, message: String },

    #[error("{operation} on {host} timed out after {timeout:?}")]
    Timeout {
        host: String,
        operation: &'static str,
        timeout: Duration,
    },

    /// A failure from the closed set of remote pre-check failures.
    #[error("{host} rejected the request: {failure}")]
    PreCheck { host: String, failure: PreCheckError },

    #[error("{operation} on {host} failed: {message}")]
    Remote {
        host: String,
        operation: String,
        message: String,
    },

    #[error("unexpected reply to {operation} from {host}")]
    UnexpectedReply { host: String, operation: &'static str },
}

impl ComputeRpcError {
    /// Splits out failures that belong to the pre-check family: remote
    /// pre-check rejections and timed out synchronous calls.
    pub fn into_precheck(self) -> Result<PreCheckError, Self> {
        match self {
            ComputeRpcError::PreCheck { failure, .. } => Ok(failure),
            ComputeRpcError::Timeout { host, timeout, .. } => {
                Ok(PreCheckError::Timeout { host, timeout })
            }
            other => Err(other),
        }
    }
}

/// Transport to compute agents.
#[async_trait]
pub trait ComputeRpc: Send + Sync {
    async fn dispatch(
        &self,
        host: &str,
        operation: ComputeOperation,
    ) -> Result<ComputeReply, ComputeRpcError>;
}

/// Typed compute agent API.
///
/// Casts return once the agent has accepted the operation; calls wait for
/// the reply, bounded by `call_timeout`.
#[derive(Clone)]
pub struct ComputeAgentClient {
    rpc: Arc<dyn ComputeRpc>,
    call_timeout: Duration,
}

impl ComputeAgentClient {
    pub fn new(rpc: Arc<dyn ComputeRpc>, call_timeout: Duration) -> Self {
        Self { rpc, call_timeout }
    }

    async fn cast(&self, host: &str, operation: ComputeOperation) -> Result<(), ComputeRpcError> {
        debug!(host, method = operation.name(), instance_id = %operation.instance_uuid(), "Casting to compute");
        self.rpc.dispatch(host, operation).await.map(|_| ())
    }

    async fn call(
        &self,
        host: &str,
        operation: ComputeOperation,
    ) -> Result<ComputeReply, ComputeRpcError> {
        let name = operation.name();
        debug!(host, method = name, instance_id = %operation.instance_uuid(), "Calling compute");
        tokio::time::timeout(self.call_timeout, self.rpc.dispatch(host, operation))
            .await
            .map_err(|_| ComputeRpcError::Timeout {
                host: host.to_string(),
                operation: name,
                timeout: self.call_timeout,
            })?
    }

    pub async fn build_and_run_instance(
        &self,
        host: &str,
        request: BuildAndRunInstance,
    ) -> Result<(), ComputeRpcError> {
        self.cast(host, ComputeOperation::BuildAndRunInstance(request))
            .await
    }

    pub async fn rebuild_instance(
        &self,
        host: &str,
        request: RebuildInstance,
    ) -> Result<(), ComputeRpcError> {
        self.cast(host, ComputeOperation::RebuildInstance(request))
            .await
    }

    pub async fn unshelve_instance(
        &self,
        host: &str,
        request: UnshelveInstance,
    ) -> Result<(), ComputeRpcError> {
        self.cast(host, ComputeOperation::UnshelveInstance(request))
            .await
    }

    pub async fn start_instance(&self, host: &str, instance: Instance) -> Result<(), ComputeRpcError> {
        self.cast(host, ComputeOperation::StartInstance(StartInstance { instance }))
            .await
    }

    pub async fn prep_resize(&self, host: &str, request: PrepResize) -> Result<(), ComputeRpcError> {
        self.cast(host, ComputeOperation::PrepResize(request)).await
    }

    /// Synchronous destination check; returns the agent's migrate data.
    pub async fn check_can_live_migrate_destination(
        &self,
        dest: &str,
        request: CheckCanLiveMigrateDestination,
    ) -> Result<serde_json::Value, ComputeRpcError> {
        match self
            .call(dest, ComputeOperation::CheckCanLiveMigrateDestination(request))
            .await?
        {
            ComputeReply::MigrateData(data) => Ok(data),
            ComputeReply::Accepted => Err(ComputeRpcError::UnexpectedReply {
                host: dest.to_string(),
                operation: ComputeOperation::CHECK_CAN_LIVE_MIGRATE_DESTINATION,
            }),
        }
    }

    /// Starts the live migration on the source host.
    pub async fn live_migration(
        &self,
        source: &str,
        request: LiveMigration,
    ) -> Result<(), ComputeRpcError> {
        self.cast(source, ComputeOperation::LiveMigration(request))
            .await
    }
}
