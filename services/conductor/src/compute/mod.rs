//! Compute agent RPC.
//!
//! The set of remote operations is closed: [`ComputeOperation`] enumerates
//! them and every transport dispatches on it with a `match`.

mod http;
mod recording;
mod rpc;

pub use http::HttpComputeRpc;
pub use recording::{RecordedCall, RecordingComputeRpc};
pub use rpc::{
    BuildAndRunInstance, CheckCanLiveMigrateDestination, ComputeAgentClient, ComputeOperation,
    ComputeReply, ComputeRpc, ComputeRpcError, InjectedFile, LiveMigration, PrepResize,
    RebuildInstance, RequestedNetwork, StartInstance, UnshelveInstance,
};
