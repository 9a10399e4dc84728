//! Host selection.
//!
//! [`HostSelector`] wraps a placement service ([`SchedulerClient`]) with the
//! request-scoped bookkeeping the orchestration tasks need: retry history,
//! instance group resolution and post-selection annotations.
//!
//! Two placement services ship with the conductor:
//! - [`HttpSchedulerClient`] talks to an external placement service
//! - [`InventoryScheduler`] places against an in-process host inventory

mod client;
mod inventory;
mod selector;

pub use client::HttpSchedulerClient;
pub use inventory::{HostState, InventoryScheduler};
pub use selector::HostSelector;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{FilterProperties, HostCandidate, RequestSpec};

/// Placement service errors.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("No valid host was found. {reason}")]
    NoValidHost { reason: String },

    #[error("placement service unavailable: {0}")]
    Unavailable(String),

    #[error("placement service returned {status}: {message}")]
    Rejected { status: u16, message: String },
}

/// Placement service contract.
///
/// Returns up to `spec.num_instances` candidates, claimed together as one
/// batch. Candidates must respect `filter.excluded_hosts()`.
#[async_trait]
pub trait SchedulerClient: Send + Sync {
    async fn select_destinations(
        &self,
        spec: &RequestSpec,
        filter: &FilterProperties,
    ) -> Result<Vec<HostCandidate>, SchedulerError>;
}
