//! Migration tasks.
//!
//! A task owns one orchestration attempt for one instance: it schedules,
//! drives the compute agents, and on failure puts the instance (and the
//! migration record, for live migration) into a consistent state before
//! returning the error.

mod cold_migrate;
mod live_migrate;

pub use cold_migrate::{ColdMigrationPhase, ColdMigrationTask};
pub use live_migrate::LiveMigrationTask;

use std::sync::Arc;

use crate::compute::ComputeAgentClient;
use crate::config::MigrationConfig;
use crate::db::{FlavorStore, InstanceStore, MigrationStore};
use crate::hosts::HostRegistry;
use crate::images::ImageService;
use crate::notifier::InstanceStateNotifier;
use crate::scheduler::HostSelector;

/// Method name reported when a migration fails.
pub(crate) const MIGRATE_SERVER: &str = "migrate_server";

/// Everything an orchestration task talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub instances: Arc<dyn InstanceStore>,
    pub migrations: Arc<dyn MigrationStore>,
    pub flavors: Arc<dyn FlavorStore>,
    pub images: Arc<dyn ImageService>,
    pub hosts: Arc<dyn HostRegistry>,
    pub selector: HostSelector,
    pub compute: ComputeAgentClient,
    pub notifier: InstanceStateNotifier,
    pub migration: MigrationConfig,
}
