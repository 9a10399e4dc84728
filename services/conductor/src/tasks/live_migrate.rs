//! Live migration.
//!
//! The migration record is persisted in `pre-migrating` before any compute
//! agent is contacted. Failures split in two families:
//!
//! - placement and pre-check failures reset the instance to its state at
//!   call time and mark the record `error`;
//! - anything else puts the instance in ERROR, marks the record `failed`
//!   and surfaces as [`ConductorError::Migration`].

use tracing::{debug, error, info, instrument, warn};

use super::{Collaborators, MIGRATE_SERVER};
use crate::compute::{CheckCanLiveMigrateDestination, LiveMigration};
use crate::db::InstanceUpdate;
use crate::error::{ConductorError, ErrorKind, PreCheckError};
use crate::hosts::ComputeNodeInfo;
use crate::model::{
    FilterProperties, Instance, MigrationRecord, MigrationStatus, PowerState, RequestSpec,
    TaskState, VmState,
};

/// Live-migrates one instance, to a given host or one chosen by placement.
pub struct LiveMigrationTask<'a> {
    services: &'a Collaborators,
    instance: Instance,
    destination: Option<String>,
    filter_properties: FilterProperties,
    block_migration: bool,
    disk_over_commit: bool,
    migration: MigrationRecord,
}

impl<'a> LiveMigrationTask<'a> {
    pub fn new(
        services: &'a Collaborators,
        instance: Instance,
        destination: Option<String>,
        filter_properties: FilterProperties,
        block_migration: bool,
        disk_over_commit: bool,
    ) -> Self {
        let migration = MigrationRecord::live(&instance, destination.as_deref());
        Self {
            services,
            instance,
            destination,
            filter_properties,
            block_migration,
            disk_over_commit,
            migration,
        }
    }

    /// The record tracking this attempt.
    pub fn migration(&self) -> &MigrationRecord {
        &self.migration
    }

    #[instrument(skip(self), fields(instance_id = %self.instance.uuid, migration_id = %self.migration.id))]
    pub async fn execute(&mut self) -> Result<(), ConductorError> {
        self.services
            .migrations
            .create_migration(&self.migration)
            .await?;

        match self.migrate().await {
            Ok(()) => Ok(()),
            Err(err) => Err(self.roll_back(err).await),
        }
    }

    async fn migrate(&mut self) -> Result<(), ConductorError> {
        self.check_instance_is_active()?;
        let source = self.instance.host.clone().ok_or_else(|| {
            PreCheckError::MigrationPreCheck {
                reason: format!("instance {} has no host", self.instance.uuid),
            }
        })?;
        self.check_host_is_up(&source).await?;

        let migrate_data = match self.destination.clone() {
            Some(dest) => self.check_requested_destination(&source, &dest).await?,
            None => self.find_destination(&source).await?,
        };

        self.migration.transition(MigrationStatus::Running)?;
        self.services
            .migrations
            .save_migration(&self.migration)
            .await?;

        let dest = self.migration.dest_compute.clone().unwrap_or_default();
        info!(
            instance_id = %self.instance.uuid,
            source = %source,
            dest = %dest,
            block_migration = self.block_migration,
            "Starting live migration"
        );
        self.services
            .compute
            .live_migration(
                &source,
                LiveMigration {
                    instance: self.instance.clone(),
                    dest,
                    block_migration: self.block_migration,
                    migration_id: self.migration.id,
                    migrate_data: Some(migrate_data),
                },
            )
            .await?;
        Ok(())
    }

    fn check_instance_is_active(&self) -> Result<(), PreCheckError> {
        match self.instance.power_state {
            PowerState::Running | PowerState::Paused => Ok(()),
            other => Err(PreCheckError::InstanceInvalidState {
                instance: self.instance.uuid,
                attr: "power_state".to_string(),
                state: other.to_string(),
                method: "live migrate".to_string(),
            }),
        }
    }

    async fn check_host_is_up(&self, host: &str) -> Result<(), ConductorError> {
        if self.services.hosts.is_up(host).await? {
            Ok(())
        } else {
            Err(PreCheckError::ComputeServiceUnavailable {
                host: host.to_string(),
            }
            .into())
        }
    }

    async fn compute_node(&self, host: &str) -> Result<ComputeNodeInfo, ConductorError> {
        self.services
            .hosts
            .compute_node(host)
            .await?
            .ok_or_else(|| {
                PreCheckError::HypervisorUnavailable {
                    host: host.to_string(),
                }
                .into()
            })
    }

    async fn check_requested_destination(
        &mut self,
        source: &str,
        dest: &str,
    ) -> Result<serde_json::Value, ConductorError> {
        if dest == source {
            return Err(PreCheckError::UnableToMigrateToSelf {
                instance: self.instance.uuid,
                host: dest.to_string(),
            }
            .into());
        }
        self.check_host_is_up(dest).await?;
        self.check_destination_has_enough_memory(dest).await?;
        self.check_compatible_with_source_hypervisor(source, dest)
            .await?;
        self.call_live_migration_checks(dest).await
    }

    async fn check_destination_has_enough_memory(&self, dest: &str) -> Result<(), ConductorError> {
        let node = self.compute_node(dest).await?;
        let needed = self.instance.flavor.memory_mb;
        let available = u64::try_from(node.free_ram_mb).unwrap_or(0);
        if available < needed {
            return Err(PreCheckError::MigrationPreCheck {
                reason: format!(
                    "Unable to migrate {} to {dest}: Lack of memory(host:{available} < instance:{needed})",
                    self.instance.uuid
                ),
            }
            .into());
        }
        Ok(())
    }

    async fn check_compatible_with_source_hypervisor(
        &self,
        source: &str,
        dest: &str,
    ) -> Result<(), ConductorError> {
        let source_node = self.compute_node(source).await?;
        let dest_node = self.compute_node(dest).await?;

        if source_node.hypervisor_type != dest_node.hypervisor_type {
            return Err(PreCheckError::InvalidHypervisorType {
                source_type: source_node.hypervisor_type,
                dest: dest.to_string(),
            }
            .into());
        }
        if source_node.hypervisor_version > dest_node.hypervisor_version {
            return Err(PreCheckError::DestinationHypervisorTooOld {
                dest: dest.to_string(),
                source_version: source_node.hypervisor_version,
                dest_version: dest_node.hypervisor_version,
            }
            .into());
        }
        Ok(())
    }

    async fn call_live_migration_checks(&self, dest: &str) -> Result<serde_json::Value, ConductorError> {
        let data = self
            .services
            .compute
            .check_can_live_migrate_destination(
                dest,
                CheckCanLiveMigrateDestination {
                    instance: self.instance.clone(),
                    block_migration: self.block_migration,
                    disk_over_commit: self.disk_over_commit,
                },
            )
            .await?;
        Ok(data)
    }

    /// Asks placement for hosts until one passes the destination checks.
    ///
    /// Every rejected host joins `ignore_hosts` for the next attempt. The
    /// chosen host is written into the migration record.
    async fn find_destination(&mut self, source: &str) -> Result<serde_json::Value, ConductorError> {
        let image = self.instance.image_from_system_metadata();
        let mut base = self.filter_properties.clone();
        self.services
            .selector
            .setup_instance_group(&mut base)
            .await?;
        let mut attempted = vec![source.to_string()];
        let mut retries: u32 = 0;

        loop {
            let spec = RequestSpec::for_instance(image.clone(), &self.instance, None);
            let mut filter = base.clone();
            filter.ignore_hosts.extend(attempted.iter().cloned());
            let candidate = self
                .services
                .selector
                .select_destinations(&spec, &filter)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| ConductorError::no_valid_host("placement returned no hosts"))?;

            let checked = match self
                .check_compatible_with_source_hypervisor(source, &candidate.host)
                .await
            {
                Ok(()) => self.call_live_migration_checks(&candidate.host).await,
                Err(e) => Err(e),
            };

            match checked {
                Ok(data) => {
                    debug!(host = %candidate.host, node = %candidate.nodename, "Selected live migration destination");
                    self.migration.dest_compute = Some(candidate.host);
                    self.migration.dest_node = Some(candidate.nodename);
                    return Ok(data);
                }
                Err(e) if e.kind() == ErrorKind::PreCheck => {
                    warn!(host = %candidate.host, error = %e, "Skipping live migration destination");
                    attempted.push(candidate.host);
                    retries += 1;
                    if let Some(max) = self.services.migration.max_retries {
                        if retries > max {
                            return Err(ConductorError::no_valid_host(format!(
                                "Exceeded max scheduling retries {max} for instance {} during live migration",
                                self.instance.uuid
                            )));
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Records the failure and returns the error to raise.
    async fn roll_back(&mut self, err: ConductorError) -> ConductorError {
        let spec = RequestSpec::for_instance(None, &self.instance, None);
        let dest = self
            .migration
            .dest_compute
            .clone()
            .unwrap_or_else(|| "(scheduler)".to_string());

        if err.is_expected_live_migration_failure() {
            let mut update = InstanceUpdate::new()
                .task_state(None)
                .expect_task_state(Some(TaskState::Migrating));
            if let Some(state) = self.instance.vm_state {
                update = update.vm_state(state);
            }
            self.services
                .notifier
                .set_vm_state_and_notify(self.instance.uuid, MIGRATE_SERVER, update, &err, Some(&spec))
                .await;
            self.finish(MigrationStatus::Error).await;
            return err;
        }

        error!(
            instance_id = %self.instance.uuid,
            dest = %dest,
            error = %err,
            "Migration of instance {} to host {dest} unexpectedly failed.",
            self.instance.uuid
        );
        let update = InstanceUpdate::new()
            .vm_state(VmState::Error)
            .task_state(self.instance.task_state)
            .expect_task_state(Some(TaskState::Migrating));
        self.services
            .notifier
            .set_vm_state_and_notify(self.instance.uuid, MIGRATE_SERVER, update, &err, Some(&spec))
            .await;
        self.finish(MigrationStatus::Failed).await;

        ConductorError::Migration {
            reason: err.to_string(),
            source: Box::new(err),
        }
    }

    async fn finish(&mut self, status: MigrationStatus) {
        match self.migration.transition(status) {
            Ok(_) => {
                if let Err(e) = self.services.migrations.save_migration(&self.migration).await {
                    error!(migration_id = %self.migration.id, status = %status, error = %e, "Failed to save migration status");
                }
            }
            Err(e) => warn!(error = %e, "Migration status not updated"),
        }
    }
}
