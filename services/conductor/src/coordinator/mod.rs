//! Compute task manager.
//!
//! Entry points for the orchestration operations. Each takes a canonical
//! request (see [`normalize`]) and either returns once its side effects are
//! applied, or returns a [`ConductorError`] after the instance and
//! migration state have been made consistent.

pub mod normalize;

pub use normalize::{
    BuildInstances, BuildInstancesBody, FlavorRef, InstanceRef, MigrateServer, MigrateServerBody,
    RebuildInstance, RebuildInstanceBody, RequestedNetworkRef, SchedulerHint,
    UnshelveInstanceBody,
};

use cirrus_events::event_types;
use cirrus_id::{InstanceId, MigrationId};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use crate::compute::{self, BuildAndRunInstance, UnshelveInstance};
use crate::context::RequestContext;
use crate::db::InstanceUpdate;
use crate::error::{ConductorError, ErrorKind, PreCheckError};
use crate::images::ImageError;
use crate::model::{
    FilterProperties, HostCandidate, ImageMeta, Instance, MigrationRecord, MigrationStatus,
    RequestSpec, TaskState, VmState,
};
use crate::notifier::events;
use crate::scheduler::HostSelector;
use crate::tasks::{Collaborators, ColdMigrationTask, LiveMigrationTask};

const BUILD_INSTANCES: &str = "build_instances";
const REBUILD_SERVER: &str = "rebuild_server";
const UNSHELVE_INSTANCE: &str = "unshelve_instance";

/// Outcome of a `build_instances` batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BuildSummary {
    /// Instances handed to a compute agent.
    pub dispatched: usize,
    /// Instances deleted while the batch was scheduled.
    pub skipped: usize,
    /// Instances put in ERROR.
    pub failed: usize,
}

/// Dispatches orchestration requests to the migration tasks and compute
/// agents.
#[derive(Clone)]
pub struct ComputeTaskManager {
    services: Collaborators,
}

impl ComputeTaskManager {
    pub fn new(services: Collaborators) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &Collaborators {
        &self.services
    }

    /// Live-migrates, cold-migrates or resizes an instance.
    ///
    /// Only `live && !rebuild && flavor.is_none()` (live migration) and
    /// `!live && !rebuild && flavor.is_some()` (cold migration) are
    /// supported. Returns the migration record id for live migrations.
    #[instrument(skip(self, ctx, request), fields(instance_id = %request.instance.uuid, live = request.live))]
    pub async fn migrate_server(
        &self,
        ctx: &RequestContext,
        request: MigrateServer,
    ) -> Result<Option<MigrationId>, ConductorError> {
        let MigrateServer {
            instance,
            scheduler_hint,
            live,
            rebuild,
            flavor,
            block_migration,
            disk_over_commit,
            reservations,
            clean_shutdown,
        } = request;

        match (live, rebuild, flavor) {
            (true, false, None) => {
                let mut task = LiveMigrationTask::new(
                    &self.services,
                    instance,
                    scheduler_hint.host,
                    scheduler_hint.filter_properties,
                    block_migration,
                    disk_over_commit,
                );
                task.execute().await?;
                Ok(Some(task.migration().id))
            }
            (false, false, Some(flavor)) => {
                let instance_id = instance.uuid;
                let mut task = ColdMigrationTask::new(
                    &self.services,
                    instance,
                    flavor,
                    scheduler_hint.filter_properties,
                    reservations,
                    clean_shutdown,
                );
                self.services
                    .notifier
                    .report(ctx, instance_id, events::COLD_MIGRATE, task.execute())
                    .await?;
                Ok(None)
            }
            (live, rebuild, flavor) => Err(ConductorError::NotImplemented {
                live,
                rebuild,
                flavor: flavor.is_some(),
            }),
        }
    }

    /// Schedules a batch of new instances in one placement request and
    /// starts each on its host.
    ///
    /// Never fails: a placement failure puts every instance in ERROR, and
    /// a failure for one instance does not affect the others.
    #[instrument(skip(self, _ctx, request), fields(num_instances = request.instances.len()))]
    pub async fn build_instances(&self, _ctx: &RequestContext, request: BuildInstances) -> BuildSummary {
        let mut summary = BuildSummary::default();
        let BuildInstances {
            instances,
            image,
            mut filter_properties,
            admin_password,
            injected_files,
            requested_networks,
            security_groups,
        } = request;

        let flavor = filter_properties.instance_type.clone();
        let Some(request_spec) = RequestSpec::build(image.clone(), &instances, flavor.as_ref()) else {
            warn!("build_instances called without instances");
            return summary;
        };

        let hosts = match self
            .schedule_batch(&request_spec, &mut filter_properties, &instances)
            .await
        {
            Ok(hosts) => hosts,
            Err(err) => {
                for instance in &instances {
                    self.services
                        .notifier
                        .set_vm_state_and_notify(
                            instance.uuid,
                            BUILD_INSTANCES,
                            InstanceUpdate::new().vm_state(VmState::Error).task_state(None),
                            &err,
                            Some(&request_spec),
                        )
                        .await;
                }
                summary.failed = instances.len();
                return summary;
            }
        };

        for (instance, host) in instances.iter().zip(hosts) {
            let instance = match self.services.instances.get_instance(instance.uuid).await {
                Ok(current) => current,
                Err(e) if e.is_not_found() => {
                    debug!(instance_id = %instance.uuid, "Instance deleted during build");
                    summary.skipped += 1;
                    continue;
                }
                Err(e) => {
                    error!(instance_id = %instance.uuid, error = %e, "Failed to refresh instance");
                    summary.failed += 1;
                    continue;
                }
            };

            let mut local_filter = filter_properties.clone();
            HostSelector::populate_filter_properties(&mut local_filter, &host);

            let dispatched = async {
                let block_device_mappings =
                    self.services.instances.block_device_mappings(instance.uuid).await?;
                self.services
                    .compute
                    .build_and_run_instance(
                        &host.host,
                        BuildAndRunInstance {
                            instance: instance.clone(),
                            image: image.clone(),
                            request_spec: request_spec.clone(),
                            filter_properties: local_filter,
                            admin_password: admin_password.clone(),
                            injected_files: injected_files.clone(),
                            requested_networks: requested_networks.clone(),
                            security_groups: security_groups.clone(),
                            block_device_mappings,
                            node: host.nodename.clone(),
                            limits: host.limits.clone(),
                        },
                    )
                    .await?;
                Ok::<(), ConductorError>(())
            }
            .await;

            match dispatched {
                Ok(()) => summary.dispatched += 1,
                Err(err) => {
                    error!(instance_id = %instance.uuid, host = %host.host, error = %err, "Failed to dispatch build");
                    self.services
                        .notifier
                        .set_vm_state_and_notify(
                            instance.uuid,
                            BUILD_INSTANCES,
                            InstanceUpdate::new().vm_state(VmState::Error).task_state(None),
                            &err,
                            Some(&request_spec),
                        )
                        .await;
                    summary.failed += 1;
                }
            }
        }

        info!(
            dispatched = summary.dispatched,
            skipped = summary.skipped,
            failed = summary.failed,
            "build_instances complete"
        );
        summary
    }

    async fn schedule_batch(
        &self,
        request_spec: &RequestSpec,
        filter_properties: &mut FilterProperties,
        instances: &[Instance],
    ) -> Result<Vec<HostCandidate>, ConductorError> {
        let selector = &self.services.selector;
        selector.setup_instance_group(filter_properties).await?;
        // Retry state follows the first instance; a retried build only
        // ever carries one.
        if let Some(first) = instances.first() {
            selector.populate_retry(filter_properties, first.uuid)?;
        }
        selector
            .select_destinations(request_spec, filter_properties)
            .await
    }

    /// Brings a shelved instance back.
    ///
    /// A `shelved` instance is powered on where it is; a
    /// `shelved_offloaded` one is scheduled and unshelved on the chosen
    /// host. Placement failures clear the task state and are not errors.
    #[instrument(skip(self, ctx, instance), fields(instance_id = %instance.uuid))]
    pub async fn unshelve_instance(
        &self,
        ctx: &RequestContext,
        instance: Instance,
    ) -> Result<(), ConductorError> {
        match instance.vm_state {
            Some(VmState::Shelved) => {
                let host = instance.host.clone().ok_or_else(|| ConductorError::UnshelveFailed {
                    instance: instance.uuid,
                    reason: "shelved instance has no host".to_string(),
                })?;
                let updated = self
                    .services
                    .instances
                    .update_instance(
                        instance.uuid,
                        &InstanceUpdate::new()
                            .task_state(Some(TaskState::PoweringOn))
                            .expect_task_state(Some(TaskState::Unshelving)),
                    )
                    .await?;
                self.services.compute.start_instance(&host, updated).await?;
                Ok(())
            }
            Some(VmState::ShelvedOffloaded) => self.unshelve_offloaded(ctx, instance).await,
            other => {
                error!(
                    instance_id = %instance.uuid,
                    vm_state = ?other,
                    "Unshelve attempted but vm_state not SHELVED or SHELVED_OFFLOADED"
                );
                let err = ConductorError::PreCheck(PreCheckError::InstanceInvalidState {
                    instance: instance.uuid,
                    attr: "vm_state".to_string(),
                    state: other.map_or_else(|| "none".to_string(), |s| s.to_string()),
                    method: "unshelve".to_string(),
                });
                self.services
                    .notifier
                    .set_vm_state_and_notify(
                        instance.uuid,
                        UNSHELVE_INSTANCE,
                        InstanceUpdate::new().vm_state(VmState::Error),
                        &err,
                        None,
                    )
                    .await;
                Err(err)
            }
        }
    }

    async fn unshelve_offloaded(
        &self,
        ctx: &RequestContext,
        instance: Instance,
    ) -> Result<(), ConductorError> {
        let notifier = &self.services.notifier;

        let image = match instance.shelved_image_id() {
            Some(image_id) => Some(
                notifier
                    .report(ctx, instance.uuid, events::GET_IMAGE_INFO, self.shelved_image(&instance, image_id))
                    .await?,
            ),
            None => None,
        };

        let scheduled = notifier
            .report(
                ctx,
                instance.uuid,
                events::SCHEDULE_INSTANCES,
                self.schedule_unshelve(&instance, image),
            )
            .await;

        match scheduled {
            Ok(()) => Ok(()),
            Err(err) => {
                self.clear_task_state(instance.uuid).await;
                if err.kind() == ErrorKind::Placement {
                    warn!(instance_id = %instance.uuid, error = %err, "No valid host found for unshelve instance");
                    Ok(())
                } else {
                    error!(instance_id = %instance.uuid, error = %err, "Unshelve attempted but an error has occurred");
                    Err(err)
                }
            }
        }
    }

    async fn shelved_image(
        &self,
        instance: &Instance,
        image_id: &str,
    ) -> Result<ImageMeta, ConductorError> {
        match self.services.images.get(image_id).await {
            Ok(image) => Ok(image),
            Err(ImageError::NotFound { .. }) => {
                let reason = format!("Unshelve attempted but the image {image_id} cannot be found.");
                error!(instance_id = %instance.uuid, "{reason}");
                if let Err(e) = self
                    .services
                    .instances
                    .update_instance(instance.uuid, &InstanceUpdate::new().vm_state(VmState::Error))
                    .await
                {
                    error!(instance_id = %instance.uuid, error = %e, "Failed to record instance state");
                }
                Err(ConductorError::UnshelveFailed {
                    instance: instance.uuid,
                    reason,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn schedule_unshelve(
        &self,
        instance: &Instance,
        image: Option<ImageMeta>,
    ) -> Result<(), ConductorError> {
        let selector = &self.services.selector;
        let mut filter_properties = FilterProperties::default();
        selector.populate_retry(&mut filter_properties, instance.uuid)?;

        let request_spec = RequestSpec::for_instance(image.clone(), instance, None);
        selector.setup_instance_group(&mut filter_properties).await?;
        let candidate = selector
            .select_destinations(&request_spec, &filter_properties)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ConductorError::no_valid_host("placement returned no hosts"))?;
        HostSelector::populate_filter_properties(&mut filter_properties, &candidate);

        self.services
            .compute
            .unshelve_instance(
                &candidate.host,
                UnshelveInstance {
                    instance: instance.clone(),
                    image,
                    filter_properties,
                    node: candidate.nodename,
                },
            )
            .await?;
        Ok(())
    }

    async fn clear_task_state(&self, instance_id: InstanceId) {
        if let Err(e) = self
            .services
            .instances
            .update_instance(instance_id, &InstanceUpdate::new().task_state(None))
            .await
        {
            error!(instance_id = %instance_id, error = %e, "Failed to clear task state");
        }
    }

    /// Rebuilds an instance, on `request.host` or on a host chosen by
    /// placement away from its current one.
    #[instrument(skip(self, ctx, request), fields(instance_id = %request.instance.uuid))]
    pub async fn rebuild_instance(
        &self,
        ctx: &RequestContext,
        request: RebuildInstance,
    ) -> Result<(), ConductorError> {
        let instance_id = request.instance.uuid;
        self.services
            .notifier
            .report(ctx, instance_id, events::REBUILD_SERVER, self.rebuild(request))
            .await
    }

    async fn rebuild(&self, request: RebuildInstance) -> Result<(), ConductorError> {
        let host = match &request.host {
            Some(host) => host.clone(),
            None => self.schedule_rebuild(&request).await?,
        };

        self.services
            .notifier
            .instance_usage(&request.instance, event_types::REBUILD_SCHEDULED);

        info!(instance_id = %request.instance.uuid, host = %host, recreate = request.recreate, "Dispatching rebuild");
        self.services
            .compute
            .rebuild_instance(
                &host,
                compute::RebuildInstance {
                    instance: request.instance,
                    orig_image_ref: request.orig_image_ref,
                    image_ref: request.image_ref,
                    injected_files: request.injected_files,
                    new_pass: request.new_pass,
                    orig_sys_metadata: request.orig_sys_metadata,
                    block_device_mappings: request.block_device_mappings,
                    recreate: request.recreate,
                    on_shared_storage: request.on_shared_storage,
                    preserve_ephemeral: request.preserve_ephemeral,
                    host: host.clone(),
                },
            )
            .await?;
        Ok(())
    }

    async fn schedule_rebuild(&self, request: &RebuildInstance) -> Result<String, ConductorError> {
        let instance = &request.instance;
        let image = request.image_ref.as_ref().map(|id| ImageMeta {
            id: Some(id.clone()),
            ..Default::default()
        });
        let request_spec = RequestSpec::for_instance(image, instance, None);
        let mut filter_properties = FilterProperties::ignoring(instance.host.clone());
        filter_properties.scheduler_hints = request.scheduler_hints.clone();

        let selected = async {
            let selector = &self.services.selector;
            selector.setup_instance_group(&mut filter_properties).await?;
            selector
                .select_destinations(&request_spec, &filter_properties)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| ConductorError::no_valid_host("placement returned no hosts"))
        }
        .await;

        match selected {
            Ok(candidate) => Ok(candidate.host),
            Err(err) => {
                if err.kind() == ErrorKind::Placement {
                    let mut update = InstanceUpdate::new().task_state(None);
                    if let Some(state) = instance.vm_state {
                        update = update.vm_state(state);
                    }
                    self.services
                        .notifier
                        .set_vm_state_and_notify(instance.uuid, REBUILD_SERVER, update, &err, Some(&request_spec))
                        .await;
                    warn!(instance_id = %instance.uuid, error = %err, "No valid host found for rebuild");
                }
                Err(err)
            }
        }
    }

    /// Applies a progress report for a migration.
    ///
    /// Repeating the current status is accepted and changes nothing.
    #[instrument(skip(self))]
    pub async fn record_migration_progress(
        &self,
        id: MigrationId,
        status: MigrationStatus,
    ) -> Result<MigrationRecord, ConductorError> {
        let mut record = self.services.migrations.get_migration(id).await?;
        if record.transition(status)? {
            self.services.migrations.save_migration(&record).await?;
            info!(migration_id = %id, instance_id = %record.instance_uuid, status = %status, "Migration progressed");
        } else {
            debug!(migration_id = %id, status = %status, "Duplicate migration progress report");
        }
        Ok(record)
    }

    /// Writes whitelisted instance fields.
    #[instrument(skip(self, fields))]
    pub async fn instance_update(
        &self,
        id: InstanceId,
        fields: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Instance, ConductorError> {
        let update = InstanceUpdate::from_fields(fields)
            .map_err(|e| ConductorError::InvalidRequest(e.to_string()))?;
        if update.is_empty() && update.expected_task_state.is_none() {
            return Ok(self.services.instances.get_instance(id).await?);
        }
        Ok(self.services.instances.update_instance(id, &update).await?)
    }
}
