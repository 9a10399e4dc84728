//! Cold migration and resize.

use tracing::{error, info, instrument, warn};

use super::{Collaborators, MIGRATE_SERVER};
use crate::compute::PrepResize;
use crate::db::InstanceUpdate;
use crate::error::{ConductorError, ErrorKind};
use crate::model::{FilterProperties, Flavor, Instance, RequestSpec};
use crate::scheduler::HostSelector;

/// Progress of a [`ColdMigrationTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColdMigrationPhase {
    Built,
    Scheduled,
    Dispatched,
    Done,
    Failed,
}

/// Moves an instance to a new host, optionally with a new flavor.
///
/// The destination is asked to `prep_resize`; the rest of the resize is
/// driven by the compute agents.
pub struct ColdMigrationTask<'a> {
    services: &'a Collaborators,
    instance: Instance,
    flavor: Flavor,
    filter_properties: FilterProperties,
    request_spec: RequestSpec,
    reservations: Vec<String>,
    clean_shutdown: bool,
    phase: ColdMigrationPhase,
}

impl<'a> ColdMigrationTask<'a> {
    pub fn new(
        services: &'a Collaborators,
        instance: Instance,
        flavor: Flavor,
        filter_properties: FilterProperties,
        reservations: Vec<String>,
        clean_shutdown: bool,
    ) -> Self {
        let image = instance.image_from_system_metadata();
        let request_spec = RequestSpec::for_instance(image, &instance, Some(&flavor));
        Self {
            services,
            instance,
            flavor,
            filter_properties,
            request_spec,
            reservations,
            clean_shutdown,
            phase: ColdMigrationPhase::Built,
        }
    }

    pub fn phase(&self) -> ColdMigrationPhase {
        self.phase
    }

    pub fn request_spec(&self) -> &RequestSpec {
        &self.request_spec
    }

    /// True when the target flavor differs from the current one.
    pub fn is_resize(&self) -> bool {
        self.flavor.id != self.instance.flavor.id
    }

    #[instrument(skip(self), fields(instance_id = %self.instance.uuid, flavor_id = self.flavor.id))]
    pub async fn execute(&mut self) -> Result<(), ConductorError> {
        match self.schedule_and_dispatch().await {
            Ok(()) => {
                self.phase = ColdMigrationPhase::Done;
                Ok(())
            }
            Err(err) => {
                self.phase = ColdMigrationPhase::Failed;
                Err(self.roll_back(err).await)
            }
        }
    }

    async fn schedule_and_dispatch(&mut self) -> Result<(), ConductorError> {
        let selector = &self.services.selector;
        selector
            .setup_instance_group(&mut self.filter_properties)
            .await?;
        selector.populate_retry(&mut self.filter_properties, self.instance.uuid)?;

        let candidate = selector
            .select_destinations(&self.request_spec, &self.filter_properties)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ConductorError::no_valid_host("placement returned no hosts"))?;
        self.phase = ColdMigrationPhase::Scheduled;

        HostSelector::populate_filter_properties(&mut self.filter_properties, &candidate);
        info!(
            instance_id = %self.instance.uuid,
            host = %candidate.host,
            node = %candidate.nodename,
            resize = self.is_resize(),
            "Dispatching prep_resize"
        );

        self.services
            .compute
            .prep_resize(
                &candidate.host,
                PrepResize {
                    instance: self.instance.clone(),
                    image: self.request_spec.image.clone(),
                    instance_type: self.flavor.clone(),
                    reservations: self.reservations.clone(),
                    request_spec: self.request_spec.clone(),
                    filter_properties: self.filter_properties.clone(),
                    node: candidate.nodename.clone(),
                    clean_shutdown: self.clean_shutdown,
                },
            )
            .await?;
        self.phase = ColdMigrationPhase::Dispatched;
        Ok(())
    }

    /// Restores the instance's stable state and returns the error to raise.
    async fn roll_back(&self, err: ConductorError) -> ConductorError {
        if err.kind() != ErrorKind::Placement {
            error!(instance_id = %self.instance.uuid, error = %err, "Cold migration failed");
        }

        let update = InstanceUpdate::new()
            .vm_state(self.instance.stable_vm_state())
            .task_state(None);
        self.services
            .notifier
            .set_vm_state_and_notify(
                self.instance.uuid,
                MIGRATE_SERVER,
                update,
                &err,
                Some(&self.request_spec),
            )
            .await;

        match err {
            ConductorError::NoValidHost { .. } => {
                let reason = if self.is_resize() {
                    "No valid host found for resize"
                } else {
                    "No valid host found for cold migrate"
                };
                warn!(instance_id = %self.instance.uuid, "{reason}");
                ConductorError::no_valid_host(reason)
            }
            other => other,
        }
    }
}
