use std::collections::BTreeSet;
use std::sync::Arc;

use cirrus_id::InstanceId;
use tracing::{debug, warn};

use super::SchedulerClient;
use crate::config::SchedulerConfig;
use crate::db::InstanceStore;
use crate::error::ConductorError;
use crate::model::{
    FilterProperties, GroupInfo, HostCandidate, RequestSpec, RetryContext, TriedHost,
};

/// Scheduler hint naming an instance group by id or name.
pub const GROUP_HINT: &str = "group";

/// Placement front end used by every orchestration task.
#[derive(Clone)]
pub struct HostSelector {
    client: Arc<dyn SchedulerClient>,
    instances: Arc<dyn InstanceStore>,
    config: SchedulerConfig,
}

impl HostSelector {
    pub fn new(
        client: Arc<dyn SchedulerClient>,
        instances: Arc<dyn InstanceStore>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            client,
            instances,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Records another scheduling attempt for `instance_uuid`.
    ///
    /// Retry state belongs to one instance: a context left over from a
    /// different instance is replaced. Does nothing when retries are
    /// disabled (`max_attempts == 1`).
    pub fn populate_retry(
        &self,
        filter: &mut FilterProperties,
        instance_uuid: InstanceId,
    ) -> Result<(), ConductorError> {
        let max_attempts = self.config.max_attempts;
        if max_attempts <= 1 {
            return Ok(());
        }

        let retry = match filter.retry.take() {
            Some(mut retry) if retry.instance_uuid == instance_uuid => {
                retry.num_attempts += 1;
                retry
            }
            _ => RetryContext {
                instance_uuid,
                num_attempts: 1,
                hosts: Vec::new(),
            },
        };

        let attempts = retry.num_attempts;
        filter.retry = Some(retry);

        if attempts > max_attempts {
            return Err(ConductorError::no_valid_host(format!(
                "Exceeded maximum number of retries. Exceeded max scheduling attempts \
                 {max_attempts} for instance {instance_uuid}"
            )));
        }
        Ok(())
    }

    /// Annotates `filter` with the chosen candidate: the host joins the
    /// retry history and its limits are recorded.
    pub fn populate_filter_properties(filter: &mut FilterProperties, candidate: &HostCandidate) {
        if let Some(retry) = filter.retry.as_mut() {
            retry.hosts.push(TriedHost {
                host: candidate.host.clone(),
                node: candidate.nodename.clone(),
            });
        }
        filter.limits = Some(candidate.limits.clone());
    }

    /// Resolves the `group` scheduler hint into `filter.group`.
    pub async fn setup_instance_group(
        &self,
        filter: &mut FilterProperties,
    ) -> Result<(), ConductorError> {
        let Some(hint) = filter.scheduler_hints.get(GROUP_HINT) else {
            return Ok(());
        };
        let name = match hint {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };

        let group = self
            .instances
            .instance_group(&name)
            .await?
            .ok_or_else(|| ConductorError::GroupNotFound(name.clone()))?;

        if let Some(policy) = group
            .policies
            .iter()
            .find(|p| !self.config.supported_group_policies.contains(*p))
        {
            return Err(ConductorError::UnsupportedPolicy {
                reason: format!("ServerGroup policy '{policy}' is not supported"),
            });
        }

        let mut hosts = BTreeSet::new();
        for member in &group.members {
            match self.instances.get_instance(*member).await {
                Ok(instance) => hosts.extend(instance.host),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            }
        }

        debug!(group = %group.name, members = group.members.len(), hosts = hosts.len(), "Resolved instance group");
        filter.group = Some(GroupInfo {
            group_id: group.id,
            policies: group.policies,
            hosts,
        });
        Ok(())
    }

    /// Asks the placement service for `spec.num_instances` hosts.
    ///
    /// Candidates on excluded hosts are discarded; fewer usable candidates
    /// than instances is `NoValidHost`.
    pub async fn select_destinations(
        &self,
        spec: &RequestSpec,
        filter: &FilterProperties,
    ) -> Result<Vec<HostCandidate>, ConductorError> {
        let wanted = spec.num_instances;
        debug!(
            instance_id = %spec.instance_properties.uuid,
            num_instances = wanted,
            ignore_hosts = ?filter.ignore_hosts,
            "Selecting destinations"
        );

        let candidates = self.client.select_destinations(spec, filter).await?;

        let excluded = filter.excluded_hosts();
        let (usable, rejected): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .partition(|c| !excluded.contains(&c.host));
        if !rejected.is_empty() {
            warn!(
                hosts = ?rejected.iter().map(|c| c.host.as_str()).collect::<Vec<_>>(),
                "Placement returned excluded hosts, discarding them"
            );
        }

        if usable.len() < wanted {
            return Err(ConductorError::no_valid_host(format!(
                "Requested {wanted} hosts, placement returned {}",
                usable.len()
            )));
        }

        Ok(usable.into_iter().take(wanted).collect())
    }
}
