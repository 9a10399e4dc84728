//! In-process placement over a fixed host inventory.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{SchedulerClient, SchedulerError};
use crate::model::{FilterProperties, Flavor, HostCandidate, RequestSpec, ResourceLimits};

/// Free capacity of one compute host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostState {
    pub host: String,
    pub nodename: String,
    pub free_ram_mb: u64,
    pub free_vcpus: u32,
    pub free_disk_gb: u64,
}

impl HostState {
    pub fn new(host: impl Into<String>, free_ram_mb: u64, free_vcpus: u32, free_disk_gb: u64) -> Self {
        let host = host.into();
        Self {
            nodename: host.clone(),
            host,
            free_ram_mb,
            free_vcpus,
            free_disk_gb,
        }
    }

    fn fits(&self, flavor: &Flavor) -> bool {
        self.free_ram_mb >= flavor.memory_mb
            && self.free_vcpus >= flavor.vcpus
            && self.free_disk_gb >= flavor.root_gb + flavor.ephemeral_gb
    }

    fn claim(&mut self, flavor: &Flavor) {
        self.free_ram_mb -= flavor.memory_mb;
        self.free_vcpus -= flavor.vcpus;
        self.free_disk_gb -= flavor.root_gb + flavor.ephemeral_gb;
    }

    fn limits(&self) -> ResourceLimits {
        ResourceLimits {
            memory_mb: Some(self.free_ram_mb),
            vcpus: Some(self.free_vcpus),
            disk_gb: Some(self.free_disk_gb),
        }
    }
}

/// Capacity scheduler that claims a whole batch under one lock.
///
/// Hosts are ranked by free RAM, then free vCPUs, then name. Every
/// instance of a request is placed against the capacity left by the
/// previous ones; nothing is committed unless all of them fit.
#[derive(Default)]
pub struct InventoryScheduler {
    hosts: Mutex<BTreeMap<String, HostState>>,
}

impl InventoryScheduler {
    pub fn new(hosts: impl IntoIterator<Item = HostState>) -> Self {
        Self {
            hosts: Mutex::new(hosts.into_iter().map(|h| (h.host.clone(), h)).collect()),
        }
    }

    pub fn add_host(&self, host: HostState) {
        self.hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(host.host.clone(), host);
    }

    pub fn host(&self, name: &str) -> Option<HostState> {
        self.hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    fn eligible(
        state: &HostState,
        filter: &FilterProperties,
        excluded: &BTreeSet<String>,
        chosen: &[HostCandidate],
    ) -> bool {
        if excluded.contains(&state.host) {
            return false;
        }
        if !filter.force_hosts.is_empty() && !filter.force_hosts.contains(&state.host) {
            return false;
        }
        if !filter.force_nodes.is_empty() && !filter.force_nodes.contains(&state.nodename) {
            return false;
        }
        if let Some(group) = &filter.group {
            if group.has_policy("anti-affinity")
                && (group.hosts.contains(&state.host) || chosen.iter().any(|c| c.host == state.host))
            {
                return false;
            }
            if group.has_policy("affinity") {
                let pinned = group
                    .hosts
                    .iter()
                    .next()
                    .or_else(|| chosen.first().map(|c| &c.host));
                if pinned.is_some_and(|host| *host != state.host) {
                    return false;
                }
            }
        }
        true
    }
}

#[async_trait]
impl SchedulerClient for InventoryScheduler {
    async fn select_destinations(
        &self,
        spec: &RequestSpec,
        filter: &FilterProperties,
    ) -> Result<Vec<HostCandidate>, SchedulerError> {
        let flavor = &spec.instance_type;
        let excluded = filter.excluded_hosts();

        let mut hosts = self.hosts.lock().unwrap_or_else(PoisonError::into_inner);
        let mut working = hosts.clone();
        let mut chosen: Vec<HostCandidate> = Vec::with_capacity(spec.num_instances);

        for index in 0..spec.num_instances {
            let best = working
                .values()
                .filter(|s| s.fits(flavor) && Self::eligible(s, filter, &excluded, &chosen))
                .max_by(|a, b| {
                    a.free_ram_mb
                        .cmp(&b.free_ram_mb)
                        .then(a.free_vcpus.cmp(&b.free_vcpus))
                        .then(b.host.cmp(&a.host))
                })
                .map(|s| s.host.clone());

            let Some(host) = best else {
                return Err(SchedulerError::NoValidHost {
                    reason: format!(
                        "There are not enough hosts available for instance {} of {}.",
                        index + 1,
                        spec.num_instances
                    ),
                });
            };

            if let Some(state) = working.get_mut(&host) {
                let limits = state.limits();
                state.claim(flavor);
                chosen.push(HostCandidate {
                    host: state.host.clone(),
                    nodename: state.nodename.clone(),
                    limits,
                });
            }
        }

        *hosts = working;
        debug!(
            hosts = ?chosen.iter().map(|c| c.host.as_str()).collect::<Vec<_>>(),
            "Claimed placement batch"
        );
        Ok(chosen)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use cirrus_id::InstanceGroupId;

    use super::*;
    use crate::model::{fixtures, GroupInfo};

    fn spec(count: usize) -> RequestSpec {
        let instances: Vec<_> = (0..count).map(|_| fixtures::instance("src")).collect();
        RequestSpec::build(None, &instances, None).unwrap()
    }

    #[tokio::test]
    async fn test_prefers_most_free_ram() {
        let scheduler = InventoryScheduler::new([
            HostState::new("a", 4096, 8, 100),
            HostState::new("b", 16384, 8, 100),
        ]);
        let hosts = scheduler
            .select_destinations(&spec(1), &FilterProperties::default())
            .await
            .unwrap();
        assert_eq!(hosts[0].host, "b");
        assert_eq!(hosts[0].limits.memory_mb, Some(16384));
        assert_eq!(scheduler.host("b").unwrap().free_ram_mb, 16384 - 2048);
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        // room for exactly two 2 GiB instances
        let scheduler = InventoryScheduler::new([HostState::new("a", 4096, 8, 100)]);
        let err = scheduler
            .select_destinations(&spec(3), &FilterProperties::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::NoValidHost { .. }));
        assert_eq!(scheduler.host("a").unwrap().free_ram_mb, 4096);

        let hosts = scheduler
            .select_destinations(&spec(2), &FilterProperties::default())
            .await
            .unwrap();
        assert_eq!(hosts.len(), 2);
        assert_eq!(scheduler.host("a").unwrap().free_ram_mb, 0);
    }

    #[tokio::test]
    async fn test_force_hosts() {
        let scheduler = InventoryScheduler::new([
            HostState::new("a", 4096, 8, 100),
            HostState::new("b", 16384, 8, 100),
        ]);
        let filter = FilterProperties {
            force_hosts: vec!["a".into()],
            ..Default::default()
        };
        let hosts = scheduler.select_destinations(&spec(1), &filter).await.unwrap();
        assert_eq!(hosts[0].host, "a");
    }

    #[tokio::test]
    async fn test_anti_affinity_spreads_batch() {
        let scheduler = InventoryScheduler::new([
            HostState::new("a", 16384, 8, 100),
            HostState::new("b", 16384, 8, 100),
            HostState::new("c", 16384, 8, 100),
        ]);
        let filter = FilterProperties {
            group: Some(GroupInfo {
                group_id: InstanceGroupId::new(),
                policies: vec!["anti-affinity".into()],
                hosts: BTreeSet::from(["c".to_string()]),
            }),
            ..Default::default()
        };
        let hosts = scheduler.select_destinations(&spec(2), &filter).await.unwrap();
        let names: BTreeSet<_> = hosts.iter().map(|h| h.host.as_str()).collect();
        assert_eq!(names, BTreeSet::from(["a", "b"]));

        let err = scheduler.select_destinations(&spec(3), &filter).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_affinity_packs_batch() {
        let scheduler = InventoryScheduler::new([
            HostState::new("a", 16384, 8, 100),
            HostState::new("b", 8192, 8, 100),
        ]);
        let filter = FilterProperties {
            group: Some(GroupInfo {
                group_id: InstanceGroupId::new(),
                policies: vec!["affinity".into()],
                hosts: BTreeSet::new(),
            }),
            ..Default::default()
        };
        let hosts = scheduler.select_destinations(&spec(3), &filter).await.unwrap();
        assert!(hosts.iter().all(|h| h.host == "a"));
    }
}
