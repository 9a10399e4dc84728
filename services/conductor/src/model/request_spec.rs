//! Placement request types: what is being placed and under which
//! constraints.

use std::collections::{BTreeMap, BTreeSet};

use cirrus_id::{InstanceGroupId, InstanceId};
use serde::{Deserialize, Serialize};

use super::instance::{Flavor, ImageMeta, Instance, VmState};

/// Properties of the instance being placed, copied from the first instance
/// of the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceProperties {
    pub uuid: InstanceId,
    pub vm_state: Option<VmState>,
    pub host: Option<String>,
    pub node: Option<String>,
    pub project_id: Option<String>,
    pub memory_mb: u64,
    pub vcpus: u32,
    pub root_gb: u64,
    pub ephemeral_gb: u64,
}

/// Description of one placement request.
///
/// Built fresh for each scheduling attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSpec {
    pub image: Option<ImageMeta>,
    pub instance_properties: InstanceProperties,
    pub instance_type: Flavor,
    pub instance_uuids: Vec<InstanceId>,
    pub num_instances: usize,
}

impl RequestSpec {
    /// Builds a spec placing `instances` with `flavor`, falling back to the
    /// first instance's own flavor.
    ///
    /// Returns `None` when `instances` is empty.
    pub fn build(
        image: Option<ImageMeta>,
        instances: &[Instance],
        flavor: Option<&Flavor>,
    ) -> Option<Self> {
        let first = instances.first()?;
        let mut spec = Self::for_instance(image, first, flavor);
        spec.instance_uuids = instances.iter().map(|i| i.uuid).collect();
        spec.num_instances = instances.len();
        Some(spec)
    }

    /// Spec placing a single instance.
    pub fn for_instance(image: Option<ImageMeta>, instance: &Instance, flavor: Option<&Flavor>) -> Self {
        let instance_type = flavor.unwrap_or(&instance.flavor).clone();

        Self {
            image,
            instance_properties: InstanceProperties {
                uuid: instance.uuid,
                vm_state: instance.vm_state,
                host: instance.host.clone(),
                node: instance.node.clone(),
                project_id: instance.project_id.clone(),
                memory_mb: instance_type.memory_mb,
                vcpus: instance_type.vcpus,
                root_gb: instance_type.root_gb,
                ephemeral_gb: instance_type.ephemeral_gb,
            },
            instance_type,
            instance_uuids: vec![instance.uuid],
            num_instances: 1,
        }
    }

    /// JSON snapshot used in notifications.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// A host already tried by earlier scheduling attempts.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TriedHost {
    pub host: String,
    pub node: String,
}

/// Scheduling attempts made so far for one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryContext {
    pub instance_uuid: InstanceId,
    pub num_attempts: u32,
    #[serde(default)]
    pub hosts: Vec<TriedHost>,
}

/// Resolved instance group constraints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub group_id: InstanceGroupId,
    pub policies: Vec<String>,
    /// Hosts already running members of the group.
    #[serde(default)]
    pub hosts: BTreeSet<String>,
}

impl GroupInfo {
    pub fn has_policy(&self, policy: &str) -> bool {
        self.policies.iter().any(|p| p == policy)
    }
}

/// Resource headroom a placement decision assumed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vcpus: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_gb: Option<u64>,
}

/// Request-scoped scheduling constraints.
///
/// Passed by value into each scheduling attempt; `Clone` is a deep copy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FilterProperties {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub ignore_hosts: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub force_hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub force_nodes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_type: Option<Flavor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceLimits>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scheduler_hints: BTreeMap<String, serde_json::Value>,
}

impl FilterProperties {
    /// Properties that only exclude `hosts`.
    pub fn ignoring<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ignore_hosts: hosts.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Every host a candidate must not be placed on: the ignore list plus
    /// hosts already tried by earlier attempts.
    pub fn excluded_hosts(&self) -> BTreeSet<String> {
        let mut excluded = self.ignore_hosts.clone();
        if let Some(retry) = &self.retry {
            excluded.extend(retry.hosts.iter().map(|h| h.host.clone()));
        }
        excluded
    }
}

/// One placement result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCandidate {
    pub host: String,
    pub nodename: String,
    #[serde(default)]
    pub limits: ResourceLimits,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures;

    #[test]
    fn test_build_uses_target_flavor() {
        let instance = fixtures::instance("compute-1");
        let target = fixtures::flavor(7);
        let spec = RequestSpec::build(None, std::slice::from_ref(&instance), Some(&target))
            .unwrap();

        assert_eq!(spec.instance_type.id, 7);
        assert_eq!(spec.instance_properties.uuid, instance.uuid);
        assert_eq!(spec.num_instances, 1);
    }

    #[test]
    fn test_build_defaults_to_instance_flavor() {
        let instances = vec![fixtures::instance("a"), fixtures::instance("b")];
        let spec = RequestSpec::build(None, &instances, None).unwrap();

        assert_eq!(spec.instance_type, instances[0].flavor);
        assert_eq!(spec.instance_uuids.len(), 2);
        assert_eq!(spec.num_instances, 2);
    }

    #[test]
    fn test_build_empty_is_none() {
        assert!(RequestSpec::build(None, &[], None).is_none());
    }

    #[test]
    fn test_excluded_hosts_merges_retry_hosts() {
        let mut props = FilterProperties::ignoring(["a"]);
        props.retry = Some(RetryContext {
            instance_uuid: InstanceId::new(),
            num_attempts: 2,
            hosts: vec![TriedHost {
                host: "b".into(),
                node: "b".into(),
            }],
        });

        let excluded = props.excluded_hosts();
        assert!(excluded.contains("a"));
        assert!(excluded.contains("b"));
        assert_eq!(excluded.len(), 2);
    }

    #[test]
    fn test_clone_is_independent() {
        let original = FilterProperties::ignoring(["a"]);
        let mut copy = original.clone();
        copy.ignore_hosts.insert("b".into());
        copy.limits = Some(ResourceLimits::default());

        assert_eq!(original.ignore_hosts.len(), 1);
        assert!(original.limits.is_none());
    }
}
