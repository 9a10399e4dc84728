//! Request decoding at the boundary.
//!
//! Callers may send an instance as a full object or just its uuid, and a
//! flavor as a full object or `{ "id": n }`. Everything is resolved here,
//! once, into the canonical request types the coordinator works with.
//! Canonical input passes through untouched and costs no lookups.

use std::collections::BTreeMap;

use cirrus_id::InstanceId;
use serde::{Deserialize, Serialize};

use crate::compute::{InjectedFile, RequestedNetwork};
use crate::db::{FlavorStore, InstanceStore};
use crate::error::ConductorError;
use crate::model::{BlockDeviceMapping, FilterProperties, Flavor, ImageMeta, Instance};

/// An instance given in full or by reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstanceRef {
    Full(Box<Instance>),
    Uuid(InstanceId),
    Partial { uuid: InstanceId },
}

impl InstanceRef {
    pub async fn resolve(self, store: &dyn InstanceStore) -> Result<Instance, ConductorError> {
        match self {
            InstanceRef::Full(instance) => Ok(*instance),
            InstanceRef::Uuid(uuid) | InstanceRef::Partial { uuid } => {
                Ok(store.get_instance(uuid).await?)
            }
        }
    }
}

impl From<Instance> for InstanceRef {
    fn from(instance: Instance) -> Self {
        InstanceRef::Full(Box::new(instance))
    }
}

/// A flavor given in full or by database id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlavorRef {
    Full(Flavor),
    ById { id: i64 },
}

impl FlavorRef {
    pub async fn resolve(self, store: &dyn FlavorStore) -> Result<Flavor, ConductorError> {
        match self {
            FlavorRef::Full(flavor) => Ok(flavor),
            FlavorRef::ById { id } => Ok(store.flavor_by_id(id).await?),
        }
    }
}

impl From<Flavor> for FlavorRef {
    fn from(flavor: Flavor) -> Self {
        FlavorRef::Full(flavor)
    }
}

/// A requested network as an object or a `[network_id, fixed_ip, port_id]`
/// tuple (the port may be omitted).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestedNetworkRef {
    Triple(Option<String>, Option<String>, Option<String>),
    Pair(Option<String>, Option<String>),
    Canonical(RequestedNetwork),
}

impl From<RequestedNetworkRef> for RequestedNetwork {
    fn from(value: RequestedNetworkRef) -> Self {
        match value {
            RequestedNetworkRef::Triple(network_id, fixed_ip, port_id) => RequestedNetwork {
                network_id,
                fixed_ip,
                port_id,
            },
            RequestedNetworkRef::Pair(network_id, fixed_ip) => RequestedNetwork {
                network_id,
                fixed_ip,
                port_id: None,
            },
            RequestedNetworkRef::Canonical(network) => network,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Scheduling input of a migration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerHint {
    /// Requested live-migration destination.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub filter_properties: FilterProperties,
}

/// Canonical `migrate_server` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrateServer {
    pub instance: Instance,
    pub scheduler_hint: SchedulerHint,
    pub live: bool,
    pub rebuild: bool,
    pub flavor: Option<Flavor>,
    pub block_migration: bool,
    pub disk_over_commit: bool,
    pub reservations: Vec<String>,
    pub clean_shutdown: bool,
}

/// `migrate_server` as received.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateServerBody {
    pub instance: InstanceRef,
    #[serde(default)]
    pub scheduler_hint: SchedulerHint,
    #[serde(default)]
    pub live: bool,
    #[serde(default)]
    pub rebuild: bool,
    #[serde(default)]
    pub flavor: Option<FlavorRef>,
    #[serde(default)]
    pub block_migration: bool,
    #[serde(default)]
    pub disk_over_commit: bool,
    #[serde(default)]
    pub reservations: Vec<String>,
    #[serde(default = "default_true")]
    pub clean_shutdown: bool,
}

impl MigrateServerBody {
    pub async fn normalize(
        self,
        instances: &dyn InstanceStore,
        flavors: &dyn FlavorStore,
    ) -> Result<MigrateServer, ConductorError> {
        let instance = self.instance.resolve(instances).await?;
        let flavor = match self.flavor {
            Some(flavor) => Some(flavor.resolve(flavors).await?),
            None => None,
        };
        Ok(MigrateServer {
            instance,
            scheduler_hint: self.scheduler_hint,
            live: self.live,
            rebuild: self.rebuild,
            flavor,
            block_migration: self.block_migration,
            disk_over_commit: self.disk_over_commit,
            reservations: self.reservations,
            clean_shutdown: self.clean_shutdown,
        })
    }
}

impl From<MigrateServer> for MigrateServerBody {
    fn from(request: MigrateServer) -> Self {
        Self {
            instance: request.instance.into(),
            scheduler_hint: request.scheduler_hint,
            live: request.live,
            rebuild: request.rebuild,
            flavor: request.flavor.map(FlavorRef::from),
            block_migration: request.block_migration,
            disk_over_commit: request.disk_over_commit,
            reservations: request.reservations,
            clean_shutdown: request.clean_shutdown,
        }
    }
}

/// Canonical `build_instances` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildInstances {
    pub instances: Vec<Instance>,
    pub image: Option<ImageMeta>,
    pub filter_properties: FilterProperties,
    pub admin_password: Option<String>,
    pub injected_files: Vec<InjectedFile>,
    pub requested_networks: Vec<RequestedNetwork>,
    pub security_groups: Vec<String>,
}

/// `build_instances` as received.
///
/// `filter_properties.instance_type` may be a flavor reference, so the
/// properties are kept loose until normalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildInstancesBody {
    pub instances: Vec<InstanceRef>,
    #[serde(default)]
    pub image: Option<ImageMeta>,
    #[serde(default)]
    pub filter_properties: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub admin_password: Option<String>,
    #[serde(default)]
    pub injected_files: Vec<InjectedFile>,
    #[serde(default)]
    pub requested_networks: Vec<RequestedNetworkRef>,
    #[serde(default)]
    pub security_groups: Vec<String>,
}

impl BuildInstancesBody {
    pub async fn normalize(
        self,
        instances: &dyn InstanceStore,
        flavors: &dyn FlavorStore,
    ) -> Result<BuildInstances, ConductorError> {
        let mut resolved = Vec::with_capacity(self.instances.len());
        for instance in self.instances {
            resolved.push(instance.resolve(instances).await?);
        }

        let mut fields = self.filter_properties;
        let flavor = match fields.remove("instance_type") {
            None | Some(serde_json::Value::Null) => None,
            Some(value) => {
                let flavor: FlavorRef = serde_json::from_value(value).map_err(|e| {
                    ConductorError::InvalidRequest(format!("filter_properties.instance_type: {e}"))
                })?;
                Some(flavor.resolve(flavors).await?)
            }
        };
        let mut filter_properties: FilterProperties =
            serde_json::from_value(serde_json::Value::Object(fields))
                .map_err(|e| ConductorError::InvalidRequest(format!("filter_properties: {e}")))?;
        filter_properties.instance_type = flavor;

        Ok(BuildInstances {
            instances: resolved,
            image: self.image,
            filter_properties,
            admin_password: self.admin_password,
            injected_files: self.injected_files,
            requested_networks: self
                .requested_networks
                .into_iter()
                .map(RequestedNetwork::from)
                .collect(),
            security_groups: self.security_groups,
        })
    }
}

/// Canonical `rebuild_instance` request.
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
    /// Target host; chosen by placement when absent.
    pub host: Option<String>,
    /// Hints for placement, such as `group`.
    pub scheduler_hints: BTreeMap<String, serde_json::Value>,
}

/// `rebuild_instance` as received.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildInstanceBody {
    pub instance: InstanceRef,
    #[serde(default)]
    pub orig_image_ref: Option<String>,
    #[serde(default)]
    pub image_ref: Option<String>,
    #[serde(default)]
    pub injected_files: Vec<InjectedFile>,
    #[serde(default)]
    pub new_pass: Option<String>,
    #[serde(default)]
    pub orig_sys_metadata: BTreeMap<String, String>,
    #[serde(default, alias = "bdms")]
    pub block_device_mappings: Vec<BlockDeviceMapping>,
    #[serde(default)]
    pub recreate: bool,
    #[serde(default)]
    pub on_shared_storage: bool,
    #[serde(default)]
    pub preserve_ephemeral: bool,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub scheduler_hints: BTreeMap<String, serde_json::Value>,
}

impl RebuildInstanceBody {
    pub async fn normalize(self, instances: &dyn InstanceStore) -> Result<RebuildInstance, ConductorError> {
        Ok(RebuildInstance {
            instance: self.instance.resolve(instances).await?,
            orig_image_ref: self.orig_image_ref,
            image_ref: self.image_ref,
            injected_files: self.injected_files,
            new_pass: self.new_pass,
            orig_sys_metadata: self.orig_sys_metadata,
            block_device_mappings: self.block_device_mappings,
            recreate: self.recreate,
            on_shared_storage: self.on_shared_storage,
            preserve_ephemeral: self.preserve_ephemeral,
            host: self.host,
            scheduler_hints: self.scheduler_hints,
        })
    }
}

/// `unshelve_instance` as received.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnshelveInstanceBody {
    pub instance: InstanceRef,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::db::MemoryStore;
    use crate::model::fixtures;

    #[test]
    fn test_instance_ref_shapes() {
        let instance = fixtures::instance("a");
        let full: InstanceRef = serde_json::from_value(serde_json::to_value(&instance).unwrap()).unwrap();
        assert_eq!(full, InstanceRef::from(instance.clone()));

        let bare: InstanceRef = serde_json::from_value(json!(instance.uuid.to_string())).unwrap();
        assert_eq!(bare, InstanceRef::Uuid(instance.uuid));

        let partial: InstanceRef =
            serde_json::from_value(json!({"uuid": instance.uuid.to_string(), "vm_state": "active"})).unwrap();
        assert_eq!(partial, InstanceRef::Partial { uuid: instance.uuid });
    }

    #[test]
    fn test_requested_network_tuples() {
        let nets: Vec<RequestedNetworkRef> = serde_json::from_value(json!([
            ["net-1", "10.0.0.5", null],
            ["net-2", null],
            {"port_id": "p-1"}
        ]))
        .unwrap();
        let nets: Vec<RequestedNetwork> = nets.into_iter().map(Into::into).collect();

        assert_eq!(nets[0].network_id.as_deref(), Some("net-1"));
        assert_eq!(nets[0].fixed_ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(nets[1].network_id.as_deref(), Some("net-2"));
        assert!(nets[1].port_id.is_none());
        assert_eq!(nets[2].port_id.as_deref(), Some("p-1"));
    }

    #[tokio::test]
    async fn test_flavor_by_id_is_looked_up() {
        let store = MemoryStore::new();
        store.insert_flavor(fixtures::flavor(7));
        let flavor: FlavorRef = serde_json::from_value(json!({"id": 7})).unwrap();

        let resolved = flavor.resolve(&store).await.unwrap();
        assert_eq!(resolved, fixtures::flavor(7));
        assert_eq!(store.flavor_lookups(), 1);
    }

    #[tokio::test]
    async fn test_build_body_resolves_instance_type() {
        let store = MemoryStore::new();
        store.insert_flavor(fixtures::flavor(7));
        let instance = fixtures::instance("a");
        store.insert_instance(instance.clone());

        let body: BuildInstancesBody = serde_json::from_value(json!({
            "instances": [instance.uuid.to_string()],
            "filter_properties": {"instance_type": {"id": 7}, "ignore_hosts": ["b"]},
            "requested_networks": [["net-1", null, null]],
        }))
        .unwrap();
        let request = body.normalize(&store, &store).await.unwrap();

        assert_eq!(request.instances, vec![instance]);
        assert_eq!(request.filter_properties.instance_type, Some(fixtures::flavor(7)));
        assert!(request.filter_properties.ignore_hosts.contains("b"));
        assert_eq!(request.requested_networks.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_filter_properties_are_invalid() {
        let store = MemoryStore::new();
        let body: BuildInstancesBody = serde_json::from_value(json!({
            "instances": [],
            "filter_properties": {"ignore_hosts": 5},
        }))
        .unwrap();
        let err = body.normalize(&store, &store).await.unwrap_err();
        assert!(matches!(err, ConductorError::InvalidRequest(_)));
    }
}
