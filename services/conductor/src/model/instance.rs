//! Instance, flavor and image types as seen by the conductor.
//!
//! The instance record is owned by the compute-management subsystem; the
//! conductor only reads it and conditionally writes `vm_state`,
//! `task_state`, `host` and `node` through
//! [`InstanceStore::update_instance`](crate::db::InstanceStore::update_instance).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use cirrus_id::{InstanceId, InstanceGroupId};
use serde::{Deserialize, Serialize};

/// Key in system metadata holding the image created by shelve offload.
pub const SHELVED_IMAGE_ID_KEY: &str = "shelved_image_id";

/// Prefix of the system metadata keys that cache the boot image.
const IMAGE_META_PREFIX: &str = "image_";

/// Error returned when a state string is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownState {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownState;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownState {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Stable lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Active,
    Building,
    Paused,
    Suspended,
    Stopped,
    Rescued,
    Resized,
    SoftDeleted,
    Deleted,
    Error,
    Shelved,
    ShelvedOffloaded,
}

string_enum!(VmState, "vm_state", {
    Active => "active",
    Building => "building",
    Paused => "paused",
    Suspended => "suspended",
    Stopped => "stopped",
    Rescued => "rescued",
    Resized => "resized",
    SoftDeleted => "soft_deleted",
    Deleted => "deleted",
    Error => "error",
    Shelved => "shelved",
    ShelvedOffloaded => "shelved_offloaded",
});

/// In-flight operation on an instance. At most one is set at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Scheduling,
    Spawning,
    Migrating,
    ResizePrep,
    ResizeMigrating,
    Rebuilding,
    Unshelving,
    PoweringOn,
    Shelving,
}

string_enum!(TaskState, "task_state", {
    Scheduling => "scheduling",
    Spawning => "spawning",
    Migrating => "migrating",
    ResizePrep => "resize_prep",
    ResizeMigrating => "resize_migrating",
    Rebuilding => "rebuilding",
    Unshelving => "unshelving",
    PoweringOn => "powering_on",
    Shelving => "shelving",
});

/// Hypervisor-reported power state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PowerState {
    #[default]
    NoState,
    Running,
    Paused,
    Shutdown,
    Crashed,
    Suspended,
}

string_enum!(PowerState, "power_state", {
    NoState => "no_state",
    Running => "running",
    Paused => "paused",
    Shutdown => "shutdown",
    Crashed => "crashed",
    Suspended => "suspended",
});

/// Resolved flavor (instance type).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flavor {
    /// Database id; compared to tell a migrate from a resize.
    pub id: i64,
    pub flavorid: String,
    pub name: String,
    pub memory_mb: u64,
    pub vcpus: u32,
    pub root_gb: u64,
    #[serde(default)]
    pub ephemeral_gb: u64,
    #[serde(default)]
    pub extra_specs: BTreeMap<String, String>,
}

/// Image metadata as returned by the image service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default)]
    pub min_ram: u64,
    #[serde(default)]
    pub min_disk: u64,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Block device mapping attached to an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDeviceMapping {
    pub source_type: String,
    pub destination_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_index: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(default)]
    pub delete_on_termination: bool,
}

/// Instance group (server group) with its scheduling policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceGroup {
    pub id: InstanceGroupId,
    pub name: String,
    pub policies: Vec<String>,
    pub members: Vec<InstanceId>,
}

/// Snapshot of an instance record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub uuid: InstanceId,
    /// `None` only for rows written before vm_state was tracked.
    #[serde(default)]
    pub vm_state: Option<VmState>,
    #[serde(default)]
    pub task_state: Option<TaskState>,
    #[serde(default)]
    pub power_state: PowerState,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
    pub flavor: Flavor,
    #[serde(default)]
    pub image_ref: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub system_metadata: BTreeMap<String, String>,
}

impl Instance {
    /// vm_state to restore after a failed operation; ACTIVE when unknown.
    pub fn stable_vm_state(&self) -> VmState {
        self.vm_state.unwrap_or(VmState::Active)
    }

    /// Image recorded by a shelve offload, if any.
    pub fn shelved_image_id(&self) -> Option<&str> {
        self.system_metadata
            .get(SHELVED_IMAGE_ID_KEY)
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }

    /// Rebuilds the boot image metadata cached in system metadata.
    ///
    /// `image_min_ram`, `image_min_disk`, `image_name` and `image_status` map
    /// onto the matching fields; every other `image_*` key becomes a
    /// property.
    pub fn image_from_system_metadata(&self) -> Option<ImageMeta> {
        let mut image = ImageMeta {
            id: self.image_ref.clone(),
            ..Default::default()
        };
        let mut found = self.image_ref.is_some();

        for (key, value) in &self.system_metadata {
            let Some(field) = key.strip_prefix(IMAGE_META_PREFIX) else {
                continue;
            };
            found = true;
            match field {
                "min_ram" => image.min_ram = value.parse().unwrap_or(0),
                "min_disk" => image.min_disk = value.parse().unwrap_or(0),
                "name" => image.name = Some(value.clone()),
                "status" => image.status = Some(value.clone()),
                other => {
                    image.properties.insert(other.to_string(), value.clone());
                }
            }
        }

        found.then_some(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flavor(id: i64) -> Flavor {
        Flavor {
            id,
            flavorid: format!("f{id}"),
            name: format!("m1.f{id}"),
            memory_mb: 2048,
            vcpus: 2,
            root_gb: 20,
            ephemeral_gb: 0,
            extra_specs: BTreeMap::new(),
        }
    }

    fn instance() -> Instance {
        Instance {
            uuid: InstanceId::new(),
            vm_state: Some(VmState::Active),
            task_state: None,
            power_state: PowerState::Running,
            host: Some("compute-1".into()),
            node: Some("compute-1".into()),
            flavor: flavor(5),
            image_ref: Some("img-1".into()),
            project_id: None,
            system_metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_state_strings_roundtrip() {
        for state in [VmState::Active, VmState::ShelvedOffloaded, VmState::Error] {
            assert_eq!(state.as_str().parse::<VmState>().unwrap(), state);
        }
        assert_eq!(TaskState::PoweringOn.to_string(), "powering_on");
        assert!("exploding".parse::<TaskState>().is_err());
    }

    #[test]
    fn test_stable_vm_state_defaults_to_active() {
        let mut inst = instance();
        inst.vm_state = None;
        assert_eq!(inst.stable_vm_state(), VmState::Active);
        inst.vm_state = Some(VmState::Stopped);
        assert_eq!(inst.stable_vm_state(), VmState::Stopped);
    }

    #[test]
    fn test_image_from_system_metadata() {
        let mut inst = instance();
        inst.system_metadata
            .insert("image_min_ram".into(), "512".into());
        inst.system_metadata
            .insert("image_hw_disk_bus".into(), "virtio".into());
        inst.system_metadata.insert("owner".into(), "x".into());

        let image = inst.image_from_system_metadata().unwrap();
        assert_eq!(image.id.as_deref(), Some("img-1"));
        assert_eq!(image.min_ram, 512);
        assert_eq!(image.properties.get("hw_disk_bus").unwrap(), "virtio");
        assert!(!image.properties.contains_key("owner"));
    }

    #[test]
    fn test_volume_backed_instance_has_no_image() {
        let mut inst = instance();
        inst.image_ref = None;
        assert!(inst.image_from_system_metadata().is_none());
    }

    #[test]
    fn test_empty_shelved_image_id_is_absent() {
        let mut inst = instance();
        inst.system_metadata
            .insert(SHELVED_IMAGE_ID_KEY.into(), String::new());
        assert!(inst.shelved_image_id().is_none());
    }
}
