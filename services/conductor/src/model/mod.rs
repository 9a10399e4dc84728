//! Domain types shared by the orchestration tasks.

mod instance;
mod migration;
mod request_spec;

pub use instance::{
    BlockDeviceMapping, Flavor, ImageMeta, Instance, InstanceGroup, PowerState, TaskState,
    UnknownState, VmState, SHELVED_IMAGE_ID_KEY,
};
pub use migration::{InvalidTransition, MigrationRecord, MigrationStatus, MigrationType};
pub use request_spec::{
    FilterProperties, GroupInfo, HostCandidate, InstanceProperties, RequestSpec,
    ResourceLimits, RetryContext, TriedHost,
};
