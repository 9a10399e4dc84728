//! Typed ID definitions for orchestrated resources.

use crate::define_id;

define_id!(InstanceId, "instance id");
define_id!(MigrationId, "migration id");
define_id!(InstanceGroupId, "instance group id");
define_id!(RequestId, "request id");
