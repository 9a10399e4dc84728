//! Persistent record of one migration attempt.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use cirrus_id::{InstanceId, MigrationId};
use serde::{Deserialize, Serialize};

use super::instance::{Instance, UnknownState};

/// Kind of migration being tracked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationType {
    LiveMigration,
    Resize,
}

impl MigrationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationType::LiveMigration => "live-migration",
            MigrationType::Resize => "resize",
        }
    }
}

impl fmt::Display for MigrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationType {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "live-migration" => Ok(MigrationType::LiveMigration),
            "resize" => Ok(MigrationType::Resize),
            other => Err(UnknownState {
                kind: "migration_type",
                value: other.to_string(),
            }),
        }
    }
}

/// Migration status.
///
/// Progress states are ordered: `pre-migrating < running < post-migrating <
/// completed`. `error`, `failed` and `cancelled` end the record
/// unsuccessfully; `completed` ends it successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MigrationStatus {
    PreMigrating,
    Running,
    PostMigrating,
    Completed,
    Error,
    Failed,
    Cancelled,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::PreMigrating => "pre-migrating",
            MigrationStatus::Running => "running",
            MigrationStatus::PostMigrating => "post-migrating",
            MigrationStatus::Completed => "completed",
            MigrationStatus::Error => "error",
            MigrationStatus::Failed => "failed",
            MigrationStatus::Cancelled => "cancelled",
        }
    }

    /// Position along the progress path, `None` for failure states.
    fn progress_rank(&self) -> Option<u8> {
        match self {
            MigrationStatus::PreMigrating => Some(0),
            MigrationStatus::Running => Some(1),
            MigrationStatus::PostMigrating => Some(2),
            MigrationStatus::Completed => Some(3),
            MigrationStatus::Error | MigrationStatus::Failed | MigrationStatus::Cancelled => None,
        }
    }

    /// True for `error`, `failed` and `cancelled`.
    pub fn is_failure(&self) -> bool {
        self.progress_rank().is_none()
    }

    /// True once no further transition is accepted.
    pub fn is_terminal(&self) -> bool {
        self.is_failure() || *self == MigrationStatus::Completed
    }

    /// Whether a record in this status may move to `next`.
    pub fn can_transition_to(&self, next: MigrationStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.progress_rank(), next.progress_rank()) {
            (Some(current), Some(next)) => next > current,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pre-migrating" => Ok(MigrationStatus::PreMigrating),
            "running" => Ok(MigrationStatus::Running),
            "post-migrating" => Ok(MigrationStatus::PostMigrating),
            "completed" => Ok(MigrationStatus::Completed),
            "error" => Ok(MigrationStatus::Error),
            "failed" => Ok(MigrationStatus::Failed),
            "cancelled" => Ok(MigrationStatus::Cancelled),
            other => Err(UnknownState {
                kind: "migration status",
                value: other.to_string(),
            }),
        }
    }
}

/// Rejected status change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("migration {id} cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub id: MigrationId,
    pub from: MigrationStatus,
    pub to: MigrationStatus,
}

/// One migration attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub id: MigrationId,
    pub instance_uuid: InstanceId,
    pub migration_type: MigrationType,
    pub status: MigrationStatus,
    pub source_compute: Option<String>,
    pub source_node: Option<String>,
    pub dest_compute: Option<String>,
    pub dest_node: Option<String>,
    pub old_instance_type_id: i64,
    pub new_instance_type_id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MigrationRecord {
    /// A fresh `pre-migrating` live-migration record for `instance`.
    ///
    /// Old and new flavor are the instance's current flavor; a live
    /// migration never resizes.
    pub fn live(instance: &Instance, destination: Option<&str>) -> Self {
        let now = Utc::now();
        Self {
            id: MigrationId::new(),
            instance_uuid: instance.uuid,
            migration_type: MigrationType::LiveMigration,
            status: MigrationStatus::PreMigrating,
            source_compute: instance.host.clone(),
            source_node: instance.node.clone(),
            dest_compute: destination.map(str::to_string),
            dest_node: None,
            old_instance_type_id: instance.flavor.id,
            new_instance_type_id: instance.flavor.id,
            created_at: now,
            updated_at: now,
        }
    }

    /// Moves the record to `next`.
    ///
    /// Re-applying the current status is a no-op so duplicated progress
    /// reports are harmless. Returns whether the status changed.
    pub fn transition(&mut self, next: MigrationStatus) -> Result<bool, InvalidTransition> {
        if self.status == next {
            return Ok(false);
        }
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(true)
    }
}
