//! Persistence collaborators.
//!
//! This module provides:
//! - The store contracts the orchestration core depends on
//!   ([`InstanceStore`], [`MigrationStore`], [`FlavorStore`])
//! - [`InstanceUpdate`], the only way instance fields are written, and the
//!   [`ALLOWED_UPDATES`] whitelist
//! - A Postgres implementation ([`PgStore`]) and an in-memory one
//!   ([`MemoryStore`]) for dev mode and tests

mod error;
mod memory;
mod postgres;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use postgres::PgStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cirrus_id::{InstanceId, MigrationId};
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::model::{
    BlockDeviceMapping, Flavor, Instance, InstanceGroup, MigrationRecord, PowerState, TaskState,
    VmState,
};

/// Instance fields the conductor is allowed to write.
pub const ALLOWED_UPDATES: &[&str] = &[
    "vm_state",
    "task_state",
    "expected_task_state",
    "power_state",
    "host",
    "node",
];

/// A conditional write to an instance record.
///
/// Each field is `None` when untouched. `expected_task_state` turns the
/// write into a compare-and-set on `task_state`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceUpdate {
    pub vm_state: Option<VmState>,
    pub task_state: Option<Option<TaskState>>,
    pub expected_task_state: Option<Option<TaskState>>,
    pub power_state: Option<PowerState>,
    pub host: Option<Option<String>>,
    pub node: Option<Option<String>>,
}

impl InstanceUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vm_state(mut self, state: VmState) -> Self {
        self.vm_state = Some(state);
        self
    }

    pub fn task_state(mut self, state: Option<TaskState>) -> Self {
        self.task_state = Some(state);
        self
    }

    /// Fails the write unless the stored task_state equals `state`.
    pub fn expect_task_state(mut self, state: Option<TaskState>) -> Self {
        self.expected_task_state = Some(state);
        self
    }

    pub fn power_state(mut self, state: PowerState) -> Self {
        self.power_state = Some(state);
        self
    }

    pub fn host(mut self, host: Option<String>) -> Self {
        self.host = Some(host);
        self
    }

    pub fn node(mut self, node: Option<String>) -> Self {
        self.node = Some(node);
        self
    }

    /// True when the update writes nothing.
    pub fn is_empty(&self) -> bool {
        self.vm_state.is_none()
            && self.task_state.is_none()
            && self.power_state.is_none()
            && self.host.is_none()
            && self.node.is_none()
    }

    /// Builds an update from loosely typed fields, rejecting keys outside
    /// [`ALLOWED_UPDATES`].
    pub fn from_fields(
        fields: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, StoreError> {
        let mut update = Self::new();
        for (key, value) in fields {
            match key.as_str() {
                "vm_state" => {
                    update.vm_state = Some(parse_required(key, value)?);
                }
                "task_state" => update.task_state = Some(parse_optional(key, value)?),
                "expected_task_state" => {
                    update.expected_task_state = Some(parse_optional(key, value)?)
                }
                "power_state" => {
                    update.power_state = Some(parse_required(key, value)?);
                }
                "host" => update.host = Some(string_or_null(key, value)?),
                "node" => update.node = Some(string_or_null(key, value)?),
                other => return Err(StoreError::UpdateNotAllowed(other.to_string())),
            }
        }
        Ok(update)
    }

    /// Checks the compare-and-set condition against `instance`.
    pub fn check_expected(&self, instance: &Instance) -> Result<(), StoreError> {
        match self.expected_task_state {
            Some(expected) if expected != instance.task_state => {
                Err(StoreError::UnexpectedTaskState {
                    instance: instance.uuid,
                    expected,
                    actual: instance.task_state,
                })
            }
            _ => Ok(()),
        }
    }

    /// Applies the written fields to `instance`.
    pub fn apply(&self, instance: &mut Instance) {
        if let Some(state) = self.vm_state {
            instance.vm_state = Some(state);
        }
        if let Some(state) = self.task_state {
            instance.task_state = state;
        }
        if let Some(state) = self.power_state {
            instance.power_state = state;
        }
        if let Some(host) = &self.host {
            instance.host = host.clone();
        }
        if let Some(node) = &self.node {
            instance.node = node.clone();
        }
    }
}

fn parse_required<T>(field: &str, value: &serde_json::Value) -> Result<T, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let text = value.as_str().ok_or_else(|| StoreError::InvalidValue {
        field: field.to_string(),
        message: "expected a string".to_string(),
    })?;
    text.parse().map_err(|e: T::Err| StoreError::InvalidValue {
        field: field.to_string(),
        message: e.to_string(),
    })
}

fn parse_optional<T>(field: &str, value: &serde_json::Value) -> Result<Option<T>, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if value.is_null() {
        return Ok(None);
    }
    parse_required(field, value).map(Some)
}

fn string_or_null(field: &str, value: &serde_json::Value) -> Result<Option<String>, StoreError> {
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) => Ok(Some(s.clone())),
        _ => Err(StoreError::InvalidValue {
            field: field.to_string(),
            message: "expected a string or null".to_string(),
        }),
    }
}

/// A recorded failure attached to an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceFault {
    pub instance_uuid: InstanceId,
    pub code: u16,
    pub message: String,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl InstanceFault {
    pub fn new(instance_uuid: InstanceId, code: u16, message: impl Into<String>) -> Self {
        Self {
            instance_uuid,
            code,
            message: message.into(),
            details: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Instance records.
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Current snapshot; `InstanceNotFound` if the row is gone.
    async fn get_instance(&self, id: InstanceId) -> Result<Instance, StoreError>;

    /// Applies `update` atomically, honouring `expected_task_state`.
    /// Returns the updated snapshot.
    async fn update_instance(
        &self,
        id: InstanceId,
        update: &InstanceUpdate,
    ) -> Result<Instance, StoreError>;

    async fn add_fault(&self, fault: InstanceFault) -> Result<(), StoreError>;

    async fn block_device_mappings(
        &self,
        id: InstanceId,
    ) -> Result<Vec<BlockDeviceMapping>, StoreError>;

    /// Looks a group up by id or name.
    async fn instance_group(&self, id_or_name: &str) -> Result<Option<InstanceGroup>, StoreError>;
}

/// Migration records. Records are never deleted here.
#[async_trait]
pub trait MigrationStore: Send + Sync {
    async fn create_migration(&self, record: &MigrationRecord) -> Result<(), StoreError>;

    async fn get_migration(&self, id: MigrationId) -> Result<MigrationRecord, StoreError>;

    async fn save_migration(&self, record: &MigrationRecord) -> Result<(), StoreError>;
}

#[async_trait]
pub trait FlavorStore: Send + Sync {
    async fn flavor_by_id(&self, id: i64) -> Result<Flavor, StoreError>;
}

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL.
    pub database_url: String,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Minimum number of idle connections.
    pub min_connections: u32,

    /// Connection acquire timeout.
    pub acquire_timeout: Duration,

    /// Idle connection timeout.
    pub idle_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/cirrus".to_string(),
            max_connections: 10,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

impl DbConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "postgres://localhost/cirrus".to_string());

        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(10);

        let min_connections = std::env::var("DB_MIN_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        Self {
            database_url,
            max_connections,
            min_connections,
            ..Default::default()
        }
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> Result<Self, StoreError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to database"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .connect(&config.database_url)
            .await
            .map_err(StoreError::Connect)?;

        info!("Database connection pool established");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(StoreError::Query)?;
        Ok(())
    }

    /// Run pending migrations from the first migrations directory found.
    pub async fn run_migrations(&self) -> Result<(), StoreError> {
        info!("Running database migrations");

        let candidates = vec![
            std::path::PathBuf::from("./migrations"),
            std::path::PathBuf::from("services/conductor/migrations"),
            std::path::PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("migrations"),
        ];
        let mut last_error: Option<sqlx::migrate::MigrateError> = None;

        for dir in &candidates {
            match sqlx::migrate::Migrator::new(dir.clone()).await {
                Ok(migrator) => {
                    info!(migrations_dir = %dir.display(), "Loaded migrations");
                    migrator
                        .run(&self.pool)
                        .await
                        .map_err(StoreError::Migration)?;
                    return Ok(());
                }
                Err(e) => last_error = Some(e),
            }
        }

        let tried = candidates
            .iter()
            .map(|dir| dir.display().to_string())
            .collect::<Vec<_>>()
            .join(", ");

        Err(StoreError::MigrationDirNotFound {
            tried,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown error".to_string()),
        })
    }

    pub fn store(&self) -> PgStore {
        PgStore::new(self.pool.clone())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::fixtures;

    #[test]
    fn test_db_config_defaults() {
        let config = DbConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 1);
    }

    #[test]
    fn test_from_fields_whitelist() {
        let fields = json!({"vm_state": "error", "task_state": null, "host": "c2"});
        let update = InstanceUpdate::from_fields(fields.as_object().unwrap()).unwrap();
        assert_eq!(update.vm_state, Some(VmState::Error));
        assert_eq!(update.task_state, Some(None));
        assert_eq!(update.host, Some(Some("c2".to_string())));
        assert!(update.expected_task_state.is_none());

        let fields = json!({"display_name": "x"});
        let err = InstanceUpdate::from_fields(fields.as_object().unwrap()).unwrap_err();
        assert!(matches!(err, StoreError::UpdateNotAllowed(f) if f == "display_name"));
    }

    #[test]
    fn test_from_fields_rejects_bad_state() {
        let fields = json!({"vm_state": "melting"});
        let err = InstanceUpdate::from_fields(fields.as_object().unwrap()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidValue { .. }));
    }

    #[test]
    fn test_whitelist_matches_from_fields() {
        for key in ALLOWED_UPDATES {
            let mut fields = serde_json::Map::new();
            fields.insert((*key).to_string(), serde_json::Value::Null);
            let result = InstanceUpdate::from_fields(&fields);
            assert!(
                !matches!(result, Err(StoreError::UpdateNotAllowed(_))),
                "{key} should be updatable"
            );
        }
    }

    #[test]
    fn test_expected_task_state_check() {
        let mut instance = fixtures::instance("a");
        instance.task_state = Some(TaskState::Migrating);

        let ok = InstanceUpdate::new().expect_task_state(Some(TaskState::Migrating));
        assert!(ok.check_expected(&instance).is_ok());

        let stale = InstanceUpdate::new().expect_task_state(None);
        assert!(matches!(
            stale.check_expected(&instance),
            Err(StoreError::UnexpectedTaskState { .. })
        ));
    }

    #[test]
    fn test_apply_clears_task_state() {
        let mut instance = fixtures::instance("a");
        instance.task_state = Some(TaskState::ResizePrep);
        InstanceUpdate::new()
            .vm_state(VmState::Stopped)
            .task_state(None)
            .apply(&mut instance);
        assert_eq!(instance.vm_state, Some(VmState::Stopped));
        assert_eq!(instance.task_state, None);
        assert_eq!(instance.host.as_deref(), Some("a"));
    }
}
