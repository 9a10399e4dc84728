//! Persistence error types.

use cirrus_id::{InstanceId, MigrationId};
use thiserror::Error;

use crate::model::TaskState;

/// Instance, migration and flavor store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to the database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// Failed to run migrations.
    #[error("migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),

    /// Migration directory not found in the current environment.
    #[error("migration directory not found; tried {tried}. Last error: {last_error}")]
    MigrationDirNotFound { tried: String, last_error: String },

    #[error("instance {0} not found")]
    InstanceNotFound(InstanceId),

    #[error("migration {0} not found")]
    MigrationNotFound(MigrationId),

    #[error("flavor {0} not found")]
    FlavorNotFound(i64),

    #[error("migration {0} already exists")]
    DuplicateMigration(MigrationId),

    /// Optimistic concurrency check on `task_state` failed.
    #[error("instance {instance}: expected task_state {expected:?}, found {actual:?}")]
    UnexpectedTaskState {
        instance: InstanceId,
        expected: Option<TaskState>,
        actual: Option<TaskState>,
    },

    /// Field outside the updatable whitelist.
    #[error("field '{0}' may not be updated")]
    UpdateNotAllowed(String),

    #[error("invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    /// Stored row could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::InstanceNotFound(_)
                | StoreError::MigrationNotFound(_)
                | StoreError::FlavorNotFound(_)
        )
    }
}
