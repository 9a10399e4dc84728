//! Compute host liveness and hypervisor facts.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::db::StoreError;

/// Facts about a compute node used by live-migration checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeNodeInfo {
    pub host: String,
    pub hypervisor_type: String,
    pub hypervisor_version: u64,
    /// May go negative on overcommitted hosts.
    pub free_ram_mb: i64,
}

#[async_trait]
pub trait HostRegistry: Send + Sync {
    /// Whether the compute service on `host` is heartbeating.
    async fn is_up(&self, host: &str) -> Result<bool, StoreError>;

    async fn compute_node(&self, host: &str) -> Result<Option<ComputeNodeInfo>, StoreError>;
}

/// Registry backed by the `compute_services` table.
#[derive(Clone)]
pub struct PgHostRegistry {
    pool: PgPool,
    service_down_time: Duration,
}

impl PgHostRegistry {
    pub fn new(pool: PgPool, service_down_time: Duration) -> Self {
        Self {
            pool,
            service_down_time,
        }
    }

    /// Records a heartbeat for `node`, creating the row if needed.
    pub async fn heartbeat(&self, node: &ComputeNodeInfo) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO compute_services
                (host, last_heartbeat, hypervisor_type, hypervisor_version, free_ram_mb)
            VALUES ($1, now(), $2, $3, $4)
            ON CONFLICT (host) DO UPDATE SET
                last_heartbeat = now(),
                hypervisor_type = EXCLUDED.hypervisor_type,
                hypervisor_version = EXCLUDED.hypervisor_version,
                free_ram_mb = EXCLUDED.free_ram_mb
            "#,
        )
        .bind(&node.host)
        .bind(&node.hypervisor_type)
        .bind(i64::try_from(node.hypervisor_version).unwrap_or(i64::MAX))
        .bind(node.free_ram_mb)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Query)?;
        Ok(())
    }
}

#[async_trait]
impl HostRegistry for PgHostRegistry {
    async fn is_up(&self, host: &str) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(last_heartbeat > now() - make_interval(secs => $2), false) AS up
            FROM compute_services
            WHERE host = $1
            "#,
        )
        .bind(host)
        .bind(self.service_down_time.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        match row {
            Some(row) => row.try_get("up").map_err(StoreError::Query),
            None => Ok(false),
        }
    }

    async fn compute_node(&self, host: &str) -> Result<Option<ComputeNodeInfo>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT host, hypervisor_type, hypervisor_version, free_ram_mb
            FROM compute_services
            WHERE host = $1
            "#,
        )
        .bind(host)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let version: i64 = row
            .try_get("hypervisor_version")
            .map_err(StoreError::Query)?;

        Ok(Some(ComputeNodeInfo {
            host: row.try_get("host").map_err(StoreError::Query)?,
            hypervisor_type: row.try_get("hypervisor_type").map_err(StoreError::Query)?,
            hypervisor_version: u64::try_from(version)
                .map_err(|e| StoreError::Corrupt(format!("hypervisor_version: {e}")))?,
            free_ram_mb: row.try_get("free_ram_mb").map_err(StoreError::Query)?,
        }))
    }
}

/// Fixed host table for dev mode and tests.
#[derive(Default)]
pub struct StaticHostRegistry {
    hosts: Mutex<HashMap<String, (bool, ComputeNodeInfo)>>,
}

impl StaticHostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `node` as up.
    pub fn add(&self, node: ComputeNodeInfo) {
        self.hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node.host.clone(), (true, node));
    }

    pub fn set_up(&self, host: &str, up: bool) {
        if let Some(entry) = self
            .hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(host)
        {
            entry.0 = up;
        }
    }
}

#[async_trait]
impl HostRegistry for StaticHostRegistry {
    async fn is_up(&self, host: &str) -> Result<bool, StoreError> {
        Ok(self
            .hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(host)
            .is_some_and(|(up, _)| *up))
    }

    async fn compute_node(&self, host: &str) -> Result<Option<ComputeNodeInfo>, StoreError> {
        Ok(self
            .hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(host)
            .map(|(_, node)| node.clone()))
    }
}
