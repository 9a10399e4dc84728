//! Postgres-backed stores.

use std::collections::BTreeMap;

use async_trait::async_trait;
use cirrus_id::{InstanceId, MigrationId, Uuid};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::debug;

use super::{
    FlavorStore, InstanceFault, InstanceStore, InstanceUpdate, MigrationStore, StoreError,
};
use crate::model::{
    BlockDeviceMapping, Flavor, Instance, InstanceGroup, MigrationRecord, TaskState,
};

const INSTANCE_COLUMNS: &str = "uuid, vm_state, task_state, power_state, host, node, flavor, \
                                image_ref, project_id, system_metadata";

const MIGRATION_COLUMNS: &str = "id, instance_uuid, migration_type, status, source_compute, \
                                 source_node, dest_compute, dest_node, old_instance_type_id, \
                                 new_instance_type_id, created_at, updated_at";

const UNIQUE_VIOLATION: &str = "23505";

/// Instance, migration and flavor store over a Postgres pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Inserts or replaces an instance row.
    pub async fn insert_instance(&self, instance: &Instance) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO instances
                (uuid, vm_state, task_state, power_state, host, node, flavor,
                 image_ref, project_id, system_metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (uuid) DO UPDATE SET
                vm_state = EXCLUDED.vm_state,
                task_state = EXCLUDED.task_state,
                power_state = EXCLUDED.power_state,
                host = EXCLUDED.host,
                node = EXCLUDED.node,
                flavor = EXCLUDED.flavor,
                image_ref = EXCLUDED.image_ref,
                project_id = EXCLUDED.project_id,
                system_metadata = EXCLUDED.system_metadata,
                updated_at = now()
            "#,
        )
        .bind(instance.uuid.uuid())
        .bind(instance.vm_state.map(|s| s.as_str()))
        .bind(instance.task_state.map(|s| s.as_str()))
        .bind(instance.power_state.as_str())
        .bind(&instance.host)
        .bind(&instance.node)
        .bind(Json(&instance.flavor))
        .bind(&instance.image_ref)
        .bind(&instance.project_id)
        .bind(Json(&instance.system_metadata))
        .execute(&self.pool)
        .await
        .map_err(StoreError::Query)?;
        Ok(())
    }

    pub async fn insert_flavor(&self, flavor: &Flavor) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO flavors
                (id, flavorid, name, memory_mb, vcpus, root_gb, ephemeral_gb, extra_specs)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(flavor.id)
        .bind(&flavor.flavorid)
        .bind(&flavor.name)
        .bind(to_i64("memory_mb", flavor.memory_mb)?)
        .bind(i32::try_from(flavor.vcpus).map_err(|e| invalid("vcpus", e))?)
        .bind(to_i64("root_gb", flavor.root_gb)?)
        .bind(to_i64("ephemeral_gb", flavor.ephemeral_gb)?)
        .bind(Json(&flavor.extra_specs))
        .execute(&self.pool)
        .await
        .map_err(StoreError::Query)?;
        Ok(())
    }

    /// Explains why a conditional update matched no row.
    async fn missed_update(&self, id: InstanceId, update: &InstanceUpdate) -> StoreError {
        let row = sqlx::query("SELECT task_state FROM instances WHERE uuid = $1")
            .bind(id.uuid())
            .fetch_optional(&self.pool)
            .await;

        match row {
            Err(e) => StoreError::Query(e),
            Ok(None) => StoreError::InstanceNotFound(id),
            Ok(Some(row)) => {
                let actual = match row
                    .try_get::<Option<String>, _>("task_state")
                    .map_err(StoreError::Query)
                    .and_then(|s| parse_opt::<TaskState>(s))
                {
                    Ok(actual) => actual,
                    Err(e) => return e,
                };
                StoreError::UnexpectedTaskState {
                    instance: id,
                    expected: update.expected_task_state.flatten(),
                    actual,
                }
            }
        }
    }
}

#[async_trait]
impl InstanceStore for PgStore {
    async fn get_instance(&self, id: InstanceId) -> Result<Instance, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM instances WHERE uuid = $1"
        ))
        .bind(id.uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Query)?
        .ok_or(StoreError::InstanceNotFound(id))?;

        instance_from_row(&row)
    }

    async fn update_instance(
        &self,
        id: InstanceId,
        update: &InstanceUpdate,
    ) -> Result<Instance, StoreError> {
        let mut builder = QueryBuilder::<Postgres>::new("UPDATE instances SET updated_at = now()");
        if let Some(state) = update.vm_state {
            builder.push(", vm_state = ").push_bind(state.as_str());
        }
        if let Some(state) = update.task_state {
            builder
                .push(", task_state = ")
                .push_bind(state.map(|s| s.as_str()));
        }
        if let Some(state) = update.power_state {
            builder.push(", power_state = ").push_bind(state.as_str());
        }
        if let Some(host) = &update.host {
            builder.push(", host = ").push_bind(host.clone());
        }
        if let Some(node) = &update.node {
            builder.push(", node = ").push_bind(node.clone());
        }
        builder.push(" WHERE uuid = ").push_bind(id.uuid());
        if let Some(expected) = update.expected_task_state {
            builder
                .push(" AND task_state IS NOT DISTINCT FROM ")
                .push_bind(expected.map(|s| s.as_str()));
        }
        builder.push(" RETURNING ").push(INSTANCE_COLUMNS);

        let row = builder
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::Query)?;

        match row {
            Some(row) => instance_from_row(&row),
            None => Err(self.missed_update(id, update).await),
        }
    }

    async fn add_fault(&self, fault: InstanceFault) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO instance_faults (instance_uuid, code, message, details, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(fault.instance_uuid.uuid())
        .bind(i32::from(fault.code))
        .bind(&fault.message)
        .bind(&fault.details)
        .bind(fault.created_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Query)?;
        Ok(())
    }

    async fn block_device_mappings(
        &self,
        id: InstanceId,
    ) -> Result<Vec<BlockDeviceMapping>, StoreError> {
        let rows = sqlx::query(
            "SELECT mapping FROM block_device_mappings WHERE instance_uuid = $1 ORDER BY id",
        )
        .bind(id.uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        rows.iter()
            .map(|row| {
                row.try_get::<Json<BlockDeviceMapping>, _>("mapping")
                    .map(|j| j.0)
                    .map_err(StoreError::Query)
            })
            .collect()
    }

    async fn instance_group(&self, id_or_name: &str) -> Result<Option<InstanceGroup>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, policies, members
            FROM instance_groups
            WHERE id::text = $1 OR name = $1
            ORDER BY id::text = $1 DESC
            LIMIT 1
            "#,
        )
        .bind(id_or_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: Uuid = row.try_get("id").map_err(StoreError::Query)?;
        Ok(Some(InstanceGroup {
            id: id.into(),
            name: row.try_get("name").map_err(StoreError::Query)?,
            policies: row
                .try_get::<Json<Vec<String>>, _>("policies")
                .map_err(StoreError::Query)?
                .0,
            members: row
                .try_get::<Json<Vec<InstanceId>>, _>("members")
                .map_err(StoreError::Query)?
                .0,
        }))
    }
}

#[async_trait]
impl MigrationStore for PgStore {
    async fn create_migration(&self, record: &MigrationRecord) -> Result<(), StoreError> {
        let result = sqlx::query(&format!(
            "INSERT INTO migrations ({MIGRATION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        ))
        .bind(record.id.uuid())
        .bind(record.instance_uuid.uuid())
        .bind(record.migration_type.as_str())
        .bind(record.status.as_str())
        .bind(&record.source_compute)
        .bind(&record.source_node)
        .bind(&record.dest_compute)
        .bind(&record.dest_node)
        .bind(record.old_instance_type_id)
        .bind(record.new_instance_type_id)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!(migration_id = %record.id, status = %record.status, "Migration created");
                Ok(())
            }
            Err(sqlx::Error::Database(db_err))
                if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) =>
            {
                Err(StoreError::DuplicateMigration(record.id))
            }
            Err(e) => Err(StoreError::Query(e)),
        }
    }

    async fn get_migration(&self, id: MigrationId) -> Result<MigrationRecord, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {MIGRATION_COLUMNS} FROM migrations WHERE id = $1"
        ))
        .bind(id.uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Query)?
        .ok_or(StoreError::MigrationNotFound(id))?;

        migration_from_row(&row)
    }

    async fn save_migration(&self, record: &MigrationRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE migrations
            SET status = $2, dest_compute = $3, dest_node = $4, updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(record.id.uuid())
        .bind(record.status.as_str())
        .bind(&record.dest_compute)
        .bind(&record.dest_node)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::Query)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::MigrationNotFound(record.id));
        }
        debug!(migration_id = %record.id, status = %record.status, "Migration saved");
        Ok(())
    }
}

#[async_trait]
impl FlavorStore for PgStore {
    async fn flavor_by_id(&self, id: i64) -> Result<Flavor, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, flavorid, name, memory_mb, vcpus, root_gb, ephemeral_gb, extra_specs
            FROM flavors
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::Query)?
        .ok_or(StoreError::FlavorNotFound(id))?;

        let vcpus: i32 = row.try_get("vcpus").map_err(StoreError::Query)?;
        Ok(Flavor {
            id: row.try_get("id").map_err(StoreError::Query)?,
            flavorid: row.try_get("flavorid").map_err(StoreError::Query)?,
            name: row.try_get("name").map_err(StoreError::Query)?,
            memory_mb: get_u64(&row, "memory_mb")?,
            vcpus: u32::try_from(vcpus).map_err(|e| corrupt("vcpus", e))?,
            root_gb: get_u64(&row, "root_gb")?,
            ephemeral_gb: get_u64(&row, "ephemeral_gb")?,
            extra_specs: row
                .try_get::<Json<BTreeMap<String, String>>, _>("extra_specs")
                .map_err(StoreError::Query)?
                .0,
        })
    }
}

fn instance_from_row(row: &PgRow) -> Result<Instance, StoreError> {
    let uuid: Uuid = row.try_get("uuid").map_err(StoreError::Query)?;
    let power_state: String = row.try_get("power_state").map_err(StoreError::Query)?;

    Ok(Instance {
        uuid: uuid.into(),
        vm_state: parse_opt(row.try_get("vm_state").map_err(StoreError::Query)?)?,
        task_state: parse_opt(row.try_get("task_state").map_err(StoreError::Query)?)?,
        power_state: power_state
            .parse()
            .map_err(|e| corrupt("power_state", e))?,
        host: row.try_get("host").map_err(StoreError::Query)?,
        node: row.try_get("node").map_err(StoreError::Query)?,
        flavor: row
            .try_get::<Json<Flavor>, _>("flavor")
            .map_err(StoreError::Query)?
            .0,
        image_ref: row.try_get("image_ref").map_err(StoreError::Query)?,
        project_id: row.try_get("project_id").map_err(StoreError::Query)?,
        system_metadata: row
            .try_get::<Json<BTreeMap<String, String>>, _>("system_metadata")
            .map_err(StoreError::Query)?
            .0,
    })
}

fn migration_from_row(row: &PgRow) -> Result<MigrationRecord, StoreError> {
    let id: Uuid = row.try_get("id").map_err(StoreError::Query)?;
    let instance_uuid: Uuid = row.try_get("instance_uuid").map_err(StoreError::Query)?;
    let migration_type: String = row.try_get("migration_type").map_err(StoreError::Query)?;
    let status: String = row.try_get("status").map_err(StoreError::Query)?;

    Ok(MigrationRecord {
        id: id.into(),
        instance_uuid: instance_uuid.into(),
        migration_type: migration_type
            .parse()
            .map_err(|e| corrupt("migration_type", e))?,
        status: status.parse().map_err(|e| corrupt("status", e))?,
        source_compute: row.try_get("source_compute").map_err(StoreError::Query)?,
        source_node: row.try_get("source_node").map_err(StoreError::Query)?,
        dest_compute: row.try_get("dest_compute").map_err(StoreError::Query)?,
        dest_node: row.try_get("dest_node").map_err(StoreError::Query)?,
        old_instance_type_id: row
            .try_get("old_instance_type_id")
            .map_err(StoreError::Query)?,
        new_instance_type_id: row
            .try_get("new_instance_type_id")
            .map_err(StoreError::Query)?,
        created_at: row.try_get("created_at").map_err(StoreError::Query)?,
        updated_at: row.try_get("updated_at").map_err(StoreError::Query)?,
    })
}

fn parse_opt<T>(value: Option<String>) -> Result<Option<T>, StoreError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .map(|s| s.parse::<T>().map_err(|e| corrupt("state", e)))
        .transpose()
}

fn get_u64(row: &PgRow, column: &str) -> Result<u64, StoreError> {
    let value: i64 = row.try_get(column).map_err(StoreError::Query)?;
    u64::try_from(value).map_err(|e| corrupt(column, e))
}

fn to_i64(field: &str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|e| invalid(field, e))
}

fn corrupt(column: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("{column}: {err}"))
}

fn invalid(field: &str, err: impl std::fmt::Display) -> StoreError {
    StoreError::InvalidValue {
        field: field.to_string(),
        message: err.to_string(),
    }
}
