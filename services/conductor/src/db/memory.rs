//! In-memory stores for dev mode and tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use cirrus_id::{InstanceId, MigrationId};

use super::{
    FlavorStore, InstanceFault, InstanceStore, InstanceUpdate, MigrationStore, StoreError,
};
use crate::model::{
    BlockDeviceMapping, Flavor, Instance, InstanceGroup, MigrationRecord, MigrationStatus,
};

/// Instance, migration and flavor store held in process memory.
///
/// Keeps a history of writes so callers can assert on what happened.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    instances: HashMap<InstanceId, Instance>,
    migrations: HashMap<MigrationId, MigrationRecord>,
    flavors: HashMap<i64, Flavor>,
    groups: Vec<InstanceGroup>,
    bdms: HashMap<InstanceId, Vec<BlockDeviceMapping>>,
    faults: Vec<InstanceFault>,
    /// Keep `updates` and `migration_history`; off for long-running stores.
    write_log: bool,
    updates: Vec<(InstanceId, InstanceUpdate)>,
    migration_history: Vec<(MigrationId, MigrationStatus)>,
    instance_lookups: usize,
    flavor_lookups: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that also remembers every instance write and migration save,
    /// for assertions.
    pub fn with_write_log() -> Self {
        let store = Self::default();
        store.lock().write_log = true;
        store
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_instance(&self, instance: Instance) {
        self.lock().instances.insert(instance.uuid, instance);
    }

    pub fn remove_instance(&self, id: InstanceId) -> Option<Instance> {
        self.lock().instances.remove(&id)
    }

    pub fn insert_flavor(&self, flavor: Flavor) {
        self.lock().flavors.insert(flavor.id, flavor);
    }

    pub fn insert_group(&self, group: InstanceGroup) {
        self.lock().groups.push(group);
    }

    pub fn set_block_device_mappings(&self, id: InstanceId, bdms: Vec<BlockDeviceMapping>) {
        self.lock().bdms.insert(id, bdms);
    }

    pub fn instance(&self, id: InstanceId) -> Option<Instance> {
        self.lock().instances.get(&id).cloned()
    }

    pub fn migration(&self, id: MigrationId) -> Option<MigrationRecord> {
        self.lock().migrations.get(&id).cloned()
    }

    /// Migration records for `instance`, oldest first.
    pub fn migrations_for(&self, instance: InstanceId) -> Vec<MigrationRecord> {
        let inner = self.lock();
        let mut records: Vec<_> = inner
            .migrations
            .values()
            .filter(|m| m.instance_uuid == instance)
            .cloned()
            .collect();
        records.sort_by_key(|m| m.created_at);
        records
    }

    /// Every persisted status of `id`, in write order. Empty unless built
    /// with [`MemoryStore::with_write_log`].
    pub fn migration_history(&self, id: MigrationId) -> Vec<MigrationStatus> {
        self.lock()
            .migration_history
            .iter()
            .filter(|(mid, _)| *mid == id)
            .map(|(_, status)| *status)
            .collect()
    }

    pub fn faults(&self) -> Vec<InstanceFault> {
        self.lock().faults.clone()
    }

    /// Successful instance writes, in order. Empty unless built with
    /// [`MemoryStore::with_write_log`].
    pub fn updates(&self) -> Vec<(InstanceId, InstanceUpdate)> {
        self.lock().updates.clone()
    }

    pub fn updates_for(&self, id: InstanceId) -> Vec<InstanceUpdate> {
        self.lock()
            .updates
            .iter()
            .filter(|(iid, _)| *iid == id)
            .map(|(_, u)| u.clone())
            .collect()
    }

    pub fn instance_lookups(&self) -> usize {
        self.lock().instance_lookups
    }

    pub fn flavor_lookups(&self) -> usize {
        self.lock().flavor_lookups
    }
}

#[async_trait]
impl InstanceStore for MemoryStore {
    async fn get_instance(&self, id: InstanceId) -> Result<Instance, StoreError> {
        let mut inner = self.lock();
        inner.instance_lookups += 1;
        inner
            .instances
            .get(&id)
            .cloned()
            .ok_or(StoreError::InstanceNotFound(id))
    }

    async fn update_instance(
        &self,
        id: InstanceId,
        update: &InstanceUpdate,
    ) -> Result<Instance, StoreError> {
        let mut inner = self.lock();
        let instance = inner
            .instances
            .get_mut(&id)
            .ok_or(StoreError::InstanceNotFound(id))?;
        update.check_expected(instance)?;
        update.apply(instance);
        let updated = instance.clone();
        if inner.write_log {
            inner.updates.push((id, update.clone()));
        }
        Ok(updated)
    }

    async fn add_fault(&self, fault: InstanceFault) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if !inner.instances.contains_key(&fault.instance_uuid) {
            return Err(StoreError::InstanceNotFound(fault.instance_uuid));
        }
        inner.faults.push(fault);
        Ok(())
    }

    async fn block_device_mappings(
        &self,
        id: InstanceId,
    ) -> Result<Vec<BlockDeviceMapping>, StoreError> {
        Ok(self.lock().bdms.get(&id).cloned().unwrap_or_default())
    }

    async fn instance_group(&self, id_or_name: &str) -> Result<Option<InstanceGroup>, StoreError> {
        Ok(self
            .lock()
            .groups
            .iter()
            .find(|g| g.id.to_string() == id_or_name || g.name == id_or_name)
            .cloned())
    }
}

#[async_trait]
impl MigrationStore for MemoryStore {
    async fn create_migration(&self, record: &MigrationRecord) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if inner.migrations.contains_key(&record.id) {
            return Err(StoreError::DuplicateMigration(record.id));
        }
        inner.migrations.insert(record.id, record.clone());
        if inner.write_log {
            inner.migration_history.push((record.id, record.status));
        }
        Ok(())
    }

    async fn get_migration(&self, id: MigrationId) -> Result<MigrationRecord, StoreError> {
        self.lock()
            .migrations
            .get(&id)
            .cloned()
            .ok_or(StoreError::MigrationNotFound(id))
    }

    async fn save_migration(&self, record: &MigrationRecord) -> Result<(), StoreError> {
        let mut inner = self.lock();
        let stored = inner
            .migrations
            .get_mut(&record.id)
            .ok_or(StoreError::MigrationNotFound(record.id))?;
        *stored = record.clone();
        if inner.write_log {
            inner.migration_history.push((record.id, record.status));
        }
        Ok(())
    }
}

#[async_trait]
impl FlavorStore for MemoryStore {
    async fn flavor_by_id(&self, id: i64) -> Result<Flavor, StoreError> {
        let mut inner = self.lock();
        inner.flavor_lookups += 1;
        inner
            .flavors
            .get(&id)
            .cloned()
            .ok_or(StoreError::FlavorNotFound(id))
    }
}
