use std::collections::HashMap;

use agenthost_control_plane::{Instance, NewInstance};
use parking_lot::RwLock;

use super::{InstanceStore, InstanceUpdate};

/// Process-local store used when no database is configured, and by tests.
#[derive(Default)]
pub struct MemoryInstanceStore {
    records: RwLock<HashMap<String, Instance>>,
}

impl InstanceStore for MemoryInstanceStore {
    fn get(&self, id: &str) -> anyhow::Result<Option<Instance>> {
        Ok(self.records.read().get(id).cloned())
    }

    fn list_for_user(&self, user_id: &str) -> anyhow::Result<Vec<Instance>> {
        let mut instances: Vec<Instance> = self
            .records
            .read()
            .values()
            .filter(|instance| instance.user_id == user_id)
            .cloned()
            .collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(instances)
    }

    fn create(&self, new: NewInstance) -> anyhow::Result<Instance> {
        let mut records = self.records.write();
        if records.contains_key(&new.id) {
            anyhow::bail!("instance {} already exists", new.id);
        }
        let instance = Instance::from_new(new, chrono::Utc::now());
        records.insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    fn update(&self, id: &str, update: InstanceUpdate) -> anyhow::Result<Instance> {
        let mut records = self.records.write();
        let Some(current) = records.get(id) else {
            anyhow::bail!("instance {id} does not exist");
        };
        let mut next = current.clone();
        update.apply_to(&mut next)?;
        records.insert(id.to_string(), next.clone());
        Ok(next)
    }

    fn upsert(&self, instance: Instance) -> anyhow::Result<Instance> {
        self.records
            .write()
            .insert(instance.id.clone(), instance.clone());
        Ok(instance)
    }

    fn delete(&self, id: &str) -> anyhow::Result<bool> {
        Ok(self.records.write().remove(id).is_some())
    }
}
