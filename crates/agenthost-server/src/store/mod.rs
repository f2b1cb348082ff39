use agenthost_control_plane::{Instance, InstanceStatus, NewInstance, ProviderHandles};

pub mod encrypted;
pub mod memory;

pub use encrypted::EncryptedInstanceStore;
pub use memory::MemoryInstanceStore;

/// Persistence for instance records. Reads return records as stored; callers that
/// need plaintext secrets go through [`EncryptedInstanceStore`].
pub trait InstanceStore: Send + Sync {
    fn get(&self, id: &str) -> anyhow::Result<Option<Instance>>;

    /// All records owned by `user_id`, oldest first, DELETED ones included.
    fn list_for_user(&self, user_id: &str) -> anyhow::Result<Vec<Instance>>;

    fn create(&self, new: NewInstance) -> anyhow::Result<Instance>;

    /// Fails if no record with `id` exists.
    fn update(&self, id: &str, update: InstanceUpdate) -> anyhow::Result<Instance>;

    fn upsert(&self, instance: Instance) -> anyhow::Result<Instance>;

    /// Hard delete. Returns false when nothing was removed.
    fn delete(&self, id: &str) -> anyhow::Result<bool>;
}

/// Returned through `anyhow` when an update's `expected` status no longer matches.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("instance {id} is {actual}, expected {expected}")]
pub struct StatusConflict {
    pub id: String,
    pub expected: InstanceStatus,
    pub actual: InstanceStatus,
}

/// Partial update; `None` leaves a field untouched. When `expected` is set the
/// update only applies if the stored status still equals it.
#[derive(Clone, Debug, Default)]
pub struct InstanceUpdate {
    pub expected: Option<InstanceStatus>,
    pub status: Option<InstanceStatus>,
    pub handles: Option<ProviderHandles>,
    pub ip_address: Option<Option<String>>,
    pub is_default: Option<bool>,
    pub bot_token: Option<Option<String>>,
}

impl InstanceUpdate {
    pub fn status(status: InstanceStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn is_default(is_default: bool) -> Self {
        Self {
            is_default: Some(is_default),
            ..Self::default()
        }
    }

    pub fn expecting(mut self, status: InstanceStatus) -> Self {
        self.expected = Some(status);
        self
    }

    /// Must run under the same lock or row lock as the write that follows.
    pub fn apply_to(self, instance: &mut Instance) -> anyhow::Result<()> {
        if let Some(expected) = self.expected {
            if instance.status != expected {
                return Err(StatusConflict {
                    id: instance.id.clone(),
                    expected,
                    actual: instance.status,
                }
                .into());
            }
        }
        if let Some(handles) = self.handles {
            instance.set_handles(handles)?;
        }
        if let Some(status) = self.status {
            instance.status = status;
        }
        if let Some(ip_address) = self.ip_address {
            instance.ip_address = ip_address;
        }
        if let Some(is_default) = self.is_default {
            instance.is_default = is_default;
        }
        if let Some(bot_token) = self.bot_token {
            instance.bot_token = bot_token;
        }
        instance.updated_at = chrono::Utc::now();
        Ok(())
    }
}
