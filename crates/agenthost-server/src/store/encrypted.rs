use std::sync::Arc;

use agenthost_control_plane::{Instance, NewInstance};
use agenthost_vault::Vault;
use anyhow::Context;

use super::{InstanceStore, InstanceUpdate};

/// Seals bot tokens on every write and opens them on every read, so the inner
/// store only ever holds ciphertext when the vault is enabled.
pub struct EncryptedInstanceStore {
    inner: Arc<dyn InstanceStore>,
    vault: Arc<Vault>,
}

impl EncryptedInstanceStore {
    pub fn new(inner: Arc<dyn InstanceStore>, vault: Arc<Vault>) -> Self {
        Self { inner, vault }
    }

    fn seal(&self, token: Option<String>) -> anyhow::Result<Option<String>> {
        token
            .map(|token| self.vault.encrypt(&token).context("seal bot token"))
            .transpose()
    }

    fn open(&self, mut instance: Instance) -> anyhow::Result<Instance> {
        if let Some(token) = instance.bot_token.take() {
            let opened = self
                .vault
                .decrypt(&token)
                .with_context(|| format!("open bot token of instance {}", instance.id))?;
            instance.bot_token = Some(opened);
        }
        Ok(instance)
    }
}

impl InstanceStore for EncryptedInstanceStore {
    fn get(&self, id: &str) -> anyhow::Result<Option<Instance>> {
        self.inner
            .get(id)?
            .map(|instance| self.open(instance))
            .transpose()
    }

    fn list_for_user(&self, user_id: &str) -> anyhow::Result<Vec<Instance>> {
        self.inner
            .list_for_user(user_id)?
            .into_iter()
            .map(|instance| self.open(instance))
            .collect()
    }

    fn create(&self, mut new: NewInstance) -> anyhow::Result<Instance> {
        new.bot_token = self.seal(new.bot_token.take())?;
        self.open(self.inner.create(new)?)
    }

    fn update(&self, id: &str, mut update: InstanceUpdate) -> anyhow::Result<Instance> {
        if let Some(token) = update.bot_token.take() {
            update.bot_token = Some(self.seal(token)?);
        }
        self.open(self.inner.update(id, update)?)
    }

    fn upsert(&self, mut instance: Instance) -> anyhow::Result<Instance> {
        instance.bot_token = self.seal(instance.bot_token.take())?;
        self.open(self.inner.upsert(instance)?)
    }

    fn delete(&self, id: &str) -> anyhow::Result<bool> {
        self.inner.delete(id)
    }
}
