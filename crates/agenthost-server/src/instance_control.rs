use std::sync::Arc;

use agenthost_control_plane::{
    resolve_ai_provider, Instance, InstanceStatus, NewInstance, ProviderHandles, ProviderKind,
};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::bridge::{ChatReply, UploadedFile};
use crate::config::AiCredentials;
use crate::error::InstanceError;
use crate::provider::{CreateInstanceConfig, InstanceProvider, ProviderSet};
use crate::store::{InstanceStore, InstanceUpdate, StatusConflict};

const DELETE_ATTEMPTS: usize = 3;

#[derive(Clone, Debug)]
pub struct ProvisionRequest {
    pub user_id: String,
    pub name: String,
    pub provider: ProviderKind,
    pub region: String,
    pub model: String,
    pub bot_token: Option<String>,
}

/// Owns the instance state machine. Every status change goes through here.
#[derive(Clone)]
pub struct InstanceOrchestrator {
    store: Arc<dyn InstanceStore>,
    providers: ProviderSet,
    credentials: AiCredentials,
}

impl InstanceOrchestrator {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        providers: ProviderSet,
        credentials: AiCredentials,
    ) -> Self {
        Self {
            store,
            providers,
            credentials,
        }
    }

    /// Validates configuration, persists a CREATING record and returns its id. The
    /// provider call runs on a background task; its outcome lands in the store.
    pub fn provision_instance(&self, request: ProvisionRequest) -> Result<String, InstanceError> {
        self.spawn_provisioning(request).map(|(id, _)| id)
    }

    fn spawn_provisioning(
        &self,
        request: ProvisionRequest,
    ) -> Result<(String, JoinHandle<()>), InstanceError> {
        let ai_provider = resolve_ai_provider(&request.model);
        let ai_api_key = self
            .credentials
            .key_for(ai_provider)
            .ok_or_else(|| {
                InstanceError::Config(format!(
                    "{} is not configured; cannot provision a {} instance",
                    ai_provider.api_key_env(),
                    ai_provider
                ))
            })?
            .to_string();
        let provider = self.providers.provider_for(request.provider)?;

        let has_default = self
            .store
            .list_for_user(&request.user_id)
            .map_err(InstanceError::Store)?
            .iter()
            .any(|instance| instance.is_default && instance.status != InstanceStatus::Deleted);

        let id = uuid::Uuid::new_v4().to_string();
        let instance = self
            .store
            .create(NewInstance {
                id: id.clone(),
                user_id: request.user_id,
                name: request.name.clone(),
                provider: request.provider,
                region: request.region.clone(),
                model: request.model.clone(),
                ai_provider,
                bot_token: request.bot_token.clone(),
                status: InstanceStatus::Creating,
                is_default: !has_default,
            })
            .map_err(InstanceError::Store)?;
        info!(
            instance_id = %instance.id,
            provider = %instance.provider,
            ai_provider = %ai_provider,
            "instance accepted for provisioning"
        );

        let config = CreateInstanceConfig {
            instance_id: id.clone(),
            name: request.name,
            region: request.region,
            model: request.model,
            ai_provider,
            ai_api_key,
            bot_token: request.bot_token,
        };
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let instance_id = config.instance_id.clone();
            match this.run_provisioning(provider, config).await {
                Ok(()) => {}
                Err(err) => {
                    error!(instance_id = %instance_id, error = %err, "provisioning failed");
                    this.mark_failed(&instance_id);
                }
            }
        });
        Ok((id, handle))
    }

    async fn run_provisioning(
        &self,
        provider: Arc<dyn InstanceProvider>,
        config: CreateInstanceConfig,
    ) -> Result<(), InstanceError> {
        let id = config.instance_id.as_str();
        if self.load(id)?.status == InstanceStatus::Deleted {
            info!(instance_id = id, "instance deleted before provisioning started");
            return Ok(());
        }
        self.transition(id, InstanceStatus::Provisioning)?;

        let created = provider
            .create_instance(&config)
            .await
            .map_err(InstanceError::Provider)?;
        let handles = created.handles(provider.kind());

        let update = InstanceUpdate {
            handles: Some(handles.clone()),
            ip_address: Some(Some(created.ip_address)),
            ..InstanceUpdate::default()
        };
        if let Err(err) = self.apply_transition(id, InstanceStatus::Running, update) {
            // the record can no longer reach these resources
            if let Err(cleanup_err) = provider.delete_instance(&handles).await {
                warn!(instance_id = id, error = %cleanup_err, "failed to remove orphaned resources");
            }
            if matches!(self.load(id), Ok(current) if current.status == InstanceStatus::Deleted) {
                warn!(instance_id = id, "instance deleted during provisioning; removed new resources");
                return Ok(());
            }
            return Err(err);
        }
        info!(instance_id = id, "instance running");
        Ok(())
    }

    fn mark_failed(&self, id: &str) {
        let current = match self.load(id) {
            Ok(current) => current,
            Err(err) => {
                error!(instance_id = id, error = %err, "could not load instance to mark it failed");
                return;
            }
        };
        if !current.status.can_transition_to(InstanceStatus::Failed) {
            return;
        }
        if let Err(err) = self.store.update(
            id,
            InstanceUpdate::status(InstanceStatus::Failed).expecting(current.status),
        ) {
            error!(instance_id = id, error = %err, "could not mark instance failed");
        }
    }

    pub fn get_instance(&self, id: &str) -> Result<Instance, InstanceError> {
        self.load(id)
    }

    /// Fetches an instance on behalf of `user_id`. Other users' instances read as
    /// not found.
    pub fn get_owned_instance(&self, user_id: &str, id: &str) -> Result<Instance, InstanceError> {
        let instance = self.load(id)?;
        if instance.user_id != user_id {
            return Err(InstanceError::NotFound(id.to_string()));
        }
        Ok(instance)
    }

    pub fn list_instances(
        &self,
        user_id: &str,
        include_deleted: bool,
    ) -> Result<Vec<Instance>, InstanceError> {
        let instances = self
            .store
            .list_for_user(user_id)
            .map_err(InstanceError::Store)?;
        Ok(instances
            .into_iter()
            .filter(|instance| include_deleted || instance.status != InstanceStatus::Deleted)
            .collect())
    }

    pub async fn start_instance(&self, id: &str) -> Result<Instance, InstanceError> {
        let instance = self.load(id)?;
        if instance.status != InstanceStatus::Stopped {
            return Err(InstanceError::InvalidState(format!(
                "instance is {}; only STOPPED instances can be started",
                instance.status
            )));
        }
        let handles = complete_handles(&instance)?;
        let provider = self.providers.provider_for(instance.provider)?;

        self.transition(id, InstanceStatus::Starting)?;
        match provider.start_instance(&handles).await {
            Ok(()) => {
                info!(instance_id = id, "instance started");
                self.transition(id, InstanceStatus::Running)
            }
            Err(err) => {
                self.restore(id, InstanceStatus::Stopped);
                Err(InstanceError::Provider(err))
            }
        }
    }

    pub async fn stop_instance(&self, id: &str) -> Result<Instance, InstanceError> {
        let instance = self.load(id)?;
        if instance.status != InstanceStatus::Running {
            return Err(InstanceError::InvalidState(format!(
                "instance is {}; only RUNNING instances can be stopped",
                instance.status
            )));
        }
        let handles = complete_handles(&instance)?;
        let provider = self.providers.provider_for(instance.provider)?;

        self.transition(id, InstanceStatus::Stopping)?;
        match provider.stop_instance(&handles).await {
            Ok(()) => {
                info!(instance_id = id, "instance stopped");
                self.transition(id, InstanceStatus::Stopped)
            }
            Err(err) => {
                self.restore(id, InstanceStatus::Running);
                Err(InstanceError::Provider(err))
            }
        }
    }

    /// Puts a record back after a failed start or stop. Errors are logged only so the
    /// provider error reaches the caller.
    fn restore(&self, id: &str, status: InstanceStatus) {
        if let Err(err) = self.transition(id, status) {
            warn!(instance_id = id, error = %err, "could not restore instance status");
        }
    }

    /// Best-effort removal of provider resources followed by a soft delete. Provider
    /// failures never block the record from reaching DELETED.
    pub async fn delete_instance(&self, id: &str) -> Result<Instance, InstanceError> {
        for _ in 0..DELETE_ATTEMPTS {
            let instance = self.load(id)?;
            if instance.status == InstanceStatus::Deleted {
                return Ok(instance);
            }

            if let Some(handles) = instance.handles.as_ref().filter(|h| !h.is_empty()) {
                self.remove_resources(&instance, handles).await;
            }

            let update = InstanceUpdate {
                is_default: Some(false),
                ..InstanceUpdate::status(InstanceStatus::Deleted)
            }
            .expecting(instance.status);
            match self.store.update(id, update) {
                Ok(deleted) => {
                    info!(instance_id = id, "instance deleted");
                    return Ok(deleted);
                }
                Err(err) if err.downcast_ref::<StatusConflict>().is_some() => {
                    info!(instance_id = id, error = %err, "instance changed during delete; retrying");
                }
                Err(err) => return Err(InstanceError::Store(err)),
            }
        }
        Err(InstanceError::InvalidState(format!(
            "instance {id} kept changing state; delete not applied"
        )))
    }

    async fn remove_resources(&self, instance: &Instance, handles: &ProviderHandles) {
        match self.providers.provider_for(instance.provider) {
            Ok(provider) => {
                if let Err(err) = provider.delete_instance(handles).await {
                    warn!(instance_id = %instance.id, error = %err, "provider cleanup failed");
                }
            }
            Err(err) => {
                warn!(instance_id = %instance.id, error = %err, "provider cleanup skipped");
            }
        }
    }

    /// Live provider status. Never persisted.
    pub async fn live_status(&self, id: &str) -> Result<InstanceStatus, InstanceError> {
        let instance = self.load(id)?;
        if instance.status == InstanceStatus::Deleted {
            return Ok(InstanceStatus::Deleted);
        }
        let Some(handles) = instance.handles.as_ref() else {
            return Ok(InstanceStatus::Unknown);
        };
        match self.providers.provider_for(instance.provider) {
            Ok(provider) => Ok(provider.get_instance_status(handles).await),
            Err(_) => Ok(InstanceStatus::Unknown),
        }
    }

    /// Marks `id` as the user's default and clears the flag on their other instances.
    pub fn set_default_instance(&self, user_id: &str, id: &str) -> Result<Instance, InstanceError> {
        let target = self.get_owned_instance(user_id, id)?;
        if target.status == InstanceStatus::Deleted {
            return Err(InstanceError::InvalidState(
                "a deleted instance cannot be the default".to_string(),
            ));
        }
        for other in self.list_instances(user_id, true)? {
            if other.id != id && other.is_default {
                self.store
                    .update(&other.id, InstanceUpdate::is_default(false))
                    .map_err(InstanceError::Store)?;
            }
        }
        self.store
            .update(id, InstanceUpdate::is_default(true))
            .map_err(InstanceError::Store)
    }

    pub async fn send_message(
        &self,
        id: &str,
        session_id: &str,
        text: &str,
        timeout_secs: u64,
    ) -> Result<ChatReply, InstanceError> {
        let (instance, handles) = self.running_instance(id)?;
        let provider = self.providers.provider_for(instance.provider)?;
        provider
            .send_message(&handles, session_id, text, timeout_secs)
            .await
            .map_err(InstanceError::Provider)
    }

    pub async fn upload_file(
        &self,
        id: &str,
        bytes: &[u8],
        filename: &str,
    ) -> Result<UploadedFile, InstanceError> {
        let (instance, handles) = self.running_instance(id)?;
        let provider = self.providers.provider_for(instance.provider)?;
        let uploaded = provider
            .upload_file(&handles, bytes, filename)
            .await
            .map_err(InstanceError::Provider)?;
        info!(instance_id = id, path = %uploaded.path, bytes = bytes.len(), "file uploaded");
        Ok(uploaded)
    }

    /// Removes every instance of `user_id`, provider resources included, and hard
    /// deletes the records. Returns how many records were removed.
    pub async fn purge_user_instances(&self, user_id: &str) -> Result<usize, InstanceError> {
        let mut removed = 0;
        for instance in self.list_instances(user_id, true)? {
            if instance.status != InstanceStatus::Deleted {
                if let Some(handles) = instance.handles.as_ref().filter(|h| !h.is_empty()) {
                    self.remove_resources(&instance, handles).await;
                }
            }
            if self.store.delete(&instance.id).map_err(InstanceError::Store)? {
                removed += 1;
            }
        }
        info!(user_id, removed, "purged user instances");
        Ok(removed)
    }

    fn running_instance(&self, id: &str) -> Result<(Instance, ProviderHandles), InstanceError> {
        let instance = self.load(id)?;
        if instance.status != InstanceStatus::Running {
            return Err(InstanceError::InvalidState(format!(
                "instance is {}; it must be RUNNING",
                instance.status
            )));
        }
        let handles = complete_handles(&instance)?;
        Ok((instance, handles))
    }

    fn load(&self, id: &str) -> Result<Instance, InstanceError> {
        self.store
            .get(id)
            .map_err(InstanceError::Store)?
            .ok_or_else(|| InstanceError::NotFound(id.to_string()))
    }

    fn ensure_transition(&self, current: &Instance, next: InstanceStatus) -> Result<(), InstanceError> {
        if current.status.can_transition_to(next) {
            return Ok(());
        }
        Err(InstanceError::InvalidState(format!(
            "cannot move instance {} from {} to {}",
            current.id, current.status, next
        )))
    }

    fn transition(&self, id: &str, next: InstanceStatus) -> Result<Instance, InstanceError> {
        self.apply_transition(id, next, InstanceUpdate::default())
    }

    /// Writes `next` together with `update`, provided nobody moved the record since
    /// it was checked.
    fn apply_transition(
        &self,
        id: &str,
        next: InstanceStatus,
        update: InstanceUpdate,
    ) -> Result<Instance, InstanceError> {
        let current = self.load(id)?;
        self.ensure_transition(&current, next)?;
        let update = InstanceUpdate {
            status: Some(next),
            ..update
        }
        .expecting(current.status);
        self.store.update(id, update).map_err(store_error)
    }
}

fn store_error(err: anyhow::Error) -> InstanceError {
    match err.downcast_ref::<StatusConflict>() {
        Some(conflict) => InstanceError::InvalidState(conflict.to_string()),
        None => InstanceError::Store(err),
    }
}

fn complete_handles(instance: &Instance) -> Result<ProviderHandles, InstanceError> {
    match &instance.handles {
        Some(handles) if handles.is_complete() => Ok(handles.clone()),
        _ => Err(InstanceError::InvalidState(
            match instance.provider {
                ProviderKind::Fly => "no machine id or app name found",
                ProviderKind::Docker => "no container id found",
            }
            .to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::CreatedInstance;
    use crate::store::{EncryptedInstanceStore, MemoryInstanceStore};
    use agenthost_control_plane::AiProvider;
    use agenthost_vault::{is_sealed, Vault};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Calls {
        create: AtomicUsize,
        start: AtomicUsize,
        stop: AtomicUsize,
        delete: AtomicUsize,
    }

    struct MockProvider {
        kind: ProviderKind,
        calls: Calls,
        gate: Option<Arc<Notify>>,
        fail_create: bool,
        fail_start: bool,
        fail_delete: bool,
        seen_configs: Mutex<Vec<CreateInstanceConfig>>,
    }

    impl MockProvider {
        fn new(kind: ProviderKind) -> Self {
            Self {
                kind,
                calls: Calls::default(),
                gate: None,
                fail_create: false,
                fail_start: false,
                fail_delete: false,
                seen_configs: Mutex::new(Vec::new()),
            }
        }

        fn handles(&self) -> ProviderHandles {
            match self.kind {
                ProviderKind::Fly => ProviderHandles::Fly {
                    app_name: Some("agent-mock".to_string()),
                    machine_id: Some("m-mock".to_string()),
                },
                ProviderKind::Docker => ProviderHandles::Docker {
                    container_id: Some("c-mock".to_string()),
                    port: Some(49153),
                },
            }
        }
    }

    #[async_trait]
    impl InstanceProvider for MockProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn create_instance(
            &self,
            config: &CreateInstanceConfig,
        ) -> anyhow::Result<CreatedInstance> {
            self.calls.create.fetch_add(1, Ordering::SeqCst);
            self.seen_configs.lock().push(config.clone());
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail_create {
                anyhow::bail!("Fly API error: 422 Unprocessable Entity bad region");
            }
            Ok(match self.kind {
                ProviderKind::Fly => CreatedInstance {
                    provider_id: "m-mock".to_string(),
                    provider_app_id: Some("agent-mock".to_string()),
                    ip_address: "fdaa::9".to_string(),
                    port: None,
                },
                ProviderKind::Docker => CreatedInstance {
                    provider_id: "c-mock".to_string(),
                    provider_app_id: None,
                    ip_address: "127.0.0.1".to_string(),
                    port: Some(49153),
                },
            })
        }

        async fn start_instance(&self, _handles: &ProviderHandles) -> anyhow::Result<()> {
            self.calls.start.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                anyhow::bail!("Docker command failed: driver failed");
            }
            Ok(())
        }

        async fn stop_instance(&self, _handles: &ProviderHandles) -> anyhow::Result<()> {
            self.calls.stop.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn delete_instance(&self, _handles: &ProviderHandles) -> anyhow::Result<()> {
            self.calls.delete.fetch_add(1, Ordering::SeqCst);
            if self.fail_delete {
                anyhow::bail!("Fly API error: 500 Internal Server Error");
            }
            Ok(())
        }

        async fn get_instance_status(&self, _handles: &ProviderHandles) -> InstanceStatus {
            InstanceStatus::Stopped
        }

        async fn send_message(
            &self,
            _handles: &ProviderHandles,
            _session_id: &str,
            text: &str,
            _timeout_secs: u64,
        ) -> anyhow::Result<ChatReply> {
            Ok(ChatReply {
                response: format!("echo: {text}"),
            })
        }

        async fn upload_file(
            &self,
            _handles: &ProviderHandles,
            _bytes: &[u8],
            filename: &str,
        ) -> anyhow::Result<UploadedFile> {
            Ok(UploadedFile {
                path: format!("/tmp/agenthost-uploads/{filename}"),
            })
        }
    }

    fn credentials() -> AiCredentials {
        AiCredentials {
            openai: None,
            anthropic: Some("sk-ant".to_string()),
            google: Some("g-key".to_string()),
        }
    }

    fn orchestrator(provider: Arc<MockProvider>) -> (Arc<MemoryInstanceStore>, InstanceOrchestrator) {
        let store = Arc::new(MemoryInstanceStore::default());
        let orchestrator = InstanceOrchestrator::new(
            store.clone(),
            ProviderSet::default().with_provider(provider),
            credentials(),
        );
        (store, orchestrator)
    }

    fn request(provider: ProviderKind, model: &str) -> ProvisionRequest {
        ProvisionRequest {
            user_id: "u1".to_string(),
            name: "helper".to_string(),
            provider,
            region: "lax".to_string(),
            model: model.to_string(),
            bot_token: Some("123:abc".to_string()),
        }
    }

    /// Seeds a record directly in the store, bypassing provisioning.
    fn seed(
        store: &MemoryInstanceStore,
        status: InstanceStatus,
        handles: Option<ProviderHandles>,
    ) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        store
            .create(NewInstance {
                id: id.clone(),
                user_id: "u1".to_string(),
                name: "seeded".to_string(),
                provider: handles
                    .as_ref()
                    .map(ProviderHandles::kind)
                    .unwrap_or(ProviderKind::Docker),
                region: "local".to_string(),
                model: "claude-sonnet-4".to_string(),
                ai_provider: AiProvider::Anthropic,
                bot_token: None,
                status,
                is_default: false,
            })
            .unwrap();
        if let Some(handles) = handles {
            store
                .update(
                    &id,
                    InstanceUpdate {
                        handles: Some(handles),
                        ..InstanceUpdate::default()
                    },
                )
                .unwrap();
        }
        id
    }

    fn status_of(store: &MemoryInstanceStore, id: &str) -> InstanceStatus {
        store.get(id).unwrap().unwrap().status
    }

    #[tokio::test]
    async fn provision_returns_before_provider_finishes() {
        let gate = Arc::new(Notify::new());
        let mut mock = MockProvider::new(ProviderKind::Fly);
        mock.gate = Some(gate.clone());
        let mock = Arc::new(mock);
        let (store, orchestrator) = orchestrator(mock.clone());

        let (id, task) = orchestrator
            .spawn_provisioning(request(ProviderKind::Fly, "gemini-2.0-flash"))
            .unwrap();
        let record = store.get(&id).unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Creating);
        assert_eq!(record.ai_provider, AiProvider::Google);
        assert_eq!(record.handles, None);
        assert!(record.is_default);

        gate.notify_one();
        task.await.unwrap();

        let record = store.get(&id).unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Running);
        assert_eq!(
            record.handles,
            Some(ProviderHandles::Fly {
                app_name: Some("agent-mock".to_string()),
                machine_id: Some("m-mock".to_string()),
            })
        );
        assert_eq!(record.ip_address.as_deref(), Some("fdaa::9"));

        let configs = mock.seen_configs.lock();
        assert_eq!(configs[0].ai_api_key, "g-key");
        assert_eq!(configs[0].region, "lax");
        assert_eq!(configs[0].bot_token.as_deref(), Some("123:abc"));
    }

    #[tokio::test]
    async fn provider_failure_marks_instance_failed() {
        let mut mock = MockProvider::new(ProviderKind::Fly);
        mock.fail_create = true;
        let (store, orchestrator) = orchestrator(Arc::new(mock));

        let (id, task) = orchestrator
            .spawn_provisioning(request(ProviderKind::Fly, "claude-sonnet-4"))
            .unwrap();
        task.await.unwrap();

        let record = store.get(&id).unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Failed);
        assert_eq!(record.handles, None);
    }

    #[tokio::test]
    async fn missing_ai_credential_fails_before_any_side_effect() {
        let mock = Arc::new(MockProvider::new(ProviderKind::Fly));
        let (store, orchestrator) = orchestrator(mock.clone());

        let err = orchestrator
            .provision_instance(request(ProviderKind::Fly, "gpt-4o"))
            .unwrap_err();
        assert!(matches!(err, InstanceError::Config(_)));
        assert!(err.to_string().contains("OPENAI_API_KEY"));
        assert!(store.list_for_user("u1").unwrap().is_empty());
        assert_eq!(mock.calls.create.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unconfigured_provider_fails_before_any_side_effect() {
        let (store, orchestrator) = orchestrator(Arc::new(MockProvider::new(ProviderKind::Fly)));
        let err = orchestrator
            .provision_instance(request(ProviderKind::Docker, "claude-sonnet-4"))
            .unwrap_err();
        assert!(matches!(err, InstanceError::Config(_)));
        assert!(store.list_for_user("u1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_instance_is_not_default() {
        let (store, orchestrator) = orchestrator(Arc::new(MockProvider::new(ProviderKind::Docker)));
        let (first, task) = orchestrator
            .spawn_provisioning(request(ProviderKind::Docker, "claude-sonnet-4"))
            .unwrap();
        task.await.unwrap();
        let (second, task) = orchestrator
            .spawn_provisioning(request(ProviderKind::Docker, "claude-sonnet-4"))
            .unwrap();
        task.await.unwrap();

        assert!(store.get(&first).unwrap().unwrap().is_default);
        assert!(!store.get(&second).unwrap().unwrap().is_default);
    }

    #[tokio::test]
    async fn start_and_stop_reject_wrong_states_without_provider_calls() {
        let mock = Arc::new(MockProvider::new(ProviderKind::Docker));
        let (store, orchestrator) = orchestrator(mock.clone());
        let running = seed(&store, InstanceStatus::Running, Some(mock.handles()));
        let stopped = seed(&store, InstanceStatus::Stopped, Some(mock.handles()));

        let err = orchestrator.start_instance(&running).await.unwrap_err();
        assert!(matches!(err, InstanceError::InvalidState(_)));
        let err = orchestrator.stop_instance(&stopped).await.unwrap_err();
        assert!(matches!(err, InstanceError::InvalidState(_)));

        assert_eq!(mock.calls.start.load(Ordering::SeqCst), 0);
        assert_eq!(mock.calls.stop.load(Ordering::SeqCst), 0);
        assert_eq!(status_of(&store, &running), InstanceStatus::Running);
        assert_eq!(status_of(&store, &stopped), InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn stop_then_start_round_trips() {
        let mock = Arc::new(MockProvider::new(ProviderKind::Docker));
        let (store, orchestrator) = orchestrator(mock.clone());
        let id = seed(&store, InstanceStatus::Running, Some(mock.handles()));

        let stopped = orchestrator.stop_instance(&id).await.unwrap();
        assert_eq!(stopped.status, InstanceStatus::Stopped);
        let started = orchestrator.start_instance(&id).await.unwrap();
        assert_eq!(started.status, InstanceStatus::Running);
        assert_eq!(mock.calls.stop.load(Ordering::SeqCst), 1);
        assert_eq!(mock.calls.start.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_start_restores_stopped() {
        let mut mock = MockProvider::new(ProviderKind::Docker);
        mock.fail_start = true;
        let mock = Arc::new(mock);
        let (store, orchestrator) = orchestrator(mock.clone());
        let id = seed(&store, InstanceStatus::Stopped, Some(mock.handles()));

        let err = orchestrator.start_instance(&id).await.unwrap_err();
        assert!(matches!(err, InstanceError::Provider(_)));
        assert!(err.to_string().contains("driver failed"));
        assert_eq!(status_of(&store, &id), InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn start_with_incomplete_handles_is_rejected() {
        let mock = Arc::new(MockProvider::new(ProviderKind::Fly));
        let (store, orchestrator) = orchestrator(mock.clone());
        let id = seed(
            &store,
            InstanceStatus::Stopped,
            Some(ProviderHandles::Fly {
                app_name: Some("agent-x".to_string()),
                machine_id: None,
            }),
        );

        let err = orchestrator.start_instance(&id).await.unwrap_err();
        assert_eq!(err.to_string(), "no machine id or app name found");
        assert_eq!(mock.calls.start.load(Ordering::SeqCst), 0);
        assert_eq!(status_of(&store, &id), InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn delete_without_handles_skips_provider() {
        let mock = Arc::new(MockProvider::new(ProviderKind::Docker));
        let (store, orchestrator) = orchestrator(mock.clone());
        let id = seed(&store, InstanceStatus::Failed, None);

        let deleted = orchestrator.delete_instance(&id).await.unwrap();
        assert_eq!(deleted.status, InstanceStatus::Deleted);
        assert_eq!(mock.calls.delete.load(Ordering::SeqCst), 0);
        assert!(store.get(&id).unwrap().is_some());
    }

    #[tokio::test]
    async fn delete_survives_provider_errors() {
        let mut mock = MockProvider::new(ProviderKind::Fly);
        mock.fail_delete = true;
        let mock = Arc::new(mock);
        let (store, orchestrator) = orchestrator(mock.clone());
        let id = seed(&store, InstanceStatus::Running, Some(mock.handles()));

        let deleted = orchestrator.delete_instance(&id).await.unwrap();
        assert_eq!(deleted.status, InstanceStatus::Deleted);
        assert_eq!(mock.calls.delete.load(Ordering::SeqCst), 1);

        // second delete is a no-op
        orchestrator.delete_instance(&id).await.unwrap();
        assert_eq!(mock.calls.delete.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delete_during_provisioning_tears_down_new_resources() {
        let gate = Arc::new(Notify::new());
        let mut mock = MockProvider::new(ProviderKind::Fly);
        mock.gate = Some(gate.clone());
        let mock = Arc::new(mock);
        let (store, orchestrator) = orchestrator(mock.clone());

        let (id, task) = orchestrator
            .spawn_provisioning(request(ProviderKind::Fly, "claude-sonnet-4"))
            .unwrap();
        while mock.calls.create.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(status_of(&store, &id), InstanceStatus::Provisioning);

        orchestrator.delete_instance(&id).await.unwrap();
        assert_eq!(mock.calls.delete.load(Ordering::SeqCst), 0);

        gate.notify_one();
        task.await.unwrap();

        let record = store.get(&id).unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Deleted);
        assert_eq!(record.handles, None);
        assert_eq!(mock.calls.delete.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delete_before_task_runs_skips_provider_entirely() {
        let mock = Arc::new(MockProvider::new(ProviderKind::Fly));
        let (store, orchestrator) = orchestrator(mock.clone());

        let (id, task) = orchestrator
            .spawn_provisioning(request(ProviderKind::Fly, "claude-sonnet-4"))
            .unwrap();
        orchestrator.delete_instance(&id).await.unwrap();
        task.await.unwrap();

        assert_eq!(status_of(&store, &id), InstanceStatus::Deleted);
        assert_eq!(mock.calls.create.load(Ordering::SeqCst), 0);
    }

    enum Interference {
        RejectRunning,
        DeleteBeforeRunning,
        RunBeforeDelete(ProviderHandles),
    }

    /// Memory store that interferes once with a particular status write.
    struct InterferingStore {
        inner: MemoryInstanceStore,
        interference: Interference,
        fired: AtomicBool,
    }

    impl InterferingStore {
        fn new(interference: Interference) -> Self {
            Self {
                inner: MemoryInstanceStore::default(),
                interference,
                fired: AtomicBool::new(false),
            }
        }
    }

    impl InstanceStore for InterferingStore {
        fn get(&self, id: &str) -> anyhow::Result<Option<Instance>> {
            self.inner.get(id)
        }

        fn list_for_user(&self, user_id: &str) -> anyhow::Result<Vec<Instance>> {
            self.inner.list_for_user(user_id)
        }

        fn create(&self, new: NewInstance) -> anyhow::Result<Instance> {
            self.inner.create(new)
        }

        fn update(&self, id: &str, update: InstanceUpdate) -> anyhow::Result<Instance> {
            match &self.interference {
                Interference::RejectRunning if update.status == Some(InstanceStatus::Running) => {
                    anyhow::bail!("connection reset by peer");
                }
                Interference::DeleteBeforeRunning
                    if update.status == Some(InstanceStatus::Running)
                        && !self.fired.swap(true, Ordering::SeqCst) =>
                {
                    self.inner
                        .update(id, InstanceUpdate::status(InstanceStatus::Deleted))?;
                }
                Interference::RunBeforeDelete(handles)
                    if update.status == Some(InstanceStatus::Deleted)
                        && !self.fired.swap(true, Ordering::SeqCst) =>
                {
                    self.inner.update(
                        id,
                        InstanceUpdate {
                            handles: Some(handles.clone()),
                            ..InstanceUpdate::status(InstanceStatus::Running)
                        },
                    )?;
                }
                _ => {}
            }
            self.inner.update(id, update)
        }

        fn upsert(&self, instance: Instance) -> anyhow::Result<Instance> {
            self.inner.upsert(instance)
        }

        fn delete(&self, id: &str) -> anyhow::Result<bool> {
            self.inner.delete(id)
        }
    }

    fn interfering_orchestrator(
        provider: Arc<MockProvider>,
        interference: Interference,
    ) -> (Arc<InterferingStore>, InstanceOrchestrator) {
        let store = Arc::new(InterferingStore::new(interference));
        let orchestrator = InstanceOrchestrator::new(
            store.clone(),
            ProviderSet::default().with_provider(provider),
            credentials(),
        );
        (store, orchestrator)
    }

    #[tokio::test]
    async fn failed_running_write_removes_new_resources() {
        let mock = Arc::new(MockProvider::new(ProviderKind::Fly));
        let (store, orchestrator) =
            interfering_orchestrator(mock.clone(), Interference::RejectRunning);

        let (id, task) = orchestrator
            .spawn_provisioning(request(ProviderKind::Fly, "claude-sonnet-4"))
            .unwrap();
        task.await.unwrap();

        assert_eq!(mock.calls.create.load(Ordering::SeqCst), 1);
        assert_eq!(mock.calls.delete.load(Ordering::SeqCst), 1);
        let record = store.get(&id).unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Failed);
        assert_eq!(record.handles, None);
    }

    #[tokio::test]
    async fn delete_racing_the_running_write_stays_deleted() {
        let mock = Arc::new(MockProvider::new(ProviderKind::Fly));
        let (store, orchestrator) =
            interfering_orchestrator(mock.clone(), Interference::DeleteBeforeRunning);

        let (id, task) = orchestrator
            .spawn_provisioning(request(ProviderKind::Fly, "claude-sonnet-4"))
            .unwrap();
        task.await.unwrap();

        let record = store.get(&id).unwrap().unwrap();
        assert_eq!(record.status, InstanceStatus::Deleted);
        assert_eq!(record.handles, None);
        assert_eq!(mock.calls.delete.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn delete_retries_when_provisioning_lands_first() {
        let mock = Arc::new(MockProvider::new(ProviderKind::Docker));
        let (store, orchestrator) = interfering_orchestrator(
            mock.clone(),
            Interference::RunBeforeDelete(mock.handles()),
        );
        let id = seed(&store.inner, InstanceStatus::Provisioning, None);

        let deleted = orchestrator.delete_instance(&id).await.unwrap();
        assert_eq!(deleted.status, InstanceStatus::Deleted);
        assert_eq!(deleted.handles, Some(mock.handles()));
        assert_eq!(mock.calls.delete.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn live_status_reads_provider_without_persisting() {
        let mock = Arc::new(MockProvider::new(ProviderKind::Docker));
        let (store, orchestrator) = orchestrator(mock.clone());
        let id = seed(&store, InstanceStatus::Running, Some(mock.handles()));
        let bare = seed(&store, InstanceStatus::Creating, None);

        assert_eq!(orchestrator.live_status(&id).await.unwrap(), InstanceStatus::Stopped);
        assert_eq!(status_of(&store, &id), InstanceStatus::Running);
        assert_eq!(orchestrator.live_status(&bare).await.unwrap(), InstanceStatus::Unknown);
    }

    #[tokio::test]
    async fn set_default_moves_the_flag() {
        let mock = Arc::new(MockProvider::new(ProviderKind::Docker));
        let (store, orchestrator) = orchestrator(mock.clone());
        let first = seed(&store, InstanceStatus::Running, Some(mock.handles()));
        let second = seed(&store, InstanceStatus::Stopped, Some(mock.handles()));
        orchestrator.set_default_instance("u1", &first).unwrap();

        orchestrator.set_default_instance("u1", &second).unwrap();
        assert!(!store.get(&first).unwrap().unwrap().is_default);
        assert!(store.get(&second).unwrap().unwrap().is_default);

        let err = orchestrator.set_default_instance("someone-else", &first).unwrap_err();
        assert!(matches!(err, InstanceError::NotFound(_)));
    }

    #[tokio::test]
    async fn chat_and_upload_require_running() {
        let mock = Arc::new(MockProvider::new(ProviderKind::Docker));
        let (store, orchestrator) = orchestrator(mock.clone());
        let running = seed(&store, InstanceStatus::Running, Some(mock.handles()));
        let stopped = seed(&store, InstanceStatus::Stopped, Some(mock.handles()));

        let reply = orchestrator.send_message(&running, "main", "hi", 60).await.unwrap();
        assert_eq!(reply.response, "echo: hi");
        let uploaded = orchestrator.upload_file(&running, b"data", "a.txt").await.unwrap();
        assert_eq!(uploaded.path, "/tmp/agenthost-uploads/a.txt");

        let err = orchestrator.send_message(&stopped, "main", "hi", 60).await.unwrap_err();
        assert!(matches!(err, InstanceError::InvalidState(_)));
        let err = orchestrator.upload_file(&stopped, b"data", "a.txt").await.unwrap_err();
        assert!(matches!(err, InstanceError::InvalidState(_)));
    }

    #[tokio::test]
    async fn purge_removes_records_and_live_resources() {
        let mock = Arc::new(MockProvider::new(ProviderKind::Docker));
        let (store, orchestrator) = orchestrator(mock.clone());
        seed(&store, InstanceStatus::Running, Some(mock.handles()));
        seed(&store, InstanceStatus::Failed, None);
        let gone = seed(&store, InstanceStatus::Running, Some(mock.handles()));
        orchestrator.delete_instance(&gone).await.unwrap();
        assert_eq!(mock.calls.delete.load(Ordering::SeqCst), 1);

        let removed = orchestrator.purge_user_instances("u1").await.unwrap();
        assert_eq!(removed, 3);
        assert_eq!(mock.calls.delete.load(Ordering::SeqCst), 2);
        assert!(store.list_for_user("u1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn bot_token_is_sealed_in_store_but_plain_for_provider() {
        let raw = Arc::new(MemoryInstanceStore::default());
        let vault = Arc::new(Vault::new(Some("orchestrator-key")).unwrap());
        let mock = Arc::new(MockProvider::new(ProviderKind::Docker));
        let orchestrator = InstanceOrchestrator::new(
            Arc::new(EncryptedInstanceStore::new(raw.clone(), vault)),
            ProviderSet::default().with_provider(mock.clone()),
            credentials(),
        );

        let (id, task) = orchestrator
            .spawn_provisioning(request(ProviderKind::Docker, "claude-sonnet-4"))
            .unwrap();
        task.await.unwrap();

        let at_rest = raw.get(&id).unwrap().unwrap();
        assert!(is_sealed(at_rest.bot_token.as_deref().unwrap()));
        assert_eq!(
            orchestrator.get_instance(&id).unwrap().bot_token.as_deref(),
            Some("123:abc")
        );
        assert_eq!(
            mock.seen_configs.lock()[0].bot_token.as_deref(),
            Some("123:abc")
        );
    }
}
