use std::collections::BTreeMap;
use std::sync::Arc;

use agenthost_control_plane::{AiProvider, InstanceStatus, ProviderHandles, ProviderKind};
use async_trait::async_trait;

use crate::agent_clients::docker::DockerClient;
use crate::agent_clients::fly_machines::FlyClient;
use crate::bridge::{ChatReply, UploadedFile};
use crate::config::AppConfig;
use crate::error::InstanceError;

/// Everything a provider needs to allocate a compute unit for one instance.
#[derive(Clone)]
pub struct CreateInstanceConfig {
    pub instance_id: String,
    pub name: String,
    pub region: String,
    pub model: String,
    pub ai_provider: AiProvider,
    pub ai_api_key: String,
    pub bot_token: Option<String>,
}

impl CreateInstanceConfig {
    /// Environment handed to the agent process inside the compute unit.
    pub fn agent_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        env.insert("AGENTHOST_INSTANCE_ID".to_string(), self.instance_id.clone());
        env.insert("AGENT_MODEL".to_string(), self.model.clone());
        env.insert("AGENT_AI_PROVIDER".to_string(), self.ai_provider.to_string());
        env.insert(
            self.ai_provider.api_key_env().to_string(),
            self.ai_api_key.clone(),
        );
        if let Some(token) = &self.bot_token {
            env.insert("TELEGRAM_BOT_TOKEN".to_string(), token.clone());
        }
        env
    }
}

impl std::fmt::Debug for CreateInstanceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreateInstanceConfig")
            .field("instance_id", &self.instance_id)
            .field("name", &self.name)
            .field("region", &self.region)
            .field("model", &self.model)
            .field("ai_provider", &self.ai_provider)
            .field("bot_token", &self.bot_token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreatedInstance {
    pub provider_id: String,
    pub provider_app_id: Option<String>,
    pub ip_address: String,
    pub port: Option<u16>,
}

impl CreatedInstance {
    pub fn handles(&self, kind: ProviderKind) -> ProviderHandles {
        match kind {
            ProviderKind::Fly => ProviderHandles::Fly {
                app_name: self.provider_app_id.clone(),
                machine_id: Some(self.provider_id.clone()),
            },
            ProviderKind::Docker => ProviderHandles::Docker {
                container_id: Some(self.provider_id.clone()),
                port: self.port,
            },
        }
    }
}

/// Lifecycle contract shared by every compute backend.
#[async_trait]
pub trait InstanceProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Allocates a compute unit. Performs real side effects on every call.
    async fn create_instance(&self, config: &CreateInstanceConfig)
        -> anyhow::Result<CreatedInstance>;

    async fn start_instance(&self, handles: &ProviderHandles) -> anyhow::Result<()>;

    async fn stop_instance(&self, handles: &ProviderHandles) -> anyhow::Result<()>;

    /// Removes whatever exists for `handles`; missing handles and already-removed
    /// resources are not errors.
    async fn delete_instance(&self, handles: &ProviderHandles) -> anyhow::Result<()>;

    /// Never fails: missing handles, unknown states and transport errors read as UNKNOWN.
    async fn get_instance_status(&self, handles: &ProviderHandles) -> InstanceStatus;

    async fn send_message(
        &self,
        handles: &ProviderHandles,
        session_id: &str,
        text: &str,
        timeout_secs: u64,
    ) -> anyhow::Result<ChatReply>;

    async fn upload_file(
        &self,
        handles: &ProviderHandles,
        bytes: &[u8],
        filename: &str,
    ) -> anyhow::Result<UploadedFile>;
}

/// Provider clients keyed by kind, built once at startup.
#[derive(Clone, Default)]
pub struct ProviderSet {
    fly: Option<Arc<dyn InstanceProvider>>,
    docker: Option<Arc<dyn InstanceProvider>>,
}

impl ProviderSet {
    pub fn from_config(config: &AppConfig) -> Self {
        let mut set = Self::default();
        if let Some(fly) = &config.fly {
            set = set.with_provider(Arc::new(FlyClient::new(fly, &config.agent_cli)));
        }
        set.with_provider(Arc::new(DockerClient::new(
            &config.docker,
            &config.agent_cli,
        )))
    }

    pub fn with_provider(mut self, provider: Arc<dyn InstanceProvider>) -> Self {
        match provider.kind() {
            ProviderKind::Fly => self.fly = Some(provider),
            ProviderKind::Docker => self.docker = Some(provider),
        }
        self
    }

    pub fn provider_for(
        &self,
        kind: ProviderKind,
    ) -> Result<Arc<dyn InstanceProvider>, InstanceError> {
        let provider = match kind {
            ProviderKind::Fly => self.fly.clone(),
            ProviderKind::Docker => self.docker.clone(),
        };
        provider.ok_or_else(|| {
            InstanceError::Config(format!("provider {kind} is not configured on this server"))
        })
    }
}
