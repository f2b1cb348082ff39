use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unknown provider kind: {0}")]
    ProviderKind(String),
    #[error("unknown ai provider: {0}")]
    AiProvider(String),
    #[error("unknown instance status: {0}")]
    Status(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{handles} handles cannot be attached to a {provider} instance")]
pub struct HandleMismatch {
    pub provider: ProviderKind,
    pub handles: ProviderKind,
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Fly,
    Docker,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fly => "fly",
            Self::Docker => "docker",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fly" => Ok(Self::Fly),
            "docker" => Ok(Self::Docker),
            other => Err(ParseError::ProviderKind(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AiProvider {
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
    Google,
}

impl AiProvider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Google => "google",
        }
    }

    /// Environment variable the agent inside the compute unit reads its key from.
    pub fn api_key_env(self) -> &'static str {
        match self {
            Self::OpenAi => "OPENAI_API_KEY",
            Self::Anthropic => "ANTHROPIC_API_KEY",
            Self::Google => "GEMINI_API_KEY",
        }
    }
}

impl fmt::Display for AiProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AiProvider {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "openai" => Ok(Self::OpenAi),
            "anthropic" => Ok(Self::Anthropic),
            "google" => Ok(Self::Google),
            other => Err(ParseError::AiProvider(other.to_string())),
        }
    }
}

const OPENAI_MODEL_PREFIXES: &[&str] = &["gpt-", "o1-", "o3-", "o4-", "chatgpt-"];

/// Model family for a model identifier. Unrecognized prefixes fall back to Anthropic.
pub fn resolve_ai_provider(model: &str) -> AiProvider {
    let model = model.trim().to_ascii_lowercase();
    if OPENAI_MODEL_PREFIXES
        .iter()
        .any(|prefix| model.starts_with(prefix))
    {
        return AiProvider::OpenAi;
    }
    if model.starts_with("gemini-") {
        return AiProvider::Google;
    }
    AiProvider::Anthropic
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Creating,
    Provisioning,
    Running,
    Starting,
    Stopping,
    Stopped,
    Failed,
    Deleted,
    Unknown,
}

impl InstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Creating => "CREATING",
            Self::Provisioning => "PROVISIONING",
            Self::Running => "RUNNING",
            Self::Starting => "STARTING",
            Self::Stopping => "STOPPING",
            Self::Stopped => "STOPPED",
            Self::Failed => "FAILED",
            Self::Deleted => "DELETED",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Whether a stored record may move from `self` to `next`.
    ///
    /// UNKNOWN is a read-time value and is never a valid target. STARTING -> STOPPED
    /// and STOPPING -> RUNNING exist so a failed start/stop can restore the prior state.
    pub fn can_transition_to(self, next: InstanceStatus) -> bool {
        use InstanceStatus::*;
        if next == Unknown || self == Deleted {
            return false;
        }
        if next == Deleted {
            return true;
        }
        matches!(
            (self, next),
            (Creating, Provisioning)
                | (Creating, Failed)
                | (Provisioning, Running)
                | (Provisioning, Failed)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Stopping, Running)
                | (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InstanceStatus {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATING" => Ok(Self::Creating),
            "PROVISIONING" => Ok(Self::Provisioning),
            "RUNNING" => Ok(Self::Running),
            "STARTING" => Ok(Self::Starting),
            "STOPPING" => Ok(Self::Stopping),
            "STOPPED" => Ok(Self::Stopped),
            "FAILED" => Ok(Self::Failed),
            "DELETED" => Ok(Self::Deleted),
            "UNKNOWN" => Ok(Self::Unknown),
            other => Err(ParseError::Status(other.to_string())),
        }
    }
}

pub fn map_fly_state(state: &str) -> InstanceStatus {
    match state {
        "started" => InstanceStatus::Running,
        "starting" => InstanceStatus::Starting,
        "stopping" => InstanceStatus::Stopping,
        "stopped" | "suspended" => InstanceStatus::Stopped,
        "destroyed" => InstanceStatus::Deleted,
        "created" | "replacing" => InstanceStatus::Creating,
        _ => InstanceStatus::Unknown,
    }
}

pub fn map_docker_state(state: &str) -> InstanceStatus {
    match state {
        "running" => InstanceStatus::Running,
        "created" | "restarting" => InstanceStatus::Starting,
        "paused" | "exited" | "dead" => InstanceStatus::Stopped,
        "removing" => InstanceStatus::Stopping,
        "removed" => InstanceStatus::Deleted,
        _ => InstanceStatus::Unknown,
    }
}

/// Identifiers addressing an existing compute unit. Inner fields are optional so a
/// partially created unit (app created, machine not yet) stays representable.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderHandles {
    Fly {
        #[serde(skip_serializing_if = "Option::is_none")]
        app_name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        machine_id: Option<String>,
    },
    Docker {
        #[serde(skip_serializing_if = "Option::is_none")]
        container_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },
}

impl ProviderHandles {
    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Fly { .. } => ProviderKind::Fly,
            Self::Docker { .. } => ProviderKind::Docker,
        }
    }

    /// Every identifier needed to start, stop or exec is present.
    pub fn is_complete(&self) -> bool {
        match self {
            Self::Fly {
                app_name,
                machine_id,
            } => app_name.is_some() && machine_id.is_some(),
            Self::Docker { container_id, .. } => container_id.is_some(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Fly {
                app_name,
                machine_id,
            } => app_name.is_none() && machine_id.is_none(),
            Self::Docker { container_id, port } => container_id.is_none() && port.is_none(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Instance {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub provider: ProviderKind,
    pub region: String,
    pub model: String,
    pub ai_provider: AiProvider,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bot_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handles: Option<ProviderHandles>,
    pub status: InstanceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Instance {
    pub fn from_new(new: NewInstance, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id,
            user_id: new.user_id,
            name: new.name,
            provider: new.provider,
            region: new.region,
            model: new.model,
            ai_provider: new.ai_provider,
            bot_token: new.bot_token,
            handles: None,
            status: new.status,
            ip_address: None,
            is_default: new.is_default,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn set_handles(&mut self, handles: ProviderHandles) -> Result<(), HandleMismatch> {
        if handles.kind() != self.provider {
            return Err(HandleMismatch {
                provider: self.provider,
                handles: handles.kind(),
            });
        }
        self.handles = Some(handles);
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NewInstance {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub provider: ProviderKind,
    pub region: String,
    pub model: String,
    pub ai_provider: AiProvider,
    pub bot_token: Option<String>,
    pub status: InstanceStatus,
    pub is_default: bool,
}
