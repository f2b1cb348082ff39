use anyhow::Context;
use agenthost_control_plane::AiProvider;

pub const DEFAULT_FLY_API_BASE_URL: &str = "https://api.machines.dev";
pub const DEFAULT_AGENT_IMAGE: &str = "ghcr.io/openclaw/openclaw:latest";
pub const DEFAULT_AGENT_CLI: &str = "openclaw";
/// Port the agent gateway listens on inside the compute unit.
pub const AGENT_GATEWAY_PORT: u16 = 18789;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub port: u16,
    pub encryption_key: Option<String>,
    pub credentials: AiCredentials,
    pub fly: Option<FlyConfig>,
    pub docker: DockerConfig,
    pub agent_cli: String,
}

#[derive(Clone, Default)]
pub struct AiCredentials {
    pub openai: Option<String>,
    pub anthropic: Option<String>,
    pub google: Option<String>,
}

impl AiCredentials {
    pub fn key_for(&self, provider: AiProvider) -> Option<&str> {
        match provider {
            AiProvider::OpenAi => self.openai.as_deref(),
            AiProvider::Anthropic => self.anthropic.as_deref(),
            AiProvider::Google => self.google.as_deref(),
        }
    }
}

impl std::fmt::Debug for AiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiCredentials")
            .field("openai", &self.openai.is_some())
            .field("anthropic", &self.anthropic.is_some())
            .field("google", &self.google.is_some())
            .finish()
    }
}

#[derive(Clone)]
pub struct FlyConfig {
    pub api_token: String,
    pub api_base_url: String,
    pub org_slug: String,
    pub image: String,
    pub cpus: u32,
    pub memory_mb: u32,
}

impl std::fmt::Debug for FlyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlyConfig")
            .field("api_token", &"[REDACTED]")
            .field("api_base_url", &self.api_base_url)
            .field("org_slug", &self.org_slug)
            .field("image", &self.image)
            .field("cpus", &self.cpus)
            .field("memory_mb", &self.memory_mb)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct DockerConfig {
    pub bin: String,
    pub image: String,
    pub bind_host: String,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let port = std::env::var("AGENTHOST_PORT")
            .ok()
            .map(|p| p.trim().parse::<u16>())
            .transpose()
            .context("AGENTHOST_PORT must be a port number")?
            .unwrap_or(8080);

        let fly = match non_empty_env("FLY_API_TOKEN") {
            Some(api_token) => Some(FlyConfig {
                api_token,
                api_base_url: optional_non_empty_env("FLY_API_BASE_URL", DEFAULT_FLY_API_BASE_URL),
                org_slug: optional_non_empty_env("FLY_ORG_SLUG", "personal"),
                image: optional_non_empty_env("FLY_AGENT_IMAGE", DEFAULT_AGENT_IMAGE),
                cpus: env_u32("FLY_AGENT_CPUS")?.unwrap_or(1),
                memory_mb: env_u32("FLY_AGENT_MEMORY_MB")?.unwrap_or(2048),
            }),
            None => None,
        };

        Ok(Self {
            database_url: non_empty_env("DATABASE_URL"),
            port,
            encryption_key: non_empty_env("ENCRYPTION_KEY"),
            credentials: AiCredentials {
                openai: non_empty_env("OPENAI_API_KEY"),
                anthropic: non_empty_env("ANTHROPIC_API_KEY"),
                google: non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY")),
            },
            fly,
            docker: DockerConfig {
                bin: optional_non_empty_env("DOCKER_BIN", "docker"),
                image: optional_non_empty_env("DOCKER_AGENT_IMAGE", DEFAULT_AGENT_IMAGE),
                bind_host: optional_non_empty_env("DOCKER_BIND_HOST", "127.0.0.1"),
            },
            agent_cli: optional_non_empty_env("AGENT_CLI_BIN", DEFAULT_AGENT_CLI),
        })
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn optional_non_empty_env(key: &str, default: &str) -> String {
    non_empty_env(key).unwrap_or_else(|| default.to_string())
}

fn env_u32(key: &str) -> anyhow::Result<Option<u32>> {
    non_empty_env(key)
        .map(|raw| {
            raw.parse::<u32>()
                .with_context(|| format!("{key} must be a positive integer"))
        })
        .transpose()
}
