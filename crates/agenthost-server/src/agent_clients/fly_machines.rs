use std::collections::BTreeMap;
use std::time::Duration;

use agenthost_control_plane::{map_fly_state, InstanceStatus, ProviderHandles, ProviderKind};
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bridge::{self, ChatReply, ExecOutput, ExecTransport, UploadedFile, EXEC_GRACE};
use crate::config::{FlyConfig, AGENT_GATEWAY_PORT};
use crate::provider::{CreateInstanceConfig, CreatedInstance, InstanceProvider};

/// Fly rejects exec requests whose command exceeds this many bytes.
const EXEC_MAX_ARG_BYTES: usize = 128 * 1024;
const MACHINE_WAIT_TIMEOUT_SECS: u64 = 60;

pub struct FlyClient {
    client: reqwest::Client,
    api_token: String,
    api_base_url: String,
    org_slug: String,
    image: String,
    cpus: u32,
    memory_mb: u32,
    agent_cli: String,
    exec_grace: Duration,
}

#[derive(Debug, Serialize)]
struct CreateAppRequest<'a> {
    app_name: &'a str,
    org_slug: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateMachineRequest {
    name: String,
    region: String,
    config: MachineConfig,
}

#[derive(Debug, Serialize)]
struct MachineConfig {
    image: String,
    env: BTreeMap<String, String>,
    guest: GuestConfig,
    services: Vec<MachineService>,
    restart: RestartPolicy,
}

#[derive(Debug, Serialize)]
struct GuestConfig {
    cpu_kind: String,
    cpus: u32,
    memory_mb: u32,
}

#[derive(Debug, Serialize)]
struct MachineService {
    protocol: String,
    internal_port: u16,
    ports: Vec<ServicePort>,
}

#[derive(Debug, Serialize)]
struct ServicePort {
    port: u16,
    handlers: Vec<String>,
}

#[derive(Debug, Serialize)]
struct RestartPolicy {
    policy: String,
}

#[derive(Debug, Serialize)]
struct ExecRequest<'a> {
    command: &'a [String],
    timeout: u64,
}

#[derive(Debug, Deserialize)]
pub struct Machine {
    pub id: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub private_ip: Option<String>,
}

/// Fly app name for an instance: `agent-` plus the first 12 hex digits of its id.
pub fn app_name_for(instance_id: &str) -> String {
    let hex: String = instance_id
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .take(12)
        .collect::<String>()
        .to_ascii_lowercase();
    format!("agent-{hex}")
}

impl FlyClient {
    pub fn new(config: &FlyConfig, agent_cli: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_token: config.api_token.clone(),
            api_base_url: config.api_base_url.clone(),
            org_slug: config.org_slug.clone(),
            image: config.image.clone(),
            cpus: config.cpus,
            memory_mb: config.memory_mb,
            agent_cli: agent_cli.to_string(),
            exec_grace: EXEC_GRACE,
        }
    }

    fn apps_url(&self) -> String {
        format!("{}/v1/apps", self.api_base_url.trim_end_matches('/'))
    }

    fn machines_url(&self, app_name: &str) -> String {
        format!("{}/{app_name}/machines", self.apps_url())
    }

    pub async fn create_app(&self, app_name: &str) -> anyhow::Result<()> {
        let body = CreateAppRequest {
            app_name,
            org_slug: &self.org_slug,
        };
        let resp = self
            .client
            .post(self.apps_url())
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await
            .context("send create app request")?;
        check_status(resp).await?;
        Ok(())
    }

    pub async fn create_machine(
        &self,
        app_name: &str,
        region: &str,
        env: BTreeMap<String, String>,
    ) -> anyhow::Result<Machine> {
        let body = CreateMachineRequest {
            name: app_name.to_string(),
            region: region.to_string(),
            config: MachineConfig {
                image: self.image.clone(),
                env,
                guest: GuestConfig {
                    cpu_kind: "shared".to_string(),
                    cpus: self.cpus,
                    memory_mb: self.memory_mb,
                },
                services: vec![MachineService {
                    protocol: "tcp".to_string(),
                    internal_port: AGENT_GATEWAY_PORT,
                    ports: vec![ServicePort {
                        port: 443,
                        handlers: vec!["tls".to_string(), "http".to_string()],
                    }],
                }],
                restart: RestartPolicy {
                    policy: "always".to_string(),
                },
            },
        };

        let resp = self
            .client
            .post(self.machines_url(app_name))
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await
            .context("send create machine request")?;
        check_status(resp)
            .await?
            .json()
            .await
            .context("decode create machine response")
    }

    pub async fn wait_for_state(
        &self,
        app_name: &str,
        machine_id: &str,
        state: &str,
    ) -> anyhow::Result<()> {
        let url = format!(
            "{}/{machine_id}/wait?state={state}&timeout={MACHINE_WAIT_TIMEOUT_SECS}",
            self.machines_url(app_name)
        );
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.api_token)
            .timeout(Duration::from_secs(MACHINE_WAIT_TIMEOUT_SECS + 15))
            .send()
            .await
            .context("send wait machine request")?;
        check_status(resp).await?;
        Ok(())
    }

    pub async fn get_machine(&self, app_name: &str, machine_id: &str) -> anyhow::Result<Machine> {
        let url = format!("{}/{machine_id}", self.machines_url(app_name));
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .context("send get machine request")?;
        check_status(resp)
            .await?
            .json()
            .await
            .context("decode get machine response")
    }

    pub async fn start_machine(&self, app_name: &str, machine_id: &str) -> anyhow::Result<()> {
        self.machine_action(app_name, machine_id, "start").await
    }

    pub async fn stop_machine(&self, app_name: &str, machine_id: &str) -> anyhow::Result<()> {
        self.machine_action(app_name, machine_id, "stop").await
    }

    async fn machine_action(
        &self,
        app_name: &str,
        machine_id: &str,
        action: &str,
    ) -> anyhow::Result<()> {
        let url = format!("{}/{machine_id}/{action}", self.machines_url(app_name));
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .with_context(|| format!("send {action} machine request"))?;
        check_status(resp).await?;
        Ok(())
    }

    /// Returns false when the machine was already gone.
    pub async fn delete_machine(&self, app_name: &str, machine_id: &str) -> anyhow::Result<bool> {
        let url = format!("{}/{machine_id}?force=true", self.machines_url(app_name));
        let resp = self
            .client
            .delete(url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .context("send delete machine request")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_status(resp).await?;
        Ok(true)
    }

    /// Returns false when the app was already gone.
    pub async fn delete_app(&self, app_name: &str) -> anyhow::Result<bool> {
        let url = format!("{}/{app_name}", self.apps_url());
        let resp = self
            .client
            .delete(url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .context("send delete app request")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check_status(resp).await?;
        Ok(true)
    }

    pub async fn exec_machine(
        &self,
        app_name: &str,
        machine_id: &str,
        argv: &[String],
        timeout: Duration,
    ) -> anyhow::Result<ExecOutput> {
        let url = format!("{}/{machine_id}/exec", self.machines_url(app_name));
        let body = ExecRequest {
            command: argv,
            timeout: timeout.as_secs(),
        };
        let limit = timeout + self.exec_grace;
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.api_token)
            .timeout(limit)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    anyhow::anyhow!("Fly exec timed out after {}s", limit.as_secs())
                } else {
                    anyhow::Error::new(err).context("send exec request")
                }
            })?;
        check_status(resp)
            .await?
            .json()
            .await
            .context("decode exec response")
    }
}

async fn check_status(resp: reqwest::Response) -> anyhow::Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    anyhow::bail!("Fly API error: {status} {text}");
}

fn machine_handles(handles: &ProviderHandles) -> anyhow::Result<(&str, &str)> {
    match handles {
        ProviderHandles::Fly {
            app_name: Some(app_name),
            machine_id: Some(machine_id),
        } => Ok((app_name, machine_id)),
        ProviderHandles::Fly { .. } => anyhow::bail!("no machine id or app name found"),
        other => anyhow::bail!("Fly provider cannot use {} handles", other.kind()),
    }
}

#[async_trait]
impl InstanceProvider for FlyClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Fly
    }

    async fn create_instance(
        &self,
        config: &CreateInstanceConfig,
    ) -> anyhow::Result<CreatedInstance> {
        let app_name = app_name_for(&config.instance_id);
        self.create_app(&app_name).await?;

        let machine = match self
            .create_machine(&app_name, &config.region, config.agent_env())
            .await
        {
            Ok(machine) => machine,
            Err(err) => {
                if let Err(cleanup_err) = self.delete_app(&app_name).await {
                    warn!(app_name = %app_name, error = %cleanup_err, "failed to remove app after machine creation failed");
                }
                return Err(err);
            }
        };

        if let Err(err) = self.wait_for_state(&app_name, &machine.id, "started").await {
            warn!(app_name = %app_name, machine_id = %machine.id, error = %err, "machine did not report started in time");
        }

        let ip_address = machine
            .private_ip
            .filter(|ip| !ip.trim().is_empty())
            .unwrap_or_else(|| format!("{app_name}.fly.dev"));
        info!(app_name = %app_name, machine_id = %machine.id, region = %config.region, "created fly machine");

        Ok(CreatedInstance {
            provider_id: machine.id,
            provider_app_id: Some(app_name),
            ip_address,
            port: None,
        })
    }

    async fn start_instance(&self, handles: &ProviderHandles) -> anyhow::Result<()> {
        let (app_name, machine_id) = machine_handles(handles)?;
        self.start_machine(app_name, machine_id).await
    }

    async fn stop_instance(&self, handles: &ProviderHandles) -> anyhow::Result<()> {
        let (app_name, machine_id) = machine_handles(handles)?;
        self.stop_machine(app_name, machine_id).await
    }

    async fn delete_instance(&self, handles: &ProviderHandles) -> anyhow::Result<()> {
        let ProviderHandles::Fly {
            app_name,
            machine_id,
        } = handles
        else {
            anyhow::bail!("Fly provider cannot use {} handles", handles.kind());
        };
        let Some(app_name) = app_name else {
            if machine_id.is_some() {
                warn!("machine id recorded without app name; nothing addressable to delete");
            }
            return Ok(());
        };

        if let Some(machine_id) = machine_id {
            if !self.delete_machine(app_name, machine_id).await? {
                debug!(app_name = %app_name, machine_id = %machine_id, "machine already deleted");
            }
        }
        if !self.delete_app(app_name).await? {
            debug!(app_name = %app_name, "app already deleted");
        }
        Ok(())
    }

    async fn get_instance_status(&self, handles: &ProviderHandles) -> InstanceStatus {
        let Ok((app_name, machine_id)) = machine_handles(handles) else {
            return InstanceStatus::Unknown;
        };
        match self.get_machine(app_name, machine_id).await {
            Ok(machine) => map_fly_state(&machine.state),
            Err(err) => {
                warn!(app_name, machine_id, error = %err, "failed to read machine state");
                InstanceStatus::Unknown
            }
        }
    }

    async fn send_message(
        &self,
        handles: &ProviderHandles,
        session_id: &str,
        text: &str,
        timeout_secs: u64,
    ) -> anyhow::Result<ChatReply> {
        bridge::send_message(self, &self.agent_cli, handles, session_id, text, timeout_secs).await
    }

    async fn upload_file(
        &self,
        handles: &ProviderHandles,
        bytes: &[u8],
        filename: &str,
    ) -> anyhow::Result<UploadedFile> {
        bridge::upload_file(self, handles, bytes, filename).await
    }
}

#[async_trait]
impl ExecTransport for FlyClient {
    fn transport_name(&self) -> &'static str {
        "Fly"
    }

    async fn exec(
        &self,
        handles: &ProviderHandles,
        argv: &[String],
        timeout: Duration,
    ) -> anyhow::Result<ExecOutput> {
        let (app_name, machine_id) = machine_handles(handles)?;
        self.exec_machine(app_name, machine_id, argv, timeout).await
    }

    fn max_arg_bytes(&self) -> Option<usize> {
        Some(EXEC_MAX_ARG_BYTES)
    }
}
