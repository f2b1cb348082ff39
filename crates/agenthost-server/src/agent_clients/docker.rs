use std::collections::BTreeMap;
use std::io::Write;
use std::process::{Output, Stdio};
use std::time::Duration;

use agenthost_control_plane::{map_docker_state, InstanceStatus, ProviderHandles, ProviderKind};
use anyhow::Context;
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::bridge::{self, ChatReply, ExecOutput, ExecTransport, UploadedFile, EXEC_GRACE};
use crate::config::{DockerConfig, AGENT_GATEWAY_PORT};
use crate::provider::{CreateInstanceConfig, CreatedInstance, InstanceProvider};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
const INSTANCE_LABEL: &str = "agenthost.instance";

/// Drives a local Docker daemon through its CLI. Every call passes an explicit argv;
/// secrets travel in the child environment and are referenced by name only.
pub struct DockerClient {
    bin: String,
    image: String,
    bind_host: String,
    agent_cli: String,
    exec_grace: Duration,
}

/// Container name for an instance: `agent-` plus the first 12 hex digits of its id.
pub fn container_name_for(instance_id: &str) -> String {
    let hex: String = instance_id
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .take(12)
        .collect::<String>()
        .to_ascii_lowercase();
    format!("agent-{hex}")
}

impl DockerClient {
    pub fn new(config: &DockerConfig, agent_cli: &str) -> Self {
        Self {
            bin: config.bin.clone(),
            image: config.image.clone(),
            bind_host: config.bind_host.clone(),
            agent_cli: agent_cli.to_string(),
            exec_grace: EXEC_GRACE,
        }
    }

    fn run_args(&self, config: &CreateInstanceConfig, env: &BTreeMap<String, String>) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            container_name_for(&config.instance_id),
            "--label".to_string(),
            format!("{INSTANCE_LABEL}={}", config.instance_id),
            "--restart".to_string(),
            "unless-stopped".to_string(),
            "-p".to_string(),
            format!("{}::{AGENT_GATEWAY_PORT}", self.bind_host),
        ];
        for key in env.keys() {
            args.push("-e".to_string());
            args.push(key.clone());
        }
        args.push(self.image.clone());
        args
    }

    async fn output(
        &self,
        args: &[String],
        env: &BTreeMap<String, String>,
        limit: Duration,
    ) -> anyhow::Result<Output> {
        let mut cmd = Command::new(&self.bin);
        cmd.args(args)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match tokio::time::timeout(limit, cmd.output()).await {
            Ok(result) => result.map_err(|err| anyhow::anyhow!("Docker command failed: {err}")),
            Err(_) => anyhow::bail!(
                "Docker command timed out after {}s: {} {}",
                limit.as_secs(),
                self.bin,
                args.first().map(String::as_str).unwrap_or_default()
            ),
        }
    }

    async fn docker(&self, args: &[String]) -> anyhow::Result<String> {
        self.docker_with_env(args, &BTreeMap::new()).await
    }

    async fn docker_with_env(
        &self,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> anyhow::Result<String> {
        let output = self.output(args, env, COMMAND_TIMEOUT).await?;
        if !output.status.success() {
            anyhow::bail!("Docker command failed: {}", failure_text(&output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn published_port(&self, container_id: &str) -> anyhow::Result<u16> {
        let stdout = self
            .docker(&[
                "port".to_string(),
                container_id.to_string(),
                format!("{AGENT_GATEWAY_PORT}/tcp"),
            ])
            .await?;
        parse_published_port(&stdout)
    }

    async fn remove_container(&self, container_id: &str) -> anyhow::Result<()> {
        let args = ["rm".to_string(), "-f".to_string(), container_id.to_string()];
        match self.docker(&args).await {
            Ok(_) => Ok(()),
            Err(err) if err.to_string().contains("No such container") => {
                debug!(container_id, "container already removed");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

fn failure_text(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if !stderr.is_empty() {
        return stderr;
    }
    match output.status.code() {
        Some(code) => format!("exit code {code}"),
        None => "terminated by signal".to_string(),
    }
}

/// Reads the host port from `docker port` output such as `127.0.0.1:49153` or `[::]:49153`.
fn parse_published_port(stdout: &str) -> anyhow::Result<u16> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .context("docker port printed no mapping")?;
    let (_, port) = line
        .rsplit_once(':')
        .with_context(|| format!("unexpected docker port output: {line}"))?;
    port.parse::<u16>()
        .with_context(|| format!("unexpected docker port output: {line}"))
}

/// Writes an upload to a temp file readable by any container user; `docker cp`
/// keeps the file mode.
fn stage_upload(bytes: &[u8]) -> anyhow::Result<tempfile::NamedTempFile> {
    let mut staged = tempfile::NamedTempFile::new().context("create upload staging file")?;
    staged.write_all(bytes).context("write upload staging file")?;
    staged.flush().context("flush upload staging file")?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        staged
            .as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))
            .context("set upload staging file mode")?;
    }
    Ok(staged)
}

fn container_id(handles: &ProviderHandles) -> anyhow::Result<&str> {
    match handles {
        ProviderHandles::Docker {
            container_id: Some(id),
            ..
        } => Ok(id),
        ProviderHandles::Docker { .. } => anyhow::bail!("no container id found"),
        other => anyhow::bail!("Docker provider cannot use {} handles", other.kind()),
    }
}

#[async_trait]
impl InstanceProvider for DockerClient {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Docker
    }

    async fn create_instance(
        &self,
        config: &CreateInstanceConfig,
    ) -> anyhow::Result<CreatedInstance> {
        let env = config.agent_env();
        let args = self.run_args(config, &env);
        let stdout = match self.docker_with_env(&args, &env).await {
            Ok(stdout) => stdout,
            Err(err) => {
                // the daemon may have created the named container before failing
                let name = container_name_for(&config.instance_id);
                if let Err(cleanup_err) = self.remove_container(&name).await {
                    warn!(container = %name, error = %cleanup_err, "failed to remove container after docker run failed");
                }
                return Err(err);
            }
        };
        let container_id = stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .context("docker run printed no container id")?
            .to_string();

        let port = match self.published_port(&container_id).await {
            Ok(port) => port,
            Err(err) => {
                if let Err(cleanup_err) = self.remove_container(&container_id).await {
                    warn!(container_id = %container_id, error = %cleanup_err, "failed to remove container after port lookup failed");
                }
                return Err(err);
            }
        };
        info!(container_id = %container_id, port, "started agent container");

        Ok(CreatedInstance {
            provider_id: container_id,
            provider_app_id: None,
            ip_address: self.bind_host.clone(),
            port: Some(port),
        })
    }

    async fn start_instance(&self, handles: &ProviderHandles) -> anyhow::Result<()> {
        let id = container_id(handles)?;
        self.docker(&["start".to_string(), id.to_string()]).await?;
        Ok(())
    }

    async fn stop_instance(&self, handles: &ProviderHandles) -> anyhow::Result<()> {
        let id = container_id(handles)?;
        self.docker(&["stop".to_string(), id.to_string()]).await?;
        Ok(())
    }

    async fn delete_instance(&self, handles: &ProviderHandles) -> anyhow::Result<()> {
        match handles {
            ProviderHandles::Docker {
                container_id: Some(id),
                ..
            } => self.remove_container(id).await,
            ProviderHandles::Docker { .. } => Ok(()),
            other => anyhow::bail!("Docker provider cannot use {} handles", other.kind()),
        }
    }

    async fn get_instance_status(&self, handles: &ProviderHandles) -> InstanceStatus {
        let Ok(id) = container_id(handles) else {
            return InstanceStatus::Unknown;
        };
        let args = [
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Status}}".to_string(),
            id.to_string(),
        ];
        match self.docker(&args).await {
            Ok(state) => map_docker_state(&state),
            Err(err) => {
                warn!(container_id = id, error = %err, "failed to inspect container");
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
impl ExecTransport for DockerClient {
    fn transport_name(&self) -> &'static str {
        "Docker"
    }

    async fn exec(
        &self,
        handles: &ProviderHandles,
        argv: &[String],
        timeout: Duration,
    ) -> anyhow::Result<ExecOutput> {
        let id = container_id(handles)?;
        let mut args = vec!["exec".to_string(), id.to_string()];
        args.extend(argv.iter().cloned());
        let output = self
            .output(&args, &BTreeMap::new(), timeout + self.exec_grace)
            .await?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code(),
        })
    }

    /// `docker cp` has no argv limit to respect, so uploads skip chunking.
    async fn copy_into(
        &self,
        handles: &ProviderHandles,
        bytes: &[u8],
        dest: &str,
    ) -> anyhow::Result<()> {
        let id = container_id(handles)?;
        let bytes = bytes.to_vec();
        let staged = tokio::task::spawn_blocking(move || stage_upload(&bytes))
            .await
            .context("join upload staging task")??;

        let args = [
            "cp".to_string(),
            staged.path().display().to_string(),
            format!("{id}:{dest}"),
        ];
        self.docker(&args).await?;
        Ok(())
    }
}
