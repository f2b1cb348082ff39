//! Runs the agent CLI and moves files into a compute unit over a provider's exec
//! channel. Providers only supply [`ExecTransport`]; message framing, reply parsing
//! and chunked uploads live here so both backends behave the same.

use std::path::Path;
use std::time::Duration;

use agenthost_control_plane::ProviderHandles;
use anyhow::Context;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Extra time a transport waits beyond the agent's own timeout before giving up.
pub const EXEC_GRACE: Duration = Duration::from_secs(30);
pub const UPLOAD_DIR: &str = "/tmp/agenthost-uploads";
pub const NO_RESPONSE_FALLBACK: &str = "No response from agent.";

const PAYLOAD_MARKER: &str = "\"payloads\"";
const FILE_OP_TIMEOUT: Duration = Duration::from_secs(60);
/// Conservative argv budget for transports that do not declare one.
const DEFAULT_MAX_ARG_BYTES: usize = 128 * 1024;

const WRITE_FIRST_CHUNK: &str = r#"printf %s "$1" | base64 -d > "$2""#;
const APPEND_CHUNK: &str = r#"printf %s "$1" | base64 -d >> "$2""#;
const TRUNCATE_FILE: &str = r#": > "$1""#;

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct ExecOutput {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl ExecOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code.unwrap_or(0) == 0
    }

    fn failure_text(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        let stdout = self.stdout.trim();
        if !stdout.is_empty() {
            return stdout.to_string();
        }
        match self.exit_code {
            Some(code) => format!("exit code {code}"),
            None => "no output".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChatReply {
    pub response: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UploadedFile {
    pub path: String,
}

/// A way to run a command inside an existing compute unit.
#[async_trait]
pub trait ExecTransport: Send + Sync {
    fn transport_name(&self) -> &'static str;

    /// Runs `argv` without a shell. Implementations wait `timeout` plus [`EXEC_GRACE`]
    /// before failing. A non-zero exit code is returned as output, not as an error.
    async fn exec(
        &self,
        handles: &ProviderHandles,
        argv: &[String],
        timeout: Duration,
    ) -> anyhow::Result<ExecOutput>;

    /// Largest single argv the transport accepts, if it enforces one.
    fn max_arg_bytes(&self) -> Option<usize> {
        None
    }

    /// Places `bytes` at `dest`. Defaults to chunked base64 writes over `exec`.
    async fn copy_into(
        &self,
        handles: &ProviderHandles,
        bytes: &[u8],
        dest: &str,
    ) -> anyhow::Result<()> {
        write_chunked(self, handles, bytes, dest).await
    }
}

pub async fn send_message<T: ExecTransport + ?Sized>(
    transport: &T,
    agent_cli: &str,
    handles: &ProviderHandles,
    session_id: &str,
    text: &str,
    timeout_secs: u64,
) -> anyhow::Result<ChatReply> {
    let argv = agent_argv(agent_cli, session_id, text, timeout_secs);
    let output = transport
        .exec(handles, &argv, Duration::from_secs(timeout_secs))
        .await?;
    parse_agent_reply(transport.transport_name(), &output)
}

fn agent_argv(agent_cli: &str, session_id: &str, text: &str, timeout_secs: u64) -> Vec<String> {
    vec![
        agent_cli.to_string(),
        "agent".to_string(),
        "--session-id".to_string(),
        session_id.to_string(),
        "--message".to_string(),
        text.to_string(),
        "--timeout".to_string(),
        timeout_secs.to_string(),
        "--json".to_string(),
    ]
}

#[derive(Deserialize)]
struct AgentTurn {
    #[serde(default)]
    payloads: Vec<AgentPayload>,
}

#[derive(Deserialize)]
struct AgentPayload {
    #[serde(default)]
    text: Option<String>,
}

/// Interprets agent CLI output. The presence of a payload document in stdout decides
/// success; stderr noise and the exit code are ignored when it is there.
pub fn parse_agent_reply(transport: &str, output: &ExecOutput) -> anyhow::Result<ChatReply> {
    let Some(turn) = find_agent_turn(&output.stdout) else {
        anyhow::bail!("{transport} exec failed: {}", output.failure_text());
    };

    if !output.stderr.trim().is_empty() {
        debug!(
            transport,
            stderr = %output.stderr.trim(),
            "agent wrote diagnostics alongside its reply"
        );
    }

    let texts: Vec<&str> = turn
        .payloads
        .iter()
        .filter_map(|payload| payload.text.as_deref())
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .collect();
    let response = if texts.is_empty() {
        NO_RESPONSE_FALLBACK.to_string()
    } else {
        texts.join("\n\n")
    };
    Ok(ChatReply { response })
}

/// Finds the JSON object carrying `"payloads"`, tolerating log lines printed before
/// or after it.
fn find_agent_turn(stdout: &str) -> Option<AgentTurn> {
    let marker = stdout.find(PAYLOAD_MARKER)?;
    stdout[..marker]
        .rmatch_indices('{')
        .find_map(|(start, _)| {
            let mut stream =
                serde_json::Deserializer::from_str(&stdout[start..]).into_iter::<serde_json::Value>();
            match stream.next() {
                Some(Ok(value)) if value.get("payloads").is_some() => {
                    serde_json::from_value::<AgentTurn>(value).ok()
                }
                _ => None,
            }
        })
}

pub async fn upload_file<T: ExecTransport + ?Sized>(
    transport: &T,
    handles: &ProviderHandles,
    bytes: &[u8],
    filename: &str,
) -> anyhow::Result<UploadedFile> {
    let mkdir = vec!["mkdir".to_string(), "-p".to_string(), UPLOAD_DIR.to_string()];
    let output = transport.exec(handles, &mkdir, FILE_OP_TIMEOUT).await?;
    ensure_success(transport.transport_name(), &output, "create upload directory")?;

    let path = format!("{UPLOAD_DIR}/{}", upload_file_name(filename));
    transport
        .copy_into(handles, bytes, &path)
        .await
        .with_context(|| format!("copy upload to {path}"))?;
    Ok(UploadedFile { path })
}

/// Random name keeping the original extension when it is short and plain.
pub fn upload_file_name(original: &str) -> String {
    let stem = uuid::Uuid::new_v4().simple().to_string();
    let extension = Path::new(original)
        .extension()
        .and_then(|ext| ext.to_str())
        .filter(|ext| {
            !ext.is_empty() && ext.len() <= 16 && ext.chars().all(|c| c.is_ascii_alphanumeric())
        });
    match extension {
        Some(ext) => format!("{stem}.{ext}"),
        None => stem,
    }
}

/// Writes `bytes` to `dest` as a series of base64 chunks, each small enough to fit the
/// transport's argv limit. The first chunk truncates, the rest append.
pub async fn write_chunked<T: ExecTransport + ?Sized>(
    transport: &T,
    handles: &ProviderHandles,
    bytes: &[u8],
    dest: &str,
) -> anyhow::Result<()> {
    let name = transport.transport_name();
    let encoded = BASE64.encode(bytes);

    if encoded.is_empty() {
        let argv = shell_argv(TRUNCATE_FILE, &[dest]);
        let output = transport.exec(handles, &argv, FILE_OP_TIMEOUT).await?;
        return ensure_success(name, &output, "create empty upload");
    }

    let chunk_len = chunk_len_for(transport.max_arg_bytes().unwrap_or(DEFAULT_MAX_ARG_BYTES));
    let mut start = 0;
    let mut index = 0usize;
    while start < encoded.len() {
        let end = (start + chunk_len).min(encoded.len());
        let script = if index == 0 { WRITE_FIRST_CHUNK } else { APPEND_CHUNK };
        let argv = shell_argv(script, &[&encoded[start..end], dest]);
        let output = transport.exec(handles, &argv, FILE_OP_TIMEOUT).await?;
        ensure_success(name, &output, "write upload chunk")
            .with_context(|| format!("chunk {index} of {dest}"))?;
        start = end;
        index += 1;
    }
    debug!(transport = name, dest, chunks = index, "upload written");
    Ok(())
}

/// A quarter of the argv budget, rounded down to whole base64 quanta.
fn chunk_len_for(max_arg_bytes: usize) -> usize {
    ((max_arg_bytes / 4) / 4 * 4).max(4)
}

fn shell_argv(script: &str, args: &[&str]) -> Vec<String> {
    let mut argv = vec![
        "sh".to_string(),
        "-c".to_string(),
        script.to_string(),
        "sh".to_string(),
    ];
    argv.extend(args.iter().map(|arg| arg.to_string()));
    argv
}

fn ensure_success(transport: &str, output: &ExecOutput, action: &str) -> anyhow::Result<()> {
    if output.succeeded() {
        return Ok(());
    }
    anyhow::bail!("{transport} exec failed to {action}: {}", output.failure_text())
}
