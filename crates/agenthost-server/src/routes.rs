use agenthost_control_plane::{AiProvider, Instance, InstanceStatus, ProviderHandles, ProviderKind};
use axum::extract::{Path, Query};
use axum::http::{HeaderMap, StatusCode};
use axum::{Extension, Json};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::bridge::{ChatReply, UploadedFile};
use crate::error::InstanceError;
use crate::instance_control::ProvisionRequest;
use crate::State;

pub const USER_HEADER: &str = "x-user-id";
pub const MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_SESSION_ID: &str = "main";
const DEFAULT_CHAT_TIMEOUT_SECS: u64 = 120;
const MAX_CHAT_TIMEOUT_SECS: u64 = 600;

type ApiResult<T> = Result<T, (StatusCode, String)>;

#[derive(Debug, Clone, Deserialize)]
pub struct CreateInstanceRequest {
    pub name: String,
    pub provider: ProviderKind,
    #[serde(default)]
    pub region: Option<String>,
    pub model: String,
    #[serde(default)]
    pub bot_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub include_deleted: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadRequest {
    pub filename: String,
    pub content_base64: String,
}

/// Public shape of an instance. The bot token is always masked.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InstanceView {
    pub id: String,
    pub name: String,
    pub provider: ProviderKind,
    pub region: String,
    pub model: String,
    pub ai_provider: AiProvider,
    pub status: InstanceStatus,
    pub ip_address: Option<String>,
    pub port: Option<u16>,
    pub is_default: bool,
    pub bot_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Instance> for InstanceView {
    fn from(instance: Instance) -> Self {
        let port = match &instance.handles {
            Some(ProviderHandles::Docker { port, .. }) => *port,
            _ => None,
        };
        Self {
            id: instance.id,
            name: instance.name,
            provider: instance.provider,
            region: instance.region,
            model: instance.model,
            ai_provider: instance.ai_provider,
            status: instance.status,
            ip_address: instance.ip_address,
            port,
            is_default: instance.is_default,
            bot_token: instance.bot_token.as_deref().map(agenthost_vault::mask),
            created_at: instance.created_at,
            updated_at: instance.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub id: String,
    pub status: InstanceStatus,
    pub live_status: InstanceStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct PurgeView {
    pub removed: usize,
}

fn user_id(headers: &HeaderMap) -> ApiResult<String> {
    headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            (
                StatusCode::UNAUTHORIZED,
                format!("missing {USER_HEADER} header"),
            )
        })
}

fn bad_request(message: impl Into<String>) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, message.into())
}

fn default_region(provider: ProviderKind) -> &'static str {
    match provider {
        ProviderKind::Fly => "iad",
        ProviderKind::Docker => "local",
    }
}

pub async fn create_instance(
    Extension(state): Extension<State>,
    headers: HeaderMap,
    Json(payload): Json<CreateInstanceRequest>,
) -> ApiResult<(StatusCode, Json<InstanceView>)> {
    let user_id = user_id(&headers)?;
    let name = payload.name.trim();
    let model = payload.model.trim();
    if name.is_empty() {
        return Err(bad_request("name must not be empty"));
    }
    if model.is_empty() {
        return Err(bad_request("model must not be empty"));
    }
    let region = payload
        .region
        .as_deref()
        .map(str::trim)
        .filter(|region| !region.is_empty())
        .unwrap_or(default_region(payload.provider));
    let bot_token = payload
        .bot_token
        .as_deref()
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(str::to_string);

    let request = ProvisionRequest {
        user_id,
        name: name.to_string(),
        provider: payload.provider,
        region: region.to_string(),
        model: model.to_string(),
        bot_token,
    };
    let result = state
        .orchestrator
        .provision_instance(request)
        .and_then(|id| state.orchestrator.get_instance(&id));
    match result {
        Ok(instance) => {
            info!(instance_id = %instance.id, "accepted instance request");
            Ok((StatusCode::ACCEPTED, Json(instance.into())))
        }
        Err(e) => Err(handle_instance_error("create_instance", e)),
    }
}

pub async fn list_instances(
    Extension(state): Extension<State>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<InstanceView>>> {
    let user_id = user_id(&headers)?;
    match state
        .orchestrator
        .list_instances(&user_id, query.include_deleted)
    {
        Ok(instances) => Ok(Json(instances.into_iter().map(InstanceView::from).collect())),
        Err(e) => Err(handle_instance_error("list_instances", e)),
    }
}

pub async fn get_instance(
    Extension(state): Extension<State>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<InstanceView>> {
    let user_id = user_id(&headers)?;
    match state.orchestrator.get_owned_instance(&user_id, &id) {
        Ok(instance) => Ok(Json(instance.into())),
        Err(e) => Err(handle_instance_error("get_instance", e)),
    }
}

pub async fn instance_status(
    Extension(state): Extension<State>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<StatusView>> {
    let user_id = user_id(&headers)?;
    let orchestrator = &state.orchestrator;
    let result = async {
        let instance = orchestrator.get_owned_instance(&user_id, &id)?;
        let live_status = orchestrator.live_status(&id).await?;
        Ok::<_, InstanceError>(StatusView {
            id: instance.id,
            status: instance.status,
            live_status,
        })
    }
    .await;
    match result {
        Ok(view) => Ok(Json(view)),
        Err(e) => Err(handle_instance_error("instance_status", e)),
    }
}

pub async fn start_instance(
    Extension(state): Extension<State>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<InstanceView>> {
    let user_id = user_id(&headers)?;
    let result = match state.orchestrator.get_owned_instance(&user_id, &id) {
        Ok(_) => state.orchestrator.start_instance(&id).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(instance) => Ok(Json(instance.into())),
        Err(e) => Err(handle_instance_error("start_instance", e)),
    }
}

pub async fn stop_instance(
    Extension(state): Extension<State>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<InstanceView>> {
    let user_id = user_id(&headers)?;
    let result = match state.orchestrator.get_owned_instance(&user_id, &id) {
        Ok(_) => state.orchestrator.stop_instance(&id).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(instance) => Ok(Json(instance.into())),
        Err(e) => Err(handle_instance_error("stop_instance", e)),
    }
}

pub async fn delete_instance(
    Extension(state): Extension<State>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<InstanceView>> {
    let user_id = user_id(&headers)?;
    let result = match state.orchestrator.get_owned_instance(&user_id, &id) {
        Ok(_) => state.orchestrator.delete_instance(&id).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(instance) => Ok(Json(instance.into())),
        Err(e) => Err(handle_instance_error("delete_instance", e)),
    }
}

/// Account closure: tears down and hard deletes every instance of the caller.
pub async fn purge_instances(
    Extension(state): Extension<State>,
    headers: HeaderMap,
) -> ApiResult<Json<PurgeView>> {
    let user_id = user_id(&headers)?;
    match state.orchestrator.purge_user_instances(&user_id).await {
        Ok(removed) => {
            info!(user_id = %user_id, removed, "account instances purged");
            Ok(Json(PurgeView { removed }))
        }
        Err(e) => Err(handle_instance_error("purge_instances", e)),
    }
}

pub async fn set_default_instance(
    Extension(state): Extension<State>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<InstanceView>> {
    let user_id = user_id(&headers)?;
    match state.orchestrator.set_default_instance(&user_id, &id) {
        Ok(instance) => Ok(Json(instance.into())),
        Err(e) => Err(handle_instance_error("set_default_instance", e)),
    }
}

pub async fn chat(
    Extension(state): Extension<State>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(payload): Json<ChatRequest>,
) -> ApiResult<Json<ChatReply>> {
    let user_id = user_id(&headers)?;
    if payload.message.trim().is_empty() {
        return Err(bad_request("message must not be empty"));
    }
    let session_id = payload
        .session_id
        .as_deref()
        .map(str::trim)
        .filter(|session| !session.is_empty())
        .unwrap_or(DEFAULT_SESSION_ID);
    let timeout_secs = payload
        .timeout_seconds
        .unwrap_or(DEFAULT_CHAT_TIMEOUT_SECS)
        .clamp(1, MAX_CHAT_TIMEOUT_SECS);

    let result = match state.orchestrator.get_owned_instance(&user_id, &id) {
        Ok(_) => {
            state
                .orchestrator
                .send_message(&id, session_id, &payload.message, timeout_secs)
                .await
        }
        Err(e) => Err(e),
    };
    match result {
        Ok(reply) => Ok(Json(reply)),
        Err(e) => Err(handle_instance_error("chat", e)),
    }
}

pub async fn upload_file(
    Extension(state): Extension<State>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(payload): Json<UploadRequest>,
) -> ApiResult<Json<UploadedFile>> {
    let user_id = user_id(&headers)?;
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.content_base64.trim())
        .map_err(|e| bad_request(format!("content_base64 is not valid base64: {e}")))?;
    if bytes.len() > MAX_UPLOAD_BYTES {
        return Err((
            StatusCode::PAYLOAD_TOO_LARGE,
            format!("uploads are limited to {MAX_UPLOAD_BYTES} bytes"),
        ));
    }

    let result = match state.orchestrator.get_owned_instance(&user_id, &id) {
        Ok(_) => {
            state
                .orchestrator
                .upload_file(&id, &bytes, &payload.filename)
                .await
        }
        Err(e) => Err(e),
    };
    match result {
        Ok(uploaded) => Ok(Json(uploaded)),
        Err(e) => Err(handle_instance_error("upload_file", e)),
    }
}

pub async fn health_check() -> ApiResult<Json<()>> {
    Ok(Json(()))
}

pub(crate) fn handle_instance_error(function: &str, err: InstanceError) -> (StatusCode, String) {
    let status = match &err {
        InstanceError::Config(_) | InstanceError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        InstanceError::InvalidState(_) => StatusCode::CONFLICT,
        InstanceError::NotFound(_) => StatusCode::NOT_FOUND,
        InstanceError::Provider(_) => StatusCode::BAD_GATEWAY,
    };
    if status.is_server_error() {
        error!("Error in {function}: {err:?}");
    } else {
        warn!("Rejected in {function}: {err}");
    }
    (status, format!("{err}"))
}
