//! JSON endpoints for login flows and task management.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use keepalive_core::login::CodeOutcome;
use keepalive_core::scheduler::HeartbeatOutcome;
use keepalive_core::{Credential, ErrorKind, KeepaliveError};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::AppState;

/// Error response: `{"code": <kind>, "message": <reason>}`.
#[derive(Debug)]
pub struct ApiError(pub KeepaliveError);

impl From<KeepaliveError> for ApiError {
    fn from(err: KeepaliveError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(KeepaliveError::InvalidInput(rejection.body_text()))
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidInput
        | ErrorKind::ChallengeRejected
        | ErrorKind::InvalidCredential => StatusCode::BAD_REQUEST,
        ErrorKind::SessionNotFound | ErrorKind::TaskNotFound => StatusCode::NOT_FOUND,
        ErrorKind::UpstreamError => StatusCode::BAD_GATEWAY,
        ErrorKind::CapacityExceeded => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Storage => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (kind, message) = self.0.to_error_code();
        let status = status_for(kind);
        if status.is_server_error() {
            error!(?kind, "request failed: {}", self.0);
        }
        (status, Json(json!({ "code": kind, "message": message }))).into_response()
    }
}

type ApiResult = Result<Json<Value>, ApiError>;

fn parse_uuid(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw)
        .map_err(|_| KeepaliveError::InvalidInput(format!("invalid task id: {raw}")).into())
}

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
pub struct LoginStart {
    phone: String,
}

pub async fn login_start(
    State(state): State<Arc<AppState>>,
    body: Result<Json<LoginStart>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    let session_id = state.logins.start(&body.phone).await?;
    Ok(Json(json!({
        "session_id": session_id,
        "message": "Verification code sent",
    })))
}

#[derive(Debug, Deserialize)]
pub struct LoginCode {
    session_id: String,
    code: String,
}

pub async fn login_code(
    State(state): State<Arc<AppState>>,
    body: Result<Json<LoginCode>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    let outcome = state.logins.submit_code(&body.session_id, &body.code).await?;
    Ok(Json(match outcome {
        CodeOutcome::Authenticated {
            credential,
            account_id,
        } => json!({
            "status": "code_accepted",
            "credential": credential.expose(),
            "account_id": account_id,
        }),
        CodeOutcome::PasswordRequired => json!({ "status": "password_required" }),
    }))
}

#[derive(Debug, Deserialize)]
pub struct LoginPassword {
    session_id: String,
    password: String,
}

pub async fn login_password(
    State(state): State<Arc<AppState>>,
    body: Result<Json<LoginPassword>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    let (credential, account_id) = state
        .logins
        .submit_password(&body.session_id, &body.password)
        .await?;
    Ok(Json(json!({
        "status": "code_accepted",
        "credential": credential.expose(),
        "account_id": account_id,
    })))
}

#[derive(Debug, Deserialize)]
pub struct TaskValidate {
    #[serde(alias = "session_string")]
    credential: Credential,
}

pub async fn task_validate(
    State(state): State<Arc<AppState>>,
    body: Result<Json<TaskValidate>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    let info = state.scheduler.validate(&body.credential).await?;
    Ok(Json(json!({
        "account_id": info.account_id,
        "notify_target_hint": info.account_id,
        "username": info.username,
        "first_name": info.first_name,
        "bot_name": state.bot_name,
    })))
}

#[derive(Debug, Deserialize)]
pub struct TaskCreate {
    #[serde(alias = "session_string")]
    credential: Credential,
    #[serde(default, alias = "notify_chat_id")]
    notify_target: Option<i64>,
}

pub async fn task_create(
    State(state): State<Arc<AppState>>,
    body: Result<Json<TaskCreate>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body?;
    let task = state
        .scheduler
        .create_or_replace(body.credential, body.notify_target)
        .await?;
    Ok(Json(json!({
        "uuid": task.uuid,
        "account_id": task.account_id,
        "notify_target": task.notify_target,
    })))
}

pub async fn task_get(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
) -> ApiResult {
    let uuid = parse_uuid(&uuid)?;
    let task = state
        .scheduler
        .store()
        .get(&uuid)
        .await
        .ok_or(KeepaliveError::TaskNotFound(uuid))?;
    Ok(Json(json!({
        "uuid": task.uuid,
        "account_id": task.account_id,
        "credential": task.credential.expose(),
        "notify_target": task.notify_target,
        "consecutive_failures": task.consecutive_failures,
        "created_at_ms": task.created_at_ms,
        "last_heartbeat_ms": task.last_heartbeat_ms,
    })))
}

pub async fn task_delete(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
) -> ApiResult {
    let uuid = parse_uuid(&uuid)?;
    state.scheduler.delete(uuid).await?;
    info!(uuid = %uuid, "task deleted via api");
    Ok(Json(json!({ "deleted": uuid })))
}

pub async fn task_heartbeat(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
) -> ApiResult {
    let uuid = parse_uuid(&uuid)?;
    let outcome: HeartbeatOutcome = state.scheduler.trigger(uuid).await?;
    Ok(Json(json!({ "uuid": uuid, "heartbeat": outcome })))
}
