//! Agent HTTP 接口
//!
//! - `POST /agent/message`、`GET /agent/message`：消息收发
//! - `POST /agent/setup/:key`：下载引导脚本
//! - `POST /agent/register/:key`：注册主机
//! - `POST /agent/reregister`：更新主机名称与地址

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::core::error::{ProtocolViolation, RegistrationError};

use super::message::MessageBatch;
use super::registration::{ClientIdentity, Registrar, RegisterRequest, ReregisterRequest};
use super::transport::AgentTransport;

pub const CLIENT_SERIAL_HEADER: &str = "x-ssl-client-serial";
pub const CLIENT_NAME_HEADER: &str = "x-ssl-client-name";

/// 路由共享状态
pub struct AgentHttpState {
    pub transport: Arc<AgentTransport>,
    pub registrar: Arc<Registrar>,
}

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    pub server_boot_time: DateTime<Utc>,
    pub client_start_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct SetupQuery {
    pub profile_name: Option<String>,
}

pub fn create_router(state: Arc<AgentHttpState>) -> Router {
    Router::new()
        .route("/agent/message", post(post_message).get(get_message))
        .route("/agent/setup/:key", post(setup))
        .route("/agent/register/:key", post(register))
        .route("/agent/reregister", post(reregister))
        .route("/health", get(|| async { "OK" }))
        .with_state(state)
}

fn identity(headers: &HeaderMap) -> ClientIdentity {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    ClientIdentity {
        serial: header(CLIENT_SERIAL_HEADER),
        name: header(CLIENT_NAME_HEADER),
    }
}

fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn violation(e: ProtocolViolation) -> (StatusCode, String) {
    let body = match e {
        ProtocolViolation::Forbidden => String::new(),
        ref other => other.to_string(),
    };
    (status(e.status_code()), body)
}

fn registration_failure(e: RegistrationError) -> Response {
    let code = status(e.status_code());
    match e {
        RegistrationError::FqdnInUse => {
            (code, Json(serde_json::json!({ "fqdn": ["FQDN in use"] }))).into_response()
        }
        // 冒充嫌疑：不给出任何细节
        RegistrationError::FqdnMismatch | RegistrationError::InvalidToken => {
            code.into_response()
        }
        other => {
            if code.is_server_error() {
                tracing::error!(error = %other, "Registration failed");
            }
            (code, other.to_string()).into_response()
        }
    }
}

/// POST /agent/message - Agent 上送消息
async fn post_message(
    State(state): State<Arc<AgentHttpState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<StatusCode, (StatusCode, String)> {
    state
        .transport
        .post_messages(&identity(&headers), body)
        .map_err(violation)?;
    Ok(StatusCode::OK)
}

/// GET /agent/message - 长轮询取回发往 Agent 的消息
async fn get_message(
    State(state): State<Arc<AgentHttpState>>,
    headers: HeaderMap,
    Query(q): Query<PollQuery>,
) -> Result<Json<MessageBatch>, (StatusCode, String)> {
    let messages = state
        .transport
        .get_messages(&identity(&headers), q.server_boot_time, q.client_start_time)
        .await
        .map_err(violation)?;
    Ok(Json(MessageBatch { messages }))
}

/// POST /agent/setup/:key - 引导脚本
async fn setup(
    State(state): State<Arc<AgentHttpState>>,
    Path(key): Path<String>,
    Query(q): Query<SetupQuery>,
) -> Response {
    match state.registrar.setup(&key, q.profile_name.as_deref()) {
        Ok(script) => (StatusCode::CREATED, script).into_response(),
        Err(e) => registration_failure(e),
    }
}

/// POST /agent/register/:key - 注册主机并签发证书
async fn register(
    State(state): State<Arc<AgentHttpState>>,
    Path(key): Path<String>,
    Json(request): Json<RegisterRequest>,
) -> Response {
    match state.registrar.register(&key, &request) {
        Ok(response) => (StatusCode::CREATED, Json(response)).into_response(),
        Err(e) => registration_failure(e),
    }
}

/// POST /agent/reregister - 以有效证书更新主机身份
async fn reregister(
    State(state): State<Arc<AgentHttpState>>,
    headers: HeaderMap,
    Json(request): Json<ReregisterRequest>,
) -> Response {
    match state.registrar.reregister(&identity(&headers), &request) {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => registration_failure(e),
    }
}
