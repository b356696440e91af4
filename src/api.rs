use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::ratelimit::client_key;
use crate::terminal::{SessionInfo, validate_terminal_size};

/// 1 リクエストあたりの入力上限
pub const MAX_INPUT_BYTES: usize = 64 * 1024;

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub working_dir: String,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenameSessionRequest {
    pub new_name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachRequest {
    #[serde(default)]
    pub conn_id: String,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeRequest {
    pub conn_id: Option<String>,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputRequest {
    pub conn_id: Option<String>,
    pub input: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub start_seq: Option<i64>,
    pub end_seq: Option<i64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryChunk {
    pub sequence: i64,
    /// base64 エンコード済み
    pub data: String,
    pub timestamp_ms: i64,
}

/// GET /api/sessions
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<Vec<SessionInfo>> {
    let sessions = state
        .manager
        .list_sessions()
        .into_iter()
        .map(|session| session.session_info())
        .collect();
    Json(sessions)
}

/// POST /api/sessions
pub async fn create_session(
    State(state): State<Arc<AppState>>,
    body: Option<Json<CreateSessionRequest>>,
) -> impl IntoResponse {
    let req = body.map(|Json(req)| req).unwrap_or_default();

    let cols = req.cols.filter(|&c| c > 0).unwrap_or(80);
    let rows = req.rows.filter(|&r| r > 0).unwrap_or(24);
    if !validate_terminal_size(cols, rows) {
        return (StatusCode::BAD_REQUEST, "invalid cols/rows").into_response();
    }

    match state
        .manager
        .create_session(&req.name, &req.working_dir, cols, rows)
        .await
    {
        Ok(session) => Json(session.session_info()).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// DELETE /api/sessions/{id}
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.manager.delete_session(&session_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}

/// POST /api/sessions/{id}/rename
pub async fn rename_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(req): Json<RenameSessionRequest>,
) -> impl IntoResponse {
    if req.new_name.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "invalid payload").into_response();
    }
    match state.manager.rename_session(&session_id, &req.new_name) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}

/// POST /api/sessions/{id}/attach
///
/// dormant セッションは自動的に activate される。
pub async fn attach_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(req): Json<AttachRequest>,
) -> impl IntoResponse {
    if req.conn_id.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "connId is required").into_response();
    }

    let cols = req.cols.filter(|&c| c > 0).unwrap_or(80);
    let rows = req.rows.filter(|&r| r > 0).unwrap_or(24);
    if !validate_terminal_size(cols, rows) {
        return (StatusCode::BAD_REQUEST, "invalid cols/rows").into_response();
    }

    let Some(session) = state.manager.get_session(&session_id) else {
        return (StatusCode::NOT_FOUND, "session not found").into_response();
    };

    if !session.is_active() {
        if let Err(e) = state.manager.activate_session(&session_id, cols, rows).await {
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    }

    session.add_connection(&req.conn_id, cols, rows).await;
    StatusCode::NO_CONTENT.into_response()
}

/// POST /api/sessions/{id}/resize
///
/// connId 付きは接続単位の更新（最小サイズ再計算込み）、
/// connId なしは PTY の直接リサイズ。
pub async fn resize_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(req): Json<ResizeRequest>,
) -> impl IntoResponse {
    if !validate_terminal_size(req.cols, req.rows) {
        return (StatusCode::BAD_REQUEST, "invalid cols/rows").into_response();
    }

    let Some(session) = state.manager.get_session(&session_id) else {
        return (StatusCode::NOT_FOUND, "session not found").into_response();
    };

    match req.conn_id.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        Some(conn_id) => {
            session.update_connection_size(conn_id, req.cols, req.rows).await;
            StatusCode::NO_CONTENT.into_response()
        }
        None => match session.resize_pty(req.cols, req.rows).await {
            Ok(()) => StatusCode::NO_CONTENT.into_response(),
            Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
        },
    }
}

/// POST /api/sessions/{id}/input
pub async fn write_input(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Json(req): Json<InputRequest>,
) -> impl IntoResponse {
    if req.input.len() > MAX_INPUT_BYTES {
        return (StatusCode::BAD_REQUEST, "input too large").into_response();
    }

    let key = client_key(&session_id, req.conn_id.as_deref());
    if !state.input_limiter.allow(&key, req.input.len(), Instant::now()) {
        return (StatusCode::TOO_MANY_REQUESTS, "input rate limit exceeded").into_response();
    }

    let Some(session) = state.manager.get_session(&session_id) else {
        return (StatusCode::NOT_FOUND, "session not found").into_response();
    };

    let source = req.conn_id.as_deref().unwrap_or("");
    match session.write_data_with_source(req.input.as_bytes(), source).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// GET /api/sessions/{id}/history?startSeq=N&endSeq=M
pub async fn session_history(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let Some(session) = state.manager.get_session(&session_id) else {
        return (StatusCode::NOT_FOUND, "session not found").into_response();
    };

    let start_seq = query.start_seq.unwrap_or(0);
    let end_seq = query.end_seq.unwrap_or(-1);

    let chunks = session.history_from_sequence(start_seq);
    let mut out = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        if end_seq > 0 && chunk.sequence > end_seq {
            break;
        }
        out.push(HistoryChunk {
            sequence: chunk.sequence,
            data: BASE64.encode(&chunk.data),
            timestamp_ms: chunk.timestamp_ms,
        });
    }

    Json(out).into_response()
}

/// POST /api/sessions/{id}/clear
pub async fn clear_history(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> impl IntoResponse {
    match state.manager.clear_session_history(&session_id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}
