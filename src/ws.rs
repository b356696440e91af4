use std::sync::Arc;

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::AppState;
use crate::hub::{CloseReason, Subscription};

/// WebSocket close code: policy violation
const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// WebSocket close code: normal closure
const CLOSE_NORMAL: u16 = 1000;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsQuery {
    pub session_id: String,
    pub conn_id: Option<String>,
}

/// GET /ws?sessionId=…&connId=…
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    if query.session_id.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "missing sessionId").into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, query: WsQuery) {
    let session_id = query.session_id;
    let conn_id = query
        .conn_id
        .map(|c| c.trim().to_string())
        .filter(|c| !c.is_empty());

    let subscription = state.hub.subscribe(&session_id, conn_id);
    let Subscription {
        id: subscriber_id,
        mut rx,
        close_reason,
    } = subscription;

    let (mut ws_tx, mut ws_rx) = socket.split();

    // hub → WS 転送。チャネルが閉じたら理由に応じた close frame を送る。
    let events_to_ws = async {
        while let Some(payload) = rx.recv().await {
            if ws_tx.send(Message::Text(payload.into())).await.is_err() {
                return;
            }
        }
        let (code, reason) = match close_reason.get() {
            Some(CloseReason::SlowConsumer) => (CLOSE_POLICY_VIOLATION, "slow consumer"),
            Some(CloseReason::SessionClosed) => (CLOSE_NORMAL, "session closed"),
            None => (CLOSE_NORMAL, "closed"),
        };
        let _ = ws_tx
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.to_string().into(),
            })))
            .await;
    };

    // クライアント → サーバのメッセージは無視し、切断検出のみ行う
    let watch_close = async {
        while let Some(Ok(msg)) = ws_rx.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    };

    tokio::select! {
        _ = events_to_ws => {}
        _ = watch_close => {}
    }

    // 参照カウントが 0 になった論理接続はセッションから切り離す
    // （切り離しは最小サイズの再計算を誘発する）
    if let Some(conn_id) = state.hub.unsubscribe(&session_id, subscriber_id) {
        if let Some(session) = state.manager.get_session(&session_id) {
            session.remove_connection(&conn_id).await;
        }
    }

    tracing::debug!(session_id = %session_id, "WebSocket client detached");
}
