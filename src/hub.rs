//! Attach Boundary: セッションごとの購読者レジストリとイベントのファンアウト。
//!
//! 1 つの論理接続 (conn_id) が複数の WebSocket を張っても、セッションの
//! サイズ計算上は 1 接続として数えるよう参照カウントで調停する。

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::terminal::{Session, TerminalEventHandler};

/// 購読者チャネルの容量。あふれた購読者は slow consumer として切断される。
const SUBSCRIBER_BUFFER: usize = 64;

/// 購読者チャネルが閉じられた理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// セッションが終了した
    SessionClosed,
    /// 送信バッファあふれ（ポリシー違反として切断）
    SlowConsumer,
}

/// `subscribe` の戻り値。rx が閉じたら close_reason を確認して
/// 適切な close frame を送る。
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<String>,
    pub close_reason: Arc<OnceLock<CloseReason>>,
}

struct Subscriber {
    tx: mpsc::Sender<String>,
    conn_id: Option<String>,
    close_reason: Arc<OnceLock<CloseReason>>,
}

struct HubState {
    subscribers: HashMap<String, HashMap<u64, Subscriber>>,
    conn_refs: HashMap<String, HashMap<String, usize>>,
    next_subscriber_id: u64,
}

/// セッション単位の購読者レジストリ
pub struct SessionHub {
    state: RwLock<HubState>,
}

impl SessionHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(HubState {
                subscribers: HashMap::new(),
                conn_refs: HashMap::new(),
                next_subscriber_id: 1,
            }),
        })
    }

    /// 購読者を登録する。conn_id があれば参照カウントを増やす。
    pub fn subscribe(&self, session_id: &str, conn_id: Option<String>) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let close_reason = Arc::new(OnceLock::new());

        let mut state = self.lock_write();
        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;

        if let Some(conn_id) = &conn_id {
            *state
                .conn_refs
                .entry(session_id.to_string())
                .or_default()
                .entry(conn_id.clone())
                .or_insert(0) += 1;
        }

        state
            .subscribers
            .entry(session_id.to_string())
            .or_default()
            .insert(
                id,
                Subscriber {
                    tx,
                    conn_id,
                    close_reason: Arc::clone(&close_reason),
                },
            );

        Subscription {
            id,
            rx,
            close_reason,
        }
    }

    /// 購読者を除去する。その購読者の conn_id の参照カウントが 0 に
    /// なった場合、セッションから切り離すべき conn_id を返す。
    pub fn unsubscribe(&self, session_id: &str, subscriber_id: u64) -> Option<String> {
        let mut state = self.lock_write();

        let set = state.subscribers.get_mut(session_id)?;
        let removed = set.remove(&subscriber_id);
        if set.is_empty() {
            state.subscribers.remove(session_id);
        }

        let conn_id = removed.and_then(|sub| sub.conn_id)?;

        let session_refs = state.conn_refs.get_mut(session_id)?;
        let drop_conn = match session_refs.get_mut(&conn_id) {
            Some(count) if *count <= 1 => {
                session_refs.remove(&conn_id);
                true
            }
            Some(count) => {
                *count -= 1;
                false
            }
            None => false,
        };
        if session_refs.is_empty() {
            state.conn_refs.remove(session_id);
        }

        drop_conn.then_some(conn_id)
    }

    /// セッションの全購読者へペイロードを配る。
    /// ロックはスナップショット取得のみに使い、enqueue は非ブロッキング。
    pub fn broadcast(&self, session_id: &str, payload: String) {
        let targets: Vec<(u64, mpsc::Sender<String>, Arc<OnceLock<CloseReason>>)> = {
            let state = self.lock_read();
            let Some(set) = state.subscribers.get(session_id) else {
                return;
            };
            set.iter()
                .map(|(id, sub)| (*id, sub.tx.clone(), Arc::clone(&sub.close_reason)))
                .collect()
        };

        let mut slow: Vec<u64> = Vec::new();
        for (id, tx, close_reason) in targets {
            match tx.try_send(payload.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // slow consumer: ポリシー違反として切断。残りの購読者には
                    // 影響させない。
                    let _ = close_reason.set(CloseReason::SlowConsumer);
                    slow.push(id);
                    tracing::warn!(session_id = %session_id, subscriber = id, "Dropping slow consumer");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    slow.push(id);
                }
            }
        }

        if !slow.is_empty() {
            let mut state = self.lock_write();
            if let Some(set) = state.subscribers.get_mut(session_id) {
                for id in slow {
                    // tx を drop してチャネルを閉じる。conn_refs は購読者側の
                    // unsubscribe で整理される。
                    set.remove(&id);
                }
                if set.is_empty() {
                    state.subscribers.remove(session_id);
                }
            }
        }
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.lock_read()
            .subscribers
            .get(session_id)
            .map(|set| set.len())
            .unwrap_or(0)
    }

    /// セッション終了時に全購読者を閉じる
    fn drop_session_subscribers(&self, session_id: &str) {
        let mut state = self.lock_write();
        if let Some(set) = state.subscribers.remove(session_id) {
            for sub in set.values() {
                let _ = sub.close_reason.set(CloseReason::SessionClosed);
            }
        }
        state.conn_refs.remove(session_id);
    }

    fn lock_read(&self) -> std::sync::RwLockReadGuard<'_, HubState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_write(&self) -> std::sync::RwLockWriteGuard<'_, HubState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// WebSocket で配送するサーバ→クライアントイベント
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WsEvent<'a> {
    #[serde(rename_all = "camelCase")]
    Data {
        session_id: &'a str,
        data: String,
        sequence: i64,
        timestamp_ms: i64,
        echo_of_input: bool,
        original_source: &'a str,
    },
    #[serde(rename_all = "camelCase")]
    Name {
        session_id: &'a str,
        new_name: &'a str,
        working_dir: &'a str,
        timestamp_ms: i64,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        session_id: &'a str,
        error: &'a str,
        timestamp_ms: i64,
    },
}

impl TerminalEventHandler for SessionHub {
    fn on_terminal_data(
        &self,
        session_id: &str,
        data: &[u8],
        sequence: i64,
        is_echo: bool,
        original_source: &str,
    ) {
        let event = WsEvent::Data {
            session_id,
            data: BASE64.encode(data),
            sequence,
            timestamp_ms: Utc::now().timestamp_millis(),
            echo_of_input: is_echo,
            original_source,
        };
        let Ok(payload) = serde_json::to_string(&event) else {
            return;
        };
        self.broadcast(session_id, payload);
    }

    fn on_terminal_name_changed(
        &self,
        session_id: &str,
        _old_name: &str,
        new_name: &str,
        working_dir: &str,
    ) {
        let event = WsEvent::Name {
            session_id,
            new_name,
            working_dir,
            timestamp_ms: Utc::now().timestamp_millis(),
        };
        let Ok(payload) = serde_json::to_string(&event) else {
            return;
        };
        self.broadcast(session_id, payload);
    }

    fn on_terminal_session_created(&self, _session: &Arc<Session>) {}

    fn on_terminal_session_closed(&self, session_id: &str) {
        // 該当セッションの WebSocket クライアントを全て切断し、
        // フロントエンドが再接続し続けないようにする
        self.drop_session_subscribers(session_id);
    }

    fn on_terminal_error(&self, session_id: &str, error: &str) {
        let event = WsEvent::Error {
            session_id,
            error,
            timestamp_ms: Utc::now().timestamp_millis(),
        };
        let Ok(payload) = serde_json::to_string(&event) else {
            return;
        };
        self.broadcast(session_id, payload);
    }
}
