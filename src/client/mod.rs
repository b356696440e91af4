//! クライアント側コンポーネント: 受信チャンクの並べ替え、リプレイ中の
//! 自動応答抑止、セッション一覧のリコンシリエーション。

pub mod auto_response;
pub mod coordinator;
pub mod sequence_buffer;

use serde::{Deserialize, Serialize};

/// サーバの SessionInfo に対応するクライアント側ビュー
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub name: String,
    pub working_dir: String,
    pub created_at_ms: i64,
    pub last_active_at_ms: i64,
    pub is_active: bool,
}

/// WS data イベントから復元した出力チャンク
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamChunk {
    pub sequence: i64,
    pub data: Vec<u8>,
    pub timestamp_ms: i64,
}
