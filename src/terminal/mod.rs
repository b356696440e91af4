pub mod history_filter;
pub mod manager;
pub mod ring_buffer;
pub mod session;
pub mod shell;
pub mod shell_init;
pub mod workdir;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use manager::{Manager, ManagerConfig, ManagerError, TerminalEnv};
pub use ring_buffer::{RingBuffer, RingBufferStats};
pub use session::{Session, SessionError};

/// 履歴リプレイ用に保持する PTY 出力チャンク
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub sequence: i64,
    pub data: Vec<u8>,
    pub timestamp_ms: i64,
    pub size: usize,
}

/// 一覧 API 向けセッション概要
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub working_dir: String,
    pub created_at_ms: i64,
    pub last_active_at_ms: i64,
    pub is_active: bool,
}

/// 接続クライアントのメタデータ
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub conn_id: String,
    pub joined_at: DateTime<Utc>,
    pub cols: u16,
    pub rows: u16,
}

/// セッションのライフサイクル/出力イベントを受け取るハンドラ。
///
/// すべてのメソッドはセッション/マネージャのロックを保持しない状態で
/// 呼び出される。ハンドラから同期的に API へ再入しても安全。
pub trait TerminalEventHandler: Send + Sync {
    fn on_terminal_data(
        &self,
        session_id: &str,
        data: &[u8],
        sequence: i64,
        is_echo: bool,
        original_source: &str,
    );
    fn on_terminal_name_changed(
        &self,
        session_id: &str,
        old_name: &str,
        new_name: &str,
        working_dir: &str,
    );
    fn on_terminal_session_created(&self, session: &Arc<Session>);
    fn on_terminal_session_closed(&self, session_id: &str);
    fn on_terminal_error(&self, session_id: &str, error: &str);
}

pub const MIN_TERMINAL_COLS: u16 = 20;
pub const MIN_TERMINAL_ROWS: u16 = 5;
pub const MAX_TERMINAL_COLS: u16 = 500;
pub const MAX_TERMINAL_ROWS: u16 = 200;

pub fn validate_terminal_size(cols: u16, rows: u16) -> bool {
    (MIN_TERMINAL_COLS..=MAX_TERMINAL_COLS).contains(&cols)
        && (MIN_TERMINAL_ROWS..=MAX_TERMINAL_ROWS).contains(&rows)
}

pub fn clamp_terminal_size(cols: u16, rows: u16) -> (u16, u16) {
    (
        cols.clamp(MIN_TERMINAL_COLS, MAX_TERMINAL_COLS),
        rows.clamp(MIN_TERMINAL_ROWS, MAX_TERMINAL_ROWS),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_validation_bounds() {
        assert!(validate_terminal_size(20, 5));
        assert!(validate_terminal_size(500, 200));
        assert!(validate_terminal_size(80, 24));
        assert!(!validate_terminal_size(19, 24));
        assert!(!validate_terminal_size(501, 24));
        assert!(!validate_terminal_size(80, 4));
        assert!(!validate_terminal_size(80, 201));
    }

    #[test]
    fn size_clamping() {
        assert_eq!(clamp_terminal_size(10, 3), (20, 5));
        assert_eq!(clamp_terminal_size(1000, 1000), (500, 200));
        assert_eq!(clamp_terminal_size(80, 24), (80, 24));
    }
}
