//! クライアント→サーバ方向のキーストロークフィルタ。
//!
//! 履歴リプレイ中、xterm は記録データに含まれていた端末問い合わせに
//! 応答を生成してしまう。その応答が PTY へ届くと実行中のプログラムを
//! 壊すため、リプレイ開始から一定時間だけ送信バイト列から自動応答を
//! 取り除く。ウィンドウ外ではフィルタは素通しになる。

use crate::terminal::history_filter::{
    strip_cursor_position_reports, strip_device_attribute_replies, strip_osc_color_replies,
    strip_terminal_queries,
};

/// リプレイ開始からフィルタを効かせる時間
const REPLAY_WINDOW_MS: i64 = 5_000;

pub struct AutoResponseFilter {
    replay_until_ms: Option<i64>,
}

impl AutoResponseFilter {
    pub fn new() -> Self {
        Self {
            replay_until_ms: None,
        }
    }

    /// 履歴リプレイの開始を通知する
    pub fn begin_replay(&mut self, now_ms: i64) {
        self.replay_until_ms = Some(now_ms + REPLAY_WINDOW_MS);
    }

    pub fn is_replay_active(&self, now_ms: i64) -> bool {
        matches!(self.replay_until_ms, Some(until) if now_ms < until)
    }

    /// 送信バイト列を処理する。リプレイウィンドウ内なら自動応答を
    /// 取り除き、それ以外は素通しする。
    pub fn filter(&self, data: &[u8], now_ms: i64) -> Vec<u8> {
        if !self.is_replay_active(now_ms) {
            return data.to_vec();
        }

        let mut out = strip_osc_color_replies(data);
        out = strip_device_attribute_replies(&out);
        out = strip_cursor_position_reports(&out);
        out = strip_terminal_queries(&out);
        out
    }
}

impl Default for AutoResponseFilter {
    fn default() -> Self {
        Self::new()
    }
}
