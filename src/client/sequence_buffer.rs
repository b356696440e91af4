//! 受信チャンクをシーケンス順に並べ直すリオーダバッファ。
//!
//! WebSocket 再接続の境界で起こる一時的な順序乱れを吸収する。欠番が
//! `max_stall_ms` を超えて埋まらない場合は飛ばして先へ進む
//! （UI を固めないことを完全性より優先する意図的なトレード）。

use std::collections::{BTreeMap, HashMap};

use super::StreamChunk;

#[derive(Debug, Clone)]
pub struct SequenceBufferConfig {
    /// 保留できるチャンク数の上限
    pub max_pending_chunks: usize,
    /// expected からこのギャップ以内のチャンクだけ保留する
    pub max_sequence_gap: i64,
    /// 保留数がここに達したら全破棄する
    pub force_cleanup_threshold: usize,
    /// 定期クリーンアップの間隔
    pub cleanup_interval_ms: i64,
    /// 欠番を待つ最長時間
    pub max_stall_ms: i64,
}

impl Default for SequenceBufferConfig {
    fn default() -> Self {
        Self {
            max_pending_chunks: 40,
            max_sequence_gap: 32,
            force_cleanup_threshold: 60,
            cleanup_interval_ms: 5_000,
            max_stall_ms: 500,
        }
    }
}

pub struct SequenceBuffer {
    config: SequenceBufferConfig,
    expected: i64,
    pending: BTreeMap<i64, StreamChunk>,
    inserted_at: HashMap<i64, i64>,
    last_cleanup_ms: i64,
}

impl SequenceBuffer {
    pub fn new(config: SequenceBufferConfig) -> Self {
        Self {
            config,
            expected: 1,
            pending: BTreeMap::new(),
            inserted_at: HashMap::new(),
            last_cleanup_ms: 0,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SequenceBufferConfig::default())
    }

    pub fn expected(&self) -> i64 {
        self.expected
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// チャンクを投入し、順序どおりに解放できるチャンク列を返す
    pub fn push(&mut self, chunk: StreamChunk, now_ms: i64) -> Vec<StreamChunk> {
        let mut released = Vec::new();

        // シーケンスなしのチャンクは並べ替え対象外
        if chunk.sequence < 1 {
            released.push(chunk);
            return released;
        }

        // 滞留した欠番があれば、まず諦めて前に進む
        self.flush_stalled(now_ms, &mut released);

        if chunk.sequence == self.expected {
            self.expected += 1;
            released.push(chunk);
            self.drain_contiguous(&mut released);
        } else if self.expected < chunk.sequence
            && chunk.sequence <= self.expected + self.config.max_sequence_gap
            && self.pending.len() < self.config.max_pending_chunks
        {
            // 到着時刻は初回のみ記録する（再送で滞留判定が延びないように）
            self.inserted_at.entry(chunk.sequence).or_insert(now_ms);
            self.pending.insert(chunk.sequence, chunk);
        } else {
            // 大きく先行しているかバッファ満杯: 保留分を諦めてジャンプする
            self.expected = chunk.sequence + 1;
            self.discard_pending();
            released.push(chunk);
        }

        self.maybe_cleanup(now_ms);
        released
    }

    /// 状態を破棄して expected を max(1, start_sequence) に合わせる
    pub fn reset(&mut self, start_sequence: i64) {
        self.discard_pending();
        self.expected = start_sequence.max(1);
        self.last_cleanup_ms = 0;
    }

    /// 最小の保留シーケンスが max_stall_ms を超えて待たされていたら、
    /// そこへ expected を進めて連続分を解放する
    fn flush_stalled(&mut self, now_ms: i64, released: &mut Vec<StreamChunk>) {
        let Some((&smallest, _)) = self.pending.first_key_value() else {
            return;
        };
        let Some(&inserted) = self.inserted_at.get(&smallest) else {
            return;
        };
        if now_ms - inserted < self.config.max_stall_ms {
            return;
        }

        self.expected = smallest;
        self.drain_contiguous(released);
    }

    /// expected から連続して保留済みのチャンクを解放する
    fn drain_contiguous(&mut self, released: &mut Vec<StreamChunk>) {
        while let Some(chunk) = self.pending.remove(&self.expected) {
            self.inserted_at.remove(&self.expected);
            self.expected += 1;
            released.push(chunk);
        }
    }

    fn maybe_cleanup(&mut self, now_ms: i64) {
        if self.pending.len() >= self.config.force_cleanup_threshold {
            self.discard_pending();
            return;
        }

        if now_ms - self.last_cleanup_ms < self.config.cleanup_interval_ms {
            return;
        }
        self.last_cleanup_ms = now_ms;

        let low = self.expected;
        let high = self.expected + self.config.max_sequence_gap;
        self.pending.retain(|&seq, _| low <= seq && seq <= high);
        self.inserted_at.retain(|&seq, _| low <= seq && seq <= high);
    }

    fn discard_pending(&mut self) {
        self.pending.clear();
        self.inserted_at.clear();
    }
}
