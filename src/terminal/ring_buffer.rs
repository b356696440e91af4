use chrono::Utc;

use super::Chunk;

/// 履歴バッファの既定容量（チャンク数）
const DEFAULT_CAPACITY: usize = 2048;

/// 履歴バッファの統計スナップショット
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingBufferStats {
    pub capacity: usize,
    pub used: usize,
    pub total_bytes: i64,
    pub write_count: i64,
    pub read_count: i64,
    pub memory_usage: i64,
    pub oldest_timestamp_ms: i64,
    pub newest_timestamp_ms: i64,
}

/// 固定容量のチャンクリングバッファ。
///
/// 満杯時は最古のチャンクを上書きする。シーケンス番号は上書き後も
/// 再利用されず単調増加する（clear で 1 にリセット）。
pub struct RingBuffer {
    chunks: Vec<Option<Chunk>>,
    head: usize,
    tail: usize,
    full: bool,

    total_bytes: i64,
    write_count: i64,
    read_count: i64,
    next_sequence: i64,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            capacity
        };
        let mut chunks = Vec::with_capacity(capacity);
        chunks.resize_with(capacity, || None);
        Self {
            chunks,
            head: 0,
            tail: 0,
            full: false,
            total_bytes: 0,
            write_count: 0,
            read_count: 0,
            next_sequence: 1,
        }
    }

    /// チャンクを追記する。空データは黙って無視する。
    /// データの所有権はバッファに移る。
    pub fn write(&mut self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }

        // 満杯時は head 位置の最古チャンクを上書きする。
        // 上書き前にバイト集計を減算して total_bytes を正確に保つ。
        if self.full {
            if let Some(old) = self.chunks[self.head].take() {
                self.total_bytes -= old.size as i64;
            }
            self.tail = (self.tail + 1) % self.chunks.len();
        }

        let size = data.len();
        self.chunks[self.head] = Some(Chunk {
            sequence: self.next_sequence,
            data,
            timestamp_ms: Utc::now().timestamp_millis(),
            size,
        });

        self.total_bytes += size as i64;
        self.write_count += 1;
        self.next_sequence += 1;

        self.head = (self.head + 1) % self.chunks.len();
        self.full = self.head == self.tail;
    }

    /// 保持中の全データを古い順に独立コピーで返す
    pub fn read_all(&mut self) -> Vec<Vec<u8>> {
        self.read_count += 1;
        self.iter_used().map(|chunk| chunk.data.clone()).collect()
    }

    /// 保持中の全チャンクを古い順に独立コピーで返す
    pub fn read_all_chunks(&mut self) -> Vec<Chunk> {
        self.read_count += 1;
        self.iter_used().cloned().collect()
    }

    /// timestamp_ms 以降のチャンクを古い順に返す
    pub fn read_chunks_from(&mut self, timestamp_ms: i64) -> Vec<Chunk> {
        self.read_count += 1;
        self.iter_used()
            .filter(|chunk| chunk.timestamp_ms >= timestamp_ms)
            .cloned()
            .collect()
    }

    /// 全スロットを破棄し、シーケンス番号を 1 に戻す
    pub fn clear(&mut self) {
        for slot in &mut self.chunks {
            *slot = None;
        }
        self.head = 0;
        self.tail = 0;
        self.full = false;
        self.total_bytes = 0;
        self.next_sequence = 1;
    }

    pub fn stats(&self) -> RingBufferStats {
        let used = self.used_chunks();
        let (oldest, newest) = if used > 0 {
            let oldest = self.chunks[self.tail]
                .as_ref()
                .map(|c| c.timestamp_ms)
                .unwrap_or(0);
            let newest_index = (self.head + self.chunks.len() - 1) % self.chunks.len();
            let newest = self.chunks[newest_index]
                .as_ref()
                .map(|c| c.timestamp_ms)
                .unwrap_or(0);
            (oldest, newest)
        } else {
            (0, 0)
        };

        RingBufferStats {
            capacity: self.chunks.len(),
            used,
            total_bytes: self.total_bytes,
            write_count: self.write_count,
            read_count: self.read_count,
            memory_usage: self.estimate_memory_usage(),
            oldest_timestamp_ms: oldest,
            newest_timestamp_ms: newest,
        }
    }

    fn is_empty(&self) -> bool {
        !self.full && self.head == self.tail
    }

    fn used_chunks(&self) -> usize {
        if self.full {
            self.chunks.len()
        } else if self.head >= self.tail {
            self.head - self.tail
        } else {
            self.chunks.len() - self.tail + self.head
        }
    }

    fn iter_used(&self) -> impl Iterator<Item = &Chunk> {
        let used = if self.is_empty() { 0 } else { self.used_chunks() };
        (0..used).filter_map(move |i| {
            let index = (self.tail + i) % self.chunks.len();
            self.chunks[index].as_ref()
        })
    }

    fn estimate_memory_usage(&self) -> i64 {
        let slot_memory = (self.chunks.len() * std::mem::size_of::<Option<Chunk>>()) as i64;
        slot_memory + self.total_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_in_order() {
        let mut buf = RingBuffer::new(4);
        buf.write(b"one".to_vec());
        buf.write(b"two".to_vec());

        let chunks = buf.read_all_chunks();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].data, b"one");
        assert_eq!(chunks[1].data, b"two");
        assert_eq!(chunks[0].sequence, 1);
        assert_eq!(chunks[1].sequence, 2);
    }

    #[test]
    fn overflow_keeps_newest_in_write_order() {
        let mut buf = RingBuffer::new(3);
        for i in 0..5u8 {
            buf.write(vec![b'a' + i]);
        }

        let chunks = buf.read_all_chunks();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].data, b"c");
        assert_eq!(chunks[1].data, b"d");
        assert_eq!(chunks[2].data, b"e");
        // 上書き後もシーケンスは再利用されない
        assert_eq!(chunks[0].sequence, 3);
        assert_eq!(chunks[2].sequence, 5);
    }

    #[test]
    fn sequences_stay_monotonic_across_reads() {
        let mut buf = RingBuffer::new(2);
        for i in 0..10u8 {
            buf.write(vec![i]);
            let chunks = buf.read_all_chunks();
            for pair in chunks.windows(2) {
                assert!(pair[0].sequence < pair[1].sequence);
            }
        }
    }

    #[test]
    fn empty_write_is_ignored() {
        let mut buf = RingBuffer::new(4);
        buf.write(Vec::new());
        assert!(buf.read_all_chunks().is_empty());
        assert_eq!(buf.stats().write_count, 0);
    }

    #[test]
    fn clear_resets_sequence() {
        let mut buf = RingBuffer::new(2);
        buf.write(b"one".to_vec());
        buf.clear();
        assert!(buf.read_all_chunks().is_empty());
        assert_eq!(buf.stats().total_bytes, 0);

        buf.write(b"two".to_vec());
        assert_eq!(buf.read_all_chunks()[0].sequence, 1);
    }

    #[test]
    fn read_chunks_from_cutoff() {
        let mut buf = RingBuffer::new(5);
        buf.write(b"alpha".to_vec());
        buf.write(b"beta".to_vec());
        buf.write(b"gamma".to_vec());

        let chunks = buf.read_all_chunks();
        let cutoff = chunks[1].timestamp_ms;
        let filtered = buf.read_chunks_from(cutoff);
        assert!(filtered.len() >= 2);
        assert!(filtered.iter().all(|c| c.timestamp_ms >= cutoff));
    }

    #[test]
    fn total_bytes_accurate_across_overflow() {
        let mut buf = RingBuffer::new(3);
        buf.write(b"a".to_vec());
        buf.write(b"bb".to_vec());
        buf.write(b"ccc".to_vec());
        assert_eq!(buf.stats().total_bytes, 6);

        // "a" が上書きされ 2+3+4=9 になる
        buf.write(b"dddd".to_vec());
        assert_eq!(buf.stats().total_bytes, 9);

        let retained: Vec<Vec<u8>> = buf.read_all();
        assert_eq!(retained, vec![b"bb".to_vec(), b"ccc".to_vec(), b"dddd".to_vec()]);
    }

    #[test]
    fn total_bytes_matches_retained_sum_after_random_ops() {
        let mut buf = RingBuffer::new(4);
        for i in 0..40usize {
            buf.write(vec![0u8; (i % 7) + 1]);
            if i % 11 == 0 {
                buf.clear();
            }
            let sum: i64 = buf.read_all_chunks().iter().map(|c| c.size as i64).sum();
            assert_eq!(buf.stats().total_bytes, sum);
        }
    }

    #[test]
    fn zero_capacity_falls_back_to_default() {
        let buf = RingBuffer::new(0);
        assert_eq!(buf.stats().capacity, 2048);
    }

    #[test]
    fn stats_counts_reads_and_writes() {
        let mut buf = RingBuffer::new(4);
        buf.write(b"x".to_vec());
        buf.write(b"y".to_vec());
        let _ = buf.read_all();
        let _ = buf.read_all_chunks();
        let stats = buf.stats();
        assert_eq!(stats.write_count, 2);
        assert_eq!(stats.read_count, 2);
        assert_eq!(stats.used, 2);
        assert!(stats.memory_usage >= stats.total_bytes);
        assert!(stats.oldest_timestamp_ms <= stats.newest_timestamp_ms);
    }
}
