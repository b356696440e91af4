//! 入力バイト数のトークンバケットレートリミッタ。
//! キーはクライアント単位（session:conn）で、放置されたバケットは
//! 定期的に回収する。

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// バケット整理の最短間隔
const CLEANUP_INTERVAL: Duration = Duration::from_secs(120);

/// この期間アクセスのないバケットは破棄する
const IDLE_TTL: Duration = Duration::from_secs(600);

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

struct LimiterState {
    buckets: HashMap<String, TokenBucket>,
    last_cleanup: Instant,
}

pub struct ByteRateLimiter {
    rate_bytes_per_sec: f64,
    burst_bytes: f64,
    state: Mutex<LimiterState>,
}

impl ByteRateLimiter {
    pub fn new(rate_bytes_per_sec: usize, burst_bytes: usize) -> Self {
        Self {
            rate_bytes_per_sec: (rate_bytes_per_sec as f64).max(1.0),
            burst_bytes: (burst_bytes as f64).max(1.0),
            state: Mutex::new(LimiterState {
                buckets: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
        }
    }

    /// cost_bytes 分の送信を許可するか判定する。空キーは常に拒否。
    pub fn allow(&self, key: &str, cost_bytes: usize, now: Instant) -> bool {
        if key.is_empty() {
            return false;
        }
        if cost_bytes == 0 {
            return true;
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Self::cleanup_locked(&mut state, now);

        let bucket = state.buckets.entry(key.to_string()).or_insert(TokenBucket {
            tokens: self.burst_bytes,
            last_refill: now,
            last_seen: now,
        });

        bucket.last_seen = now;
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            bucket.tokens = self
                .burst_bytes
                .min(bucket.tokens + elapsed * self.rate_bytes_per_sec);
            bucket.last_refill = now;
        }

        let cost = cost_bytes as f64;
        if bucket.tokens < cost {
            return false;
        }
        bucket.tokens -= cost;
        true
    }

    fn cleanup_locked(state: &mut LimiterState, now: Instant) {
        if now.saturating_duration_since(state.last_cleanup) < CLEANUP_INTERVAL {
            return;
        }
        state.last_cleanup = now;
        state
            .buckets
            .retain(|_, b| now.saturating_duration_since(b.last_seen) <= IDLE_TTL);
    }
}

/// レート制限キー: session:conn。conn 不明時は同一セッションの匿名クライアント
/// をまとめて 1 キーにする。
pub fn client_key(session_id: &str, conn_id: Option<&str>) -> String {
    if session_id.trim().is_empty() {
        return String::new();
    }
    match conn_id.map(str::trim).filter(|c| !c.is_empty()) {
        Some(conn) => format!("{}:{}", session_id, conn),
        None => format!("{}:-", session_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_refill() {
        let limiter = ByteRateLimiter::new(100, 200);
        let start = Instant::now();

        // バースト分までは許可
        assert!(limiter.allow("k", 200, start));
        // 空になったら拒否
        assert!(!limiter.allow("k", 1, start));
        // 1 秒後には 100 バイト分補充されている
        assert!(limiter.allow("k", 100, start + Duration::from_secs(1)));
        assert!(!limiter.allow("k", 1, start + Duration::from_secs(1)));
    }

    #[test]
    fn refill_caps_at_burst() {
        let limiter = ByteRateLimiter::new(100, 150);
        let start = Instant::now();
        assert!(limiter.allow("k", 150, start));
        // 長時間待ってもバーストを超えては貯まらない
        let later = start + Duration::from_secs(3600);
        assert!(limiter.allow("k", 150, later));
        assert!(!limiter.allow("k", 1, later));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = ByteRateLimiter::new(10, 10);
        let now = Instant::now();
        assert!(limiter.allow("a", 10, now));
        assert!(limiter.allow("b", 10, now));
        assert!(!limiter.allow("a", 1, now));
    }

    #[test]
    fn empty_key_rejected_zero_cost_allowed() {
        let limiter = ByteRateLimiter::new(10, 10);
        let now = Instant::now();
        assert!(!limiter.allow("", 1, now));
        assert!(limiter.allow("k", 0, now));
    }

    #[test]
    fn idle_buckets_are_collected() {
        let limiter = ByteRateLimiter::new(10, 10);
        let start = Instant::now();
        assert!(limiter.allow("old", 10, start));

        // TTL を超えて放置した後の別キーへのアクセスで回収される
        let later = start + IDLE_TTL + CLEANUP_INTERVAL + Duration::from_secs(1);
        assert!(limiter.allow("fresh", 1, later));
        let state = limiter.state.lock().unwrap();
        assert!(!state.buckets.contains_key("old"));
    }

    #[test]
    fn client_key_format() {
        assert_eq!(client_key("s1", Some("c1")), "s1:c1");
        assert_eq!(client_key("s1", Some("  ")), "s1:-");
        assert_eq!(client_key("s1", None), "s1:-");
        assert_eq!(client_key("", Some("c1")), "");
    }
}
