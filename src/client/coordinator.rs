//! クライアント側のセッション一覧リコンシリエーション。
//!
//! 削除は楽観的に一覧から外し、失敗時は強制リフレッシュで戻す。
//! リフレッシュは単調増加するシーケンスで重複排除し、新しい結果の
//! 上に古い結果を適用しない。

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;

use super::SessionSummary;

/// 一覧ポーリングの既定間隔
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// 通信失敗時のリトライバックオフ（初期値と上限）
const BACKOFF_INITIAL: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

/// HTTP/WS 層の失敗
#[derive(Debug)]
pub struct TransportError(pub String);

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport failure: {}", self.0)
    }
}

impl std::error::Error for TransportError {}

#[derive(Debug, Clone, Default)]
pub struct CreateSessionOptions {
    pub name: Option<String>,
    pub working_dir: Option<String>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

/// name イベント等から一覧エントリへ反映する部分更新
#[derive(Debug, Clone, Default)]
pub struct SessionMetaPatch {
    pub name: Option<String>,
    pub working_dir: Option<String>,
    pub last_active_at_ms: Option<i64>,
    pub is_active: Option<bool>,
}

/// セッション一覧 API へのトランスポート。テストではモックに差し替える。
pub trait SessionsTransport: Send + Sync + 'static {
    fn list_sessions(
        &self,
    ) -> impl Future<Output = Result<Vec<SessionSummary>, TransportError>> + Send;
    fn create_session(
        &self,
        options: CreateSessionOptions,
    ) -> impl Future<Output = Result<SessionSummary, TransportError>> + Send;
    fn delete_session(
        &self,
        session_id: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

struct CoordinatorState {
    sessions: Vec<SessionSummary>,
    pending_deletions: HashSet<String>,
    applied_refresh_seq: u64,
}

/// 購読ガード。drop で購読者数を減らし、0 になるとポーリングが止まる。
pub struct SessionsSubscription {
    pub receiver: watch::Receiver<Vec<SessionSummary>>,
    _guard: SubscriberGuard,
}

struct SubscriberGuard(Arc<AtomicUsize>);

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

pub struct SessionsCoordinator<T: SessionsTransport> {
    transport: T,
    state: Mutex<CoordinatorState>,
    snapshot_tx: watch::Sender<Vec<SessionSummary>>,
    refresh_counter: AtomicU64,
    subscriber_count: Arc<AtomicUsize>,
    poll_interval: Duration,
}

impl<T: SessionsTransport> SessionsCoordinator<T> {
    pub fn new(transport: T) -> Arc<Self> {
        Self::with_poll_interval(transport, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(transport: T, poll_interval: Duration) -> Arc<Self> {
        let (snapshot_tx, _) = watch::channel(Vec::new());
        Arc::new(Self {
            transport,
            state: Mutex::new(CoordinatorState {
                sessions: Vec::new(),
                pending_deletions: HashSet::new(),
                applied_refresh_seq: 0,
            }),
            snapshot_tx,
            refresh_counter: AtomicU64::new(0),
            subscriber_count: Arc::new(AtomicUsize::new(0)),
            poll_interval,
        })
    }

    /// 現在の一覧スナップショット
    pub fn sessions(&self) -> Vec<SessionSummary> {
        self.lock_state().sessions.clone()
    }

    /// 一覧を購読する。即座に現在のスナップショットが receiver に入って
    /// おり、購読者がいる間はバックグラウンドでポーリングが回る。
    pub fn subscribe(self: &Arc<Self>) -> SessionsSubscription {
        let receiver = self.snapshot_tx.subscribe();
        let guard = SubscriberGuard(Arc::clone(&self.subscriber_count));

        let previous = self.subscriber_count.fetch_add(1, Ordering::Relaxed);
        if previous == 0 {
            self.spawn_poll_loop();
        }

        SessionsSubscription {
            receiver,
            _guard: guard,
        }
    }

    fn spawn_poll_loop(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let poll_interval = self.poll_interval;
        tokio::spawn(async move {
            let mut delay = poll_interval;
            let mut backoff = BACKOFF_INITIAL;
            loop {
                tokio::time::sleep(delay).await;

                let Some(coordinator) = weak.upgrade() else {
                    return;
                };
                if coordinator.subscriber_count.load(Ordering::Relaxed) == 0 {
                    return;
                }

                match coordinator.refresh().await {
                    Ok(()) => {
                        backoff = BACKOFF_INITIAL;
                        delay = poll_interval;
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "Session list refresh failed, backing off");
                        delay = backoff;
                        backoff = (backoff * 2).min(BACKOFF_MAX);
                    }
                }
            }
        });
    }

    /// 一覧を取り直す。並行リフレッシュはシーケンスで重複排除され、
    /// 古い結果が新しい結果を上書きすることはない。
    pub async fn refresh(&self) -> Result<(), TransportError> {
        let seq = self.refresh_counter.fetch_add(1, Ordering::Relaxed) + 1;
        let listed = self.transport.list_sessions().await?;

        let snapshot = {
            let mut state = self.lock_state();
            if seq <= state.applied_refresh_seq {
                return Ok(());
            }
            state.applied_refresh_seq = seq;

            let mut next: Vec<SessionSummary> = listed
                .into_iter()
                .filter(|s| !state.pending_deletions.contains(&s.id))
                .collect();
            sort_summaries(&mut next);

            if next == state.sessions {
                return Ok(());
            }
            state.sessions = next.clone();
            next
        };

        let _ = self.snapshot_tx.send(snapshot);
        Ok(())
    }

    /// セッションを作成して結果を一覧へマージする
    pub async fn create_session(
        &self,
        options: CreateSessionOptions,
    ) -> Result<SessionSummary, TransportError> {
        let created = self.transport.create_session(options).await?;

        let snapshot = {
            let mut state = self.lock_state();
            state.sessions.retain(|s| s.id != created.id);
            state.sessions.push(created.clone());
            sort_summaries(&mut state.sessions);
            state.sessions.clone()
        };
        let _ = self.snapshot_tx.send(snapshot);

        Ok(created)
    }

    /// 楽観的削除。トランスポート失敗時は保留マーカーを外して
    /// 強制リフレッシュし（セッションが一覧に戻る）、エラーを返す。
    pub async fn delete_session(&self, session_id: &str) -> Result<(), TransportError> {
        {
            let mut state = self.lock_state();
            state.pending_deletions.insert(session_id.to_string());
            let before = state.sessions.len();
            state.sessions.retain(|s| s.id != session_id);
            if state.sessions.len() != before {
                let snapshot = state.sessions.clone();
                drop(state);
                let _ = self.snapshot_tx.send(snapshot);
            }
        }

        match self.transport.delete_session(session_id).await {
            Ok(()) => {
                let _ = self.refresh().await;
                self.lock_state().pending_deletions.remove(session_id);
                Ok(())
            }
            Err(e) => {
                self.lock_state().pending_deletions.remove(session_id);
                let _ = self.refresh().await;
                Err(e)
            }
        }
    }

    /// 一覧エントリへ部分更新を適用する。削除保留中のセッションには
    /// 適用しない。適用されたかどうかを返す。
    pub fn update_session_meta(&self, session_id: &str, patch: SessionMetaPatch) -> bool {
        let snapshot = {
            let mut state = self.lock_state();
            if state.pending_deletions.contains(session_id) {
                return false;
            }
            let Some(entry) = state.sessions.iter_mut().find(|s| s.id == session_id) else {
                return false;
            };

            if let Some(name) = patch.name {
                entry.name = name;
            }
            if let Some(working_dir) = patch.working_dir {
                entry.working_dir = working_dir;
            }
            if let Some(last_active) = patch.last_active_at_ms {
                entry.last_active_at_ms = last_active;
            }
            if let Some(is_active) = patch.is_active {
                entry.is_active = is_active;
            }
            state.sessions.clone()
        };

        let _ = self.snapshot_tx.send(snapshot);
        true
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// created_at → id の順で安定ソートする
fn sort_summaries(sessions: &mut [SessionSummary]) {
    sessions.sort_by(|a, b| {
        a.created_at_ms
            .cmp(&b.created_at_ms)
            .then_with(|| a.id.cmp(&b.id))
    });
}
