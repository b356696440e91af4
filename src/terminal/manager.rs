use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;

use super::history_filter::{DefaultHistoryFilter, HistoryFilter};
use super::session::{Session, SessionError};
use super::shell::{
    DefaultEnvProvider, DefaultShellArgsProvider, DefaultShellResolver, ShellArgsProvider,
    ShellEnvProvider, ShellResolver,
};
use super::shell_init::{DefaultShellInitWriter, ShellInitWriter};
use super::workdir;
use super::TerminalEventHandler;

/// 最大セッション数（DoS 対策）
const MAX_SESSIONS: usize = 50;

/// Manager の操作エラー
#[derive(Debug)]
pub enum ManagerError {
    /// セッションが見つからない
    NotFound(String),
    /// セッション数上限に達した
    LimitExceeded,
    /// セッション操作の失敗
    Session(SessionError),
}

impl fmt::Display for ManagerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "session not found: {id}"),
            Self::LimitExceeded => write!(f, "session limit exceeded (max {MAX_SESSIONS})"),
            Self::Session(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ManagerError {}

impl From<SessionError> for ManagerError {
    fn from(e: SessionError) -> Self {
        Self::Session(e)
    }
}

/// すべての PTY セッションに適用される環境変数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalEnv {
    pub term: String,
    pub colorterm: String,
    pub lang: String,
    pub lc_all: String,
    pub term_program: String,
    pub term_program_version: String,
    pub terminfo: String,
    pub term_features: String,
}

impl Default for TerminalEnv {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            colorterm: "truecolor".to_string(),
            lang: "en_US.UTF-8".to_string(),
            lc_all: "en_US.UTF-8".to_string(),
            term_program: "floeterm".to_string(),
            term_program_version: env!("CARGO_PKG_VERSION").to_string(),
            terminfo: "/usr/share/terminfo".to_string(),
            term_features: "256color:altscreen:mouse".to_string(),
        }
    }
}

/// Manager が生成するセッション全体の既定設定
pub struct ManagerConfig {
    pub shell_resolver: Arc<dyn ShellResolver>,
    pub env_provider: Arc<dyn ShellEnvProvider>,
    pub shell_args_provider: Arc<dyn ShellArgsProvider>,
    pub shell_init_writer: Arc<dyn ShellInitWriter>,
    pub history_filter: Arc<dyn HistoryFilter>,
    pub history_buffer_size: usize,
    pub input_window: Duration,
    pub initial_resize_suppress: Duration,
    pub resize_suppress: Duration,
    pub terminal_env: TerminalEnv,
    pub max_sessions: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            shell_resolver: Arc::new(DefaultShellResolver),
            env_provider: Arc::new(DefaultEnvProvider),
            shell_args_provider: Arc::new(DefaultShellArgsProvider),
            shell_init_writer: Arc::new(DefaultShellInitWriter { base_dir: None }),
            history_filter: Arc::new(DefaultHistoryFilter),
            history_buffer_size: 2048,
            input_window: Duration::from_millis(10),
            initial_resize_suppress: Duration::from_millis(500),
            resize_suppress: Duration::from_millis(200),
            terminal_env: TerminalEnv::default(),
            max_sessions: MAX_SESSIONS,
        }
    }
}

struct ManagerState {
    sessions: HashMap<String, Arc<Session>>,
    order: Vec<String>,
    handler: Option<Arc<dyn TerminalEventHandler>>,
}

/// 複数ターミナルセッションのインメモリレジストリ。
///
/// `sessions` と `order` は常に同じロックの下で一緒に更新する。
/// イベントハンドラの呼び出しはロック解放後にのみ行う。
pub struct Manager {
    state: RwLock<ManagerState>,
    config: Arc<ManagerConfig>,
}

impl Manager {
    pub fn new(config: ManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            state: RwLock::new(ManagerState {
                sessions: HashMap::new(),
                order: Vec::new(),
                handler: None,
            }),
            config: Arc::new(config),
        })
    }

    /// セッションを作成して PTY を起動する。
    ///
    /// PTY 起動前にレジストリへ登録することで、子プロセスが即座に
    /// 終了しても on_exit 経由の除去が確実に働く。created イベントが
    /// 返るまで closed イベントを遅延させるバリアもここで張る。
    pub async fn create_session(
        self: &Arc<Self>,
        name: &str,
        working_dir: &str,
        cols: u16,
        rows: u16,
    ) -> Result<Arc<Session>, ManagerError> {
        let session_id = generate_session_id();

        let name = if name.is_empty() {
            workdir::directory_display_name(working_dir)
        } else {
            name.to_string()
        };

        let working_dir = if working_dir.is_empty() {
            dirs::home_dir()
                .map(|home| home.to_string_lossy().into_owned())
                .unwrap_or_else(|| "/".to_string())
        } else {
            working_dir.to_string()
        };

        // セッション生成中の初期出力を取りこぼさないよう、現時点の
        // ハンドラをスナップショットしておく
        let initial_handler = self.lock_read().handler.clone();

        let session = Session::new(
            session_id.clone(),
            name.clone(),
            working_dir.clone(),
            Arc::clone(&self.config),
        );
        session.set_event_handler(initial_handler);

        let (created_tx, created_rx) = watch::channel(false);
        session.set_on_exit(build_reap_callback(Arc::downgrade(self), created_rx));

        {
            let mut state = self.lock_write();
            if state.sessions.len() >= self.config.max_sessions {
                return Err(ManagerError::LimitExceeded);
            }
            state.sessions.insert(session_id.clone(), Arc::clone(&session));
            state.order.push(session_id.clone());
        }

        if let Err(e) = session.activate(cols, rows).await {
            self.detach_session(&session_id);
            session.cleanup().await;
            let _ = created_tx.send(true);
            tracing::error!(session_id = %session_id, error = %e, "Terminal session creation failed");
            return Err(e.into());
        }

        // 初期化中に差し替えられた可能性があるためハンドラを取り直す
        let handler = self.lock_read().handler.clone();
        session.set_event_handler(handler.clone());

        tracing::info!(
            session_id = %session_id,
            name = %name,
            working_dir = %working_dir,
            "Created terminal session"
        );

        if let Some(handler) = handler {
            handler.on_terminal_session_created(&session);
        }

        // created バリア解除: これ以降 on_exit の closed 通知が走れる
        let _ = created_tx.send(true);

        Ok(session)
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.lock_read().sessions.get(session_id).cloned()
    }

    /// 作成順のセッション一覧
    pub fn list_sessions(&self) -> Vec<Arc<Session>> {
        let state = self.lock_read();
        state
            .order
            .iter()
            .filter_map(|id| state.sessions.get(id).cloned())
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.lock_read().sessions.len()
    }

    /// セッションを除去して停止する
    pub async fn delete_session(&self, session_id: &str) -> Result<(), ManagerError> {
        let Some((session, handler)) = self.detach_session(session_id) else {
            return Err(ManagerError::NotFound(session_id.to_string()));
        };

        session.cleanup().await;
        if let Some(handler) = handler {
            handler.on_terminal_session_closed(session_id);
        }

        tracing::info!(
            session_id = %session_id,
            remaining = self.session_count(),
            "Deleted terminal session"
        );
        Ok(())
    }

    /// 子プロセス終了時の自動除去。既に消えていれば no-op。
    async fn reap_session(&self, session_id: &str) {
        let Some((session, handler)) = self.detach_session(session_id) else {
            return;
        };

        session.cleanup().await;
        if let Some(handler) = handler {
            handler.on_terminal_session_closed(session_id);
        }

        tracing::info!(
            session_id = %session_id,
            remaining = self.session_count(),
            "Deleted terminal session (auto)"
        );
    }

    fn detach_session(
        &self,
        session_id: &str,
    ) -> Option<(Arc<Session>, Option<Arc<dyn TerminalEventHandler>>)> {
        let mut state = self.lock_write();
        let session = state.sessions.remove(session_id)?;
        state.order.retain(|id| id != session_id);
        Some((session, state.handler.clone()))
    }

    pub fn rename_session(&self, session_id: &str, new_name: &str) -> Result<(), ManagerError> {
        let session = self
            .get_session(session_id)
            .ok_or_else(|| ManagerError::NotFound(session_id.to_string()))?;
        session.rename(new_name);
        tracing::info!(session_id = %session_id, new_name = %new_name, "Renamed terminal session");
        Ok(())
    }

    /// dormant セッションの PTY を起動する。起動済みなら no-op。
    pub async fn activate_session(
        &self,
        session_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), ManagerError> {
        let session = self
            .get_session(session_id)
            .ok_or_else(|| ManagerError::NotFound(session_id.to_string()))?;

        // activate は内部で同期化されており二重起動しない
        session.activate(cols, rows).await?;
        tracing::info!(session_id = %session_id, "Activated session");
        Ok(())
    }

    pub fn clear_session_history(&self, session_id: &str) -> Result<(), ManagerError> {
        let session = self
            .get_session(session_id)
            .ok_or_else(|| ManagerError::NotFound(session_id.to_string()))?;
        session.clear_history();
        Ok(())
    }

    /// ハンドラを差し替える。既存セッションにも即時反映される。
    pub fn set_event_handler(&self, handler: Arc<dyn TerminalEventHandler>) {
        let mut state = self.lock_write();
        state.handler = Some(Arc::clone(&handler));
        for session in state.sessions.values() {
            session.set_event_handler(Some(Arc::clone(&handler)));
        }
    }

    /// 全セッションを停止して空にする
    pub async fn cleanup(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut state = self.lock_write();
            state.order.clear();
            state.sessions.drain().map(|(_, session)| session).collect()
        };

        tracing::info!(count = sessions.len(), "Cleaning up all terminal sessions");
        for session in sessions {
            session.cleanup().await;
        }
    }

    fn lock_read(&self) -> std::sync::RwLockReadGuard<'_, ManagerState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_write(&self) -> std::sync::RwLockWriteGuard<'_, ManagerState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// 子プロセス終了時に自動除去を起動するコールバックを組み立てる。
/// created バリアが解除されるまで closed 通知を遅延させる。
fn build_reap_callback(
    manager: Weak<Manager>,
    created_rx: watch::Receiver<bool>,
) -> super::session::ExitCallback {
    Box::new(move |session_id: &str| {
        let session_id = session_id.to_string();
        let manager = manager.clone();
        let mut created_rx = created_rx.clone();
        tokio::spawn(async move {
            // CreateSession が返る（= created イベントが配送済みになる）のを待つ
            let _ = created_rx.wait_for(|created| *created).await;
            if let Some(manager) = manager.upgrade() {
                manager.reap_session(&session_id).await;
            }
        });
    })
}

/// 推測不能なセッション ID を生成する: "session-" + 128bit 乱数の hex
fn generate_session_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    format!("session-{}", hex::encode(bytes))
}
