use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex as TokioMutex, watch};

use super::manager::ManagerConfig;
use super::ring_buffer::RingBuffer;
use super::workdir;
use super::{Chunk, ConnectionInfo, SessionInfo, TerminalEventHandler, clamp_terminal_size};

/// PTY 読み取りバッファサイズ
const READ_BUF_SIZE: usize = 4096;

/// 書き込み後この時間内の出力は入力エコーとみなす
const ECHO_WINDOW: Duration = Duration::from_millis(100);

/// cleanup 時のプロセス終了待ちタイムアウト（SIGTERM 後と SIGKILL 後）
const EXIT_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Session の操作エラー
#[derive(Debug)]
pub enum SessionError {
    /// cleanup 済みセッションの再起動
    Closed,
    /// PTY が起動していない
    PtyUnavailable,
    /// PTY / 子プロセスの起動失敗
    SpawnFailed(String),
    /// PTY への書き込み失敗
    WriteFailed(std::io::Error),
    /// カーネル PTY リサイズ失敗
    ResizeFailed(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "session is closed"),
            Self::PtyUnavailable => write!(f, "PTY not available"),
            Self::SpawnFailed(msg) => write!(f, "failed to start PTY: {msg}"),
            Self::WriteFailed(e) => write!(f, "failed to write to PTY: {e}"),
            Self::ResizeFailed(msg) => write!(f, "failed to resize PTY: {msg}"),
        }
    }
}

impl std::error::Error for SessionError {}

pub(crate) type ExitCallback = Box<dyn Fn(&str) + Send + Sync>;

struct Naming {
    name: String,
    working_dir: String,
    current_working_dir: String,
}

struct ResizeWindow {
    suppressing: bool,
    end_at: Instant,
}

#[derive(Default)]
struct LastInput {
    source: String,
    at: Option<Instant>,
    hash: [u8; 32],
    len: usize,
}

/// async 側からのみ触る PTY 状態
struct SessionIo {
    writer: Option<Box<dyn Write + Send>>,
    master: Option<Box<dyn MasterPty + Send>>,
    child_pid: Option<u32>,
    connections: HashMap<String, ConnectionInfo>,
    wait_done_rx: Option<watch::Receiver<bool>>,
}

struct SpawnedPty {
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    pid: Option<u32>,
}

/// PTY 1 本とその子プロセスを所有する永続ターミナルセッション。
///
/// 状態は dormant → active → closed と遷移する。出力読み取りは
/// blocking スレッド上の reader タスクが担い、そこから触る状態は
/// atomics と std ロックに限定している（await を跨いで保持しない）。
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,

    config: Arc<ManagerConfig>,

    active: AtomicBool,
    closed: AtomicBool,
    sequence: AtomicI64,
    last_active_ms: AtomicI64,

    ring: StdMutex<RingBuffer>,
    resize_window: StdMutex<ResizeWindow>,
    naming: StdRwLock<Naming>,
    last_input: StdMutex<LastInput>,
    handler: StdRwLock<Option<Arc<dyn TerminalEventHandler>>>,
    on_exit: StdMutex<Option<ExitCallback>>,

    io: TokioMutex<SessionIo>,
}

impl Session {
    pub(crate) fn new(
        id: String,
        name: String,
        working_dir: String,
        config: Arc<ManagerConfig>,
    ) -> Arc<Self> {
        let now = Utc::now();
        Arc::new(Self {
            id,
            created_at: now,
            ring: StdMutex::new(RingBuffer::new(config.history_buffer_size)),
            config,
            active: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sequence: AtomicI64::new(0),
            last_active_ms: AtomicI64::new(now.timestamp_millis()),
            resize_window: StdMutex::new(ResizeWindow {
                suppressing: false,
                end_at: Instant::now(),
            }),
            naming: StdRwLock::new(Naming {
                name,
                current_working_dir: working_dir.clone(),
                working_dir,
            }),
            last_input: StdMutex::new(LastInput::default()),
            handler: StdRwLock::new(None),
            on_exit: StdMutex::new(None),
            io: TokioMutex::new(SessionIo {
                writer: None,
                master: None,
                child_pid: None,
                connections: HashMap::new(),
                wait_done_rx: None,
            }),
        })
    }

    // --- ライフサイクル ---

    /// PTY を起動する。既に active なら no-op、closed なら失敗。
    pub async fn activate(self: &Arc<Self>, cols: u16, rows: u16) -> Result<(), SessionError> {
        let mut io = self.io.lock().await;

        if self.active.load(Ordering::Acquire) {
            tracing::warn!(session_id = %self.id, "Attempted to start PTY for active session");
            return Ok(());
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(SessionError::Closed);
        }

        let shell = self.config.shell_resolver.resolve_shell();
        let working_dir = self.lock_naming_read().working_dir.clone();
        tracing::info!(
            session_id = %self.id,
            shell = %shell,
            working_dir = %working_dir,
            "Starting terminal"
        );

        let (mut env, path_prepend) =
            match self.config.env_provider.build_env(&shell, &working_dir) {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!(error = %e, "Env provider failed");
                    (std::env::vars().collect(), String::new())
                }
            };
        if env.is_empty() {
            env = std::env::vars().collect();
        }

        if !path_prepend.is_empty() {
            if let Err(e) = self
                .config
                .shell_init_writer
                .ensure_shell_init_files(&path_prepend)
            {
                tracing::warn!(error = %e, "Failed to ensure shell init files");
            }
        }

        let (shell_args, shell_env) = self
            .config
            .shell_args_provider
            .shell_args(&shell, &path_prepend);

        let mut cmd = CommandBuilder::new(&shell);
        match shell_args {
            // 空スライスは「引数なしで起動」(zsh の ZDOTDIR 方式)
            Some(args) => {
                for arg in &args {
                    cmd.arg(arg);
                }
            }
            // 意見なし → 従来互換のログインシェル
            None => {
                cmd.arg("-l");
            }
        }

        if !working_dir.is_empty() {
            cmd.cwd(&working_dir);
        }

        cmd.env_clear();
        for (key, value) in env.into_iter().chain(shell_env) {
            cmd.env(key, value);
        }
        let te = &self.config.terminal_env;
        cmd.env("TERM", &te.term);
        cmd.env("COLORTERM", &te.colorterm);
        cmd.env("LANG", &te.lang);
        cmd.env("LC_ALL", &te.lc_all);
        cmd.env("TERM_PROGRAM", &te.term_program);
        cmd.env("TERM_PROGRAM_VERSION", &te.term_program_version);
        cmd.env("COLUMNS", cols.to_string());
        cmd.env("LINES", rows.to_string());
        cmd.env("PROMPT_EOL_MARK", "");
        cmd.env("TERMINFO", &te.terminfo);
        cmd.env("TERM_FEATURES", &te.term_features);

        let spawned = tokio::task::spawn_blocking(move || spawn_pty(cmd, cols, rows))
            .await
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?
            .map_err(SessionError::SpawnFailed)?;

        // リサイズ直後の再描画バーストが履歴を汚さないよう、初期の抑止
        // ウィンドウを reader 起動前に張る
        self.arm_resize_window(self.config.initial_resize_suppress);

        let (done_tx, done_rx) = watch::channel(false);
        io.writer = Some(spawned.writer);
        io.master = Some(spawned.master);
        io.child_pid = spawned.pid;
        io.wait_done_rx = Some(done_rx);
        self.active.store(true, Ordering::Release);
        self.touch();

        let reader_session = Arc::clone(self);
        tokio::task::spawn_blocking(move || reader_session.read_pty_output(spawned.reader));

        let waiter_session = Arc::clone(self);
        tokio::spawn(async move {
            waiter_session.wait_process_exit(spawned.child, done_tx).await;
        });

        tracing::info!(session_id = %self.id, cols, rows, "Started PTY session");
        Ok(())
    }

    pub async fn close(&self) {
        self.cleanup().await;
    }

    /// セッションを停止して資源を解放する。二重呼び出しは no-op。
    pub(crate) async fn cleanup(&self) {
        self.closed.store(true, Ordering::Release);

        let (pid, wait_rx) = {
            let mut io = self.io.lock().await;
            io.writer = None;
            // master を drop して PTY を閉じる
            io.master = None;
            (io.child_pid.take(), io.wait_done_rx.clone())
        };

        if let Some(pid) = pid {
            // SIGTERM → 2 秒待ち → SIGKILL → さらに 2 秒待ち。
            // 待機中はロックを保持しない（reader/waiter と直列化しないため）。
            let rc = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if rc != 0 {
                tracing::debug!(session_id = %self.id, pid, "Failed to send SIGTERM");
            }
            if !wait_for_exit(wait_rx.clone(), EXIT_WAIT_TIMEOUT).await {
                tracing::debug!(session_id = %self.id, pid, "Force killing process");
                unsafe { libc::kill(pid as i32, libc::SIGKILL) };
                let _ = wait_for_exit(wait_rx, EXIT_WAIT_TIMEOUT).await;
            }
        }

        {
            let mut io = self.io.lock().await;
            io.connections.clear();
        }

        self.active.store(false, Ordering::Release);
        tracing::info!(session_id = %self.id, "Cleaned up session");
    }

    async fn wait_process_exit(
        self: Arc<Self>,
        child: Box<dyn Child + Send + Sync>,
        done_tx: watch::Sender<bool>,
    ) {
        let wait_result = tokio::task::spawn_blocking(move || {
            let mut child = child;
            child.wait()
        })
        .await;

        match &wait_result {
            Ok(Ok(status)) => {
                tracing::debug!(session_id = %self.id, code = status.exit_code(), "Child process exited")
            }
            Ok(Err(e)) => tracing::debug!(session_id = %self.id, error = %e, "Child wait failed"),
            Err(e) => tracing::debug!(session_id = %self.id, error = %e, "Child wait task failed"),
        }

        {
            let mut io = self.io.lock().await;
            self.active.store(false, Ordering::Release);
            io.writer = None;
            io.master = None;
            io.child_pid = None;
        }

        let _ = done_tx.send(true);

        // closed イベントの発火は Manager の責務。ここでは reap コールバック
        // を起動するだけ（コールバック側が created バリアを待つ）。
        let on_exit = self.on_exit.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(callback) = on_exit {
            callback(&self.id);
        }
    }

    // --- PTY 出力 ---

    fn read_pty_output(&self, mut reader: Box<dyn Read + Send>) {
        tracing::info!(session_id = %self.id, "Starting PTY output reader");

        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            if self.closed.load(Ordering::Acquire) {
                tracing::info!(session_id = %self.id, "PTY output reader stopping");
                return;
            }

            match reader.read(&mut buf) {
                Ok(0) => {
                    tracing::debug!(session_id = %self.id, "PTY read finished (EOF)");
                    return;
                }
                Ok(n) => self.process_raw_output(&buf[..n]),
                Err(e) => {
                    tracing::debug!(session_id = %self.id, error = %e, "PTY read finished");
                    return;
                }
            }
        }
    }

    pub(crate) fn process_raw_output(&self, data: &[u8]) {
        self.touch();

        if self.should_skip_ring_write() {
            tracing::debug!(
                session_id = %self.id,
                data_len = data.len(),
                "Skipping ring buffer write during resize"
            );
        } else {
            self.lock_ring().write(data.to_vec());
        }

        self.broadcast_data(data);

        let text = String::from_utf8_lossy(data);
        if workdir::contains_workdir_hint(&text) {
            self.check_working_directory_change(&text);
        }
    }

    fn should_skip_ring_write(&self) -> bool {
        let mut window = self
            .resize_window
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if !window.suppressing {
            return false;
        }
        if Instant::now() >= window.end_at {
            window.suppressing = false;
            tracing::debug!(session_id = %self.id, "Resize suppression ended");
            return false;
        }
        true
    }

    fn broadcast_data(&self, data: &[u8]) {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;

        // ハンドラは同期的にこのセッションへ再入しうるため、呼び出し中は
        // いかなるロックも保持しない
        let handler = self.snapshot_handler();
        let (is_echo, original_source) = {
            let last = self.last_input.lock().unwrap_or_else(|e| e.into_inner());
            match last.at {
                Some(at) if !last.source.is_empty() && at.elapsed() < ECHO_WINDOW => {
                    (true, last.source.clone())
                }
                _ => (false, String::new()),
            }
        };

        match handler {
            Some(handler) => {
                handler.on_terminal_data(&self.id, data, sequence, is_echo, &original_source)
            }
            None => {
                tracing::warn!(session_id = %self.id, "No event handler for terminal data")
            }
        }
    }

    fn check_working_directory_change(&self, output: &str) {
        let Some(dir) = workdir::parse_working_directory(output) else {
            tracing::debug!(session_id = %self.id, "Failed to parse working directory");
            return;
        };

        if self.lock_naming_read().current_working_dir == dir {
            return;
        }

        tracing::info!(session_id = %self.id, to = %dir, "Working directory changed");

        let new_name = workdir::directory_display_name(&dir);
        let (old_name, name_changed) = {
            let mut naming = self.naming.write().unwrap_or_else(|e| e.into_inner());
            naming.current_working_dir = dir.clone();
            let old_name = naming.name.clone();
            let name_changed = new_name != old_name;
            if name_changed {
                naming.name = new_name.clone();
            }
            (old_name, name_changed)
        };

        if !name_changed {
            return;
        }

        tracing::info!(
            session_id = %self.id,
            old_name = %old_name,
            new_name = %new_name,
            "Updated session name"
        );

        if let Some(handler) = self.snapshot_handler() {
            handler.on_terminal_name_changed(&self.id, &old_name, &new_name, &dir);
        }
    }

    // --- 入力 ---

    /// PTY へ入力を書き込む。冗長な配送経路からの重複入力は、
    /// (長さ, sha256) が直前の入力と一致し dedup ウィンドウ内なら黙って捨てる。
    pub async fn write_data_with_source(
        &self,
        data: &[u8],
        source_conn_id: &str,
    ) -> Result<(), SessionError> {
        let mut io = self.io.lock().await;
        let Some(writer) = io.writer.as_mut() else {
            return Err(SessionError::PtyUnavailable);
        };

        let digest: [u8; 32] = Sha256::digest(data).into();
        {
            let last = self.last_input.lock().unwrap_or_else(|e| e.into_inner());
            let within_window = matches!(last.at, Some(at) if at.elapsed() < self.config.input_window);
            if within_window && last.len == data.len() && last.hash == digest {
                tracing::debug!(
                    session_id = %self.id,
                    data_len = data.len(),
                    "Ignoring duplicate input"
                );
                return Ok(());
            }
        }

        writer.write_all(data).map_err(|e| {
            tracing::error!(session_id = %self.id, error = %e, "Failed to write to PTY");
            SessionError::WriteFailed(e)
        })?;
        writer.flush().map_err(SessionError::WriteFailed)?;

        self.touch();
        {
            let mut last = self.last_input.lock().unwrap_or_else(|e| e.into_inner());
            last.source = source_conn_id.to_string();
            last.at = Some(Instant::now());
            last.hash = digest;
            last.len = data.len();
        }

        Ok(())
    }

    pub async fn write_data(&self, data: &[u8]) -> Result<(), SessionError> {
        self.write_data_with_source(data, "").await
    }

    // --- 接続とリサイズ ---

    pub async fn add_connection(&self, conn_id: &str, cols: u16, rows: u16) {
        if conn_id.is_empty() {
            tracing::error!(session_id = %self.id, "Cannot add connection with empty ID");
            return;
        }

        let mut io = self.io.lock().await;
        let existing = io.connections.insert(
            conn_id.to_string(),
            ConnectionInfo {
                conn_id: conn_id.to_string(),
                joined_at: Utc::now(),
                cols,
                rows,
            },
        );
        if existing.is_some() {
            tracing::debug!(session_id = %self.id, conn_id, "Replacing existing connection");
        } else {
            tracing::debug!(session_id = %self.id, conn_id, cols, rows, "Adding connection");
        }

        if let Err(e) = self.refit_pty_to_minimum(&mut io) {
            tracing::warn!(session_id = %self.id, error = %e, "Failed to resize after adding connection");
        }
    }

    pub async fn remove_connection(&self, conn_id: &str) {
        if conn_id.is_empty() {
            return;
        }

        let mut io = self.io.lock().await;
        if io.connections.remove(conn_id).is_none() {
            return;
        }
        tracing::debug!(session_id = %self.id, conn_id, "Removed connection");

        if let Err(e) = self.refit_pty_to_minimum(&mut io) {
            tracing::warn!(session_id = %self.id, error = %e, "Failed to resize after removing connection");
        }
    }

    pub async fn update_connection_size(&self, conn_id: &str, cols: u16, rows: u16) {
        if conn_id.is_empty() {
            return;
        }

        let mut io = self.io.lock().await;
        match io.connections.get_mut(conn_id) {
            Some(conn) => {
                conn.cols = cols;
                conn.rows = rows;
            }
            None => {
                // attach 完了前に resize が届いた場合や、切断直後の再接続で起こる
                tracing::debug!(session_id = %self.id, conn_id, "Connection not found for size update");
                return;
            }
        }

        if let Err(e) = self.refit_pty_to_minimum(&mut io) {
            tracing::warn!(session_id = %self.id, error = %e, "Failed to resize after update");
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.io.lock().await.connections.len()
    }

    /// 明示的なリサイズ。サイズ検証は呼び出し側の責務。
    pub async fn resize_pty(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        let io = self.io.lock().await;
        let Some(master) = io.master.as_ref() else {
            return Err(SessionError::PtyUnavailable);
        };

        self.arm_resize_window(self.config.resize_suppress);
        if let Err(e) = master.resize(build_winsize(cols, rows)) {
            self.clear_resize_window();
            return Err(SessionError::ResizeFailed(e.to_string()));
        }

        tracing::info!(session_id = %self.id, cols, rows, "PTY resized");
        Ok(())
    }

    /// 現在の PTY サイズ (cols, rows)。PTY がなければ None。
    pub async fn pty_size(&self) -> Option<(u16, u16)> {
        let io = self.io.lock().await;
        let master = io.master.as_ref()?;
        master.get_size().ok().map(|size| (size.cols, size.rows))
    }

    fn refit_pty_to_minimum(&self, io: &mut SessionIo) -> Result<(), SessionError> {
        let Some(master) = io.master.as_ref() else {
            return Err(SessionError::PtyUnavailable);
        };

        let (cols, rows) = minimum_terminal_size(io.connections.values());
        self.arm_resize_window(self.config.resize_suppress);
        if let Err(e) = master.resize(build_winsize(cols, rows)) {
            self.clear_resize_window();
            return Err(SessionError::ResizeFailed(e.to_string()));
        }

        tracing::debug!(session_id = %self.id, cols, rows, "PTY resized to minimum size");
        Ok(())
    }

    fn arm_resize_window(&self, duration: Duration) {
        let mut window = self
            .resize_window
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        window.suppressing = true;
        window.end_at = Instant::now() + duration;
    }

    fn clear_resize_window(&self) {
        let mut window = self
            .resize_window
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        window.suppressing = false;
    }

    // --- 履歴 ---

    pub fn history_chunks(&self) -> Vec<Chunk> {
        self.lock_ring().read_all_chunks()
    }

    /// fromSeq 以降のチャンクを、リプレイフィルタ適用済みで返す
    pub fn history_from_sequence(&self, from_seq: i64) -> Vec<Chunk> {
        let chunks = self.history_chunks();
        if chunks.is_empty() {
            return chunks;
        }

        let filtered: Vec<Chunk> = if from_seq > 0 {
            chunks
                .into_iter()
                .filter(|chunk| chunk.sequence >= from_seq)
                .collect()
        } else {
            chunks
        };

        self.config.history_filter.filter(filtered)
    }

    /// 履歴を消去する。チャンクのシーケンス番号は 1 に戻るが、
    /// 配送済みイベントのシーケンスには影響しない。
    pub fn clear_history(&self) {
        self.lock_ring().clear();
        tracing::info!(session_id = %self.id, "Terminal history cleared");
    }

    pub fn history_stats(&self) -> super::RingBufferStats {
        self.lock_ring().stats()
    }

    // --- アクセサ ---

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn name(&self) -> String {
        self.lock_naming_read().name.clone()
    }

    pub fn working_dir(&self) -> String {
        self.lock_naming_read().working_dir.clone()
    }

    pub fn current_working_dir(&self) -> String {
        self.lock_naming_read().current_working_dir.clone()
    }

    pub fn last_active_ms(&self) -> i64 {
        self.last_active_ms.load(Ordering::Relaxed)
    }

    pub fn session_info(&self) -> SessionInfo {
        let naming = self.lock_naming_read();
        SessionInfo {
            id: self.id.clone(),
            name: naming.name.clone(),
            working_dir: naming.working_dir.clone(),
            created_at_ms: self.created_at.timestamp_millis(),
            last_active_at_ms: self.last_active_ms(),
            is_active: self.is_active(),
        }
    }

    pub(crate) fn rename(&self, new_name: &str) {
        let mut naming = self.naming.write().unwrap_or_else(|e| e.into_inner());
        naming.name = new_name.to_string();
        drop(naming);
        self.touch();
    }

    pub(crate) fn set_event_handler(&self, handler: Option<Arc<dyn TerminalEventHandler>>) {
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = handler;
    }

    pub(crate) fn set_on_exit(&self, callback: ExitCallback) {
        *self.on_exit.lock().unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    fn snapshot_handler(&self) -> Option<Arc<dyn TerminalEventHandler>> {
        self.handler.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn touch(&self) {
        self.last_active_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    fn lock_ring(&self) -> std::sync::MutexGuard<'_, RingBuffer> {
        self.ring.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_naming_read(&self) -> std::sync::RwLockReadGuard<'_, Naming> {
        self.naming.read().unwrap_or_else(|e| e.into_inner())
    }
}

/// 接続群の最小サイズに合わせた PTY サイズを返す。接続がなければ 80×24。
fn minimum_terminal_size<'a>(
    connections: impl Iterator<Item = &'a ConnectionInfo>,
) -> (u16, u16) {
    let mut min_cols = u16::MAX;
    let mut min_rows = u16::MAX;
    let mut any = false;
    for conn in connections {
        any = true;
        min_cols = min_cols.min(conn.cols);
        min_rows = min_rows.min(conn.rows);
    }

    if !any {
        return (80, 24);
    }
    clamp_terminal_size(min_cols, min_rows)
}

fn build_winsize(cols: u16, rows: u16) -> PtySize {
    // 一部のプログラム向けにピクセルサイズも概算で埋める
    const CHAR_WIDTH: f64 = 8.4;
    const CHAR_HEIGHT: f64 = 18.0;
    PtySize {
        rows,
        cols,
        pixel_width: (cols as f64 * CHAR_WIDTH) as u16,
        pixel_height: (rows as f64 * CHAR_HEIGHT) as u16,
    }
}

fn spawn_pty(cmd: CommandBuilder, cols: u16, rows: u16) -> Result<SpawnedPty, String> {
    let pty_system = native_pty_system();
    let size = build_winsize(cols, rows);

    let pair = pty_system
        .openpty(size)
        .map_err(|e| format!("failed to open PTY: {e}"))?;
    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| format!("failed to spawn command: {e}"))?;
    drop(pair.slave);

    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| format!("failed to clone PTY reader: {e}"))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| format!("failed to take PTY writer: {e}"))?;

    // 一部のエミュレータはサイズを再確認するため、少し置いて二度設定する
    let _ = pair.master.resize(size);
    std::thread::sleep(Duration::from_millis(10));
    if pair.master.resize(size).is_ok() {
        tracing::debug!("Terminal size re-confirmed");
    }

    let pid = child.process_id();
    Ok(SpawnedPty {
        reader,
        writer,
        master: pair.master,
        child,
        pid,
    })
}

async fn wait_for_exit(rx: Option<watch::Receiver<bool>>, timeout: Duration) -> bool {
    let Some(mut rx) = rx else {
        return true;
    };
    tokio::time::timeout(timeout, rx.wait_for(|done| *done))
        .await
        .is_ok()
}
