use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::sync::mpsc;

use floeterm::terminal::shell::{ShellArgsProvider, StaticShellResolver};
use floeterm::terminal::{Manager, ManagerConfig, Session, TerminalEventHandler};

/// stty で PTY のエコーを切ってから cat を回す。出力は cat 由来のみに
/// なるので、マーカーの出現回数が数えられる。
struct CatShellArgs;

impl ShellArgsProvider for CatShellArgs {
    fn shell_args(&self, _: &str, _: &str) -> (Option<Vec<String>>, Vec<(String, String)>) {
        (
            Some(vec![
                "-c".to_string(),
                "stty raw -echo 2>/dev/null; printf 'ready\\n'; cat".to_string(),
            ]),
            Vec::new(),
        )
    }
}

/// 即座に終了するシェル（created/closed の順序テスト用）
struct QuickExitShellArgs;

impl ShellArgsProvider for QuickExitShellArgs {
    fn shell_args(&self, _: &str, _: &str) -> (Option<Vec<String>>, Vec<(String, String)>) {
        (Some(vec!["-c".to_string(), "exit 0".to_string()]), Vec::new())
    }
}

fn test_manager_config(args: Arc<dyn ShellArgsProvider>) -> ManagerConfig {
    let mut config = ManagerConfig::default();
    config.shell_resolver = Arc::new(StaticShellResolver {
        shell: "/bin/sh".to_string(),
    });
    config.shell_args_provider = args;
    config.initial_resize_suppress = Duration::from_millis(1);
    config.resize_suppress = Duration::from_millis(1);
    config
}

fn cat_manager() -> Arc<Manager> {
    Manager::new(test_manager_config(Arc::new(CatShellArgs)))
}

/// 受信した data イベント一式
struct DataEvent {
    data: Vec<u8>,
    sequence: i64,
    is_echo: bool,
    source: String,
}

/// data/name イベントをチャネルへ流すだけのハンドラ
struct CaptureHandler {
    data_tx: mpsc::UnboundedSender<DataEvent>,
    name_tx: mpsc::UnboundedSender<(String, String, String)>,
}

impl CaptureHandler {
    fn new() -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<DataEvent>,
        mpsc::UnboundedReceiver<(String, String, String)>,
    ) {
        let (data_tx, data_rx) = mpsc::unbounded_channel();
        let (name_tx, name_rx) = mpsc::unbounded_channel();
        (Arc::new(Self { data_tx, name_tx }), data_rx, name_rx)
    }
}

impl TerminalEventHandler for CaptureHandler {
    fn on_terminal_data(&self, _: &str, data: &[u8], sequence: i64, is_echo: bool, source: &str) {
        if !data.is_empty() {
            let _ = self.data_tx.send(DataEvent {
                data: data.to_vec(),
                sequence,
                is_echo,
                source: source.to_string(),
            });
        }
    }

    fn on_terminal_name_changed(&self, _: &str, old_name: &str, new_name: &str, working_dir: &str) {
        let _ = self.name_tx.send((
            old_name.to_string(),
            new_name.to_string(),
            working_dir.to_string(),
        ));
    }

    fn on_terminal_session_created(&self, _: &Arc<Session>) {}
    fn on_terminal_session_closed(&self, _: &str) {}
    fn on_terminal_error(&self, _: &str, _: &str) {}
}

/// 出力に expected が現れるまでチャネルを読み続ける
async fn wait_for_output(
    rx: &mut mpsc::UnboundedReceiver<DataEvent>,
    expected: &str,
    timeout: Duration,
) -> String {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut buf = String::new();

    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Some(event)) => {
                buf.push_str(&String::from_utf8_lossy(&event.data));
                if buf.contains(expected) {
                    return buf;
                }
            }
            _ => panic!("timeout waiting for output {:?}, got {:?}", expected, buf),
        }
    }
}

// ============================================================
// ライフサイクルと出力
// ============================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn session_lifecycle_and_output() {
    let manager = cat_manager();
    let (handler, mut data_rx, _name_rx) = CaptureHandler::new();
    manager.set_event_handler(handler);

    let session = manager
        .create_session("test", "", 80, 24)
        .await
        .expect("failed to create session");

    wait_for_output(&mut data_rx, "ready", Duration::from_secs(2)).await;

    session
        .write_data_with_source(b"ping\n", "test")
        .await
        .expect("write failed");

    wait_for_output(&mut data_rx, "ping", Duration::from_secs(2)).await;

    let history = session.history_from_sequence(1);
    assert!(!history.is_empty(), "expected history to contain data");

    manager.cleanup().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn broadcast_sequences_are_strictly_increasing() {
    let manager = cat_manager();
    let (handler, mut data_rx, _name_rx) = CaptureHandler::new();
    manager.set_event_handler(handler);

    let session = manager.create_session("t", "", 80, 24).await.unwrap();
    wait_for_output(&mut data_rx, "ready", Duration::from_secs(2)).await;

    for i in 0..5 {
        session
            .write_data(format!("seq-{}\n", i).as_bytes())
            .await
            .unwrap();
    }

    // seq-4 が届くまでのイベント列を集めて順序を確認する
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let mut sequences = Vec::new();
    let mut buf = String::new();
    loop {
        let event = tokio::time::timeout_at(deadline, data_rx.recv())
            .await
            .expect("timed out waiting for output")
            .expect("data channel closed");
        sequences.push(event.sequence);
        buf.push_str(&String::from_utf8_lossy(&event.data));
        if buf.contains("seq-4") {
            break;
        }
    }

    assert!(!sequences.is_empty());
    for pair in sequences.windows(2) {
        assert!(pair[0] < pair[1], "sequence went backwards: {:?}", sequences);
    }

    manager.cleanup().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn recent_input_is_marked_as_echo() {
    let manager = cat_manager();
    let (handler, mut data_rx, _name_rx) = CaptureHandler::new();
    manager.set_event_handler(handler);

    let session = manager.create_session("t", "", 80, 24).await.unwrap();

    // 起動直後の出力は入力由来ではない
    let ready = tokio::time::timeout(Duration::from_secs(2), data_rx.recv())
        .await
        .expect("no initial output")
        .expect("data channel closed");
    assert!(!ready.is_echo);
    assert!(ready.source.is_empty());

    session
        .write_data_with_source(b"echo-probe\n", "c9")
        .await
        .unwrap();

    // cat の応答は書き込み直後に返るので echo 扱いになる
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let event = tokio::time::timeout_at(deadline, data_rx.recv())
            .await
            .expect("timed out waiting for echo")
            .expect("data channel closed");
        if String::from_utf8_lossy(&event.data).contains("echo-probe") {
            assert!(event.is_echo, "expected echo flag for immediate reply");
            assert_eq!(event.source, "c9");
            break;
        }
    }

    manager.cleanup().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn manager_list_rename_delete() {
    let manager = cat_manager();

    let session = manager
        .create_session("", "", 80, 24)
        .await
        .expect("create session failed");

    // 空の name は作業ディレクトリ（ここではホーム）から導出される
    assert_eq!(session.name(), "home");

    let sessions = manager.list_sessions();
    assert_eq!(sessions.len(), 1);

    manager
        .rename_session(&session.id, "renamed")
        .expect("rename failed");
    let updated = manager.get_session(&session.id).expect("session missing");
    assert_eq!(updated.name(), "renamed");

    manager
        .delete_session(&session.id)
        .await
        .expect("delete failed");
    assert_eq!(manager.session_count(), 0);

    // 二重削除は NotFound
    assert!(manager.delete_session(&session.id).await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn session_id_is_unguessable_format() {
    let manager = cat_manager();
    let session = manager.create_session("t", "", 80, 24).await.unwrap();

    let hex_part = session.id.strip_prefix("session-").expect("missing prefix");
    assert_eq!(hex_part.len(), 32);
    assert!(hex_part.chars().all(|c| c.is_ascii_hexdigit()));

    manager.cleanup().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn activate_is_idempotent_and_closed_session_rejects() {
    let manager = cat_manager();
    let session = manager.create_session("t", "", 80, 24).await.unwrap();

    // 起動済みセッションへの activate は no-op
    session.activate(80, 24).await.expect("re-activate should be a no-op");
    assert!(session.is_active());

    let id = session.id.clone();
    manager.delete_session(&id).await.unwrap();

    // cleanup 済みセッションは再起動できない
    let err = session.activate(80, 24).await.expect_err("expected closed error");
    assert_eq!(err.to_string(), "session is closed");
}

// ============================================================
// 履歴
// ============================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn clear_history_resets_sequences() {
    let manager = cat_manager();
    let (handler, mut data_rx, _name_rx) = CaptureHandler::new();
    manager.set_event_handler(handler);

    let session = manager.create_session("t", "", 80, 24).await.unwrap();
    wait_for_output(&mut data_rx, "ready", Duration::from_secs(2)).await;
    // 抑止ウィンドウ明け後の出力が履歴に入るよう少し待つ
    tokio::time::sleep(Duration::from_millis(20)).await;

    session.write_data(b"first\n").await.unwrap();
    wait_for_output(&mut data_rx, "first", Duration::from_secs(2)).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while session.history_chunks().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "history never filled");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    session.clear_history();
    assert!(session.history_chunks().is_empty());

    // 消去後の最初のチャンクはシーケンス 1 から振り直される
    session.write_data(b"second\n").await.unwrap();
    wait_for_output(&mut data_rx, "second", Duration::from_secs(2)).await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let chunks = session.history_chunks();
        if !chunks.is_empty() {
            assert_eq!(chunks[0].sequence, 1);
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "history never refilled");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    manager.cleanup().await;
}

// ============================================================
// 入力の重複排除
// ============================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_input_within_window_is_dropped() {
    let mut config = test_manager_config(Arc::new(CatShellArgs));
    // タイミング依存を避けるため窓を広げる
    config.input_window = Duration::from_millis(200);
    let manager = Manager::new(config);

    let (handler, mut data_rx, _name_rx) = CaptureHandler::new();
    manager.set_event_handler(handler);

    let session = manager.create_session("t", "", 80, 24).await.unwrap();
    wait_for_output(&mut data_rx, "ready", Duration::from_secs(2)).await;

    // 同一内容を窓内に 2 回 → PTY には 1 回だけ届く
    session.write_data_with_source(b"dup-marker\n", "c1").await.unwrap();
    session.write_data_with_source(b"dup-marker\n", "c2").await.unwrap();

    // 窓を跨いだ 3 回目は届く
    tokio::time::sleep(Duration::from_millis(300)).await;
    session.write_data_with_source(b"dup-marker\n", "c1").await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;
    session.write_data(b"end-marker\n").await.unwrap();
    let buf = wait_for_output(&mut data_rx, "end-marker", Duration::from_secs(2)).await;

    let count = buf.matches("dup-marker").count();
    assert_eq!(count, 2, "expected dedup to drop one write, output: {:?}", buf);

    manager.cleanup().await;
}

// ============================================================
// 最小サイズポリシー
// ============================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pty_follows_minimum_connection_size() {
    let manager = cat_manager();
    let session = manager.create_session("t", "", 80, 24).await.unwrap();

    session.add_connection("c1", 100, 30).await;
    assert_eq!(session.pty_size().await, Some((100, 30)));

    session.add_connection("c2", 80, 24).await;
    assert_eq!(session.pty_size().await, Some((80, 24)));

    // 極端に小さい接続は下限 (20,5) でクランプされる
    session.update_connection_size("c1", 10, 3).await;
    assert_eq!(session.pty_size().await, Some((20, 5)));

    session.remove_connection("c1").await;
    assert_eq!(session.pty_size().await, Some((80, 24)));

    // 接続ゼロでは既定サイズに戻る
    session.remove_connection("c2").await;
    assert_eq!(session.pty_size().await, Some((80, 24)));

    manager.cleanup().await;
}

// ============================================================
// 作業ディレクトリ検出 (cat が入力をそのまま吐くことを利用して
// OSC 633 シーケンスを出力へ注入する)
// ============================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workdir_sequence_renames_session() {
    let manager = cat_manager();
    let (handler, mut data_rx, mut name_rx) = CaptureHandler::new();
    manager.set_event_handler(handler);

    let session = manager.create_session("test", "", 80, 24).await.unwrap();
    wait_for_output(&mut data_rx, "ready", Duration::from_secs(2)).await;

    session
        .write_data(b"\x1b]633;P;Cwd=/tmp\x07\n")
        .await
        .unwrap();

    let (old_name, new_name, working_dir) =
        tokio::time::timeout(Duration::from_secs(2), name_rx.recv())
            .await
            .expect("timed out waiting for name event")
            .expect("name channel closed");

    assert_eq!(old_name, "test");
    assert_eq!(new_name, "tmp");
    assert_eq!(working_dir, "/tmp");
    assert_eq!(session.name(), "tmp");
    assert_eq!(session.current_working_dir(), "/tmp");

    manager.cleanup().await;
}

// ============================================================
// ハンドラ再入（ロック保持中のコールバック禁止の検証）
// ============================================================

struct ManagerReentrantHandler {
    manager: Mutex<Option<Arc<Manager>>>,
    created: mpsc::UnboundedSender<usize>,
}

impl TerminalEventHandler for ManagerReentrantHandler {
    fn on_terminal_data(&self, _: &str, _: &[u8], _: i64, _: bool, _: &str) {}
    fn on_terminal_name_changed(&self, _: &str, _: &str, _: &str, _: &str) {}

    fn on_terminal_session_created(&self, _: &Arc<Session>) {
        // create_session がロックを握ったままハンドラを呼ぶ実装だと
        // ここでデッドロックする
        let listed = self
            .manager
            .lock()
            .unwrap()
            .as_ref()
            .map(|m| m.list_sessions().len())
            .unwrap_or(0);
        let _ = self.created.send(listed);
    }

    fn on_terminal_session_closed(&self, _: &str) {}
    fn on_terminal_error(&self, _: &str, _: &str) {}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn created_handler_may_reenter_manager() {
    let manager = cat_manager();
    let (created_tx, mut created_rx) = mpsc::unbounded_channel();
    let handler = Arc::new(ManagerReentrantHandler {
        manager: Mutex::new(Some(Arc::clone(&manager))),
        created: created_tx,
    });
    manager.set_event_handler(handler);

    let create = tokio::time::timeout(
        Duration::from_secs(2),
        manager.create_session("test", "", 80, 24),
    )
    .await;
    let session = create
        .expect("create_session appears to be deadlocked")
        .expect("create_session failed");

    let listed = tokio::time::timeout(Duration::from_secs(2), created_rx.recv())
        .await
        .expect("created handler never ran")
        .expect("created channel closed");
    assert_eq!(listed, 1);

    manager.delete_session(&session.id).await.unwrap();
}

struct DataReentrantHandler {
    session: OnceLock<Arc<Session>>,
    fired: AtomicBool,
    done: mpsc::UnboundedSender<Result<(), String>>,
}

impl TerminalEventHandler for DataReentrantHandler {
    fn on_terminal_data(&self, _: &str, _: &[u8], _: i64, _: bool, _: &str) {
        let Some(session) = self.session.get() else {
            return;
        };
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        // broadcast がロックを握ったままハンドラを呼ぶ実装だとここで詰まる
        let result = futures::executor::block_on(session.write_data_with_source(b"ping\n", "handler"))
            .map_err(|e| e.to_string());
        let _ = self.done.send(result);
    }

    fn on_terminal_name_changed(&self, _: &str, _: &str, _: &str, _: &str) {}
    fn on_terminal_session_created(&self, _: &Arc<Session>) {}
    fn on_terminal_session_closed(&self, _: &str) {}
    fn on_terminal_error(&self, _: &str, _: &str) {}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn data_handler_may_write_back_without_deadlock() {
    let manager = cat_manager();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    let handler = Arc::new(DataReentrantHandler {
        session: OnceLock::new(),
        fired: AtomicBool::new(false),
        done: done_tx,
    });
    manager.set_event_handler(Arc::clone(&handler) as Arc<dyn TerminalEventHandler>);

    let session = manager.create_session("test", "", 80, 24).await.unwrap();
    let _ = handler.session.set(Arc::clone(&session));

    // ハンドラ登録後に必ず 1 回は data イベントが出るよう入力を蹴る
    session.write_data(b"kick\n").await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), done_rx.recv())
        .await
        .expect("data handler appears to be deadlocked")
        .expect("done channel closed");
    assert!(result.is_ok(), "write from handler failed: {:?}", result);

    manager.cleanup().await;
}

// ============================================================
// created → closed の順序（即時終了する子プロセス）
// ============================================================

struct EventOrderHandler {
    events: mpsc::UnboundedSender<&'static str>,
}

impl TerminalEventHandler for EventOrderHandler {
    fn on_terminal_data(&self, _: &str, _: &[u8], _: i64, _: bool, _: &str) {}
    fn on_terminal_name_changed(&self, _: &str, _: &str, _: &str, _: &str) {}

    fn on_terminal_session_created(&self, _: &Arc<Session>) {
        // created の処理を遅くして、子プロセスの終了が先行する状況を作る。
        // created バリアがなければ closed が先に飛ぶ。
        std::thread::sleep(Duration::from_millis(200));
        let _ = self.events.send("created");
    }

    fn on_terminal_session_closed(&self, _: &str) {
        let _ = self.events.send("closed");
    }

    fn on_terminal_error(&self, _: &str, _: &str) {}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn created_event_precedes_closed_even_on_fast_exit() {
    let manager = Manager::new(test_manager_config(Arc::new(QuickExitShellArgs)));
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    manager.set_event_handler(Arc::new(EventOrderHandler { events: events_tx }));

    manager
        .create_session("fast-exit", "", 80, 24)
        .await
        .expect("create_session failed");

    let first = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
        .await
        .expect("timed out waiting for first event")
        .expect("events channel closed");
    let second = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
        .await
        .expect("timed out waiting for second event")
        .expect("events channel closed");

    assert_eq!((first, second), ("created", "closed"));
}

// ============================================================
// 空の argv (Some(vec![])) はログインシェルへフォールバックしない
// ============================================================

struct EmptyArgsProvider;

impl ShellArgsProvider for EmptyArgsProvider {
    fn shell_args(&self, _: &str, _: &str) -> (Option<Vec<String>>, Vec<(String, String)>) {
        (Some(Vec::new()), Vec::new())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn empty_shell_args_skip_login_fallback() {
    // /bin/sh を引数なしで起動できること（"-l" が付くと対話シェル扱いに
    // なるだけでどちらも起動はするので、ここでは起動成功と生存を確認する）
    let manager = Manager::new(test_manager_config(Arc::new(EmptyArgsProvider)));
    let session = manager.create_session("t", "", 80, 24).await.unwrap();
    assert!(session.is_active());

    // 対話シェルとして入力を受け付ける
    session.write_data(b"exit\n").await.unwrap();

    manager.cleanup().await;
}
