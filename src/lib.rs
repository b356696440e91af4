pub mod api;
pub mod client;
pub mod config;
pub mod hub;
pub mod ratelimit;
pub mod terminal;
pub mod ws;

use std::sync::Arc;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
};

use config::Config;
use hub::SessionHub;
use ratelimit::ByteRateLimiter;
use terminal::{Manager, ManagerConfig};
use terminal::shell::StaticShellResolver;

/// JSON ボディの上限
const MAX_JSON_BODY_BYTES: usize = 1 << 20;

/// 入力レートリミット: 256 KiB/s、バースト 512 KiB
const INPUT_RATE_BYTES_PER_SEC: usize = 256 * 1024;
const INPUT_BURST_BYTES: usize = 512 * 1024;

pub struct AppState {
    pub config: Config,
    pub manager: Arc<Manager>,
    pub hub: Arc<SessionHub>,
    pub input_limiter: ByteRateLimiter,
}

/// アプリケーション Router を構築（テストからも利用可能）
pub fn create_app(config: Config) -> Router {
    let mut manager_config = ManagerConfig::default();
    manager_config.history_buffer_size = config.history_buffer_chunks;
    if let Some(shell) = &config.shell {
        manager_config.shell_resolver = Arc::new(StaticShellResolver {
            shell: shell.clone(),
        });
    }

    create_app_with_manager(config, Manager::new(manager_config))
}

/// Manager を差し替え可能な構築口（テスト用プロバイダの注入に使う）
pub fn create_app_with_manager(config: Config, manager: Arc<Manager>) -> Router {
    let hub = SessionHub::new();
    manager.set_event_handler(Arc::clone(&hub) as Arc<dyn terminal::TerminalEventHandler>);

    let state = Arc::new(AppState {
        config,
        manager,
        hub,
        input_limiter: ByteRateLimiter::new(INPUT_RATE_BYTES_PER_SEC, INPUT_BURST_BYTES),
    });

    Router::new()
        .route(
            "/api/sessions",
            get(api::list_sessions).post(api::create_session),
        )
        .route("/api/sessions/{id}", delete(api::delete_session))
        .route("/api/sessions/{id}/rename", post(api::rename_session))
        .route("/api/sessions/{id}/attach", post(api::attach_session))
        .route("/api/sessions/{id}/resize", post(api::resize_session))
        .route("/api/sessions/{id}/input", post(api::write_input))
        .route("/api/sessions/{id}/history", get(api::session_history))
        .route("/api/sessions/{id}/clear", post(api::clear_history))
        .route("/ws", get(ws::ws_handler))
        .layer(DefaultBodyLimit::max(MAX_JSON_BODY_BYTES))
        .with_state(state)
}
