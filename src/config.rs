use std::env;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq)]
pub enum Environment {
    Development,
    Production,
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            _ => Err(format!("Unknown environment: {}", s)),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::Development => write!(f, "development"),
            Environment::Production => write!(f, "production"),
        }
    }
}

pub struct Config {
    pub port: u16,
    pub bind_address: String,
    pub env: Environment,
    pub log_level: String,
    /// シェルの明示指定。未設定ならリゾルバの探索に任せる。
    pub shell: Option<String>,
    /// 履歴バッファ容量（チャンク数）
    pub history_buffer_chunks: usize,
}

impl Config {
    pub fn from_env() -> Self {
        let env = env::var("FLOETERM_ENV")
            .ok()
            .and_then(|v| Environment::from_str(&v).ok())
            .unwrap_or(Environment::Development);

        let default_port = match env {
            Environment::Development => 8080,
            Environment::Production => 3000,
        };

        let port = env::var("FLOETERM_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default_port);

        let bind_address =
            env::var("FLOETERM_BIND").unwrap_or_else(|_| "127.0.0.1".to_string());

        let default_log_level = match env {
            Environment::Development => "debug",
            Environment::Production => "info",
        };
        let log_level =
            env::var("FLOETERM_LOG_LEVEL").unwrap_or_else(|_| default_log_level.to_string());

        let shell = env::var("FLOETERM_SHELL").ok().filter(|s| !s.is_empty());

        let history_buffer_chunks = env::var("FLOETERM_HISTORY_CHUNKS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&n| n > 0)
            .unwrap_or(2048);

        Self {
            port,
            bind_address,
            env,
            log_level,
            shell,
            history_buffer_chunks,
        }
    }
}
