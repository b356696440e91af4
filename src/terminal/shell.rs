//! シェル解決と PTY 起動時の argv/env 供給ポリシー。
//!
//! どのシェルをどう起動するかはホスト環境ごとに差し替えられるよう
//! trait に切り出してある。

use std::path::Path;

pub type EnvError = Box<dyn std::error::Error + Send + Sync>;

/// ログインシェルの実行パスを返す
pub trait ShellResolver: Send + Sync {
    fn resolve_shell(&self) -> String;
}

/// 新しい PTY セッションの環境変数を構築する。
/// 戻り値の path_prepend が非空の場合、shell init ファイル経由で
/// PATH に注入される。
pub trait ShellEnvProvider: Send + Sync {
    fn build_env(
        &self,
        shell_path: &str,
        working_dir: &str,
    ) -> Result<(Vec<(String, String)>, String), EnvError>;
}

/// シェル起動時の追加 argv と環境変数を返す。
///
/// argv の `None` と `Some(vec![])` は区別される:
/// - `None` は「意見なし」→ 従来互換のログインシェル (`-l`) にフォールバック
/// - `Some(vec![])` は「引数なしで起動」(zsh の ZDOTDIR 方式で必要)
pub trait ShellArgsProvider: Send + Sync {
    fn shell_args(
        &self,
        shell_path: &str,
        path_prepend: &str,
    ) -> (Option<Vec<String>>, Vec<(String, String)>);
}

/// $SHELL → /etc/passwd → 固定候補の順でシェルを探す標準リゾルバ
pub struct DefaultShellResolver;

impl ShellResolver for DefaultShellResolver {
    fn resolve_shell(&self) -> String {
        if let Ok(shell) = std::env::var("SHELL") {
            if !shell.is_empty() {
                if Path::new(&shell).exists() {
                    return shell;
                }
                tracing::warn!(shell = %shell, "SHELL points to missing file");
            }
        }

        if let Some(shell) = resolve_shell_from_passwd() {
            return shell;
        }

        for shell in ["/bin/bash", "/bin/zsh", "/bin/sh"] {
            if Path::new(shell).exists() {
                tracing::info!(shell = %shell, "Using fallback shell");
                return shell.to_string();
            }
        }

        tracing::warn!("No suitable shell found, using /bin/sh");
        "/bin/sh".to_string()
    }
}

fn resolve_shell_from_passwd() -> Option<String> {
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .ok()?;

    let contents = match std::fs::read_to_string("/etc/passwd") {
        Ok(contents) => contents,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to read /etc/passwd");
            return None;
        }
    };

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() < 7 || fields[0] != username {
            continue;
        }

        let shell = fields[6];
        if Path::new(shell).exists() {
            tracing::info!(shell = %shell, "Found shell from /etc/passwd");
            return Some(shell.to_string());
        }
        tracing::warn!(shell = %shell, "Shell from /etc/passwd missing");
    }

    None
}

/// 常に固定のシェルパスを返すリゾルバ（設定で上書きする場合に使う）
pub struct StaticShellResolver {
    pub shell: String,
}

impl ShellResolver for StaticShellResolver {
    fn resolve_shell(&self) -> String {
        self.shell.clone()
    }
}

/// 現在のプロセス環境をそのまま返す標準プロバイダ
pub struct DefaultEnvProvider;

impl ShellEnvProvider for DefaultEnvProvider {
    fn build_env(&self, _: &str, _: &str) -> Result<(Vec<(String, String)>, String), EnvError> {
        Ok((std::env::vars().collect(), String::new()))
    }
}

/// 明示的な env と PATH prepend を返すプロバイダ
pub struct StaticEnvProvider {
    pub env: Vec<(String, String)>,
    pub path_prepend: String,
}

impl ShellEnvProvider for StaticEnvProvider {
    fn build_env(&self, _: &str, _: &str) -> Result<(Vec<(String, String)>, String), EnvError> {
        if self.env.is_empty() {
            return Ok((std::env::vars().collect(), self.path_prepend.clone()));
        }
        Ok((self.env.clone(), self.path_prepend.clone()))
    }
}

/// 保守的な標準プロバイダ: 追加の argv/env を返さない
pub struct DefaultShellArgsProvider;

impl ShellArgsProvider for DefaultShellArgsProvider {
    fn shell_args(&self, _: &str, _: &str) -> (Option<Vec<String>>, Vec<(String, String)>) {
        (None, Vec::new())
    }
}
