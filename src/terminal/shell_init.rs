//! PATH 注入用のシェル init ファイル生成。
//!
//! 生成される rc ファイルはユーザー本来の設定を source した後に
//! `$FLOETERM_PATH_PREPEND` を PATH の先頭へ追加する。

use std::path::{Path, PathBuf};

use super::shell::ShellArgsProvider;

pub const PATH_PREPEND_ENV_KEY: &str = "FLOETERM_PATH_PREPEND";
pub const ORIGINAL_ZDOTDIR_ENV_KEY: &str = "FLOETERM_ORIGINAL_ZDOTDIR";

const SHELL_INIT_FOLDER: &str = "shell-init";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellKind {
    Bash,
    Zsh,
    Fish,
    Posix,
}

pub fn detect_shell_kind(shell_path: &str) -> ShellKind {
    let name = Path::new(shell_path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if name.contains("zsh") {
        ShellKind::Zsh
    } else if name.contains("bash") {
        ShellKind::Bash
    } else if name.contains("fish") {
        ShellKind::Fish
    } else {
        ShellKind::Posix
    }
}

fn default_base_dir() -> PathBuf {
    if let Some(dir) = dirs::cache_dir() {
        return dir.join("floeterm").join(SHELL_INIT_FOLDER);
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".floeterm").join(SHELL_INIT_FOLDER);
    }
    std::env::temp_dir().join(format!("floeterm-{}", SHELL_INIT_FOLDER))
}

/// init ファイル群の配置
#[derive(Debug, Clone)]
pub struct ShellInitPaths {
    base_dir: PathBuf,
}

impl ShellInitPaths {
    pub fn new(base_dir: Option<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.unwrap_or_else(default_base_dir),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn zsh_dir(&self) -> PathBuf {
        self.base_dir.join("zsh")
    }

    pub fn zsh_rc(&self) -> PathBuf {
        self.zsh_dir().join(".zshrc")
    }

    pub fn bash_rc(&self) -> PathBuf {
        self.base_dir.join("bashrc")
    }

    pub fn fish_config(&self) -> PathBuf {
        self.base_dir.join("config.fish")
    }

    pub fn posix_rc(&self) -> PathBuf {
        self.base_dir.join("shrc")
    }
}

/// shell init ファイルを生成する
pub trait ShellInitWriter: Send + Sync {
    fn ensure_shell_init_files(&self, path_prepend: &str) -> std::io::Result<()>;
}

/// bash/zsh/fish/posix の各 rc ファイルを生成する標準ライタ
pub struct DefaultShellInitWriter {
    pub base_dir: Option<PathBuf>,
}

impl ShellInitWriter for DefaultShellInitWriter {
    fn ensure_shell_init_files(&self, path_prepend: &str) -> std::io::Result<()> {
        if path_prepend.trim().is_empty() {
            return Ok(());
        }

        let paths = ShellInitPaths::new(self.base_dir.clone());
        std::fs::create_dir_all(paths.base_dir())?;
        std::fs::create_dir_all(paths.zsh_dir())?;

        std::fs::write(paths.bash_rc(), bash_init_script())?;
        std::fs::write(paths.zsh_rc(), zsh_init_script())?;
        std::fs::write(paths.fish_config(), fish_init_script())?;
        std::fs::write(paths.posix_rc(), posix_init_script())?;

        Ok(())
    }
}

/// 生成済み init ファイルを各シェル固有の方法で読み込ませる args プロバイダ。
///
/// - bash: `--rcfile <bashrc>`
/// - zsh: 引数なし + `ZDOTDIR` を init ディレクトリへ差し替え
///   （元の ZDOTDIR はネストした zsh 用に `FLOETERM_ORIGINAL_ZDOTDIR` で保存）
/// - fish: `--init-command "source <config>"`
/// - posix: 引数なし + `ENV=<shrc>`
pub struct ShellInitArgsProvider {
    pub shell_init_base_dir: Option<PathBuf>,
}

impl ShellArgsProvider for ShellInitArgsProvider {
    fn shell_args(
        &self,
        shell_path: &str,
        path_prepend: &str,
    ) -> (Option<Vec<String>>, Vec<(String, String)>) {
        if path_prepend.trim().is_empty() {
            return (None, Vec::new());
        }

        let paths = ShellInitPaths::new(self.shell_init_base_dir.clone());
        let mut env = vec![(PATH_PREPEND_ENV_KEY.to_string(), path_prepend.to_string())];

        match detect_shell_kind(shell_path) {
            ShellKind::Bash => {
                let args = vec![
                    "--rcfile".to_string(),
                    paths.bash_rc().to_string_lossy().into_owned(),
                ];
                (Some(args), env)
            }
            ShellKind::Zsh => {
                if let Ok(original) = std::env::var("ZDOTDIR") {
                    if !original.is_empty() {
                        env.push((ORIGINAL_ZDOTDIR_ENV_KEY.to_string(), original));
                    }
                }
                env.push((
                    "ZDOTDIR".to_string(),
                    paths.zsh_dir().to_string_lossy().into_owned(),
                ));
                // ZDOTDIR 方式では argv を付けない（空スライスであって None ではない）
                (Some(Vec::new()), env)
            }
            ShellKind::Fish => {
                let args = vec![
                    "--init-command".to_string(),
                    format!("source {}", paths.fish_config().to_string_lossy()),
                ];
                (Some(args), env)
            }
            ShellKind::Posix => {
                env.push((
                    "ENV".to_string(),
                    paths.posix_rc().to_string_lossy().into_owned(),
                ));
                (Some(Vec::new()), env)
            }
        }
    }
}

fn bash_init_script() -> String {
    format!(
        r#"#!/bin/bash
# floeterm shell integration - auto-generated, do not edit.

# Source user's original bash configuration.
if [ -f "$HOME/.bashrc" ]; then
    source "$HOME/.bashrc"
elif [ -f "$HOME/.bash_profile" ]; then
    source "$HOME/.bash_profile"
elif [ -f "$HOME/.profile" ]; then
    source "$HOME/.profile"
fi

# Inject floeterm paths (after user's rc to take priority).
if [ -n "${key}" ]; then
    export PATH="${key}:$PATH"
fi
"#,
        key = PATH_PREPEND_ENV_KEY,
    )
}

fn zsh_init_script() -> String {
    let home = dirs::home_dir()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|| "$HOME".to_string());

    format!(
        r#"# floeterm shell integration - auto-generated, do not edit.

# Restore original ZDOTDIR for nested shells.
if [ -n "${original}" ]; then
    export ZDOTDIR="${original}"
else
    unset ZDOTDIR
fi

# Source global zsh configs first (system-wide).
if [ -f /etc/zsh/zshenv ]; then
    source /etc/zsh/zshenv
fi
if [ -f /etc/zsh/zshrc ]; then
    source /etc/zsh/zshrc
fi

# Source user's original zsh configuration.
if [ -f "{home}/.zshrc" ]; then
    source "{home}/.zshrc"
elif [ -f "{home}/.zprofile" ]; then
    source "{home}/.zprofile"
fi

# Inject floeterm paths (after user's rc to take priority).
if [ -n "${prepend}" ]; then
    export PATH="${prepend}:$PATH"
fi
"#,
        original = ORIGINAL_ZDOTDIR_ENV_KEY,
        home = home,
        prepend = PATH_PREPEND_ENV_KEY,
    )
}

fn fish_init_script() -> String {
    let home = dirs::home_dir()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|| "$HOME".to_string());

    format!(
        r#"# floeterm shell integration - auto-generated, do not edit.

# Source user's original fish configuration.
if test -f "{home}/.config/fish/config.fish"
    source "{home}/.config/fish/config.fish"
end

# Inject floeterm paths (after user's config to take priority).
if set -q {prepend}
    set -l prepend_paths (string split ':' ${prepend})
    for p in $prepend_paths
        if not contains $p $PATH
            set -gx PATH $p $PATH
        end
    end
end
"#,
        home = home,
        prepend = PATH_PREPEND_ENV_KEY,
    )
}

fn posix_init_script() -> String {
    format!(
        r#"#!/bin/sh
# floeterm shell integration - auto-generated, do not edit.

# Source user's original profile.
if [ -f "$HOME/.profile" ]; then
    . "$HOME/.profile"
fi

# Inject floeterm paths (after user's profile to take priority).
if [ -n "${prepend}" ]; then
    export PATH="${prepend}:$PATH"
fi
"#,
        prepend = PATH_PREPEND_ENV_KEY,
    )
}
