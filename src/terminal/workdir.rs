//! PTY 出力からの作業ディレクトリ検出。
//!
//! 優先順位はシェル統合の品質順:
//! VSCode (OSC 633) > iTerm2 (OSC 1337) > OSC 7 > OSC 0/2 (タイトル)。

use std::path::Path;

const VSCODE_CWD_PREFIX: &str = "\x1b]633;P;Cwd=";
const ITERM2_DIR_PREFIX: &str = "\x1b]1337;CurrentDir=";
const OSC7_PREFIX: &str = "\x1b]7;file://";

/// 出力に作業ディレクトリのヒントが含まれうるかの軽量スクリーニング
pub(crate) fn contains_workdir_hint(output: &str) -> bool {
    output.contains(VSCODE_CWD_PREFIX)
        || output.contains(ITERM2_DIR_PREFIX)
        || output.contains(OSC7_PREFIX)
        || output.contains("\x1b]0;")
        || output.contains("\x1b]2;")
}

/// 出力から作業ディレクトリを抽出する。見つからなければ None。
pub(crate) fn parse_working_directory(output: &str) -> Option<String> {
    parse_vscode_cwd(output)
        .or_else(|| parse_iterm2_current_dir(output))
        .or_else(|| parse_osc7(output))
        .or_else(|| parse_osc_title(output))
}

/// 作業ディレクトリから表示名を導出する。
/// ホームディレクトリは "home"、ルートは "root"、それ以外は末尾コンポーネント。
pub fn directory_display_name(path: &str) -> String {
    if path.is_empty() {
        return "home".to_string();
    }

    if let Some(home) = dirs::home_dir() {
        if Path::new(path) == home.as_path() {
            return "home".to_string();
        }
    }

    if path == "/" {
        return "root".to_string();
    }

    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit('/').next() {
        Some(last) if !last.is_empty() => last.to_string(),
        _ => "home".to_string(),
    }
}

/// VSCode シェル統合: `ESC ] 633 ; P ; Cwd=PATH BEL`
fn parse_vscode_cwd(output: &str) -> Option<String> {
    let start = output.find(VSCODE_CWD_PREFIX)?;
    let rest = &output[start + VSCODE_CWD_PREFIX.len()..];
    let end = rest.find('\x07')?;
    Some(rest[..end].to_string())
}

/// iTerm2 統合: `ESC ] 1337 ; CurrentDir=PATH BEL`
fn parse_iterm2_current_dir(output: &str) -> Option<String> {
    let start = output.find(ITERM2_DIR_PREFIX)?;
    let rest = &output[start + ITERM2_DIR_PREFIX.len()..];
    let end = rest.find('\x07')?;
    Some(rest[..end].to_string())
}

/// 標準 OSC 7: `ESC ] 7 ; file://host/path ST`（パスはパーセントデコード）
fn parse_osc7(output: &str) -> Option<String> {
    let start = output.find(OSC7_PREFIX)?;
    let rest = &output[start + OSC7_PREFIX.len()..];
    let end = rest.find("\x1b\\")?;
    let url_part = &rest[..end];

    let slash = url_part.find('/')?;
    let path = &url_part[slash..];
    Some(percent_decode(path))
}

/// OSC 0/2 タイトルのフォールバック
fn parse_osc_title(output: &str) -> Option<String> {
    extract_path_from_osc_title(output, "\x1b]0;")
        .or_else(|| extract_path_from_osc_title(output, "\x1b]2;"))
}

fn extract_path_from_osc_title(output: &str, prefix: &str) -> Option<String> {
    let start = output.find(prefix)?;
    let remaining = &output[start + prefix.len()..];

    let title = if let Some(bel) = remaining.find('\x07') {
        &remaining[..bel]
    } else if let Some(st) = remaining.find("\x1b\\") {
        &remaining[..st]
    } else {
        return None;
    };

    extract_path_from_title(title)
}

fn extract_path_from_title(title: &str) -> Option<String> {
    // 最後のコロン以降をパスとみなす（"user@host:/path" 形式）
    if let Some(colon) = title.rfind(':') {
        return expand_path(&title[colon + 1..]);
    }

    if title.starts_with('~') || title.starts_with('/') {
        return expand_path(title);
    }

    for indicator in ["~/", "/"] {
        if let Some(idx) = title.find(indicator) {
            let mut path_part = &title[idx..];
            if let Some(space) = path_part.find(' ') {
                path_part = &path_part[..space];
            }
            return expand_path(path_part);
        }
    }

    None
}

/// `~` を $HOME に展開し、実在するディレクトリの場合のみパスを返す
fn expand_path(path: &str) -> Option<String> {
    let path = path.trim();
    if path.is_empty() {
        return None;
    }

    let expanded = if let Some(stripped) = path.strip_prefix('~') {
        let home = dirs::home_dir()?;
        if stripped.is_empty() {
            home.to_string_lossy().into_owned()
        } else {
            format!("{}{}", home.to_string_lossy(), stripped)
        }
    } else {
        path.to_string()
    };

    if Path::new(&expanded).is_dir() {
        Some(expanded)
    } else {
        None
    }
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hi = (bytes[i + 1] as char).to_digit(16);
            let lo = (bytes[i + 2] as char).to_digit(16);
            if let (Some(hi), Some(lo)) = (hi, lo) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
