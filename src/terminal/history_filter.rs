use super::Chunk;

/// リプレイ時にフロントエンドへ流してはいけないシーケンスを除去するフィルタ
pub trait HistoryFilter: Send + Sync {
    fn filter(&self, chunks: Vec<Chunk>) -> Vec<Chunk>;
}

/// 端末の自動応答（OSC カラー応答・DA 応答・CPR・問い合わせ）を除去する
/// 標準フィルタ。フィルタ後に空になったチャンクは捨てる。
pub struct DefaultHistoryFilter;

impl HistoryFilter for DefaultHistoryFilter {
    fn filter(&self, chunks: Vec<Chunk>) -> Vec<Chunk> {
        if chunks.is_empty() {
            return chunks;
        }

        let mut filtered = Vec::with_capacity(chunks.len());
        for mut chunk in chunks {
            if chunk.data.is_empty() {
                // 元から空のチャンクはそのまま通す
                filtered.push(chunk);
                continue;
            }

            let mut data = strip_osc_color_replies(&chunk.data);
            if data.is_empty() {
                continue;
            }
            data = strip_device_attribute_replies(&data);
            if data.is_empty() {
                continue;
            }
            data = strip_cursor_position_reports(&data);
            if data.is_empty() {
                continue;
            }
            data = strip_terminal_queries(&data);
            if data.is_empty() {
                continue;
            }

            chunk.data = data;
            filtered.push(chunk);
        }

        filtered
    }
}

/// OSC 10/11 のカラー応答 (`ESC ] 10;... BEL` / `ESC \`) を除去する。
/// 終端がチャンク内に見つからない場合は導入バイトを残して続行する。
pub(crate) fn strip_osc_color_replies(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == 0x1b && i + 2 < data.len() && data[i + 1] == b']' {
            let mut j = i + 2;
            while j < data.len() && data[j] == b' ' {
                j += 1;
            }

            let num_start = j;
            while j < data.len() && data[j].is_ascii_digit() {
                j += 1;
            }

            if num_start == j {
                out.push(data[i]);
                i += 1;
                continue;
            }

            let code = parse_decimal(&data[num_start..j]);

            if (code == Some(10) || code == Some(11)) && j < data.len() && data[j] == b';' {
                let mut end = j + 1;
                let mut terminated = false;
                while end < data.len() {
                    let b = data[end];
                    if b == 0x07 {
                        end += 1;
                        terminated = true;
                        break;
                    }
                    if b == 0x1b && end + 1 < data.len() && data[end + 1] == b'\\' {
                        end += 2;
                        terminated = true;
                        break;
                    }
                    end += 1;
                }

                if terminated {
                    i = end;
                    continue;
                }

                out.push(data[i]);
                i += 1;
                continue;
            }

            out.push(data[i]);
            i += 1;
            continue;
        }

        out.push(data[i]);
        i += 1;
    }

    out
}

/// プライベート/セカンダリ DA 応答 (`ESC [ ? ... c` / `ESC [ > ... c`) を除去する
pub(crate) fn strip_device_attribute_replies(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == 0x1b
            && i + 3 < data.len()
            && data[i + 1] == b'['
            && (data[i + 2] == b'?' || data[i + 2] == b'>')
        {
            let mut j = i + 3;
            while j < data.len() && (data[j].is_ascii_digit() || data[j] == b';') {
                j += 1;
            }

            if j < data.len() && data[j] == b'c' {
                i = j + 1;
                continue;
            }

            out.push(data[i]);
            i += 1;
            continue;
        }

        out.push(data[i]);
        i += 1;
    }

    out
}

/// カーソル位置報告 (`ESC [ n;m R`) を除去する
pub(crate) fn strip_cursor_position_reports(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == 0x1b && i + 2 < data.len() && data[i + 1] == b'[' {
            let num_start = i + 2;
            let mut j = num_start;
            while j < data.len() && (data[j].is_ascii_digit() || data[j] == b';') {
                j += 1;
            }

            if num_start == j {
                out.push(data[i]);
                i += 1;
                continue;
            }

            if j < data.len() && data[j] == b'R' {
                i = j + 1;
                continue;
            }

            out.push(data[i]);
            i += 1;
            continue;
        }

        out.push(data[i]);
        i += 1;
    }

    out
}

/// xterm 系エミュレータがリプレイ中にエコーバックする問い合わせを除去する:
/// primary/secondary DA、DSR-6、Kitty キーボード、DECRQM、XTVERSION、
/// フォーカスレポート切替、OSC 10/11 クエリ。
pub(crate) fn strip_terminal_queries(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        if data[i] == 0x1b {
            if i + 1 < data.len() && data[i + 1] == b'[' {
                let j = i + 2;
                if j < data.len() && data[j] == b'c' {
                    i = j + 1;
                    continue;
                }
                if j + 1 < data.len() && data[j] == b'>' && data[j + 1] == b'c' {
                    i = j + 2;
                    continue;
                }
                if j + 2 < data.len() && data[j] == b'6' && data[j + 1] == b'n' {
                    i = j + 2;
                    continue;
                }
                if j + 1 < data.len() && data[j] == b'?' && data[j + 1] == b'u' {
                    i = j + 2;
                    continue;
                }
                if j + 3 < data.len() && data[j] == b'?' && data[j + 2] == b'$' && data[j + 3] == b'p'
                {
                    i = j + 4;
                    continue;
                }
                if j + 2 < data.len() && data[j] == b'>' && data[j + 1] == b'0' && data[j + 2] == b'q'
                {
                    i = j + 3;
                    continue;
                }
                if j + 5 < data.len() && &data[j..j + 5] == b"?1004" && data[j + 5] == b'h' {
                    i = j + 6;
                    continue;
                }
            }

            if i + 1 < data.len() && data[i + 1] == b']' {
                let num_start = i + 2;
                let mut j = num_start;
                while j < data.len() && data[j].is_ascii_digit() {
                    j += 1;
                }
                if num_start == j {
                    out.push(data[i]);
                    i += 1;
                    continue;
                }
                let code = parse_decimal(&data[num_start..j]);
                if (code == Some(10) || code == Some(11)) && j < data.len() && data[j] == b';' {
                    i = j + 1;
                    continue;
                }
            }
        }

        out.push(data[i]);
        i += 1;
    }

    out
}

fn parse_decimal(digits: &[u8]) -> Option<u32> {
    std::str::from_utf8(digits).ok()?.parse().ok()
}
