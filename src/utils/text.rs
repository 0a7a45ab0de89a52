//! 文本工具：Telegram 长消息切分、Markdown -> HTML、转义清理

use std::sync::OnceLock;

use regex::Regex;

/// Telegram 单条消息上限（官方 4096，留余量）
pub const TELEGRAM_MESSAGE_LIMIT: usize = 4000;

static BOLD_RE: OnceLock<Regex> = OnceLock::new();
static ITALIC_RE: OnceLock<Regex> = OnceLock::new();
static HEADING_RE: OnceLock<Regex> = OnceLock::new();
static ESCAPE_RE: OnceLock<Regex> = OnceLock::new();

/// 按字符截断（不追加省略号）
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

/// 预览用截断：超长时追加 "…"
pub fn preview(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        format!("{}…", truncate_chars(s, max_chars))
    }
}

/// 按段落（空行）切分，段落过长再按行，行过长再按字符
pub fn split_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut parts = Vec::new();
    let mut current = String::new();

    let flush = |current: &mut String, parts: &mut Vec<String>| {
        let trimmed = current.trim();
        if !trimmed.is_empty() {
            parts.push(trimmed.to_string());
        }
        current.clear();
    };

    for paragraph in text.split("\n\n") {
        let pieces: Vec<String> = if paragraph.chars().count() <= max_chars {
            vec![paragraph.to_string()]
        } else {
            split_paragraph(paragraph, max_chars)
        };

        for piece in pieces {
            let sep = if current.is_empty() { 0 } else { 2 };
            if current.chars().count() + sep + piece.chars().count() > max_chars {
                flush(&mut current, &mut parts);
            }
            if !current.is_empty() {
                current.push_str("\n\n");
            }
            current.push_str(&piece);
        }
    }
    flush(&mut current, &mut parts);
    parts
}

fn split_paragraph(paragraph: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for line in paragraph.lines() {
        let mut line = line.to_string();
        while line.chars().count() > max_chars {
            if !current.is_empty() {
                out.push(std::mem::take(&mut current));
            }
            let head = truncate_chars(&line, max_chars);
            line = line[head.len()..].to_string();
            out.push(head);
        }
        let sep = if current.is_empty() { 0 } else { 1 };
        if current.chars().count() + sep + line.chars().count() > max_chars && !current.is_empty() {
            out.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(&line);
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// HTML 实体转义（Telegram HTML 模式只要求 & < >）
pub fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// 去掉 Markdown 转义反斜杠（`\*`、`\_`、`\.` 等）
pub fn clean_escapes(s: &str) -> String {
    let re = ESCAPE_RE.get_or_init(|| Regex::new(r"\\([_*\[\]()~`>#+\-=|{}.!])").unwrap());
    re.replace_all(s, "$1").into_owned()
}

/// LLM 常见 Markdown 转 Telegram HTML：`**b**`、`*i*`、`# 标题`
pub fn markdown_to_html(s: &str) -> String {
    let escaped = escape_html(&clean_escapes(s));
    let heading = HEADING_RE.get_or_init(|| Regex::new(r"(?m)^#{1,6}\s+(.+?)\s*$").unwrap());
    let bold = BOLD_RE.get_or_init(|| Regex::new(r"\*\*(.+?)\*\*").unwrap());
    let italic = ITALIC_RE.get_or_init(|| Regex::new(r"\*([^*\n]+?)\*").unwrap());

    let out = heading.replace_all(&escaped, "<b>$1</b>");
    let out = bold.replace_all(&out, "<b>$1</b>");
    let out = italic.replace_all(&out, "<i>$1</i>");
    out.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_text_single_part() {
        assert_eq!(split_text("привет", 4000), vec!["привет".to_string()]);
        assert!(split_text("   ", 10).is_empty());
    }

    #[test]
    fn test_split_on_paragraphs() {
        let text = format!("{}\n\n{}\n\n{}", "а".repeat(6), "б".repeat(6), "в".repeat(6));
        let parts = split_text(&text, 13);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "а".repeat(6));
        assert!(parts.iter().all(|p| p.chars().count() <= 13));
    }

    #[test]
    fn test_split_merges_small_paragraphs() {
        let text = "aa\n\nbb\n\ncc";
        let parts = split_text(text, 6);
        assert_eq!(parts, vec!["aa\n\nbb".to_string(), "cc".to_string()]);
    }

    #[test]
    fn test_split_very_long_line() {
        let text = "ж".repeat(25);
        let parts = split_text(&text, 10);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts.concat(), text);
    }

    #[test]
    fn test_markdown_to_html() {
        assert_eq!(markdown_to_html("**Закон** принят"), "<b>Закон</b> принят");
        assert_eq!(markdown_to_html("*важно*"), "<i>важно</i>");
        assert_eq!(markdown_to_html("## НОВЫЕ ЗАКОНЫ"), "<b>НОВЫЕ ЗАКОНЫ</b>");
        assert_eq!(markdown_to_html("a < b & c"), "a &lt; b &amp; c");
    }

    #[test]
    fn test_clean_escapes() {
        assert_eq!(clean_escapes(r"ст\. 5 \*важно\*"), "ст. 5 *важно*");
    }

    #[test]
    fn test_truncate_and_preview_unicode() {
        assert_eq!(truncate_chars("Привет, мир!", 6), "Привет");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(preview("Привет, мир!", 6), "Привет…");
    }
}
