//! Builds the MarkdownV2 caption attached to delivered files.

use crate::core::utils::escape_markdown_v2;

/// Telegram rejects captions longer than this.
pub const CAPTION_LIMIT: usize = 1024;

/// Longest title we keep; escaping can only grow text, so the raw parts are
/// trimmed before escaping to stay comfortably under the caption limit.
const TITLE_LIMIT: usize = 280;
const UPLOADER_LIMIT: usize = 120;

/// Caption layout: bold title, uploader line, source URL.
///
/// Every part is escaped for MarkdownV2; the URL is included as plain text
/// rather than a link so a pathological URL cannot break the entity parser.
pub fn build_caption(title: &str, uploader: Option<&str>, url: &str) -> String {
    let title = head(title.trim(), TITLE_LIMIT);
    let mut caption = format!("*{}*", escape_markdown_v2(&title));

    if let Some(name) = uploader.map(str::trim).filter(|n| !n.is_empty()) {
        caption.push('\n');
        caption.push_str(&escape_markdown_v2(&head(name, UPLOADER_LIMIT)));
    }

    caption.push_str("\n\n");
    caption.push_str(&escape_markdown_v2(url));

    if caption.chars().count() > CAPTION_LIMIT {
        // The URL is the only unbounded part left; drop it rather than
        // risk truncating inside an escape sequence.
        caption = format!("*{}*", escape_markdown_v2(&title));
    }
    caption
}

fn head(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{}…", kept.trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caption_escapes_markdown_characters() {
        let caption = build_caption("What? A [test]!", Some("some.channel"), "https://example.com/v?id=1");
        assert!(caption.starts_with("*What? A \\[test\\]\\!*"));
        assert!(caption.contains("some\\.channel"));
        assert!(caption.contains("https://example\\.com/v?id\\=1"));
    }

    #[test]
    fn caption_without_uploader_has_no_blank_author_line() {
        let caption = build_caption("Title", None, "https://example.com");
        assert_eq!(caption, "*Title*\n\nhttps://example\\.com");
    }

    #[test]
    fn overlong_title_is_trimmed_before_escaping() {
        let long_title = "x".repeat(4000);
        let caption = build_caption(&long_title, None, "https://example.com");
        assert!(caption.chars().count() <= CAPTION_LIMIT);
        assert!(caption.contains('…'));
    }
}
