/// Formats a byte count as a human-readable size.
///
/// # Example
///
/// ```
/// use tubegrab::core::utils::sizeof_fmt;
///
/// assert_eq!(sizeof_fmt(1536), "1.5 KiB");
/// ```
pub fn sizeof_fmt(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    let mut value = bytes as f64;
    for unit in UNITS {
        if value < 1024.0 {
            return if unit == "B" {
                format!("{:.0} {}", value, unit)
            } else {
                format!("{:.1} {}", value, unit)
            };
        }
        value /= 1024.0;
    }
    format!("{:.1} EiB", value)
}

/// Formats a duration in seconds as `H:MM:SS` (or `M:SS` under an hour).
pub fn timeof_fmt(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{}:{:02}", minutes, secs)
    }
}

/// Replaces spaces with underscores in a file name.
pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(' ', "_")
}

/// Escapes characters that are unsafe in file names.
///
/// Path separators, Windows-reserved characters, and control characters
/// become underscores; quotes become apostrophes. Leading/trailing
/// whitespace and dots are stripped. An empty result falls back to
/// "unnamed".
pub fn escape_filename(filename: &str) -> String {
    let mut result = String::with_capacity(filename.len());

    for c in filename.chars() {
        match c {
            '/' | '\\' => result.push('_'),
            ':' | '*' | '?' | '<' | '>' | '|' => result.push('_'),
            '"' => result.push('\''),
            c if c.is_control() => result.push('_'),
            _ => result.push(c),
        }
    }

    let result = result.trim_matches(|c: char| c.is_whitespace() || c == '.');

    if result.is_empty() {
        "unnamed".to_string()
    } else {
        result.to_string()
    }
}

/// Escapes special characters for Telegram's MarkdownV2 format.
///
/// MarkdownV2 requires escaping of
/// `_`, `*`, `[`, `]`, `(`, `)`, `~`, `` ` ``, `>`, `#`, `+`, `-`, `=`, `|`, `{`, `}`, `.`, `!`.
/// The backslash is escaped first to avoid double-escaping.
pub fn escape_markdown_v2(text: &str) -> String {
    let mut result = String::with_capacity(text.len() * 2);

    for c in text.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '_' => result.push_str("\\_"),
            '*' => result.push_str("\\*"),
            '[' => result.push_str("\\["),
            ']' => result.push_str("\\]"),
            '(' => result.push_str("\\("),
            ')' => result.push_str("\\)"),
            '~' => result.push_str("\\~"),
            '`' => result.push_str("\\`"),
            '>' => result.push_str("\\>"),
            '#' => result.push_str("\\#"),
            '+' => result.push_str("\\+"),
            '-' => result.push_str("\\-"),
            '=' => result.push_str("\\="),
            '|' => result.push_str("\\|"),
            '{' => result.push_str("\\{"),
            '}' => result.push_str("\\}"),
            '.' => result.push_str("\\."),
            '!' => result.push_str("\\!"),
            _ => result.push(c),
        }
    }

    result
}

/// Keeps the last `max_chars` characters of error text so the interesting
/// part of a long subprocess dump survives into the chat message.
pub fn truncate_tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let skipped: String = text.chars().skip(count - max_chars).collect();
    format!("…{}", skipped)
}

/// Free bytes on the filesystem holding `path`, via `df -k`.
///
/// `None` when `df` is missing or its output did not parse; callers treat
/// that as "unknown", not as zero.
pub fn disk_free(path: &str) -> Option<u64> {
    let output = std::process::Command::new("df").args(["-k", path]).output().ok()?;
    if !output.status.success() {
        return None;
    }
    parse_df_available_kb(&String::from_utf8_lossy(&output.stdout)).map(|kb| kb * 1024)
}

/// Parses the Available column (1K blocks) from `df -k` output.
fn parse_df_available_kb(stdout: &str) -> Option<u64> {
    // Header line, then: Filesystem 1K-blocks Used Available Use% Mounted
    let line = stdout.lines().nth(1)?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    fields.get(3)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::{
        escape_filename, escape_markdown_v2, parse_df_available_kb, sanitize_filename, sizeof_fmt, timeof_fmt,
        truncate_tail,
    };

    #[test]
    fn test_sizeof_fmt() {
        assert_eq!(sizeof_fmt(0), "0 B");
        assert_eq!(sizeof_fmt(512), "512 B");
        assert_eq!(sizeof_fmt(1536), "1.5 KiB");
        assert_eq!(sizeof_fmt(10 * 1024 * 1024), "10.0 MiB");
        assert_eq!(sizeof_fmt(3 * 1024 * 1024 * 1024), "3.0 GiB");
    }

    #[test]
    fn test_timeof_fmt() {
        assert_eq!(timeof_fmt(0), "0:00");
        assert_eq!(timeof_fmt(59), "0:59");
        assert_eq!(timeof_fmt(61), "1:01");
        assert_eq!(timeof_fmt(3600), "1:00:00");
        assert_eq!(timeof_fmt(3723), "1:02:03");
    }

    #[test]
    fn test_escape_filename() {
        assert_eq!(escape_filename("song/name.mp3"), "song_name.mp3");
        assert_eq!(escape_filename("path\\to\\file.mp4"), "path_to_file.mp4");
        assert_eq!(escape_filename("file:name*.mp3"), "file_name_.mp3");
        assert_eq!(escape_filename("title?<>|.mp4"), "title____.mp4");
        assert_eq!(escape_filename("song \"live\".mp3"), "song 'live'.mp3");
        assert_eq!(escape_filename("  file.mp3  "), "file.mp3");
        assert_eq!(escape_filename("..."), "unnamed");
        assert_eq!(escape_filename(""), "unnamed");
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("song name.mp3"), "song_name.mp3");
        assert_eq!(sanitize_filename("Artist - Title.mp4"), "Artist_-_Title.mp4");
        assert_eq!(sanitize_filename("already_clean.mp3"), "already_clean.mp3");
    }

    #[test]
    fn test_escape_markdown_v2() {
        assert_eq!(escape_markdown_v2("Hello. World!"), "Hello\\. World\\!");
        assert_eq!(escape_markdown_v2("file.mp3"), "file\\.mp3");
        assert_eq!(escape_markdown_v2("Song (live).mp3"), "Song \\(live\\)\\.mp3");
        assert_eq!(escape_markdown_v2("track-name"), "track\\-name");
        assert_eq!(escape_markdown_v2("path\\file"), "path\\\\file");
    }

    #[test]
    fn test_truncate_tail() {
        assert_eq!(truncate_tail("short", 10), "short");
        assert_eq!(truncate_tail("0123456789", 4), "…6789");
        // Multi-byte characters must not be split
        assert_eq!(truncate_tail("ααββ", 2), "…ββ");
    }

    #[test]
    fn test_parse_df_available_kb() {
        let out = "Filesystem     1K-blocks    Used Available Use% Mounted on\n\
                   /dev/sda1      102400000 5120000  97280000   5% /\n";
        assert_eq!(parse_df_available_kb(out), Some(97_280_000));
        assert_eq!(parse_df_available_kb("garbage"), None);
        assert_eq!(parse_df_available_kb(""), None);
    }
}
