use std::fmt;
use std::time::Duration;

/// Failure categories the format-fallback loop branches on.
///
/// The orchestrator advances to the next format candidate for kinds where a
/// different selector might still succeed, and aborts for kinds where it
/// cannot (rate limiting hits the same site again, an oversized source stays
/// oversized in every candidate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadErrorKind {
    /// The extractor or a subprocess exceeded its deadline
    Timeout,
    /// The URL or requested format is not downloadable (private, removed,
    /// livestream, playlist, no matching format)
    Unsupported,
    /// The remote side told us to back off (HTTP 429 and friends)
    RateLimited,
    /// Reported media size exceeds the platform attachment cap
    TooLarge,
    /// Anything we could not classify
    Unknown,
}

impl DownloadErrorKind {
    /// Whether the candidate loop should try the next format selector.
    pub fn advances_fallback(self) -> bool {
        matches!(self, Self::Timeout | Self::Unsupported | Self::Unknown)
    }

    /// Metrics label for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Unsupported => "unsupported",
            Self::RateLimited => "rate_limited",
            Self::TooLarge => "too_large",
            Self::Unknown => "unknown",
        }
    }
}

/// Structured error for download operations: a fallback-relevant kind plus
/// the technical detail we show (truncated) to the user on final failure.
#[derive(Debug, Clone)]
pub struct DownloadError {
    pub kind: DownloadErrorKind,
    pub detail: String,
    /// Back-off advised by the remote side, when it told us one
    pub retry_after: Option<Duration>,
}

impl DownloadError {
    pub fn new(kind: DownloadErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            retry_after: None,
        }
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(DownloadErrorKind::Timeout, detail)
    }

    pub fn unsupported(detail: impl Into<String>) -> Self {
        Self::new(DownloadErrorKind::Unsupported, detail)
    }

    pub fn rate_limited(detail: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self {
            kind: DownloadErrorKind::RateLimited,
            detail: detail.into(),
            retry_after,
        }
    }

    pub fn too_large(reported: u64, max: u64) -> Self {
        Self::new(
            DownloadErrorKind::TooLarge,
            format!("reported size {} bytes exceeds platform cap {} bytes", reported, max),
        )
    }

    pub fn unknown(detail: impl Into<String>) -> Self {
        Self::new(DownloadErrorKind::Unknown, detail)
    }

    /// Short user-facing explanation, without the technical tail.
    pub fn user_message(&self) -> &'static str {
        match self.kind {
            DownloadErrorKind::Timeout => "⚠️ The download timed out. Try again in a minute.",
            DownloadErrorKind::Unsupported => {
                "⚠️ This media can't be downloaded. It may be private, removed, a livestream, or a playlist."
            }
            DownloadErrorKind::RateLimited => "⚠️ The source is rate-limiting us. Try again later.",
            DownloadErrorKind::TooLarge => "⚠️ The file is larger than Telegram allows me to send.",
            DownloadErrorKind::Unknown => "⚠️ The download failed. Check that the link is correct.",
        }
    }
}

impl fmt::Display for DownloadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.detail)
    }
}

impl std::error::Error for DownloadError {}

/// Classifies yt-dlp stderr into a [`DownloadErrorKind`].
///
/// Substring matching over lowercased output; the patterns mirror what
/// yt-dlp actually prints for each failure class.
pub fn classify_ytdlp_stderr(stderr: &str) -> DownloadErrorKind {
    let lower = stderr.to_lowercase();

    if lower.contains("http error 429")
        || lower.contains("too many requests")
        || lower.contains("rate-limit")
        || lower.contains("rate limit")
    {
        return DownloadErrorKind::RateLimited;
    }

    if lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("read operation timed out")
        || lower.contains("connection reset")
    {
        return DownloadErrorKind::Timeout;
    }

    if lower.contains("unsupported url")
        || lower.contains("no video formats")
        || lower.contains("requested format is not available")
        || lower.contains("requested format not available")
        || lower.contains("private video")
        || lower.contains("video unavailable")
        || lower.contains("this video is not available")
        || lower.contains("video has been removed")
        || lower.contains("is not a valid url")
        || lower.contains("live event will begin")
        || lower.contains("this live stream recording is not available")
    {
        return DownloadErrorKind::Unsupported;
    }

    DownloadErrorKind::Unknown
}

/// Pulls a "retry after N" hint out of error text when the remote gave one.
pub fn extract_retry_after(text: &str) -> Option<Duration> {
    let lower = text.to_lowercase();
    let idx = lower.find("retry after")?;
    let tail = &lower[idx + "retry after".len()..];
    let secs: u64 = tail
        .split_whitespace()
        .next()?
        .trim_matches(|c: char| !c.is_ascii_digit())
        .parse()
        .ok()?;
    Some(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limited() {
        assert_eq!(
            classify_ytdlp_stderr("ERROR: unable to download video data: HTTP Error 429: Too Many Requests"),
            DownloadErrorKind::RateLimited
        );
    }

    #[test]
    fn test_classify_timeout() {
        assert_eq!(
            classify_ytdlp_stderr("ERROR: The read operation timed out"),
            DownloadErrorKind::Timeout
        );
    }

    #[test]
    fn test_classify_unsupported() {
        assert_eq!(
            classify_ytdlp_stderr("ERROR: Unsupported URL: https://example.com/page"),
            DownloadErrorKind::Unsupported
        );
        assert_eq!(
            classify_ytdlp_stderr("ERROR: Private video. Sign in if you've been granted access"),
            DownloadErrorKind::Unsupported
        );
        assert_eq!(
            classify_ytdlp_stderr("ERROR: Requested format is not available"),
            DownloadErrorKind::Unsupported
        );
    }

    #[test]
    fn test_classify_unknown() {
        assert_eq!(
            classify_ytdlp_stderr("ERROR: something completely new happened"),
            DownloadErrorKind::Unknown
        );
    }

    #[test]
    fn test_fallback_policy() {
        assert!(DownloadErrorKind::Timeout.advances_fallback());
        assert!(DownloadErrorKind::Unsupported.advances_fallback());
        assert!(DownloadErrorKind::Unknown.advances_fallback());
        assert!(!DownloadErrorKind::RateLimited.advances_fallback());
        assert!(!DownloadErrorKind::TooLarge.advances_fallback());
    }

    #[test]
    fn test_extract_retry_after() {
        assert_eq!(
            extract_retry_after("Flood control exceeded. Retry after 17 seconds"),
            Some(Duration::from_secs(17))
        );
        assert_eq!(extract_retry_after("no hint here"), None);
    }

    #[test]
    fn test_too_large_detail() {
        let err = DownloadError::too_large(100, 50);
        assert_eq!(err.kind, DownloadErrorKind::TooLarge);
        assert!(err.detail.contains("100"));
        assert!(err.detail.contains("50"));
    }
}
