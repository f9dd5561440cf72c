//! Pluggable download backends.
//!
//! `MediaSource` is the seam between the orchestrator and whatever actually
//! pulls bytes off the network. Backends are registered in a `SourceRegistry`
//! and resolved by URL, except when the user forced direct mode, in which case
//! the orchestrator asks for the HTTP backend by name.
//!
//! Built-in backends:
//! - `YtdlpSource` — everything yt-dlp can extract (YouTube, TikTok, etc.)
//! - `HttpSource` — direct file URLs, streamed with resume support

pub mod http;
pub mod ytdlp;

use crate::core::error::AppResult;
use crate::download::error::DownloadError;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;

/// Progress snapshot emitted while a fetch is running.
#[derive(Debug, Clone)]
pub struct SourceProgress {
    /// Download progress percentage (0-100)
    pub percent: u8,
    /// Download speed in bytes per second
    pub speed_bytes_sec: Option<f64>,
    /// Estimated time remaining in seconds
    pub eta_seconds: Option<u64>,
    /// Bytes downloaded so far
    pub downloaded_bytes: Option<u64>,
    /// Total bytes expected
    pub total_bytes: Option<u64>,
}

/// What a backend learned about a URL without downloading it.
#[derive(Debug, Clone, Default)]
pub struct MediaProbe {
    pub title: String,
    pub uploader: Option<String>,
    pub duration_secs: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Reported or approximated size in bytes, when the extractor knows it
    pub filesize_approx: Option<u64>,
    pub is_live: bool,
}

/// Parameters for one fetch attempt.
///
/// `work_dir` is a per-task scratch directory the backend writes into; the
/// orchestrator owns its lifecycle. `format` is a yt-dlp format selector,
/// `None` meaning the extractor default.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub url: Url,
    pub work_dir: PathBuf,
    pub format: Option<String>,
    /// Hard size cap; backends abort mid-transfer once it is exceeded
    pub max_bytes: Option<u64>,
}

/// A file sitting on disk after a successful fetch.
#[derive(Debug, Clone)]
pub struct FetchedMedia {
    pub file_path: PathBuf,
    pub file_size: u64,
    pub mime_hint: Option<String>,
}

/// A download backend.
///
/// `fetch` reports failures as [`DownloadError`] so the orchestrator can
/// branch on the error kind when deciding whether to try the next format
/// candidate.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Short name used for routing and logs (e.g. "yt-dlp", "http").
    fn name(&self) -> &'static str;

    /// Whether this backend claims the given URL.
    fn supports_url(&self, url: &Url) -> bool;

    /// Fetch metadata without downloading.
    async fn probe(&self, url: &Url) -> AppResult<MediaProbe>;

    /// Download into `request.work_dir`, streaming progress through the channel.
    async fn fetch(
        &self,
        request: &FetchRequest,
        progress_tx: mpsc::UnboundedSender<SourceProgress>,
    ) -> Result<FetchedMedia, DownloadError>;
}

/// Routes URLs to the backend that handles them.
///
/// Backends are tried in registration order; the first one whose
/// `supports_url` returns true wins. yt-dlp is registered before HTTP so
/// that media pages on known hosts are not mistaken for direct files.
pub struct SourceRegistry {
    sources: Vec<Arc<dyn MediaSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self { sources: Vec::new() }
    }

    /// Register a backend. Order matters for `resolve`.
    pub fn register(&mut self, source: Arc<dyn MediaSource>) {
        self.sources.push(source);
    }

    /// First backend that claims the URL.
    pub fn resolve(&self, url: &Url) -> Option<Arc<dyn MediaSource>> {
        self.sources.iter().find(|s| s.supports_url(url)).cloned()
    }

    /// Backend by name, for forced routing (direct mode).
    pub fn get(&self, name: &str) -> Option<Arc<dyn MediaSource>> {
        self.sources.iter().find(|s| s.name() == name).cloned()
    }

    /// Registry with the built-in backends.
    pub fn default_registry() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ytdlp::YtdlpSource::new()));
        registry.register(Arc::new(http::HttpSource::new()));
        registry
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::default_registry()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_resolve_order() {
        let registry = SourceRegistry::default_registry();

        let yt_url = Url::parse("https://www.youtube.com/watch?v=test123").unwrap();
        let source = registry.resolve(&yt_url);
        assert!(source.is_some());
        assert_eq!(source.unwrap().name(), "yt-dlp");

        let http_url = Url::parse("https://example.com/file.mp3").unwrap();
        let source = registry.resolve(&http_url);
        assert!(source.is_some());
        assert_eq!(source.unwrap().name(), "http");
    }

    #[test]
    fn test_registry_get_by_name() {
        let registry = SourceRegistry::default_registry();
        assert!(registry.get("http").is_some());
        assert!(registry.get("yt-dlp").is_some());
        assert!(registry.get("gopher").is_none());
    }
}
