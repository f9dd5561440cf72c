//! Download pipeline tests with a scripted backend: format fallback order,
//! abort-on-kind, and refusals that never reach the network.
//!
//! Run with: cargo test --test pipeline_test

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use tubegrab::core::config;
use tubegrab::download::convert::VideoFacts;
use tubegrab::download::error::{DownloadError, DownloadErrorKind};
use tubegrab::download::orchestrator::{fetch_media, DownloadSettings};
use tubegrab::download::source::{
    FetchRequest, FetchedMedia, MediaProbe, MediaSource, SourceProgress,
};
use tubegrab::download::{Quality, SendAs};
use tubegrab::AppResult;

/// Backend that plays back a prepared list of fetch outcomes and records
/// what the orchestrator asked of it.
struct ScriptedSource {
    /// One entry per expected fetch call: a file name to produce, or the
    /// error to fail with.
    script: Mutex<Vec<Result<&'static str, DownloadError>>>,
    formats_seen: Mutex<Vec<Option<String>>>,
    caps_seen: Mutex<Vec<Option<u64>>>,
    probe_calls: AtomicUsize,
    fetch_calls: AtomicUsize,
    live: bool,
}

impl ScriptedSource {
    fn new(script: Vec<Result<&'static str, DownloadError>>) -> Self {
        Self {
            script: Mutex::new(script),
            formats_seen: Mutex::new(Vec::new()),
            caps_seen: Mutex::new(Vec::new()),
            probe_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            live: false,
        }
    }

    fn live(mut self) -> Self {
        self.live = true;
        self
    }

    fn formats_seen(&self) -> Vec<Option<String>> {
        self.formats_seen.lock().unwrap().clone()
    }

    fn fetches(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    fn probes(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for ScriptedSource {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn supports_url(&self, _url: &Url) -> bool {
        true
    }

    async fn probe(&self, _url: &Url) -> AppResult<MediaProbe> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(MediaProbe {
            title: "Scripted Clip".to_string(),
            is_live: self.live,
            ..Default::default()
        })
    }

    async fn fetch(
        &self,
        request: &FetchRequest,
        _progress: mpsc::UnboundedSender<SourceProgress>,
    ) -> Result<FetchedMedia, DownloadError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.formats_seen.lock().unwrap().push(request.format.clone());
        self.caps_seen.lock().unwrap().push(request.max_bytes);

        match self.script.lock().unwrap().remove(0) {
            Ok(file_name) => {
                let file_path = request.work_dir.join(file_name);
                std::fs::write(&file_path, b"0123456789").unwrap();
                Ok(FetchedMedia { file_path, file_size: 10, mime_hint: None })
            }
            Err(e) => Err(e),
        }
    }
}

fn settings(quality: Quality, send_as: SendAs) -> DownloadSettings {
    DownloadSettings { quality, send_as, custom_height: None }
}

fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

fn progress() -> mpsc::UnboundedSender<SourceProgress> {
    mpsc::unbounded_channel().0
}

#[tokio::test]
async fn test_document_delivery_skips_post_processing() {
    let source = ScriptedSource::new(vec![Ok("clip.bin")]);
    let fetched = fetch_media(
        &source,
        &url("https://example.com/v/1"),
        &settings(Quality::High, SendAs::Document),
        progress(),
    )
    .await
    .unwrap();

    assert_eq!(fetched.files.len(), 1);
    assert!(fetched.files[0].exists());
    assert_eq!(fetched.title, "Scripted Clip");
    assert_eq!(fetched.facts, VideoFacts::default());
    assert!(fetched.thumbnail.is_none());
    // Documents go straight to the extractor default, no selector walk
    assert_eq!(source.formats_seen(), vec![None]);

    fetched.cleanup().await;
    assert!(!fetched.files[0].exists());
    assert!(!fetched.work_dir.exists());
}

#[tokio::test]
async fn test_fallback_walks_selectors_in_order_until_exhausted() {
    let source = ScriptedSource::new(vec![
        Err(DownloadError::timeout("attempt 1")),
        Err(DownloadError::unsupported("attempt 2")),
        Err(DownloadError::unknown("attempt 3")),
    ]);
    let err = fetch_media(
        &source,
        &url("https://example.com/v/2"),
        &settings(Quality::High, SendAs::Video),
        progress(),
    )
    .await
    .unwrap_err();

    // The error of the final attempt is the one reported
    assert_eq!(err.kind, DownloadErrorKind::Unknown);
    assert!(err.detail.contains("attempt 3"));

    let seen = source.formats_seen();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[0].as_deref(), Some("bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]"));
    assert_eq!(seen[1].as_deref(), Some("bestvideo+bestaudio/best"));
    assert_eq!(seen[2], None);
}

#[tokio::test]
async fn test_fallback_stops_at_the_first_success() {
    let source = ScriptedSource::new(vec![
        Err(DownloadError::unsupported("requested format is not available")),
        Ok("clip.mp4"),
    ]);
    let fetched = fetch_media(
        &source,
        &url("https://example.com/v/3"),
        &settings(Quality::High, SendAs::Video),
        progress(),
    )
    .await
    .unwrap();

    assert_eq!(source.fetches(), 2);
    assert!(fetched.files[0].to_string_lossy().ends_with("clip.mp4"));
    fetched.cleanup().await;
    assert!(!fetched.work_dir.exists());
}

#[tokio::test]
async fn test_rate_limiting_aborts_instead_of_trying_other_formats() {
    let source = ScriptedSource::new(vec![Err(DownloadError::rate_limited(
        "HTTP Error 429: Too Many Requests",
        Some(Duration::from_secs(30)),
    ))]);
    let err = fetch_media(
        &source,
        &url("https://example.com/v/4"),
        &settings(Quality::High, SendAs::Video),
        progress(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind, DownloadErrorKind::RateLimited);
    assert_eq!(err.retry_after, Some(Duration::from_secs(30)));
    // Another selector hits the same site again; exactly one attempt is made
    assert_eq!(source.fetches(), 1);
}

#[tokio::test]
async fn test_oversized_media_aborts_immediately() {
    let source = ScriptedSource::new(vec![Err(DownloadError::too_large(100, 50))]);
    let err = fetch_media(
        &source,
        &url("https://example.com/v/5"),
        &settings(Quality::High, SendAs::Video),
        progress(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind, DownloadErrorKind::TooLarge);
    assert_eq!(source.fetches(), 1);
}

#[tokio::test]
async fn test_playlists_are_refused_before_any_network_call() {
    for bad in [
        "https://www.youtube.com/watch?v=abc&list=PL123",
        "https://www.youtube.com/playlist?list=PL123",
        "https://cdn.example.com/stream/master.m3u8",
    ] {
        let source = ScriptedSource::new(vec![]);
        let err = fetch_media(
            &source,
            &url(bad),
            &settings(Quality::High, SendAs::Video),
            progress(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.kind, DownloadErrorKind::Unsupported, "{}", bad);
        assert_eq!(source.probes(), 0, "{}", bad);
        assert_eq!(source.fetches(), 0, "{}", bad);
    }
}

#[tokio::test]
async fn test_livestreams_are_refused_at_probe_time() {
    let source = ScriptedSource::new(vec![]).live();
    let err = fetch_media(
        &source,
        &url("https://example.com/live/now"),
        &settings(Quality::High, SendAs::Video),
        progress(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind, DownloadErrorKind::Unsupported);
    assert_eq!(source.probes(), 1);
    assert_eq!(source.fetches(), 0);
}

#[tokio::test]
async fn test_every_attempt_carries_the_platform_size_cap() {
    let source = ScriptedSource::new(vec![
        Err(DownloadError::timeout("attempt 1")),
        Err(DownloadError::timeout("attempt 2")),
        Err(DownloadError::timeout("attempt 3")),
    ]);
    let _ = fetch_media(
        &source,
        &url("https://example.com/v/6"),
        &settings(Quality::High, SendAs::Video),
        progress(),
    )
    .await;

    let cap = config::validation::max_file_bytes();
    let caps = source.caps_seen.lock().unwrap().clone();
    assert_eq!(caps, vec![Some(cap); 3]);
}
