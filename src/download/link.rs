//! Inbound URL validation and canonical link resolution.
//!
//! The delivery cache keys on a canonical form of each link so that
//! youtu.be shortlinks, share URLs with tracking junk, and the full watch
//! URL all hit the same cache entry. YouTube forms are rewritten locally;
//! other sites are asked for their `<link rel="canonical">` tag, falling
//! back to the URL as given whenever that fails.

use moka::future::Cache;
use once_cell::sync::Lazy;
use regex::Regex;
use std::time::Duration;
use url::Url;

use crate::core::config::validation;
use crate::core::error::{AppError, AppResult};

static LINK_REL_HREF_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)<link[^>]*rel=["'](?:canonical|alternate|shortlinkUrl)["'][^>]*href=["']([^"']+)["']"#,
    )
    .expect("link rel/href regex")
});

static LINK_HREF_REL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)<link[^>]*href=["']([^"']+)["'][^>]*rel=["'](?:canonical|alternate|shortlinkUrl)["']"#,
    )
    .expect("link href/rel regex")
});

const RESOLVER_UA: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

/// Parses and validates a user-supplied link.
pub fn validate_url(text: &str) -> AppResult<Url> {
    let trimmed = text.trim();

    if trimmed.len() > validation::MAX_URL_LENGTH {
        return Err(AppError::Validation(format!(
            "URL is too long ({} > {} characters)",
            trimmed.len(),
            validation::MAX_URL_LENGTH
        )));
    }

    let url = Url::parse(trimmed)?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(AppError::Validation(format!("unsupported URL scheme '{}'", url.scheme())));
    }

    if url.host_str().is_none() {
        return Err(AppError::Validation("URL has no host".to_string()));
    }

    Ok(url)
}

/// Whether the link points at a playlist or HLS manifest, which the bot
/// refuses to download.
pub fn is_playlist(url: &Url) -> bool {
    if url.query_pairs().any(|(key, _)| key == "list") {
        return true;
    }
    let path = url.path();
    path.contains("/playlist") || path.ends_with(".m3u8")
}

fn is_youtube_host(host: &str) -> bool {
    host == "youtube.com" || host.ends_with(".youtube.com")
}

/// Rewrites YouTube URL shapes to the watch form without any network I/O.
///
/// `youtu.be/<id>`, `/shorts/<id>`, `/live/<id>`, and `/watch?v=<id>` with
/// extra query parameters all collapse to `https://www.youtube.com/watch?v=<id>`,
/// which is what YouTube's own canonical tag points at.
fn local_canonical(url: &Url) -> Option<String> {
    let host = url.host_str()?;

    if host == "youtu.be" {
        let id = url.path_segments()?.next()?;
        if !id.is_empty() {
            return Some(format!("https://www.youtube.com/watch?v={}", id));
        }
        return None;
    }

    if is_youtube_host(host) {
        let mut segments = url.path_segments()?;
        match segments.next() {
            Some("shorts") | Some("live") => {
                let id = segments.next()?;
                if !id.is_empty() {
                    return Some(format!("https://www.youtube.com/watch?v={}", id));
                }
            }
            Some("watch") => {
                let id = url.query_pairs().find(|(key, _)| key == "v").map(|(_, v)| v.into_owned())?;
                return Some(format!("https://www.youtube.com/watch?v={}", id));
            }
            _ => {}
        }
    }

    None
}

fn extract_link_tag(html: &str) -> Option<String> {
    for re in [&*LINK_REL_HREF_RE, &*LINK_HREF_REL_RE] {
        if let Some(caps) = re.captures(html) {
            let href = caps.get(1)?.as_str().trim();
            if href.is_empty() || href == "null" {
                continue;
            }
            if let Ok(parsed) = Url::parse(href) {
                if parsed.scheme() == "http" || parsed.scheme() == "https" {
                    return Some(parsed.to_string());
                }
            }
        }
    }
    None
}

/// Resolves canonical links, remembering results for a day.
pub struct CanonicalResolver {
    client: reqwest::Client,
    cache: Cache<String, String>,
}

impl CanonicalResolver {
    pub fn new() -> AppResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(RESOLVER_UA)
            .timeout(Duration::from_secs(5))
            .build()?;
        let cache = Cache::builder()
            .max_capacity(10_000)
            .time_to_live(Duration::from_secs(24 * 60 * 60))
            .build();
        Ok(Self { client, cache })
    }

    /// Returns the canonical form of `url`. Never fails: when the site
    /// cannot be asked or answers nothing useful, the URL comes back as-is.
    pub async fn resolve(&self, url: &Url) -> String {
        if let Some(canonical) = local_canonical(url) {
            return canonical;
        }

        let key = url.to_string();
        if let Some(cached) = self.cache.get(&key).await {
            return cached;
        }

        let canonical = self.fetch_canonical(url).await.unwrap_or_else(|| key.clone());
        self.cache.insert(key, canonical.clone()).await;
        canonical
    }

    async fn fetch_canonical(&self, url: &Url) -> Option<String> {
        // HEAD first: no point fetching bytes for direct file links
        let head = self.client.head(url.clone()).send().await.ok()?;
        if head.status() != reqwest::StatusCode::METHOD_NOT_ALLOWED {
            let content_type = head
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if !content_type.contains("text/html") {
                log::debug!("{} is {}, skipping canonical lookup", url, content_type);
                return None;
            }
        }

        let html = self.client.get(url.clone()).send().await.ok()?.text().await.ok()?;
        let canonical = extract_link_tag(&html)?;
        log::debug!("Canonical for {} -> {}", url, canonical);
        Some(canonical)
    }
}
