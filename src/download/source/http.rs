//! Direct HTTP download backend.
//!
//! Streams the URL as-is with reqwest, resuming partially written files via
//! Range headers when the server cooperates. Used for plain file links and
//! for users who switched to direct mode. The size cap is enforced twice:
//! against the advertised Content-Length before the transfer, and against
//! actual bytes written while it runs.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use url::Url;

use super::{FetchRequest, FetchedMedia, MediaProbe, MediaSource, SourceProgress};
use crate::core::error::{AppError, AppResult};
use crate::core::utils::escape_filename;
use crate::download::error::{DownloadError, DownloadErrorKind};

const HTTP_UA: &str = "Mozilla/5.0 (compatible; tubegrab/0.7)";

/// Emit a progress update every this many percent (or bytes, when the
/// server did not say how big the file is).
const PROGRESS_STEP_PERCENT: u8 = 5;
const PROGRESS_STEP_BYTES: u64 = 2 * 1024 * 1024;

/// Pulls a filename out of a Content-Disposition header value.
fn filename_from_disposition(value: &str) -> Option<String> {
    // RFC 5987 form first: filename*=UTF-8''encoded%20name.mp4
    if let Some(idx) = value.find("filename*=") {
        let tail = &value[idx + "filename*=".len()..];
        let tail = tail.split(';').next()?.trim();
        let encoded = tail.rsplit("''").next()?;
        if let Ok(decoded) = urlencoding::decode(encoded) {
            let name = decoded.trim_matches('"').trim();
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }

    if let Some(idx) = value.find("filename=") {
        let tail = &value[idx + "filename=".len()..];
        let name = tail.split(';').next()?.trim().trim_matches('"').trim();
        if !name.is_empty() {
            return Some(name.to_string());
        }
    }

    None
}

/// Last path segment of the URL, percent-decoded, or a fixed fallback.
fn filename_from_url(url: &Url) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|s| !s.is_empty())
        .map(|s| {
            urlencoding::decode(s)
                .map(|d| d.into_owned())
                .unwrap_or_else(|_| s.to_string())
        })
        .unwrap_or_else(|| "download.bin".to_string())
}

fn mime_from_extension(path: &Path) -> Option<String> {
    let ext = path.extension()?.to_str()?.to_lowercase();
    let mime = match ext.as_str() {
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "ogg" | "opus" => "audio/ogg",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "mp4" | "m4v" => "video/mp4",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "gif" => "image/gif",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        _ => return None,
    };
    Some(mime.to_string())
}

/// Backend that streams the URL directly.
pub struct HttpSource {
    client: reqwest::Client,
}

impl HttpSource {
    pub fn new() -> Self {
        Self {
            client: build_client(),
        }
    }
}

fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .user_agent(HTTP_UA)
        .connect_timeout(std::time::Duration::from_secs(30))
        .build()
        .unwrap_or_default()
}

impl Default for HttpSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSource for HttpSource {
    fn name(&self) -> &'static str {
        "http"
    }

    fn supports_url(&self, url: &Url) -> bool {
        // Catch-all; registered after yt-dlp so it only sees direct links
        // and forced direct-mode requests.
        matches!(url.scheme(), "http" | "https")
    }

    async fn probe(&self, url: &Url) -> AppResult<MediaProbe> {
        let response = self.client.head(url.clone()).send().await?;
        if !response.status().is_success() {
            return Err(AppError::HttpStatus(response.status()));
        }

        let title = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(filename_from_disposition)
            .unwrap_or_else(|| filename_from_url(url));

        Ok(MediaProbe {
            title,
            filesize_approx: response.content_length(),
            ..MediaProbe::default()
        })
    }

    async fn fetch(
        &self,
        request: &FetchRequest,
        progress_tx: tokio::sync::mpsc::UnboundedSender<SourceProgress>,
    ) -> Result<FetchedMedia, DownloadError> {
        let url = &request.url;

        // Resume when an earlier attempt left a partial file behind. The
        // decoded URL segment can contain separators, so it is escaped
        // before it touches the filesystem.
        let file_name = escape_filename(&filename_from_url(url));
        let target: PathBuf = request.work_dir.join(&file_name);
        let existing = tokio::fs::metadata(&target).await.map(|m| m.len()).unwrap_or(0);

        let mut req = self.client.get(url.clone());
        if existing > 0 {
            log::info!("Resuming {} from byte {}", url, existing);
            req = req.header(header::RANGE, format!("bytes={}-", existing));
        }

        let response = req.send().await.map_err(|e| classify_reqwest_error(&e, url))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(std::time::Duration::from_secs);
            return Err(DownloadError::rate_limited(format!("{} answered 429", url), retry_after));
        }
        if !status.is_success() {
            return Err(DownloadError::unsupported(format!("{} answered {}", url, status)));
        }

        // A 200 to a Range request means the server ignored it; start over.
        let resumed = existing > 0 && status == reqwest::StatusCode::PARTIAL_CONTENT;
        let mut written: u64 = if resumed { existing } else { 0 };

        let total_bytes = if resumed {
            parse_content_range_total(&response).or_else(|| response.content_length().map(|len| len + existing))
        } else {
            response.content_length()
        };

        if let (Some(cap), Some(total)) = (request.max_bytes, total_bytes) {
            if total > cap {
                return Err(DownloadError::too_large(total, cap));
            }
        }

        let mut file = if resumed {
            fs_err::tokio::OpenOptions::new()
                .append(true)
                .open(&target)
                .await
                .map_err(|e| DownloadError::unknown(format!("cannot reopen partial file: {}", e)))?
        } else {
            fs_err::tokio::File::create(&target)
                .await
                .map_err(|e| DownloadError::unknown(format!("cannot create {}: {}", target.display(), e)))?
        };

        let mut stream = response.bytes_stream();
        let mut last_percent: u8 = 0;
        let mut last_reported_bytes: u64 = written;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| classify_reqwest_error(&e, url))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| DownloadError::unknown(format!("write failed: {}", e)))?;
            written += chunk.len() as u64;

            if let Some(cap) = request.max_bytes {
                if written > cap {
                    drop(file);
                    let _ = fs_err::tokio::remove_file(&target).await;
                    return Err(DownloadError::too_large(written, cap));
                }
            }

            let should_report = match total_bytes {
                Some(total) if total > 0 => {
                    let percent = ((written as f64 / total as f64) * 100.0).min(100.0) as u8;
                    let due = percent >= last_percent.saturating_add(PROGRESS_STEP_PERCENT);
                    if due {
                        last_percent = percent;
                    }
                    due
                }
                _ => {
                    let due = written >= last_reported_bytes + PROGRESS_STEP_BYTES;
                    if due {
                        last_reported_bytes = written;
                    }
                    due
                }
            };

            if should_report {
                let _ = progress_tx.send(SourceProgress {
                    percent: last_percent,
                    speed_bytes_sec: None,
                    eta_seconds: None,
                    downloaded_bytes: Some(written),
                    total_bytes,
                });
            }
        }

        file.flush()
            .await
            .map_err(|e| DownloadError::unknown(format!("flush failed: {}", e)))?;

        log::info!("HTTP fetch finished: {} ({} bytes)", target.display(), written);

        Ok(FetchedMedia {
            mime_hint: mime_from_extension(&target),
            file_path: target,
            file_size: written,
        })
    }
}

fn parse_content_range_total(response: &reqwest::Response) -> Option<u64> {
    // Content-Range: bytes 1000-9999/10000
    response
        .headers()
        .get(header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.rsplit('/').next())
        .and_then(|total| total.parse::<u64>().ok())
}

fn classify_reqwest_error(error: &reqwest::Error, url: &Url) -> DownloadError {
    if error.is_timeout() {
        DownloadError::timeout(format!("{}: {}", url, error))
    } else if error.is_connect() {
        DownloadError::new(
            DownloadErrorKind::Unsupported,
            format!("cannot connect to {}: {}", url, error),
        )
    } else {
        DownloadError::unknown(format!("{}: {}", url, error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_from_disposition() {
        assert_eq!(
            filename_from_disposition(r#"attachment; filename="video.mp4""#).as_deref(),
            Some("video.mp4")
        );
        assert_eq!(
            filename_from_disposition("attachment; filename*=UTF-8''my%20song.mp3").as_deref(),
            Some("my song.mp3")
        );
        assert_eq!(filename_from_disposition("inline"), None);
    }

    #[test]
    fn test_filename_from_url() {
        let url = Url::parse("https://example.com/media/My%20Clip.mp4?token=x").unwrap();
        assert_eq!(filename_from_url(&url), "My Clip.mp4");

        let bare = Url::parse("https://example.com/").unwrap();
        assert_eq!(filename_from_url(&bare), "download.bin");
    }

    #[test]
    fn test_encoded_separators_cannot_leave_work_dir() {
        let url = Url::parse("https://cdn.example.com/clip%2F..%2F..%2Fescape.mp4").unwrap();
        let name = escape_filename(&filename_from_url(&url));
        assert_eq!(name, "clip_.._.._escape.mp4");
    }

    #[test]
    fn test_mime_from_extension() {
        assert_eq!(mime_from_extension(Path::new("a.mp4")).as_deref(), Some("video/mp4"));
        assert_eq!(mime_from_extension(Path::new("a.mp3")).as_deref(), Some("audio/mpeg"));
        assert_eq!(mime_from_extension(Path::new("a.xyz")), None);
        assert_eq!(mime_from_extension(Path::new("noext")), None);
    }

    #[test]
    fn test_supports_all_web_urls() {
        let source = HttpSource::new();
        assert!(source.supports_url(&Url::parse("https://example.com/file.bin").unwrap()));
        assert!(source.supports_url(&Url::parse("http://example.com/").unwrap()));
    }
}
