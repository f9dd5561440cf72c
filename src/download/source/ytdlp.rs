//! yt-dlp download backend.
//!
//! Probes with `--dump-json --no-download` and downloads with `--newline`,
//! parsing the `[download]` progress lines yt-dlp prints one per line. The
//! whole fetch runs under a single deadline; a progress report whose total
//! size estimate exceeds the request cap kills the child immediately so no
//! bandwidth is wasted on a file Telegram would reject anyway.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use url::Url;

use super::{FetchRequest, FetchedMedia, MediaProbe, MediaSource, SourceProgress};
use crate::core::config;
use crate::core::error::{AppError, AppResult};
use crate::download::error::{classify_ytdlp_stderr, extract_retry_after, DownloadError, DownloadErrorKind};

/// Extensions that mark a URL as a direct file link. Those are cheaper to
/// stream over plain HTTP than to push through an extractor.
const DIRECT_FILE_EXTS: &[&str] = &[
    "mp3", "m4a", "aac", "ogg", "opus", "wav", "flac", "mp4", "m4v", "mov", "avi", "mkv", "webm", "flv", "gif",
    "jpg", "jpeg", "png", "webp", "pdf", "zip",
];

fn has_direct_file_extension(url: &Url) -> bool {
    let path = url.path().to_lowercase();
    DIRECT_FILE_EXTS.iter().any(|ext| path.ends_with(&format!(".{ext}")))
}

/// The subset of yt-dlp's `--dump-json` output the bot cares about.
#[derive(Debug, Deserialize)]
struct YtdlpInfo {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    uploader: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    filesize: Option<u64>,
    #[serde(default)]
    filesize_approx: Option<u64>,
    #[serde(default)]
    is_live: Option<bool>,
}

impl From<YtdlpInfo> for MediaProbe {
    fn from(info: YtdlpInfo) -> Self {
        MediaProbe {
            title: info.title.unwrap_or_else(|| "media".to_string()),
            uploader: info.uploader.or(info.channel),
            duration_secs: info.duration.map(|d| d.max(0.0) as u32),
            width: info.width,
            height: info.height,
            filesize_approx: info.filesize.or(info.filesize_approx),
            is_live: info.is_live.unwrap_or(false),
        }
    }
}

/// Parses one `--newline` progress line.
///
/// Example: `[download]  45.2% of ~10.00MiB at 500.00KiB/s ETA 00:10`
pub(crate) fn parse_progress_line(line: &str) -> Option<SourceProgress> {
    if !line.contains("[download]") || !line.contains('%') {
        return None;
    }

    let mut percent = None;
    let mut total_bytes = None;
    let mut speed_bytes_sec = None;
    let mut eta_seconds = None;

    let parts: Vec<&str> = line.split_whitespace().collect();
    for (i, part) in parts.iter().enumerate() {
        if part.ends_with('%') {
            if let Ok(p) = part.trim_end_matches('%').parse::<f32>() {
                percent = Some(p.clamp(0.0, 100.0) as u8);
            }
        }
        if *part == "of" && i + 1 < parts.len() {
            total_bytes = parse_size(parts[i + 1]);
        }
        if *part == "at" && i + 1 < parts.len() {
            speed_bytes_sec = parse_size(parts[i + 1]).map(|b| b as f64);
        }
        if *part == "ETA" && i + 1 < parts.len() {
            eta_seconds = parse_eta(parts[i + 1]);
        }
    }

    let percent = percent?;
    let downloaded_bytes = total_bytes.map(|total| (total as f64 * (percent as f64 / 100.0)) as u64);

    Some(SourceProgress {
        percent,
        speed_bytes_sec,
        eta_seconds,
        downloaded_bytes,
        total_bytes,
    })
}

/// Parses sizes like `10.00MiB`, `~4.2GiB`, or `500.00KiB/s` into bytes.
fn parse_size(size_str: &str) -> Option<u64> {
    let size_str = size_str.trim_start_matches('~').trim_end_matches("/s");
    for (suffix, factor) in [
        ("GiB", 1024.0 * 1024.0 * 1024.0),
        ("MiB", 1024.0 * 1024.0),
        ("KiB", 1024.0),
        ("B", 1.0),
    ] {
        if let Some(number) = size_str.strip_suffix(suffix) {
            if let Ok(value) = number.parse::<f64>() {
                return Some((value * factor) as u64);
            }
        }
    }
    None
}

/// Parses `MM:SS` or `HH:MM:SS` into seconds.
fn parse_eta(eta_str: &str) -> Option<u64> {
    let parts: Vec<&str> = eta_str.split(':').collect();
    match parts.as_slice() {
        [m, s] => Some(m.parse::<u64>().ok()? * 60 + s.parse::<u64>().ok()?),
        [h, m, s] => Some(h.parse::<u64>().ok()? * 3600 + m.parse::<u64>().ok()? * 60 + s.parse::<u64>().ok()?),
        _ => None,
    }
}

/// Picks the downloaded file out of the scratch directory.
///
/// yt-dlp leaves `.part`/`.ytdl` droppings behind when a fragment download
/// is interrupted; the real output is the largest complete file.
fn find_output_file(work_dir: &Path) -> Option<(PathBuf, u64)> {
    let entries = std::fs::read_dir(work_dir).ok()?;
    entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            let name = path.file_name()?.to_str()?.to_string();
            if name.ends_with(".part") || name.ends_with(".ytdl") || name.ends_with(".tmp") {
                return None;
            }
            let meta = entry.metadata().ok()?;
            if !meta.is_file() {
                return None;
            }
            Some((path, meta.len()))
        })
        .max_by_key(|(_, size)| *size)
}

/// Backend that shells out to yt-dlp.
pub struct YtdlpSource {
    binary: String,
}

impl YtdlpSource {
    pub fn new() -> Self {
        Self {
            binary: config::YTDL_BIN.clone(),
        }
    }

    fn base_args(url: &Url) -> Vec<String> {
        vec![
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--no-check-certificate".to_string(),
            url.to_string(),
        ]
    }
}

impl Default for YtdlpSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaSource for YtdlpSource {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    fn supports_url(&self, url: &Url) -> bool {
        // Anything that is not an obvious direct file goes through the
        // extractor; the HTTP backend catches the rest.
        !has_direct_file_extension(url)
    }

    async fn probe(&self, url: &Url) -> AppResult<MediaProbe> {
        let mut args = vec!["--dump-json".to_string(), "--no-download".to_string()];
        args.extend(Self::base_args(url));

        log::debug!("Probing {} via {}", url, self.binary);
        let output = tokio::time::timeout(
            config::download::probe_timeout(),
            Command::new(&self.binary)
                .args(&args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .output(),
        )
        .await
        .map_err(|_| AppError::Download(DownloadError::timeout(format!("probe of {} timed out", url))))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let kind = classify_ytdlp_stderr(&stderr);
            let detail = stderr.lines().last().unwrap_or("yt-dlp probe failed").to_string();
            return Err(AppError::Download(DownloadError::new(kind, detail)));
        }

        let info: YtdlpInfo = serde_json::from_slice(&output.stdout)
            .map_err(|e| AppError::Download(DownloadError::unknown(format!("unreadable probe output: {}", e))))?;
        Ok(info.into())
    }

    async fn fetch(
        &self,
        request: &FetchRequest,
        progress_tx: mpsc::UnboundedSender<SourceProgress>,
    ) -> Result<FetchedMedia, DownloadError> {
        let output_template = request.work_dir.join("%(title).180B.%(ext)s");
        let mut args = vec![
            "-o".to_string(),
            output_template.to_string_lossy().into_owned(),
            "--newline".to_string(),
        ];
        if let Some(format) = &request.format {
            args.push("-f".to_string());
            args.push(format.clone());
        }
        args.extend(Self::base_args(&request.url));

        log::info!(
            "yt-dlp fetch: url={}, format={:?}, cap={:?}",
            request.url,
            request.format,
            request.max_bytes
        );

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DownloadError::unknown(format!("failed to start {}: {}", self.binary, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DownloadError::unknown("yt-dlp stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DownloadError::unknown("yt-dlp stderr not captured"))?;

        // Drain stderr in parallel so a chatty extractor cannot dead-lock
        // the pipes while we read stdout.
        let stderr_task = tokio::spawn(async move {
            let mut collected = String::new();
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                collected.push_str(&line);
                collected.push('\n');
            }
            collected
        });

        let deadline = tokio::time::Instant::now() + config::download::ytdlp_timeout();
        let mut lines = BufReader::new(stdout).lines();

        loop {
            let next = tokio::time::timeout_at(deadline, lines.next_line()).await;
            match next {
                Err(_) => {
                    let _ = child.kill().await;
                    return Err(DownloadError::timeout(format!(
                        "yt-dlp exceeded {}s for {}",
                        config::download::YTDLP_TIMEOUT_SECS,
                        request.url
                    )));
                }
                Ok(Ok(Some(line))) => {
                    if let Some(progress) = parse_progress_line(&line) {
                        if let (Some(cap), Some(total)) = (request.max_bytes, progress.total_bytes) {
                            if total > cap {
                                let _ = child.kill().await;
                                log::warn!("Aborting {}: reported {} bytes over cap {}", request.url, total, cap);
                                return Err(DownloadError::too_large(total, cap));
                            }
                        }
                        let _ = progress_tx.send(progress);
                    }
                }
                Ok(Ok(None)) => break,
                Ok(Err(e)) => {
                    log::debug!("yt-dlp stdout closed early: {}", e);
                    break;
                }
            }
        }

        let status = match tokio::time::timeout_at(deadline, child.wait()).await {
            Err(_) => {
                let _ = child.kill().await;
                return Err(DownloadError::timeout(format!(
                    "yt-dlp did not exit within {}s",
                    config::download::YTDLP_TIMEOUT_SECS
                )));
            }
            Ok(result) => result.map_err(|e| DownloadError::unknown(format!("failed to wait for yt-dlp: {}", e)))?,
        };

        let stderr_text = stderr_task.await.unwrap_or_default();

        if !status.success() {
            let kind = classify_ytdlp_stderr(&stderr_text);
            let detail = stderr_text
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("yt-dlp failed without output")
                .to_string();
            log::warn!("yt-dlp failed for {} ({}): {}", request.url, kind.as_str(), detail);
            return Err(DownloadError {
                kind,
                retry_after: if kind == DownloadErrorKind::RateLimited {
                    extract_retry_after(&stderr_text)
                } else {
                    None
                },
                detail,
            });
        }

        let (file_path, file_size) = find_output_file(&request.work_dir)
            .ok_or_else(|| DownloadError::unknown("yt-dlp reported success but produced no file"))?;

        // Final cap check catches files whose size was never reported in
        // the progress stream (e.g. merged A/V downloads).
        if let Some(cap) = request.max_bytes {
            if file_size > cap {
                return Err(DownloadError::too_large(file_size, cap));
            }
        }

        Ok(FetchedMedia {
            file_path,
            file_size,
            mime_hint: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_progress_line() {
        let progress = parse_progress_line("[download]  45.2% of 10.00MiB at 500.00KiB/s ETA 00:10").unwrap();
        assert_eq!(progress.percent, 45);
        assert_eq!(progress.total_bytes, Some(10 * 1024 * 1024));
        assert_eq!(progress.speed_bytes_sec, Some(500.0 * 1024.0));
        assert_eq!(progress.eta_seconds, Some(10));
        assert_eq!(progress.downloaded_bytes, Some((10.0 * 1024.0 * 1024.0 * 0.45) as u64));
    }

    #[test]
    fn test_parse_progress_line_with_estimate() {
        let progress = parse_progress_line("[download]   5.0% of ~4.00GiB at 2.00MiB/s ETA 1:02:03").unwrap();
        assert_eq!(progress.percent, 5);
        assert_eq!(progress.total_bytes, Some(4 * 1024 * 1024 * 1024));
        assert_eq!(progress.eta_seconds, Some(3723));
    }

    #[test]
    fn test_parse_progress_ignores_other_lines() {
        assert!(parse_progress_line("[download] Destination: /tmp/video.mp4").is_none());
        assert!(parse_progress_line("[youtube] dQw4w9WgXcQ: Downloading webpage").is_none());
        assert!(parse_progress_line("").is_none());
    }

    #[test]
    fn test_parse_size_units() {
        assert_eq!(parse_size("500.00KiB"), Some(512_000));
        assert_eq!(parse_size("10.00MiB"), Some(10 * 1024 * 1024));
        assert_eq!(parse_size("~1.00GiB"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size("2.00MiB/s"), Some(2 * 1024 * 1024));
        assert_eq!(parse_size("fast"), None);
    }

    #[test]
    fn test_supports_url_declines_direct_files() {
        let source = YtdlpSource::new();
        assert!(source.supports_url(&Url::parse("https://www.youtube.com/watch?v=abc").unwrap()));
        assert!(source.supports_url(&Url::parse("https://vimeo.com/123456").unwrap()));
        assert!(!source.supports_url(&Url::parse("https://example.com/song.mp3").unwrap()));
        assert!(!source.supports_url(&Url::parse("https://example.com/clip.mp4").unwrap()));
    }

    #[test]
    fn test_probe_json_mapping() {
        let raw = r#"{
            "title": "Test Video",
            "uploader": "Channel",
            "duration": 212.4,
            "width": 1920,
            "height": 1080,
            "filesize_approx": 52428800,
            "is_live": false
        }"#;
        let info: YtdlpInfo = serde_json::from_str(raw).unwrap();
        let probe = MediaProbe::from(info);
        assert_eq!(probe.title, "Test Video");
        assert_eq!(probe.uploader.as_deref(), Some("Channel"));
        assert_eq!(probe.duration_secs, Some(212));
        assert_eq!(probe.height, Some(1080));
        assert_eq!(probe.filesize_approx, Some(52_428_800));
        assert!(!probe.is_live);
    }

    #[test]
    fn test_probe_json_defaults() {
        let info: YtdlpInfo = serde_json::from_str("{}").unwrap();
        let probe = MediaProbe::from(info);
        assert_eq!(probe.title, "media");
        assert!(probe.duration_secs.is_none());
        assert!(!probe.is_live);
    }

    #[test]
    fn test_find_output_file_skips_partials() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("video.mp4"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.path().join("video.mp4.part"), vec![0u8; 500]).unwrap();
        std::fs::write(dir.path().join("fragment.ytdl"), vec![0u8; 300]).unwrap();

        let (path, size) = find_output_file(dir.path()).unwrap();
        assert_eq!(path.file_name().unwrap(), "video.mp4");
        assert_eq!(size, 100);
    }
}
