//! Runs one download from URL to local files ready for upload.
//!
//! The core is a candidate loop over the format selectors derived from the
//! user's settings. A failed attempt either advances to the next selector
//! or aborts the whole request, decided by the error kind alone: a timeout
//! or an unsupported-format complaint can be fixed by a looser selector,
//! while a rate limit or an oversized file cannot.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tokio::sync::mpsc;
use url::Url;
use uuid::Uuid;

use crate::core::config;
use crate::download::convert::{self, VideoFacts};
use crate::download::error::DownloadError;
use crate::download::formats::{format_candidates, Quality, SendAs};
use crate::download::link;
use crate::download::source::{FetchRequest, FetchedMedia, MediaProbe, MediaSource, SourceProgress};
use crate::storage::db::User;

/// Snapshot of the preferences that shape one download, taken when the
/// request is accepted. A settings change mid-queue does not reshape work
/// that is already enqueued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSettings {
    pub quality: Quality,
    pub send_as: SendAs,
    pub custom_height: Option<i64>,
}

impl DownloadSettings {
    /// Stored values that no longer parse fall back to the signup defaults.
    pub fn from_user(user: &User) -> Self {
        Self {
            quality: Quality::from_str(&user.quality).unwrap_or(Quality::High),
            send_as: SendAs::from_str(&user.send_as).unwrap_or(SendAs::Video),
            custom_height: user.custom_height,
        }
    }

    /// Audio is delivered when either the delivery kind or the quality
    /// preference says so.
    pub fn wants_audio(&self) -> bool {
        self.send_as == SendAs::Audio || self.quality == Quality::Audio
    }
}

/// A finished download, post-processed and ready for the dispatcher.
#[derive(Debug)]
pub struct Fetched {
    pub files: Vec<PathBuf>,
    pub title: String,
    pub uploader: Option<String>,
    pub facts: VideoFacts,
    pub thumbnail: Option<PathBuf>,
    /// Scratch directory holding every path above.
    pub work_dir: PathBuf,
}

impl Fetched {
    /// Removes the scratch directory once the upload is done (or given up).
    pub async fn cleanup(&self) {
        remove_work_dir(&self.work_dir).await;
    }
}

async fn remove_work_dir(dir: &Path) {
    if let Err(e) = fs_err::tokio::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::warn!("Could not remove work dir {}: {}", dir.display(), e);
        }
    }
}

/// Removes work directories a previous run left behind, e.g. after a crash
/// mid-download. Only directories whose name parses as a UUID are touched,
/// so anything else living in the download folder is safe.
pub async fn sweep_stale_work_dirs() -> std::io::Result<usize> {
    sweep_dir(Path::new(&*config::DOWNLOAD_FOLDER)).await
}

async fn sweep_dir(root: &Path) -> std::io::Result<usize> {
    let mut entries = match fs_err::tokio::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let is_work_dir = entry
            .file_name()
            .to_str()
            .map(|name| Uuid::parse_str(name).is_ok())
            .unwrap_or(false);
        if is_work_dir {
            remove_work_dir(&path).await;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Downloads `url` with the given backend, walking the format candidates
/// until one succeeds. Progress reports from the active attempt are
/// forwarded to `progress`. Callers resolve the backend from the
/// `SourceRegistry` (or force one, which is what `/direct` and `/ytdl` do).
pub async fn fetch_media(
    source: &dyn MediaSource,
    url: &Url,
    settings: &DownloadSettings,
    progress: mpsc::UnboundedSender<SourceProgress>,
) -> Result<Fetched, DownloadError> {
    if link::is_playlist(url) {
        return Err(DownloadError::unsupported("playlists and HLS manifests are not downloadable"));
    }

    // A failed probe is not fatal: the fetch itself fails with a better
    // classified error if the URL is truly broken. Livestreams however can
    // only be caught here, before yt-dlp starts recording one.
    let probe = match source.probe(url).await {
        Ok(p) => Some(p),
        Err(e) => {
            log::warn!("Probe failed for {} via {}: {}", url, source.name(), e);
            None
        }
    };
    if probe.as_ref().is_some_and(|p| p.is_live) {
        return Err(DownloadError::unsupported("livestreams cannot be downloaded"));
    }

    let work_dir = Path::new(&*config::DOWNLOAD_FOLDER).join(Uuid::new_v4().to_string());
    fs_err::tokio::create_dir_all(&work_dir)
        .await
        .map_err(|e| DownloadError::unknown(format!("cannot create work dir: {e}")))?;

    match run_candidates(source, url, settings, &work_dir, progress).await {
        Ok(media) => match finish(media, probe, settings, work_dir.clone()).await {
            Ok(fetched) => Ok(fetched),
            Err(e) => {
                remove_work_dir(&work_dir).await;
                Err(e)
            }
        },
        Err(e) => {
            remove_work_dir(&work_dir).await;
            Err(e)
        }
    }
}

async fn run_candidates(
    source: &dyn MediaSource,
    url: &Url,
    settings: &DownloadSettings,
    work_dir: &Path,
    progress: mpsc::UnboundedSender<SourceProgress>,
) -> Result<FetchedMedia, DownloadError> {
    let candidates = format_candidates(settings.quality, settings.send_as, settings.custom_height);
    let total = candidates.len();
    let max_bytes = config::validation::max_file_bytes();

    let mut last_err = DownloadError::unknown("no format candidates");
    for (idx, format) in candidates.into_iter().enumerate() {
        let request = FetchRequest {
            url: url.clone(),
            work_dir: work_dir.to_path_buf(),
            format,
            max_bytes: Some(max_bytes),
        };
        match source.fetch(&request, progress.clone()).await {
            Ok(media) => {
                if idx > 0 {
                    log::info!("Candidate {}/{} succeeded for {}", idx + 1, total, url);
                }
                return Ok(media);
            }
            Err(e) if e.kind.advances_fallback() && idx + 1 < total => {
                log::warn!("Candidate {}/{} failed for {} ({}): {}", idx + 1, total, url, e.kind.as_str(), e.detail);
                last_err = e;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err)
}

/// Post-processing after the bytes are on disk: container fixes, audio
/// extraction, stream probing, thumbnail.
async fn finish(
    media: FetchedMedia,
    probe: Option<MediaProbe>,
    settings: &DownloadSettings,
    work_dir: PathBuf,
) -> Result<Fetched, DownloadError> {
    let mut file = media.file_path;

    if settings.wants_audio() {
        file = convert::extract_audio(&file).await?;
    } else if settings.send_as == SendAs::Video {
        file = convert::ensure_mp4(&file).await?;
    }

    let (facts, thumbnail) = if settings.send_as == SendAs::Document {
        (VideoFacts::default(), None)
    } else {
        let facts = convert::probe_video_facts(&file).await;
        let thumbnail = if settings.wants_audio() {
            None
        } else {
            convert::grab_thumbnail(&file, facts.duration_secs).await
        };
        (facts, thumbnail)
    };

    let title = probe
        .as_ref()
        .map(|p| p.title.clone())
        .filter(|t| !t.is_empty())
        .or_else(|| file.file_stem().and_then(|s| s.to_str()).map(str::to_string))
        .unwrap_or_else(|| "media".to_string());
    let uploader = probe.and_then(|p| p.uploader);

    Ok(Fetched { files: vec![file], title, uploader, facts, thumbnail, work_dir })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_with(quality: &str, send_as: &str, custom_height: Option<i64>) -> User {
        User {
            chat_id: 1,
            username: None,
            plan: "free".to_string(),
            quality: quality.to_string(),
            send_as: send_as.to_string(),
            mode: "local".to_string(),
            custom_height,
            history_enabled: 1,
        }
    }

    #[test]
    fn settings_snapshot_parses_user_row() {
        let s = DownloadSettings::from_user(&user_with("medium", "document", Some(480)));
        assert_eq!(s.quality, Quality::Medium);
        assert_eq!(s.send_as, SendAs::Document);
        assert_eq!(s.custom_height, Some(480));
    }

    #[test]
    fn settings_snapshot_survives_garbage_rows() {
        let s = DownloadSettings::from_user(&user_with("4k-ultra", "hologram", None));
        assert_eq!(s.quality, Quality::High);
        assert_eq!(s.send_as, SendAs::Video);
    }

    #[test]
    fn audio_delivery_detected_from_either_field() {
        assert!(DownloadSettings::from_user(&user_with("audio", "video", None)).wants_audio());
        assert!(DownloadSettings::from_user(&user_with("high", "audio", None)).wants_audio());
        assert!(!DownloadSettings::from_user(&user_with("high", "video", None)).wants_audio());
    }

    #[tokio::test]
    async fn sweep_removes_only_uuid_directories() {
        let root = tempfile::tempdir().unwrap();
        let stale = root.path().join(Uuid::new_v4().to_string());
        let keeper = root.path().join("archive");
        std::fs::create_dir(&stale).unwrap();
        std::fs::create_dir(&keeper).unwrap();
        std::fs::write(root.path().join("notes.txt"), b"x").unwrap();

        let removed = sweep_dir(root.path()).await.unwrap();

        assert_eq!(removed, 1);
        assert!(!stale.exists());
        assert!(keeper.exists());
    }

    #[tokio::test]
    async fn sweep_of_missing_folder_is_a_noop() {
        let removed = sweep_dir(Path::new("/nonexistent/tubegrab-sweep-test")).await.unwrap();
        assert_eq!(removed, 0);
    }
}
