//! ffmpeg/ffprobe post-processing for downloaded media.
//!
//! Three jobs run here after a backend hands us a file: remuxing containers
//! Telegram cannot stream into mp4, extracting the audio track when the user
//! asked for audio delivery, and probing stream facts (dimensions, duration,
//! a mid-point thumbnail) that make video uploads render with a seek bar.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::core::config;
use crate::download::error::DownloadError;

/// Containers Telegram refuses to stream inline.
const REMUX_EXTS: &[&str] = &["flv", "webm", "mkv"];

/// Audio bitrate used when a transcode is unavoidable.
const AUDIO_BITRATE: &str = "192k";

/// Stream facts attached to a video upload. Every field is optional; an
/// upload without dimensions still goes through, it just loses the preview.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoFacts {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration_secs: Option<u32>,
}

fn extension_of(path: &Path) -> String {
    path.extension().and_then(|e| e.to_str()).unwrap_or_default().to_lowercase()
}

pub fn needs_mp4_remux(path: &Path) -> bool {
    let ext = extension_of(path);
    REMUX_EXTS.iter().any(|e| *e == ext)
}

/// Encoder for a target audio container. aac is the safe default for
/// anything we do not recognize.
fn codec_for_format(format: &str) -> &'static str {
    match format {
        "mp3" => "libmp3lame",
        "opus" | "ogg" => "libopus",
        "flac" => "flac",
        _ => "aac",
    }
}

async fn run_ffmpeg(args: &[&str]) -> Result<(), DownloadError> {
    let output = tokio::time::timeout(
        config::download::ffmpeg_timeout(),
        Command::new(&*config::FFMPEG_BIN)
            .args(["-hide_banner", "-loglevel", "error", "-y"])
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| DownloadError::timeout("ffmpeg did not finish in time"))?
    .map_err(|e| DownloadError::unknown(format!("failed to spawn ffmpeg: {e}")))?;

    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let detail = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("ffmpeg failed");
    Err(DownloadError::unknown(format!("ffmpeg: {detail}")))
}

/// Remuxes flv/webm/mkv into mp4 so Telegram streams it inline. Tries a
/// plain stream copy first and only transcodes when the codecs themselves
/// are not mp4-compatible. Files already in a streamable container pass
/// through untouched. The source file is removed after a successful rewrite.
pub async fn ensure_mp4(input: &Path) -> Result<PathBuf, DownloadError> {
    if !needs_mp4_remux(input) {
        return Ok(input.to_path_buf());
    }
    let output = input.with_extension("mp4");
    let (input_s, output_s) = (input.display().to_string(), output.display().to_string());

    log::info!("Remuxing {} to mp4", input_s);
    let copied = run_ffmpeg(&["-i", &input_s, "-c", "copy", "-movflags", "+faststart", &output_s]).await;
    if let Err(e) = copied {
        log::warn!("Stream copy failed ({}), transcoding {}", e, input_s);
        let _ = fs_err::tokio::remove_file(&output).await;
        run_ffmpeg(&[
            "-i",
            &input_s,
            "-c:v",
            "libx264",
            "-preset",
            "fast",
            "-crf",
            "28",
            "-c:a",
            "aac",
            "-b:a",
            AUDIO_BITRATE,
            "-movflags",
            "+faststart",
            &output_s,
        ])
        .await?;
    }

    if let Err(e) = fs_err::tokio::remove_file(input).await {
        log::warn!("Could not remove {} after remux: {}", input_s, e);
    }
    Ok(output)
}

/// Extracts the audio track into the configured audio container. A file
/// already in that container is returned as-is. m4a extraction tries
/// `-acodec copy` first since most sources carry aac audio already; other
/// targets go straight to a transcode.
pub async fn extract_audio(input: &Path) -> Result<PathBuf, DownloadError> {
    let format = config::AUDIO_FORMAT.as_str();
    if extension_of(input) == format {
        return Ok(input.to_path_buf());
    }
    let output = input.with_extension(format);
    let (input_s, output_s) = (input.display().to_string(), output.display().to_string());

    log::info!("Extracting audio from {} to {}", input_s, format);
    let mut done = false;
    if format == "m4a" {
        done = run_ffmpeg(&["-i", &input_s, "-vn", "-acodec", "copy", &output_s]).await.is_ok();
        if !done {
            let _ = fs_err::tokio::remove_file(&output).await;
        }
    }
    if !done {
        run_ffmpeg(&["-i", &input_s, "-vn", "-acodec", codec_for_format(format), "-b:a", AUDIO_BITRATE, &output_s])
            .await?;
    }

    if let Err(e) = fs_err::tokio::remove_file(input).await {
        log::warn!("Could not remove {} after audio extraction: {}", input_s, e);
    }
    Ok(output)
}

async fn run_ffprobe(args: &[&str]) -> Option<String> {
    let output = tokio::time::timeout(
        config::download::probe_timeout(),
        Command::new(&*config::FFPROBE_BIN).args(args).stdin(Stdio::null()).kill_on_drop(true).output(),
    )
    .await
    .ok()?
    .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

pub(crate) fn parse_dimensions(stdout: &str) -> (Option<u32>, Option<u32>) {
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let width = lines.next().and_then(|l| l.parse().ok());
    let height = lines.next().and_then(|l| l.parse().ok());
    (width, height)
}

pub(crate) fn parse_duration_secs(stdout: &str) -> Option<u32> {
    stdout.trim().parse::<f64>().ok().map(|d| d.round() as u32)
}

/// Probes width/height of the first video stream and the container
/// duration. Failures degrade to `None` fields rather than failing the
/// delivery.
pub async fn probe_video_facts(path: &Path) -> VideoFacts {
    let path_s = path.display().to_string();
    let mut facts = VideoFacts::default();

    if let Some(out) = run_ffprobe(&[
        "-v",
        "error",
        "-select_streams",
        "v:0",
        "-show_entries",
        "stream=width,height",
        "-of",
        "default=noprint_wrappers=1:nokey=1",
        &path_s,
    ])
    .await
    {
        let (w, h) = parse_dimensions(&out);
        facts.width = w;
        facts.height = h;
    } else {
        log::warn!("ffprobe could not read dimensions of {}", path_s);
    }

    if let Some(out) = run_ffprobe(&[
        "-v",
        "error",
        "-show_entries",
        "format=duration",
        "-of",
        "default=noprint_wrappers=1:nokey=1",
        &path_s,
    ])
    .await
    {
        facts.duration_secs = parse_duration_secs(&out);
    }

    facts
}

pub(crate) fn thumbnail_path(video: &Path) -> PathBuf {
    let stem = video.file_stem().and_then(|s| s.to_str()).unwrap_or("video");
    video.with_file_name(format!("{stem}_thumb.jpg"))
}

/// Grabs a single frame from the middle of the video, scaled into
/// Telegram's 320x320 thumbnail box. Returns `None` when ffmpeg cannot
/// produce one; the upload then goes out without a custom thumbnail.
pub async fn grab_thumbnail(video: &Path, duration_secs: Option<u32>) -> Option<PathBuf> {
    let midpoint = duration_secs.unwrap_or(0) / 2;
    let seek = midpoint.to_string();
    let output = thumbnail_path(video);
    let (video_s, output_s) = (video.display().to_string(), output.display().to_string());

    let result = run_ffmpeg(&[
        "-ss",
        &seek,
        "-i",
        &video_s,
        "-vframes",
        "1",
        "-vf",
        "scale=320:320:force_original_aspect_ratio=decrease",
        "-q:v",
        "2",
        "-f",
        "image2",
        &output_s,
    ])
    .await;

    match result {
        Ok(()) => Some(output),
        Err(e) => {
            log::warn!("Thumbnail extraction failed for {}: {}", video_s, e);
            let _ = fs_err::tokio::remove_file(&output).await;
            None
        }
    }
}
