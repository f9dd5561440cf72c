//! yt-dlp binary maintenance.
//!
//! Extractors rot quickly, so the bot runs `yt-dlp -U` once at startup and
//! exposes the same through the `update-ytdlp` CLI subcommand. A pip-managed
//! install reports exit code 100 on `-U`; that is not an error, just a
//! different upgrade channel.

use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

use crate::core::config;
use crate::core::error::{AppError, AppResult};

const VERSION_TIMEOUT: Duration = Duration::from_secs(10);
const UPDATE_TIMEOUT: Duration = Duration::from_secs(30);

/// The installed yt-dlp version string.
pub async fn current_version() -> AppResult<String> {
    let output = timeout(VERSION_TIMEOUT, Command::new(&*config::YTDL_BIN).arg("--version").output())
        .await
        .map_err(|_| AppError::Io(std::io::Error::other("yt-dlp --version timed out")))??;
    if !output.status.success() {
        return Err(AppError::Io(std::io::Error::other("yt-dlp --version exited with an error")));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Runs `yt-dlp -U` and returns a one-line summary of what happened.
pub async fn update_ytdlp() -> AppResult<String> {
    let output = timeout(UPDATE_TIMEOUT, Command::new(&*config::YTDL_BIN).arg("-U").output())
        .await
        .map_err(|_| AppError::Io(std::io::Error::other("yt-dlp -U timed out")))??;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    summarize_update(output.status.code(), &stdout, &stderr)
        .map_err(|detail| AppError::Io(std::io::Error::other(detail)))
}

fn summarize_update(code: Option<i32>, stdout: &str, stderr: &str) -> Result<String, String> {
    match code {
        Some(0) => {
            let text = stdout.trim();
            if text.contains("up to date") || text.contains("up-to-date") {
                Ok("yt-dlp is already up to date".to_string())
            } else if text.is_empty() {
                Ok("yt-dlp update check completed".to_string())
            } else {
                Ok(text.lines().last().unwrap_or(text).to_string())
            }
        }
        // pip-managed installs refuse self-update with code 100
        Some(100) => Ok("yt-dlp is managed by pip; run `pip install --upgrade yt-dlp`".to_string()),
        _ => {
            let detail = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("yt-dlp -U failed");
            Err(detail.to_string())
        }
    }
}

/// Startup-time update check. Never fails the boot: a missing network or a
/// read-only install just logs a warning and the bot runs with whatever
/// version is present.
pub async fn check_and_update_ytdlp() {
    match current_version().await {
        Ok(version) => log::info!("yt-dlp version {}", version),
        Err(e) => log::warn!("Could not read yt-dlp version: {}", e),
    }

    match update_ytdlp().await {
        Ok(summary) => log::info!("{}", summary),
        Err(e) => log::warn!("yt-dlp self-update failed: {}; continuing with the installed version", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn up_to_date_output_is_recognized() {
        let summary = summarize_update(Some(0), "yt-dlp is up to date (2025.08.11)\n", "");
        assert_eq!(summary.unwrap(), "yt-dlp is already up to date");
    }

    #[test]
    fn updated_output_passes_through_last_line() {
        let summary = summarize_update(Some(0), "Updating to 2025.08.20\nUpdated yt-dlp to 2025.08.20\n", "");
        assert_eq!(summary.unwrap(), "Updated yt-dlp to 2025.08.20");
    }

    #[test]
    fn pip_managed_install_is_not_an_error() {
        let summary = summarize_update(Some(100), "", "use pip to update");
        assert!(summary.unwrap().contains("pip"));
    }

    #[test]
    fn failure_carries_last_stderr_line() {
        let summary = summarize_update(Some(1), "", "warning: something\nERROR: no write permission\n");
        assert_eq!(summary.unwrap_err(), "ERROR: no write permission");
    }
}
