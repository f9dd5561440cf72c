//! Progress reporting: one status message per request, edited in place.
//!
//! Telegram rate-limits message edits hard, so every edit goes through the
//! `EditDebouncer` first. An edit landing inside the debounce window is
//! dropped; the next progress report after the window picks up the slack.
//! The message itself tolerates the two errors edits routinely hit:
//! "message is not modified" is silently fine, and a flood-control
//! `RETRY_AFTER` waits out the advised pause and tries once more.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use teloxide::prelude::*;
use teloxide::types::{ChatId, MessageId, ParseMode};

use crate::core::config;
use crate::core::utils::{escape_markdown_v2, sizeof_fmt, timeof_fmt};
use crate::download::error::extract_retry_after;
use crate::download::source::SourceProgress;

/// Identity of an editable status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EditKey {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

impl EditKey {
    pub fn new(chat_id: ChatId, message_id: MessageId) -> Self {
        Self { chat_id, message_id }
    }
}

/// Timestamp-guarded edit throttle shared by all in-flight requests.
pub struct EditDebouncer {
    last_edit: DashMap<EditKey, Instant>,
    window: Duration,
}

impl EditDebouncer {
    pub fn new() -> Self {
        Self::with_window(config::progress::edit_interval())
    }

    pub fn with_window(window: Duration) -> Self {
        Self { last_edit: DashMap::new(), window }
    }

    /// Returns true when an edit for `key` is allowed right now, recording
    /// the attempt. A false return means a recent edit already went out.
    pub fn should_edit(&self, key: EditKey) -> bool {
        let now = Instant::now();
        let mut allowed = false;
        self.last_edit
            .entry(key)
            .and_modify(|last| {
                if now.duration_since(*last) >= self.window {
                    *last = now;
                    allowed = true;
                }
            })
            .or_insert_with(|| {
                allowed = true;
                now
            });
        allowed
    }

    /// Forgets a finished message immediately.
    pub fn forget(&self, key: EditKey) {
        self.last_edit.remove(&key);
    }

    /// Drops entries older than `max_age`. Called from a periodic sweep so
    /// abandoned downloads do not leak map entries.
    pub fn evict_stale(&self, max_age: Duration) {
        let now = Instant::now();
        self.last_edit.retain(|_, last| now.duration_since(*last) < max_age);
    }

    pub fn len(&self) -> usize {
        self.last_edit.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_edit.is_empty()
    }
}

impl Default for EditDebouncer {
    fn default() -> Self {
        Self::new()
    }
}

/// What the status message currently says.
#[derive(Debug, Clone)]
pub enum DownloadStatus {
    Queued { position: usize },
    Starting { title: String },
    Downloading { title: String, progress: SourceProgress },
    Processing { title: String },
    Uploading { title: String },
    Failed { reason: String },
}

impl DownloadStatus {
    /// Renders the MarkdownV2 text for this state.
    pub fn to_message(&self) -> String {
        match self {
            DownloadStatus::Queued { position } => {
                format!("⏳ Queued \\(position {}\\)", position)
            }
            DownloadStatus::Starting { title } => {
                format!("🎬 *{}*\n\n⏳ Starting download\\.\\.\\.", escape_markdown_v2(title))
            }
            DownloadStatus::Downloading { title, progress } => {
                let mut text = format!(
                    "🎬 *{}*\n\n📥 Downloading: {}%\n{}",
                    escape_markdown_v2(title),
                    progress.percent,
                    escape_markdown_v2(&progress_bar(progress.percent))
                );
                if let Some(speed) = progress.speed_bytes_sec {
                    text.push_str(&format!("\n⚡ {}/s", escape_markdown_v2(&sizeof_fmt(speed as u64))));
                }
                if let Some(eta) = progress.eta_seconds {
                    text.push_str(&format!("\n⏱ \\~{} left", escape_markdown_v2(&timeof_fmt(eta))));
                }
                if let (Some(done), Some(total)) = (progress.downloaded_bytes, progress.total_bytes) {
                    text.push_str(&format!(
                        "\n📦 {} / {}",
                        escape_markdown_v2(&sizeof_fmt(done)),
                        escape_markdown_v2(&sizeof_fmt(total))
                    ));
                }
                text
            }
            DownloadStatus::Processing { title } => {
                format!("🎬 *{}*\n\n🛠 Processing\\.\\.\\.", escape_markdown_v2(title))
            }
            DownloadStatus::Uploading { title } => {
                format!("🎬 *{}*\n\n📤 Uploading to Telegram\\.\\.\\.", escape_markdown_v2(title))
            }
            DownloadStatus::Failed { reason } => escape_markdown_v2(reason),
        }
    }
}

fn progress_bar(percent: u8) -> String {
    let percent = percent.min(100);
    let filled = (percent / 10) as usize;
    format!("[{}{}]", "█".repeat(filled), "░".repeat(10 - filled))
}

/// The one editable message a request talks through.
pub struct StatusMessage {
    chat_id: ChatId,
    message_id: Option<MessageId>,
}

impl StatusMessage {
    pub fn new(chat_id: ChatId) -> Self {
        Self { chat_id, message_id: None }
    }

    /// Adopts a message that was already sent (the initial ack).
    pub fn attached(chat_id: ChatId, message_id: MessageId) -> Self {
        Self { chat_id, message_id: Some(message_id) }
    }

    pub fn key(&self) -> Option<EditKey> {
        self.message_id.map(|id| EditKey::new(self.chat_id, id))
    }

    /// Sends or edits the status message. Editing an unchanged message is
    /// treated as success; a flood-control pause is waited out once, and
    /// any other edit failure falls back to sending a fresh message.
    pub async fn update(&mut self, bot: &Bot, status: &DownloadStatus) -> ResponseResult<()> {
        let text = status.to_message();

        let Some(message_id) = self.message_id else {
            return self.send_fresh(bot, &text).await;
        };

        match self.edit(bot, message_id, &text).await {
            Ok(()) => Ok(()),
            Err(e) => {
                let error_text = e.to_string();
                if error_text.contains("message is not modified") {
                    return Ok(());
                }
                if let Some(pause) = extract_retry_after(&error_text) {
                    log::warn!("Flood control on edit for chat {}: waiting {:?}", self.chat_id, pause);
                    tokio::time::sleep(pause + Duration::from_secs(1)).await;
                    match self.edit(bot, message_id, &text).await {
                        Ok(()) => return Ok(()),
                        Err(e2) if e2.to_string().contains("message is not modified") => return Ok(()),
                        Err(e2) => log::warn!("Edit still failing after flood pause: {}", e2),
                    }
                } else {
                    log::warn!("Could not edit status message for chat {}: {}", self.chat_id, e);
                }
                self.send_fresh(bot, &text).await
            }
        }
    }

    async fn edit(&self, bot: &Bot, message_id: MessageId, text: &str) -> ResponseResult<()> {
        bot.edit_message_text(self.chat_id, message_id, text)
            .parse_mode(ParseMode::MarkdownV2)
            .await?;
        Ok(())
    }

    async fn send_fresh(&mut self, bot: &Bot, text: &str) -> ResponseResult<()> {
        let sent = bot.send_message(self.chat_id, text).parse_mode(ParseMode::MarkdownV2).await?;
        self.message_id = Some(sent.id);
        Ok(())
    }

    /// Deletes the status message, tolerating it being gone already.
    pub async fn remove(&mut self, bot: &Bot) {
        if let Some(message_id) = self.message_id.take() {
            if let Err(e) = bot.delete_message(self.chat_id, message_id).await {
                log::debug!("Could not delete status message {}: {}", message_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bar_fills_by_tens() {
        assert_eq!(progress_bar(0), "[░░░░░░░░░░]");
        assert_eq!(progress_bar(55), "[█████░░░░░]");
        assert_eq!(progress_bar(100), "[██████████]");
        assert_eq!(progress_bar(250), "[██████████]");
    }

    #[test]
    fn debouncer_first_edit_passes_second_is_dropped() {
        let debouncer = EditDebouncer::with_window(Duration::from_secs(60));
        let key = EditKey::new(ChatId(1), MessageId(10));
        assert!(debouncer.should_edit(key));
        assert!(!debouncer.should_edit(key));

        // A different message is unaffected
        assert!(debouncer.should_edit(EditKey::new(ChatId(1), MessageId(11))));
    }

    #[test]
    fn debouncer_allows_after_window() {
        let debouncer = EditDebouncer::with_window(Duration::from_millis(0));
        let key = EditKey::new(ChatId(2), MessageId(20));
        assert!(debouncer.should_edit(key));
        assert!(debouncer.should_edit(key));
    }

    #[test]
    fn eviction_clears_stale_entries() {
        let debouncer = EditDebouncer::with_window(Duration::from_secs(60));
        let key = EditKey::new(ChatId(3), MessageId(30));
        debouncer.should_edit(key);
        assert_eq!(debouncer.len(), 1);

        debouncer.evict_stale(Duration::from_secs(3600));
        assert_eq!(debouncer.len(), 1);

        debouncer.evict_stale(Duration::from_millis(0));
        assert!(debouncer.is_empty());
    }

    #[test]
    fn forget_removes_entry() {
        let debouncer = EditDebouncer::with_window(Duration::from_secs(60));
        let key = EditKey::new(ChatId(4), MessageId(40));
        debouncer.should_edit(key);
        debouncer.forget(key);
        assert!(debouncer.is_empty());
        assert!(debouncer.should_edit(key));
    }

    #[test]
    fn status_text_escapes_titles() {
        let status = DownloadStatus::Starting { title: "A.B (2024)".to_string() };
        let text = status.to_message();
        assert!(text.contains("A\\.B \\(2024\\)"));
    }

    #[test]
    fn downloading_text_includes_counters() {
        let status = DownloadStatus::Downloading {
            title: "clip".to_string(),
            progress: SourceProgress {
                percent: 40,
                speed_bytes_sec: Some(2.0 * 1024.0 * 1024.0),
                eta_seconds: Some(75),
                downloaded_bytes: Some(4 * 1024 * 1024),
                total_bytes: Some(10 * 1024 * 1024),
            },
        };
        let text = status.to_message();
        assert!(text.contains("40%"));
        assert!(text.contains("\\[████░░░░░░\\]"));
        assert!(text.contains("2\\.0 MiB/s"));
    }
}
