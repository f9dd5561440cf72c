//! Sends finished downloads to the chat and records what was sent.
//!
//! The send method is chosen by the user's delivery preference, with a
//! fallback chain when Telegram rejects the first attempt: documents retry
//! as video, videos degrade to animation and then photo. Flood-control
//! pauses are slept out once per attempt. After a successful single-file
//! send the platform file id is written to the delivery cache so the next
//! request for the same fingerprint skips the download entirely.

use std::path::Path;
use std::time::Duration;

use teloxide::prelude::*;
use teloxide::types::{
    FileId, InputFile, InputMedia, InputMediaAudio, InputMediaDocument, InputMediaVideo, Message, ParseMode,
};

use crate::core::error::{AppError, AppResult};
use crate::core::{config, metrics};
use crate::download::error::extract_retry_after;
use crate::download::formats::SendAs;
use crate::download::orchestrator::{DownloadSettings, Fetched};
use crate::storage::cache::{CachedDelivery, DeliveryCache, NewDelivery};
use crate::storage::db::{self, DbPool};
use crate::telegram::caption::build_caption;

/// Telegram caps media groups at ten entries.
const MEDIA_GROUP_CHUNK: usize = 10;

/// Identifiers the dispatcher needs besides the files themselves.
#[derive(Debug, Clone)]
pub struct DeliveryMeta {
    pub fingerprint: String,
    pub canonical_url: String,
    pub history_enabled: bool,
}

/// What was sent, for metrics and the caller's logs.
#[derive(Debug, Clone)]
pub struct Delivered {
    /// Send method that finally succeeded: "video", "audio", "document",
    /// "animation", "photo" or "media_group"
    pub kind: &'static str,
    /// File id of the sent media; absent for media groups
    pub file_id: Option<String>,
}

/// Uploads results and maintains the delivery cache and history.
#[derive(Clone)]
pub struct UploadDispatcher {
    cache: DeliveryCache,
    pool: DbPool,
}

impl UploadDispatcher {
    pub fn new(cache: DeliveryCache, pool: DbPool) -> Self {
        Self { cache, pool }
    }

    /// Sends a finished download to the chat.
    ///
    /// Bookkeeping after a successful send (cache write, history, archive
    /// copy) is best-effort: the user already has the file, so a bookkeeping
    /// failure is logged rather than surfaced.
    pub async fn deliver(
        &self,
        bot: &Bot,
        chat_id: ChatId,
        fetched: &Fetched,
        settings: &DownloadSettings,
        meta: &DeliveryMeta,
    ) -> AppResult<Delivered> {
        let caption = build_caption(&fetched.title, fetched.uploader.as_deref(), &meta.canonical_url);

        if fetched.files.len() > 1 {
            self.send_media_groups(bot, chat_id, fetched, settings, &caption).await?;
            // A group has no single file id to replay, so it is never cached.
            self.record_history(chat_id, meta, &fetched.title, "media_group");
            metrics::record_download_success("media_group", &settings.quality.to_string());
            return Ok(Delivered { kind: "media_group", file_id: None });
        }

        let file = fetched.files.first().ok_or_else(|| AppError::Validation("download produced no files".into()))?;
        let file_size = fs_err::tokio::metadata(file).await.map(|m| m.len() as i64).ok();

        let (message, kind) = self.send_single(bot, chat_id, file, fetched, settings, &caption).await?;
        let file_id = extract_file_id(&message);

        match &file_id {
            Some(id) => {
                let entry = NewDelivery {
                    fingerprint: &meta.fingerprint,
                    canonical_url: &meta.canonical_url,
                    file_id: id,
                    kind,
                    caption: Some(&caption),
                    width: fetched.facts.width.map(i64::from),
                    height: fetched.facts.height.map(i64::from),
                    duration: fetched.facts.duration_secs.map(i64::from),
                    file_size,
                };
                if let Err(e) = self.cache.store(&entry) {
                    log::warn!("Cache write failed for {}: {}", meta.fingerprint, e);
                }
            }
            None => log::warn!("Sent message for {} carries no file id; not cached", meta.canonical_url),
        }

        self.record_history(chat_id, meta, &fetched.title, kind);
        metrics::record_download_success(kind, &settings.quality.to_string());
        forward_to_archive(bot, chat_id, &message).await;

        Ok(Delivered { kind, file_id })
    }

    /// Re-sends a cached file id using the method recorded at first upload.
    pub async fn deliver_cached(&self, bot: &Bot, chat_id: ChatId, entry: &CachedDelivery) -> AppResult<()> {
        let file = InputFile::file_id(FileId(entry.file_id.clone()));
        let caption = entry.caption.clone().unwrap_or_default();

        let send = || async {
            match entry.kind.as_str() {
                "video" => {
                    bot.send_video(chat_id, file.clone())
                        .caption(&caption)
                        .parse_mode(ParseMode::MarkdownV2)
                        .await
                }
                "audio" => {
                    bot.send_audio(chat_id, file.clone())
                        .caption(&caption)
                        .parse_mode(ParseMode::MarkdownV2)
                        .await
                }
                "animation" => {
                    bot.send_animation(chat_id, file.clone())
                        .caption(&caption)
                        .parse_mode(ParseMode::MarkdownV2)
                        .await
                }
                "photo" => {
                    bot.send_photo(chat_id, file.clone())
                        .caption(&caption)
                        .parse_mode(ParseMode::MarkdownV2)
                        .await
                }
                // "document" and anything a future build may have written
                _ => {
                    bot.send_document(chat_id, file.clone())
                        .caption(&caption)
                        .parse_mode(ParseMode::MarkdownV2)
                        .await
                }
            }
        };

        let message = match send().await {
            Err(e) if flood_pause(&e).await => send().await?,
            other => other?,
        };
        forward_to_archive(bot, chat_id, &message).await;
        Ok(())
    }

    /// Dispatches one file along the preference's fallback chain.
    async fn send_single(
        &self,
        bot: &Bot,
        chat_id: ChatId,
        file: &Path,
        fetched: &Fetched,
        settings: &DownloadSettings,
        caption: &str,
    ) -> AppResult<(Message, &'static str)> {
        if settings.wants_audio() {
            let message = send_audio(bot, chat_id, file, fetched, caption).await?;
            return Ok((message, "audio"));
        }

        match settings.send_as {
            SendAs::Document => match send_document(bot, chat_id, file, caption).await {
                Ok(message) => Ok((message, "document")),
                Err(e) => {
                    log::warn!("send_document failed for chat {}: {}; retrying as video", chat_id, e);
                    let message = send_video(bot, chat_id, file, fetched, caption).await?;
                    Ok((message, "video"))
                }
            },
            SendAs::Audio => {
                let message = send_audio(bot, chat_id, file, fetched, caption).await?;
                Ok((message, "audio"))
            }
            SendAs::Video => match send_video(bot, chat_id, file, fetched, caption).await {
                Ok(message) => Ok((message, "video")),
                Err(e) => {
                    log::warn!("send_video failed for chat {}: {}; trying animation", chat_id, e);
                    match send_animation(bot, chat_id, file, caption).await {
                        Ok(message) => Ok((message, "animation")),
                        Err(e) => {
                            log::warn!("send_animation failed for chat {}: {}; trying photo", chat_id, e);
                            let message = send_photo(bot, chat_id, file, caption).await?;
                            Ok((message, "photo"))
                        }
                    }
                }
            },
        }
    }

    /// Sends many files as media groups of at most ten.
    ///
    /// The caption rides on the first item of the first group, which is how
    /// Telegram renders a caption for the whole album.
    async fn send_media_groups(
        &self,
        bot: &Bot,
        chat_id: ChatId,
        fetched: &Fetched,
        settings: &DownloadSettings,
        caption: &str,
    ) -> AppResult<()> {
        let mut first = true;
        for chunk in fetched.files.chunks(MEDIA_GROUP_CHUNK) {
            let mut media = Vec::with_capacity(MEDIA_GROUP_CHUNK);
            for path in chunk {
                let input = InputFile::file(path.clone());
                let item = if settings.wants_audio() {
                    let audio = InputMediaAudio::new(input);
                    let audio = if first { audio.caption(caption).parse_mode(ParseMode::MarkdownV2) } else { audio };
                    InputMedia::Audio(audio)
                } else if settings.send_as == SendAs::Document {
                    let doc = InputMediaDocument::new(input);
                    let doc = if first { doc.caption(caption).parse_mode(ParseMode::MarkdownV2) } else { doc };
                    InputMedia::Document(doc)
                } else {
                    let video = InputMediaVideo::new(input);
                    let video = if first { video.caption(caption).parse_mode(ParseMode::MarkdownV2) } else { video };
                    InputMedia::Video(video)
                };
                media.push(item);
                first = false;
            }

            let send = || async { bot.send_media_group(chat_id, media.clone()).await };
            match send().await {
                Err(e) if flood_pause(&e).await => {
                    send().await?;
                }
                other => {
                    other?;
                }
            }
        }
        Ok(())
    }

    fn record_history(&self, chat_id: ChatId, meta: &DeliveryMeta, title: &str, kind: &str) {
        if !meta.history_enabled {
            return;
        }
        match db::get_connection(&self.pool) {
            Ok(conn) => {
                if let Err(e) = db::save_download_history(&conn, chat_id.0, &meta.canonical_url, title, kind) {
                    log::warn!("History write failed for chat {}: {}", chat_id, e);
                }
            }
            Err(e) => log::warn!("No DB connection for history write: {}", e),
        }
    }
}

/// Sleeps out a flood-control pause. True means the send should be retried.
async fn flood_pause(err: &teloxide::RequestError) -> bool {
    match extract_retry_after(&err.to_string()) {
        Some(pause) => {
            metrics::record_send_retry();
            log::warn!("Flood control: pausing {:?} before retrying send", pause);
            tokio::time::sleep(pause + Duration::from_secs(1)).await;
            true
        }
        None => false,
    }
}

async fn send_video(
    bot: &Bot,
    chat_id: ChatId,
    file: &Path,
    fetched: &Fetched,
    caption: &str,
) -> Result<Message, teloxide::RequestError> {
    let attempt = || async {
        let mut req = bot
            .send_video(chat_id, InputFile::file(file.to_path_buf()))
            .caption(caption)
            .parse_mode(ParseMode::MarkdownV2)
            .supports_streaming(true);
        if let Some(duration) = fetched.facts.duration_secs {
            req = req.duration(duration);
        }
        if let Some(width) = fetched.facts.width {
            req = req.width(width);
        }
        if let Some(height) = fetched.facts.height {
            req = req.height(height);
        }
        if let Some(thumb) = &fetched.thumbnail {
            req = req.thumbnail(InputFile::file(thumb.clone()));
        }
        req.await
    };

    match attempt().await {
        Err(e) if flood_pause(&e).await => attempt().await,
        other => other,
    }
}

async fn send_audio(
    bot: &Bot,
    chat_id: ChatId,
    file: &Path,
    fetched: &Fetched,
    caption: &str,
) -> Result<Message, teloxide::RequestError> {
    let attempt = || async {
        let mut req = bot
            .send_audio(chat_id, InputFile::file(file.to_path_buf()))
            .caption(caption)
            .parse_mode(ParseMode::MarkdownV2);
        if let Some(duration) = fetched.facts.duration_secs {
            req = req.duration(duration);
        }
        if let Some(uploader) = &fetched.uploader {
            req = req.performer(uploader);
        }
        req.await
    };

    match attempt().await {
        Err(e) if flood_pause(&e).await => attempt().await,
        other => other,
    }
}

async fn send_document(
    bot: &Bot,
    chat_id: ChatId,
    file: &Path,
    caption: &str,
) -> Result<Message, teloxide::RequestError> {
    let attempt = || async {
        bot.send_document(chat_id, InputFile::file(file.to_path_buf()))
            .caption(caption)
            .parse_mode(ParseMode::MarkdownV2)
            .await
    };

    match attempt().await {
        Err(e) if flood_pause(&e).await => attempt().await,
        other => other,
    }
}

async fn send_animation(
    bot: &Bot,
    chat_id: ChatId,
    file: &Path,
    caption: &str,
) -> Result<Message, teloxide::RequestError> {
    let attempt = || async {
        bot.send_animation(chat_id, InputFile::file(file.to_path_buf()))
            .caption(caption)
            .parse_mode(ParseMode::MarkdownV2)
            .await
    };

    match attempt().await {
        Err(e) if flood_pause(&e).await => attempt().await,
        other => other,
    }
}

async fn send_photo(
    bot: &Bot,
    chat_id: ChatId,
    file: &Path,
    caption: &str,
) -> Result<Message, teloxide::RequestError> {
    let attempt = || async {
        bot.send_photo(chat_id, InputFile::file(file.to_path_buf()))
            .caption(caption)
            .parse_mode(ParseMode::MarkdownV2)
            .await
    };

    match attempt().await {
        Err(e) if flood_pause(&e).await => attempt().await,
        other => other,
    }
}

/// Pulls the platform file id out of whatever media the message carries.
fn extract_file_id(message: &Message) -> Option<String> {
    message
        .video()
        .map(|v| v.file.id.0.clone())
        .or_else(|| message.audio().map(|a| a.file.id.0.clone()))
        .or_else(|| message.document().map(|d| d.file.id.0.clone()))
        .or_else(|| message.animation().map(|a| a.file.id.0.clone()))
        .or_else(|| message.photo().and_then(|sizes| sizes.last()).map(|p| p.file.id.0.clone()))
}

/// Copies the delivered message into the archive channel, when configured.
async fn forward_to_archive(bot: &Bot, chat_id: ChatId, message: &Message) {
    if let Some(channel) = *config::ARCHIVE_CHANNEL {
        if let Err(e) = bot.forward_message(ChatId(channel), chat_id, message.id).await {
            log::warn!("Archive forward to {} failed: {}", channel, e);
        }
    }
}
