//! The link-to-delivery request flow.
//!
//! Order matters here: gates run before anything costs us work, the token
//! is charged before the cache lookup (a hit still costs one), and only a
//! cache miss reaches the queue or spawns a local pipeline.

use std::str::FromStr;

use chrono::{TimeZone, Utc};
use teloxide::prelude::*;
use teloxide::types::{ChatMemberKind, Message, Recipient};

use super::types::{fetch_user, HandlerDeps, HandlerError};
use crate::core::{config, metrics};
use crate::download::formats::DownloadMode;
use crate::download::link::{self, validate_url};
use crate::download::orchestrator::DownloadSettings;
use crate::download::progress::{DownloadStatus, StatusMessage};
use crate::download::queue::{DownloadTask, EnqueueOutcome};
use crate::payment::ledger::SpendOutcome;
use crate::storage::cache::fingerprint;
use crate::storage::db;
use crate::storage::get_connection;
use crate::telegram::worker;

/// Entry point for plain text messages (anything that is not a command).
pub(super) async fn handle_text_message(bot: &Bot, msg: &Message, deps: &HandlerDeps) -> Result<(), HandlerError> {
    let Some(text) = msg.text() else { return Ok(()) };
    process_request(bot, msg, deps, text, None).await
}

/// Runs the full acceptance flow for one link.
///
/// `forced_source` pins the request to a named backend; `/direct` and
/// `/ytdl` use it for a single message without touching stored settings.
pub(super) async fn process_request(
    bot: &Bot,
    msg: &Message,
    deps: &HandlerDeps,
    text: &str,
    forced_source: Option<&str>,
) -> Result<(), HandlerError> {
    let chat_id = msg.chat.id;

    if !is_authorized(msg) {
        log::info!("Refusing unauthorized chat {}", chat_id);
        bot.send_message(chat_id, "This bot is invite-only.").await?;
        return Ok(());
    }

    let url = match validate_url(text.trim()) {
        Ok(url) => url,
        Err(e) => {
            log::debug!("Not a downloadable link from chat {}: {}", chat_id, e);
            bot.send_message(chat_id, "Send me a video or audio link and I will fetch it. /help explains the details.")
                .await?;
            return Ok(());
        }
    };

    if let Some(channel) = config::REQUIRED_MEMBERSHIP.as_deref() {
        if !is_channel_member(bot, channel, msg).await {
            bot.send_message(chat_id, format!("Join {} first, then send the link again.", channel)).await?;
            return Ok(());
        }
    }

    let user = fetch_user(deps, msg)?;

    if link::is_playlist(&url) {
        bot.send_message(chat_id, "Playlists and live manifests are not supported. Send a link to a single video.")
            .await?;
        return Ok(());
    }

    // The canonical form keys the cache; the fetch itself uses the URL as
    // sent, redirects and all.
    let canonical = deps.resolver.resolve(&url).await;
    let settings = DownloadSettings::from_user(&user);
    let print = fingerprint(&canonical, &settings.quality.to_string(), &settings.send_as.to_string());

    // One token per accepted request, cache hits included.
    match deps.ledger.consume(user.chat_id)? {
        SpendOutcome::Exhausted { resets_at } => {
            metrics::record_quota_rejection();
            bot.send_message(
                chat_id,
                format!(
                    "You are out of downloads for now. Free quota refills at {}; /buy adds tokens right away.",
                    format_reset_time(resets_at)
                ),
            )
            .await?;
            return Ok(());
        }
        SpendOutcome::Free { remaining } => {
            log::info!("Chat {} spent a free token ({} left)", chat_id, remaining);
        }
        SpendOutcome::Paid { remaining } => {
            log::info!("Chat {} spent a paid token ({} left)", chat_id, remaining);
        }
    }

    if let Some(entry) = deps.cache.lookup(&print)? {
        metrics::record_cache_hit();
        log::info!("Cache hit for {} in chat {}", canonical, chat_id);
        deps.dispatcher.deliver_cached(bot, chat_id, &entry).await?;
        if user.history_enabled() {
            if let Ok(conn) = get_connection(&deps.db_pool) {
                if let Err(e) = db::save_download_history(&conn, chat_id.0, &canonical, &canonical, &entry.kind) {
                    log::warn!("History write failed for cached delivery: {}", e);
                }
            }
        }
        return Ok(());
    }
    metrics::record_cache_miss();

    let ack = bot.send_message(chat_id, "⏳ Accepted, preparing…").await?;

    let mut task =
        DownloadTask::new(chat_id, msg.id, url, settings, &user.plan).with_status_message(ack.id);
    if let Some(name) = forced_source {
        task = task.with_source(name);
    }

    match DownloadMode::from_str(&user.mode).unwrap_or(DownloadMode::Local) {
        DownloadMode::Local => {
            let bot = bot.clone();
            let deps = deps.clone();
            tokio::spawn(async move {
                worker::run_download_task(&bot, &deps, task).await;
            });
        }
        DownloadMode::Queued => match deps.queue.add_task(task).await {
            EnqueueOutcome::Queued { position } => {
                let mut status = StatusMessage::attached(chat_id, ack.id);
                let _ = status.update(bot, &DownloadStatus::Queued { position }).await;
            }
            EnqueueOutcome::Duplicate => {
                bot.edit_message_text(chat_id, ack.id, "That link is already queued; wait for it to finish.")
                    .await?;
            }
            EnqueueOutcome::Full => {
                bot.edit_message_text(chat_id, ack.id, "The queue is full right now. Try again in a few minutes.")
                    .await?;
            }
        },
    }

    Ok(())
}

/// Allow-list gate. An empty AUTHORIZED_USERS list means everyone.
fn is_authorized(msg: &Message) -> bool {
    let allowed = &*config::admin::AUTHORIZED_USERS;
    if allowed.is_empty() {
        return true;
    }
    let sender = msg.from.as_ref().map(|u| u.id.0 as i64).unwrap_or(msg.chat.id.0);
    allowed.contains(&sender) || allowed.contains(&msg.chat.id.0)
}

/// Required-channel gate. Fails closed on API errors other than a missing
/// sender, so a misconfigured channel name shows up in the logs fast.
async fn is_channel_member(bot: &Bot, channel: &str, msg: &Message) -> bool {
    let Some(user_id) = msg.from.as_ref().map(|u| u.id) else {
        return false;
    };
    match bot.get_chat_member(membership_recipient(channel), user_id).await {
        Ok(member) => !matches!(member.kind, ChatMemberKind::Left | ChatMemberKind::Banned(_)),
        Err(e) => {
            log::warn!("Membership check against {} failed: {}", channel, e);
            false
        }
    }
}

/// REQUIRED_MEMBERSHIP accepts "@channelname" or a raw chat id.
fn membership_recipient(raw: &str) -> Recipient {
    if let Ok(id) = raw.parse::<i64>() {
        return Recipient::Id(ChatId(id));
    }
    let name = if raw.starts_with('@') { raw.to_string() } else { format!("@{}", raw) };
    Recipient::ChannelUsername(name)
}

pub(super) fn format_reset_time(resets_at: i64) -> String {
    Utc.timestamp_opt(resets_at, 0)
        .single()
        .map(|t| t.format("%H:%M UTC").to_string())
        .unwrap_or_else(|| "midnight UTC".to_string())
}
