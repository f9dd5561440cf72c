//! Channel subscriptions.
//!
//! `/sub <channel url>` records a channel; a background poller asks yt-dlp
//! for the newest entry of each subscribed channel and, when the id moves,
//! enqueues a download for every subscriber. One flat-playlist probe per
//! channel per sweep, never one per subscriber.

use std::process::Stdio;

use serde::Deserialize;
use teloxide::prelude::*;
use teloxide::types::Message;
use tokio::process::Command;
use tokio::time::interval;

use crate::core::config;
use crate::core::error::{AppError, AppResult};
use crate::download::error::DownloadError;
use crate::download::link::validate_url;
use crate::download::orchestrator::DownloadSettings;
use crate::download::queue::{DownloadTask, EnqueueOutcome};
use crate::storage::db::{self, Channel};
use crate::storage::get_connection;
use crate::telegram::handlers::{fetch_user, HandlerDeps, HandlerError};

/// The newest entry of a channel's upload feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LatestVideo {
    pub video_id: String,
    pub url: String,
    pub title: Option<String>,
}

/// What one feed probe learns about a channel.
#[derive(Debug)]
pub struct ChannelFeed {
    pub channel_id: String,
    pub channel_title: Option<String>,
    pub latest: Option<LatestVideo>,
}

#[derive(Debug, Deserialize)]
struct FeedDump {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    channel_id: Option<String>,
    #[serde(default)]
    playlist_id: Option<String>,
    #[serde(default)]
    uploader_id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    entries: Vec<FeedEntry>,
}

#[derive(Debug, Deserialize)]
struct FeedEntry {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    title: Option<String>,
}

/// Probes a channel URL with a single flat-playlist dump limited to the
/// newest entry.
pub async fn fetch_channel_feed(channel_url: &str) -> AppResult<ChannelFeed> {
    let output = tokio::time::timeout(
        config::download::probe_timeout(),
        Command::new(&*config::YTDL_BIN)
            .args(["--dump-single-json", "--flat-playlist", "--playlist-items", "1", channel_url])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output(),
    )
    .await
    .map_err(|_| AppError::Download(DownloadError::timeout(format!("feed probe of {} timed out", channel_url))))??;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = stderr.lines().last().unwrap_or("yt-dlp feed probe failed").to_string();
        return Err(AppError::Download(DownloadError::unknown(detail)));
    }

    let dump: FeedDump = serde_json::from_slice(&output.stdout)
        .map_err(|e| AppError::Validation(format!("unparseable feed for {}: {}", channel_url, e)))?;
    feed_from_dump(dump, channel_url)
}

fn feed_from_dump(dump: FeedDump, channel_url: &str) -> AppResult<ChannelFeed> {
    // Different extractors put the stable channel key in different fields
    let channel_id = dump
        .channel_id
        .or(dump.playlist_id)
        .or(dump.uploader_id)
        .or(dump.id)
        .ok_or_else(|| AppError::Validation(format!("no channel id in feed for {}", channel_url)))?;

    let latest = dump.entries.into_iter().next().and_then(|entry| {
        Some(LatestVideo { video_id: entry.id?, url: entry.url?, title: entry.title })
    });

    Ok(ChannelFeed { channel_id, channel_title: dump.channel.or(dump.title), latest })
}

/// Subscribes the sender to a channel, confirming with the id `/unsub` takes.
pub async fn register_subscription(
    bot: &Bot,
    msg: &Message,
    deps: &HandlerDeps,
    arg: &str,
) -> Result<(), HandlerError> {
    let url = match validate_url(arg) {
        Ok(url) => url,
        Err(_) => {
            bot.send_message(msg.chat.id, "That does not look like a channel URL.").await?;
            return Ok(());
        }
    };

    let probing = bot.send_message(msg.chat.id, "Checking the channel…").await?;
    let feed = match fetch_channel_feed(url.as_str()).await {
        Ok(feed) => feed,
        Err(e) => {
            log::warn!("Feed probe failed for {}: {}", url, e);
            bot.edit_message_text(
                msg.chat.id,
                probing.id,
                "I could not read that channel's uploads. Is it really a channel or playlist URL?",
            )
            .await?;
            return Ok(());
        }
    };

    let user = fetch_user(deps, msg)?;
    let conn = get_connection(&deps.db_pool)?;
    let row_id = db::upsert_channel(&conn, url.as_str(), &feed.channel_id, feed.channel_title.as_deref())?;
    let added = db::subscribe(&conn, user.chat_id, row_id)?;

    // Track from the current head so only uploads after this point notify
    if let Some(latest) = &feed.latest {
        db::set_channel_last_video(&conn, row_id, &latest.video_id)?;
    }

    let name = feed.channel_title.as_deref().unwrap_or(url.as_str());
    let text = if added {
        format!("🔔 Subscribed to {}. New uploads arrive automatically; /unsub {} stops them.", name, row_id)
    } else {
        format!("You are already subscribed to {} (id {}).", name, row_id)
    };
    bot.edit_message_text(msg.chat.id, probing.id, text).await?;
    Ok(())
}

/// Background sweep over all subscribed channels.
pub async fn poll_subscriptions(bot: Bot, deps: HandlerDeps) {
    let mut timer = interval(config::subscription::check_interval());
    // interval fires immediately; skip that so boot stays quiet
    timer.tick().await;

    loop {
        timer.tick().await;
        if let Err(e) = poll_once(&bot, &deps).await {
            log::error!("Subscription sweep failed: {}", e);
        }
    }
}

async fn poll_once(bot: &Bot, deps: &HandlerDeps) -> AppResult<()> {
    let channels = {
        let conn = get_connection(&deps.db_pool)?;
        db::channels_with_subscribers(&conn)?
    };
    log::debug!("Sweeping {} subscribed channel(s)", channels.len());

    for channel in channels {
        let feed = match fetch_channel_feed(&channel.channel_url).await {
            Ok(feed) => feed,
            Err(e) => {
                log::warn!("Feed poll failed for {}: {}", channel.channel_url, e);
                continue;
            }
        };
        let Some(latest) = feed.latest else { continue };
        if channel.last_video_id.as_deref() == Some(latest.video_id.as_str()) {
            continue;
        }

        log::info!("Channel {} has a new upload: {}", channel.channel_url, latest.video_id);
        let subscribers = {
            let conn = get_connection(&deps.db_pool)?;
            db::set_channel_last_video(&conn, channel.id, &latest.video_id)?;
            db::channel_subscribers(&conn, channel.id)?
        };

        for chat_id in subscribers {
            notify_subscriber(bot, deps, chat_id, &channel, &latest).await;
        }
    }
    Ok(())
}

/// Announces the upload and enqueues it with the subscriber's own settings.
/// Subscription downloads always go through the queue; fanning a popular
/// channel out as inline spawns would stampede the host.
async fn notify_subscriber(
    bot: &Bot,
    deps: &HandlerDeps,
    chat_id: i64,
    channel: &Channel,
    latest: &LatestVideo,
) {
    let result: AppResult<()> = async {
        let url = validate_url(&latest.url)?;
        let (settings, plan) = {
            let conn = get_connection(&deps.db_pool)?;
            db::ensure_user(&conn, chat_id, None)?;
            let user = db::get_user(&conn, chat_id)?
                .ok_or_else(|| AppError::Validation(format!("subscriber {} has no user row", chat_id)))?;
            (DownloadSettings::from_user(&user), user.plan.clone())
        };

        let name = channel.title.as_deref().unwrap_or(&channel.channel_url);
        let what = latest.title.as_deref().unwrap_or(&latest.url);
        let ack = bot
            .send_message(ChatId(chat_id), format!("🔔 New on {}: {}\nFetching it for you…", name, what))
            .await?;

        let task = DownloadTask::new(ChatId(chat_id), ack.id, url, settings, &plan)
            .with_status_message(ack.id);
        match deps.queue.add_task(task).await {
            EnqueueOutcome::Queued { .. } => {}
            EnqueueOutcome::Duplicate => {
                log::info!("Subscriber {} already has {} queued", chat_id, latest.url);
            }
            EnqueueOutcome::Full => {
                bot.send_message(
                    ChatId(chat_id),
                    format!("The queue is full, so this one was skipped. You can send {} yourself later.", latest.url),
                )
                .await?;
            }
        }
        Ok(())
    }
    .await;

    if let Err(e) = result {
        log::warn!("Could not notify subscriber {} about {}: {}", chat_id, latest.url, e);
    }
}
