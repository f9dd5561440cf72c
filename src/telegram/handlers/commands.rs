//! Endpoints for the public `/commands` and the hidden admin ones.

use indoc::indoc;
use teloxide::prelude::*;
use teloxide::types::{LabeledPrice, Message};

use super::messages::{format_reset_time, process_request};
use super::types::{fetch_user, HandlerDeps, HandlerError};
use crate::core::utils::{sizeof_fmt, timeof_fmt};
use crate::core::{config, metrics, utils};
use crate::download::{link, ytdlp};
use crate::payment::ledger::RedeemOutcome;
use crate::payment::provider::PaymentProvider;
use crate::storage::db;
use crate::storage::get_connection;
use crate::telegram::keyboard::settings_keyboard;
use crate::telegram::subscriptions;

pub(super) async fn handle_start_command(
    bot: &Bot,
    msg: &Message,
    deps: &HandlerDeps,
) -> Result<(), HandlerError> {
    let user = fetch_user(deps, msg)?;
    let status = deps.ledger.status(user.chat_id)?;

    let text = format!(
        indoc! {"
            Hi! Send me a link and I will fetch the media behind it.

            Video, audio or a plain file, from YouTube and most other sites.
            You get {} free downloads per day; /buy adds tokens on top.

            /settings picks quality and format, /help lists everything.
        "},
        status.free_ceiling
    );
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

pub(super) async fn handle_help_command(bot: &Bot, msg: &Message) -> Result<(), HandlerError> {
    let text = indoc! {"
        Send a link and I download it. Everything else:

        /settings — quality, video/audio/file, instant or queued
        /stats — your quota, token balance and recent downloads
        /buy [packs] — buy download tokens with Telegram Stars
        /redeem <order> — redeem an externally paid order
        /sub <channel url> — get new uploads of a channel automatically
        /unsub <id> — stop that; bare /unsub lists your subscriptions
        /direct <url> — fetch a plain file without the extractor
        /ytdl <url> — force the extractor even for a plain file
        /about — version information

        Playlist links are not supported; send individual videos.
    "};
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

pub(super) async fn handle_about_command(bot: &Bot, msg: &Message) -> Result<(), HandlerError> {
    let ytdlp_version = match ytdlp::current_version().await {
        Ok(v) => v,
        Err(e) => {
            log::warn!("Could not read yt-dlp version: {}", e);
            "unavailable".to_string()
        }
    };
    let text = format!(
        "tubegrab v{}\nyt-dlp {}\nBackends: yt-dlp, direct http",
        env!("CARGO_PKG_VERSION"),
        ytdlp_version
    );
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

pub(super) async fn handle_settings_command(
    bot: &Bot,
    msg: &Message,
    deps: &HandlerDeps,
) -> Result<(), HandlerError> {
    let user = fetch_user(deps, msg)?;
    bot.send_message(msg.chat.id, "How should downloads arrive?")
        .reply_markup(settings_keyboard(&user))
        .await?;
    Ok(())
}

/// Sends a Telegram Stars invoice. The argument is a pack count, default 1.
pub(super) async fn handle_buy_command(
    bot: &Bot,
    msg: &Message,
    arg: &str,
) -> Result<(), HandlerError> {
    let packs = arg.trim().parse::<u32>().unwrap_or(1).clamp(1, 10);
    let tokens = i64::from(packs) * *config::payment::TOKEN_PACK_SIZE;
    let stars = packs * *config::payment::TOKEN_PACK_STARS;

    let title = format!("{} download tokens", tokens);
    let description = format!(
        "Adds {} downloads to your balance. Paid tokens never expire.",
        tokens
    );
    let payload = format!("tokens:{}", tokens);
    let prices = vec![LabeledPrice { label: title.clone(), amount: stars }];

    bot.send_invoice(msg.chat.id, title, description, payload, "XTR".to_string(), prices)
        .await?;
    Ok(())
}

/// Verifies an externally paid order and credits its tokens once.
pub(super) async fn handle_redeem_command(
    bot: &Bot,
    msg: &Message,
    deps: &HandlerDeps,
    arg: &str,
) -> Result<(), HandlerError> {
    let order = arg.trim();
    if order.is_empty() {
        bot.send_message(msg.chat.id, "Usage: /redeem <order id>").await?;
        return Ok(());
    }
    let Some(provider) = deps.provider.as_ref() else {
        bot.send_message(msg.chat.id, "External payments are not set up on this bot. Use /buy instead.")
            .await?;
        return Ok(());
    };

    let user = fetch_user(deps, msg)?;
    let receipt = match provider.verify(order).await {
        Ok(receipt) => receipt,
        Err(e) => {
            metrics::record_payment_failure("verify");
            log::warn!("Verification of order {} failed: {}", order, e);
            bot.send_message(
                msg.chat.id,
                "I could not verify that order. Check the id, or try again in a minute.",
            )
            .await?;
            return Ok(());
        }
    };

    match deps.ledger.redeem(user.chat_id, &receipt)? {
        RedeemOutcome::Credited { tokens, paid_balance } => {
            metrics::record_payment_success(provider.name(), 0);
            bot.send_message(
                msg.chat.id,
                format!("✅ Order confirmed: +{} tokens. You now have {} paid tokens.", tokens, paid_balance),
            )
            .await?;
        }
        RedeemOutcome::AlreadyRedeemed => {
            bot.send_message(msg.chat.id, "That order has already been redeemed.").await?;
        }
    }
    Ok(())
}

pub(super) async fn handle_sub_command(
    bot: &Bot,
    msg: &Message,
    deps: &HandlerDeps,
    arg: &str,
) -> Result<(), HandlerError> {
    if arg.trim().is_empty() {
        bot.send_message(msg.chat.id, "Usage: /sub <channel url>").await?;
        return Ok(());
    }
    subscriptions::register_subscription(bot, msg, deps, arg.trim()).await
}

/// Bare `/unsub` lists subscriptions; `/unsub <id>` removes one.
pub(super) async fn handle_unsub_command(
    bot: &Bot,
    msg: &Message,
    deps: &HandlerDeps,
    arg: &str,
) -> Result<(), HandlerError> {
    let user = fetch_user(deps, msg)?;
    let conn = get_connection(&deps.db_pool)?;

    let arg = arg.trim();
    if arg.is_empty() {
        let subs = db::user_subscriptions(&conn, user.chat_id)?;
        if subs.is_empty() {
            bot.send_message(msg.chat.id, "You have no channel subscriptions. Add one with /sub <url>.")
                .await?;
            return Ok(());
        }
        let mut lines = vec!["Your subscriptions (unsubscribe with /unsub <id>):".to_string()];
        for channel in subs {
            let title = channel.title.unwrap_or_else(|| channel.channel_url.clone());
            lines.push(format!("{} — {}", channel.id, title));
        }
        bot.send_message(msg.chat.id, lines.join("\n")).await?;
        return Ok(());
    }

    let Ok(channel_row_id) = arg.parse::<i64>() else {
        bot.send_message(msg.chat.id, "That is not a subscription id. Bare /unsub shows the list.")
            .await?;
        return Ok(());
    };

    if db::unsubscribe(&conn, user.chat_id, channel_row_id)? {
        bot.send_message(msg.chat.id, "Unsubscribed. No more automatic downloads from that channel.")
            .await?;
    } else {
        bot.send_message(msg.chat.id, "You were not subscribed to that id.").await?;
    }
    Ok(())
}

/// `/direct` skips the extractor and fetches the URL as a plain file.
pub(super) async fn handle_direct_command(
    bot: &Bot,
    msg: &Message,
    deps: &HandlerDeps,
    arg: &str,
) -> Result<(), HandlerError> {
    if arg.trim().is_empty() {
        bot.send_message(msg.chat.id, "Usage: /direct <url>").await?;
        return Ok(());
    }
    process_request(bot, msg, deps, arg.trim(), Some("http")).await
}

/// `/ytdl` forces the extractor even for links the sniffer would fetch plainly.
pub(super) async fn handle_ytdl_command(
    bot: &Bot,
    msg: &Message,
    deps: &HandlerDeps,
    arg: &str,
) -> Result<(), HandlerError> {
    if arg.trim().is_empty() {
        bot.send_message(msg.chat.id, "Usage: /ytdl <url>").await?;
        return Ok(());
    }
    process_request(bot, msg, deps, arg.trim(), Some("yt-dlp")).await
}

pub(super) async fn handle_stats_command(
    bot: &Bot,
    msg: &Message,
    deps: &HandlerDeps,
) -> Result<(), HandlerError> {
    let user = fetch_user(deps, msg)?;
    let status = deps.ledger.status(user.chat_id)?;
    let conn = get_connection(&deps.db_pool)?;
    let history = db::get_download_history(&conn, user.chat_id, Some(5))?;

    let mut lines = vec![
        "📊 Your stats".to_string(),
        String::new(),
        format!("Plan: {}", status.plan),
        format!(
            "Free downloads: {} of {} left, refill at {}",
            status.free_remaining,
            status.free_ceiling,
            format_reset_time(status.resets_at)
        ),
        format!("Paid tokens: {}", status.paid_balance),
    ];

    if let Some(position) = deps.queue.position_of(msg.chat.id).await {
        lines.push(format!("Waiting in queue: position {}", position));
    }

    if history.is_empty() {
        lines.push(String::new());
        lines.push("No downloads yet. Send me a link!".to_string());
    } else {
        lines.push(String::new());
        lines.push("Recent downloads:".to_string());
        for entry in history {
            lines.push(format!("• {} ({})", shorten(&entry.title, 60), entry.kind));
        }
    }

    let users = db::count_users(&conn)?;
    let cached = deps.cache.entry_count()?;
    lines.push(String::new());
    lines.push(format!(
        "Bot-wide: {} users, {} cached deliveries, {} tasks queued.",
        users,
        cached,
        deps.queue.size().await
    ));

    bot.send_message(msg.chat.id, lines.join("\n")).await?;
    Ok(())
}

/// Hidden `/ping`: liveness, uptime and resource numbers. Admins only.
pub(super) async fn handle_ping_command(
    bot: &Bot,
    msg: &Message,
    deps: &HandlerDeps,
) -> Result<(), HandlerError> {
    if !is_from_admin(msg) {
        bot.send_message(msg.chat.id, "This command is admin-only.").await?;
        return Ok(());
    }

    let uptime = timeof_fmt(deps.started_at.elapsed().as_secs());
    let disk = match utils::disk_free(&config::DOWNLOAD_FOLDER) {
        Some(bytes) => sizeof_fmt(bytes),
        None => "unknown".to_string(),
    };
    let text = format!(
        indoc! {"
            🏓 Pong
            Uptime: {}
            Queue: {} waiting, {} active
            Cache: {} deliveries
            Disk free: {}
            Cache hits/misses: {}/{}
        "},
        uptime,
        deps.queue.size().await,
        metrics::ACTIVE_DOWNLOADS.get() as i64,
        deps.cache.entry_count()?,
        disk,
        metrics::CACHE_HITS_TOTAL.get() as u64,
        metrics::CACHE_MISSES_TOTAL.get() as u64,
    );
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

/// Hidden `/uncache <url>`: drops cached deliveries so the next request
/// re-downloads. For when a cached file turns out broken. Admins only.
pub(super) async fn handle_uncache_command(
    bot: &Bot,
    msg: &Message,
    deps: &HandlerDeps,
) -> Result<(), HandlerError> {
    if !is_from_admin(msg) {
        bot.send_message(msg.chat.id, "This command is admin-only.").await?;
        return Ok(());
    }

    let arg = command_argument(msg.text().unwrap_or(""));
    let url = match link::validate_url(arg) {
        Ok(url) => url,
        Err(_) => {
            bot.send_message(msg.chat.id, "Usage: /uncache <url>").await?;
            return Ok(());
        }
    };

    let canonical = deps.resolver.resolve(&url).await;
    let dropped = deps.cache.remove_by_url(&canonical)?;
    bot.send_message(msg.chat.id, format!("Dropped {} cached delivery(ies) for that link.", dropped))
        .await?;
    Ok(())
}

fn is_from_admin(msg: &Message) -> bool {
    msg.from
        .as_ref()
        .map(|u| config::admin::is_admin(u.id.0 as i64))
        .unwrap_or(false)
}

/// Everything after the command token, trimmed.
pub(super) fn command_argument(text: &str) -> &str {
    text.split_once(char::is_whitespace).map(|(_, rest)| rest.trim()).unwrap_or("")
}

fn shorten(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let kept: String = text.chars().take(max_chars).collect();
    format!("{}…", kept)
}
