//! Bot construction and the public command list.

use reqwest::ClientBuilder;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;

use crate::core::config;

/// Bot commands enum with descriptions
#[derive(BotCommands, Clone, Debug)]
#[command(rename_rule = "lowercase", description = "I can:")]
pub enum Command {
    #[command(description = "show the welcome message and your quota")]
    Start,
    #[command(description = "how to use the bot")]
    Help,
    #[command(description = "version and build info")]
    About,
    #[command(description = "quality, delivery and mode settings")]
    Settings,
    #[command(description = "buy download tokens with Telegram Stars")]
    Buy(String),
    #[command(description = "redeem an external payment: /redeem <payment_id>")]
    Redeem(String),
    #[command(description = "watch a channel for new uploads: /sub <link>")]
    Sub(String),
    #[command(description = "stop watching a channel: /unsub <id>")]
    Unsub(String),
    #[command(description = "fetch a direct file link, skipping the extractor")]
    Direct(String),
    #[command(description = "force the yt-dlp backend for one link")]
    Ytdl(String),
    #[command(description = "your quota, recent downloads and totals")]
    Stats,
}

/// Creates a Bot instance against the standard or a local Bot API server.
///
/// `BOT_API_URL` points the bot at a local server, which raises the upload
/// limit from 50 MB to 2 GB. The HTTP client gets a long timeout because a
/// single send_video call can stream a whole movie.
pub fn create_bot() -> anyhow::Result<Bot> {
    let token = config::BOT_TOKEN.clone();
    if token.is_empty() {
        return Err(anyhow::anyhow!("BOT_TOKEN environment variable not set"));
    }

    let client = ClientBuilder::new().timeout(config::network::timeout()).build()?;

    let bot = match config::validation::BOT_API_URL.as_deref() {
        Some(api_url) => {
            log::info!("Using custom Bot API URL: {}", api_url);
            let url = url::Url::parse(api_url).map_err(|e| anyhow::anyhow!("Invalid BOT_API_URL: {}", e))?;
            Bot::with_client(token, client).set_api_url(url)
        }
        None => Bot::with_client(token, client),
    };

    Ok(bot)
}

/// Advertises the command list in the Telegram UI.
///
/// Admin commands (/uncache, /ping) are deliberately left out; they parse
/// from raw text so they stay invisible to regular users.
pub async fn setup_bot_commands(bot: &Bot) -> Result<(), teloxide::RequestError> {
    bot.set_my_commands(Command::bot_commands()).await?;
    Ok(())
}
