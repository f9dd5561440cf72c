//! Dispatcher schema and handler chain builders

use teloxide::dispatching::{UpdateFilterExt, UpdateHandler};
use teloxide::prelude::*;
use teloxide::types::{Message, PreCheckoutQuery};

use super::callbacks::handle_callback_query;
use super::commands::{
    handle_about_command, handle_buy_command, handle_direct_command, handle_help_command,
    handle_ping_command, handle_redeem_command, handle_settings_command, handle_start_command,
    handle_stats_command, handle_sub_command, handle_uncache_command, handle_unsub_command,
    handle_ytdl_command,
};
use super::messages::handle_text_message;
use super::payments::{handle_pre_checkout, handle_successful_payment};
use super::types::{HandlerDeps, HandlerError};
use crate::telegram::bot::Command;

/// Builds the handler tree for the dispatcher.
///
/// The same schema serves production and integration tests. Branch order
/// matters for message updates: payments and hidden commands are checked
/// before the command parser, and the plain-text handler catches whatever
/// remains.
pub fn schema(deps: HandlerDeps) -> UpdateHandler<HandlerError> {
    let deps_payment = deps.clone();
    let deps_uncache = deps.clone();
    let deps_ping = deps.clone();
    let deps_commands = deps.clone();
    let deps_messages = deps.clone();
    let deps_callback = deps;

    dptree::entry()
        // Successful payment messages must be credited before anything else
        // gets a chance to swallow them
        .branch(successful_payment_handler(deps_payment))
        // Hidden admin commands (not in the Command enum)
        .branch(uncache_handler(deps_uncache))
        .branch(ping_handler(deps_ping))
        // Public commands
        .branch(command_handler(deps_commands))
        // Plain text, i.e. links
        .branch(message_handler(deps_messages))
        .branch(pre_checkout_handler())
        .branch(callback_handler(deps_callback))
}

fn successful_payment_handler(deps: HandlerDeps) -> UpdateHandler<HandlerError> {
    Update::filter_message()
        .filter(|msg: Message| msg.successful_payment().is_some())
        .endpoint(move |bot: Bot, msg: Message| {
            let deps = deps.clone();
            async move { handle_successful_payment(&bot, &msg, &deps).await }
        })
}

fn uncache_handler(deps: HandlerDeps) -> UpdateHandler<HandlerError> {
    Update::filter_message()
        .filter(|msg: Message| msg.text().map(|text| text.starts_with("/uncache")).unwrap_or(false))
        .endpoint(move |bot: Bot, msg: Message| {
            let deps = deps.clone();
            async move {
                if let Err(e) = handle_uncache_command(&bot, &msg, &deps).await {
                    log::error!("/uncache failed for chat {}: {}", msg.chat.id, e);
                }
                Ok(())
            }
        })
}

fn ping_handler(deps: HandlerDeps) -> UpdateHandler<HandlerError> {
    Update::filter_message()
        .filter(|msg: Message| msg.text().map(|text| text.starts_with("/ping")).unwrap_or(false))
        .endpoint(move |bot: Bot, msg: Message| {
            let deps = deps.clone();
            async move {
                if let Err(e) = handle_ping_command(&bot, &msg, &deps).await {
                    log::error!("/ping failed for chat {}: {}", msg.chat.id, e);
                }
                Ok(())
            }
        })
}

fn command_handler(deps: HandlerDeps) -> UpdateHandler<HandlerError> {
    Update::filter_message().branch(dptree::entry().filter_command::<Command>().endpoint(
        move |bot: Bot, msg: Message, cmd: Command| {
            let deps = deps.clone();
            async move {
                log::info!("Received command {:?} from chat {}", cmd, msg.chat.id);

                match cmd {
                    Command::Start => handle_start_command(&bot, &msg, &deps).await?,
                    Command::Help => handle_help_command(&bot, &msg).await?,
                    Command::About => handle_about_command(&bot, &msg).await?,
                    Command::Settings => handle_settings_command(&bot, &msg, &deps).await?,
                    Command::Buy(arg) => handle_buy_command(&bot, &msg, &arg).await?,
                    Command::Redeem(arg) => handle_redeem_command(&bot, &msg, &deps, &arg).await?,
                    Command::Sub(arg) => handle_sub_command(&bot, &msg, &deps, &arg).await?,
                    Command::Unsub(arg) => handle_unsub_command(&bot, &msg, &deps, &arg).await?,
                    Command::Direct(arg) => handle_direct_command(&bot, &msg, &deps, &arg).await?,
                    Command::Ytdl(arg) => handle_ytdl_command(&bot, &msg, &deps, &arg).await?,
                    Command::Stats => handle_stats_command(&bot, &msg, &deps).await?,
                }
                Ok(())
            }
        },
    ))
}

fn message_handler(deps: HandlerDeps) -> UpdateHandler<HandlerError> {
    Update::filter_message()
        .filter(|msg: Message| msg.text().is_some())
        .endpoint(move |bot: Bot, msg: Message| {
            let deps = deps.clone();
            async move {
                if let Err(e) = handle_text_message(&bot, &msg, &deps).await {
                    log::error!("Error handling message from chat {}: {}", msg.chat.id, e);
                }
                Ok(())
            }
        })
}

fn pre_checkout_handler() -> UpdateHandler<HandlerError> {
    Update::filter_pre_checkout_query().endpoint(|bot: Bot, query: PreCheckoutQuery| async move {
        handle_pre_checkout(&bot, &query).await
    })
}

fn callback_handler(deps: HandlerDeps) -> UpdateHandler<HandlerError> {
    Update::filter_callback_query().endpoint(move |bot: Bot, q: CallbackQuery| {
        let deps = deps.clone();
        async move { handle_callback_query(&bot, &q, &deps).await }
    })
}
