//! Inline keyboard callbacks for the settings panel.

use teloxide::prelude::*;
use teloxide::types::CallbackQuery;

use super::types::{HandlerDeps, HandlerError};
use crate::storage::db;
use crate::storage::get_connection;
use crate::telegram::keyboard::{settings_keyboard, CallbackAction};

/// Applies a settings button press, refreshes the keyboard in place and
/// answers with a short toast.
pub(super) async fn handle_callback_query(
    bot: &Bot,
    q: &CallbackQuery,
    deps: &HandlerDeps,
) -> Result<(), HandlerError> {
    let callback_id = q.id.clone();
    let Some(action) = q.data.as_deref().and_then(CallbackAction::parse) else {
        // A button from an older keyboard layout; nothing to do but ack it
        bot.answer_callback_query(callback_id).await?;
        return Ok(());
    };

    let chat_id = q.message.as_ref().map(|m| m.chat().id);
    let message_id = q.message.as_ref().map(|m| m.id());
    let (Some(chat_id), Some(message_id)) = (chat_id, message_id) else {
        bot.answer_callback_query(callback_id).await?;
        return Ok(());
    };

    if action == CallbackAction::Close {
        bot.answer_callback_query(callback_id).await?;
        bot.delete_message(chat_id, message_id).await?;
        return Ok(());
    }

    // Settings belong to the user who pressed the button, not to the chat
    // the panel happens to live in.
    let user_id = q.from.id.0 as i64;
    let conn = get_connection(&deps.db_pool)?;
    db::ensure_user(&conn, user_id, q.from.username.as_deref())?;

    let toast = match action {
        CallbackAction::SetQuality(quality) => {
            db::set_user_quality(&conn, user_id, &quality.to_string())?;
            format!("Quality: {}", quality)
        }
        CallbackAction::SetHeight(height) => {
            db::set_user_custom_height(&conn, user_id, height)?;
            format!("Quality: up to {}p", height)
        }
        CallbackAction::SetSendAs(send_as) => {
            db::set_user_send_as(&conn, user_id, &send_as.to_string())?;
            format!("Deliver as: {}", send_as)
        }
        CallbackAction::SetMode(mode) => {
            db::set_user_mode(&conn, user_id, &mode.to_string())?;
            format!("Mode: {}", mode)
        }
        CallbackAction::ToggleHistory => {
            let user = db::get_user(&conn, user_id)?
                .ok_or("user row missing right after ensure_user")?;
            let enabled = !user.history_enabled();
            db::set_user_history_enabled(&conn, user_id, enabled)?;
            if enabled { "History: on".to_string() } else { "History: off".to_string() }
        }
        // Handled above
        CallbackAction::Close => return Ok(()),
    };

    let user =
        db::get_user(&conn, user_id)?.ok_or("user row missing right after ensure_user")?;

    // Pressing an already-active button leaves the markup unchanged, which
    // Telegram reports as an error; not worth surfacing.
    if let Err(e) = bot
        .edit_message_reply_markup(chat_id, message_id)
        .reply_markup(settings_keyboard(&user))
        .await
    {
        if !e.to_string().contains("message is not modified") {
            return Err(e.into());
        }
    }

    bot.answer_callback_query(callback_id).text(toast).await?;
    Ok(())
}
