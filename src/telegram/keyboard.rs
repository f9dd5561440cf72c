//! Settings inline keyboard and the callback data it emits.

use std::str::FromStr;

use teloxide::types::{InlineKeyboardButton, InlineKeyboardMarkup};

use crate::download::formats::{DownloadMode, Quality, SendAs};
use crate::storage::db::User;

/// A parsed settings-keyboard button press.
///
/// The wire format is colon-separated and versionless: `set:quality:high`,
/// `set:height:1080`, `set:send_as:audio`, `set:mode:queued`,
/// `toggle:history`, `close`. Unknown data parses to `None` and is ignored,
/// which is what happens when a user taps a keyboard from an older build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    SetQuality(Quality),
    /// Custom height cap; switches quality to "custom" as a side effect
    SetHeight(i64),
    SetSendAs(SendAs),
    SetMode(DownloadMode),
    ToggleHistory,
    Close,
}

impl CallbackAction {
    pub fn encode(self) -> String {
        match self {
            CallbackAction::SetQuality(q) => format!("set:quality:{}", q),
            CallbackAction::SetHeight(h) => format!("set:height:{}", h),
            CallbackAction::SetSendAs(s) => format!("set:send_as:{}", s),
            CallbackAction::SetMode(m) => format!("set:mode:{}", m),
            CallbackAction::ToggleHistory => "toggle:history".to_string(),
            CallbackAction::Close => "close".to_string(),
        }
    }

    pub fn parse(data: &str) -> Option<Self> {
        let mut parts = data.splitn(3, ':');
        match (parts.next()?, parts.next(), parts.next()) {
            ("close", None, None) => Some(CallbackAction::Close),
            ("toggle", Some("history"), None) => Some(CallbackAction::ToggleHistory),
            ("set", Some("quality"), Some(v)) => Quality::from_str(v).ok().map(CallbackAction::SetQuality),
            ("set", Some("height"), Some(v)) => v.parse().ok().map(CallbackAction::SetHeight),
            ("set", Some("send_as"), Some(v)) => SendAs::from_str(v).ok().map(CallbackAction::SetSendAs),
            ("set", Some("mode"), Some(v)) => DownloadMode::from_str(v).ok().map(CallbackAction::SetMode),
            _ => None,
        }
    }
}

fn marked(label: &str, active: bool) -> String {
    if active { format!("{} ✓", label) } else { label.to_string() }
}

/// Builds the settings keyboard with the user's current choices checked.
pub fn settings_keyboard(user: &User) -> InlineKeyboardMarkup {
    let quality = user.quality.as_str();
    let send_as = user.send_as.as_str();
    let mode = user.mode.as_str();
    let custom = |h: i64| quality == "custom" && user.custom_height == Some(h);

    InlineKeyboardMarkup::new(vec![
        vec![
            InlineKeyboardButton::callback(
                marked("✨ Best", quality == "high"),
                CallbackAction::SetQuality(Quality::High).encode(),
            ),
            InlineKeyboardButton::callback(
                marked("720p", quality == "medium"),
                CallbackAction::SetQuality(Quality::Medium).encode(),
            ),
            InlineKeyboardButton::callback(
                marked("480p", quality == "low"),
                CallbackAction::SetQuality(Quality::Low).encode(),
            ),
        ],
        vec![
            InlineKeyboardButton::callback(marked("1080p", custom(1080)), CallbackAction::SetHeight(1080).encode()),
            InlineKeyboardButton::callback(marked("360p", custom(360)), CallbackAction::SetHeight(360).encode()),
            InlineKeyboardButton::callback(
                marked("🎧 Audio", quality == "audio"),
                CallbackAction::SetQuality(Quality::Audio).encode(),
            ),
        ],
        vec![
            InlineKeyboardButton::callback(
                marked("🎬 Video", send_as == "video"),
                CallbackAction::SetSendAs(SendAs::Video).encode(),
            ),
            InlineKeyboardButton::callback(
                marked("🎵 Audio", send_as == "audio"),
                CallbackAction::SetSendAs(SendAs::Audio).encode(),
            ),
            InlineKeyboardButton::callback(
                marked("📄 File", send_as == "document"),
                CallbackAction::SetSendAs(SendAs::Document).encode(),
            ),
        ],
        vec![
            InlineKeyboardButton::callback(
                marked("🚀 Instant", mode == "local"),
                CallbackAction::SetMode(DownloadMode::Local).encode(),
            ),
            InlineKeyboardButton::callback(
                marked("🕐 Queue", mode == "queued"),
                CallbackAction::SetMode(DownloadMode::Queued).encode(),
            ),
        ],
        vec![InlineKeyboardButton::callback(
            if user.history_enabled() { "🗂 History: on" } else { "🗂 History: off" }.to_string(),
            CallbackAction::ToggleHistory.encode(),
        )],
        vec![InlineKeyboardButton::callback("✖ Close".to_string(), CallbackAction::Close.encode())],
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actions_round_trip_through_callback_data() {
        let actions = [
            CallbackAction::SetQuality(Quality::Medium),
            CallbackAction::SetHeight(1080),
            CallbackAction::SetSendAs(SendAs::Document),
            CallbackAction::SetMode(DownloadMode::Queued),
            CallbackAction::ToggleHistory,
            CallbackAction::Close,
        ];
        for action in actions {
            assert_eq!(CallbackAction::parse(&action.encode()), Some(action));
        }
    }

    #[test]
    fn unknown_callback_data_is_ignored() {
        assert_eq!(CallbackAction::parse("set:quality:ultra"), None);
        assert_eq!(CallbackAction::parse("lang:en"), None);
        assert_eq!(CallbackAction::parse(""), None);
        assert_eq!(CallbackAction::parse("set:height:abc"), None);
    }

    #[test]
    fn keyboard_marks_the_active_choices() {
        let user = User {
            chat_id: 1,
            username: None,
            plan: "free".to_string(),
            quality: "medium".to_string(),
            send_as: "video".to_string(),
            mode: "queued".to_string(),
            custom_height: None,
            history_enabled: 1,
        };
        let keyboard = settings_keyboard(&user);
        let labels: Vec<String> = keyboard
            .inline_keyboard
            .iter()
            .flatten()
            .map(|b| b.text.clone())
            .collect();
        assert!(labels.contains(&"720p ✓".to_string()));
        assert!(labels.contains(&"🎬 Video ✓".to_string()));
        assert!(labels.contains(&"🕐 Queue ✓".to_string()));
        assert!(labels.contains(&"🗂 History: on".to_string()));
    }
}
