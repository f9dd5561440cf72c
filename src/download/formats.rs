//! User-facing quality and delivery settings, and the yt-dlp format
//! selector candidates derived from them.

use strum::{Display, EnumString};

/// Quality preference stored per user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Quality {
    /// Best available, no height cap
    High,
    /// Capped at 720p
    Medium,
    /// Capped at 480p
    Low,
    /// Audio track only
    Audio,
    /// Capped at the user's custom height
    Custom,
}

impl Quality {
    /// The height cap this quality imposes, if any.
    pub fn height_cap(self, custom_height: Option<i64>) -> Option<i64> {
        match self {
            Quality::High | Quality::Audio => None,
            Quality::Medium => Some(720),
            Quality::Low => Some(480),
            // A custom quality without a stored height can happen when the
            // user switched plans mid-flow; fall back to the medium cap.
            Quality::Custom => custom_height.or(Some(720)),
        }
    }
}

/// How the finished file is delivered to the chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum SendAs {
    Video,
    Audio,
    Document,
}

/// Where a request runs: inline in its own task, or through the shared
/// priority queue with its bounded workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum DownloadMode {
    /// Spawn immediately, no queueing
    Local,
    /// Wait for a worker slot in the priority queue
    Queued,
}

/// Builds the ordered list of yt-dlp format selectors to attempt.
///
/// Selectors are tried front to back; `None` is always last and means
/// "no -f flag, let yt-dlp pick". The orchestrator advances through the
/// list only on errors that a different selector could fix.
pub fn format_candidates(
    quality: Quality,
    send_as: SendAs,
    custom_height: Option<i64>,
) -> Vec<Option<String>> {
    if send_as == SendAs::Audio || quality == Quality::Audio {
        return vec![Some("bestaudio[ext=m4a]/bestaudio".to_string()), None];
    }

    if send_as == SendAs::Document {
        // Documents keep whatever container the site serves best
        return vec![None];
    }

    match quality.height_cap(custom_height) {
        Some(cap) => vec![
            Some(format!(
                "bestvideo[ext=mp4][height<={cap}]+bestaudio[ext=m4a]/best[ext=mp4][height<={cap}]"
            )),
            Some(format!("bestvideo[height<={cap}]+bestaudio/best[height<={cap}]")),
            None,
        ],
        None => vec![
            Some("bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]".to_string()),
            Some("bestvideo+bestaudio/best".to_string()),
            None,
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_quality_parses_from_db_strings() {
        assert_eq!(Quality::from_str("high").unwrap(), Quality::High);
        assert_eq!(Quality::from_str("audio").unwrap(), Quality::Audio);
        assert_eq!(Quality::from_str("custom").unwrap(), Quality::Custom);
        assert!(Quality::from_str("ultra").is_err());
        assert_eq!(Quality::Medium.to_string(), "medium");
    }

    #[test]
    fn test_send_as_parses_from_db_strings() {
        assert_eq!(SendAs::from_str("video").unwrap(), SendAs::Video);
        assert_eq!(SendAs::from_str("document").unwrap(), SendAs::Document);
        assert_eq!(SendAs::Audio.to_string(), "audio");
    }

    #[test]
    fn test_height_caps() {
        assert_eq!(Quality::High.height_cap(None), None);
        assert_eq!(Quality::Medium.height_cap(None), Some(720));
        assert_eq!(Quality::Low.height_cap(None), Some(480));
        assert_eq!(Quality::Custom.height_cap(Some(360)), Some(360));
        assert_eq!(Quality::Custom.height_cap(None), Some(720));
    }

    #[test]
    fn test_candidates_end_with_default() {
        for quality in [Quality::High, Quality::Medium, Quality::Low, Quality::Audio] {
            for send_as in [SendAs::Video, SendAs::Audio, SendAs::Document] {
                let candidates = format_candidates(quality, send_as, None);
                assert!(!candidates.is_empty());
                assert_eq!(candidates.last().unwrap(), &None, "{quality}/{send_as}");
            }
        }
    }

    #[test]
    fn test_audio_candidates() {
        let candidates = format_candidates(Quality::High, SendAs::Audio, None);
        assert_eq!(candidates.len(), 2);
        assert!(candidates[0].as_deref().unwrap().starts_with("bestaudio"));

        // Audio quality forces audio selectors regardless of delivery kind
        let candidates = format_candidates(Quality::Audio, SendAs::Video, None);
        assert!(candidates[0].as_deref().unwrap().starts_with("bestaudio"));
    }

    #[test]
    fn test_capped_candidates_embed_height() {
        let candidates = format_candidates(Quality::Medium, SendAs::Video, None);
        assert_eq!(candidates.len(), 3);
        assert!(candidates[0].as_deref().unwrap().contains("height<=720"));
        assert!(candidates[1].as_deref().unwrap().contains("height<=720"));

        let candidates = format_candidates(Quality::Custom, SendAs::Video, Some(1080));
        assert!(candidates[0].as_deref().unwrap().contains("height<=1080"));
    }

    #[test]
    fn test_document_goes_straight_to_default() {
        let candidates = format_candidates(Quality::High, SendAs::Document, None);
        assert_eq!(candidates, vec![None]);
    }
}
