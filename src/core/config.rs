use once_cell::sync::Lazy;
use std::env;
use std::time::Duration;

/// Cached yt-dlp binary path
/// Read once at startup from YTDL_BIN environment variable or defaults to "yt-dlp"
pub static YTDL_BIN: Lazy<String> = Lazy::new(|| env::var("YTDL_BIN").unwrap_or_else(|_| "yt-dlp".to_string()));

/// ffmpeg binary path for container conversion and audio extraction
/// Read from FFMPEG_BIN environment variable
pub static FFMPEG_BIN: Lazy<String> = Lazy::new(|| env::var("FFMPEG_BIN").unwrap_or_else(|_| "ffmpeg".to_string()));

/// ffprobe binary path for media metadata probing
/// Read from FFPROBE_BIN environment variable
pub static FFPROBE_BIN: Lazy<String> =
    Lazy::new(|| env::var("FFPROBE_BIN").unwrap_or_else(|_| "ffprobe".to_string()));

/// Download folder path
/// Read from DOWNLOAD_FOLDER environment variable
/// Each task gets its own subdirectory which is removed after delivery
pub static DOWNLOAD_FOLDER: Lazy<String> =
    Lazy::new(|| env::var("DOWNLOAD_FOLDER").unwrap_or_else(|_| "/tmp/tubegrab".to_string()));

/// Database file path
/// Read from DATABASE_PATH environment variable
/// Default: tubegrab.sqlite
pub static DATABASE_PATH: Lazy<String> =
    Lazy::new(|| env::var("DATABASE_PATH").unwrap_or_else(|_| "tubegrab.sqlite".to_string()));

/// Log file path
/// Read from LOG_FILE_PATH environment variable
/// Default: tubegrab.log
pub static LOG_FILE_PATH: Lazy<String> =
    Lazy::new(|| env::var("LOG_FILE_PATH").unwrap_or_else(|_| "tubegrab.log".to_string()));

/// Bot token
/// Read from BOT_TOKEN or TELOXIDE_TOKEN environment variable
pub static BOT_TOKEN: Lazy<String> = Lazy::new(|| {
    env::var("BOT_TOKEN")
        .or_else(|_| env::var("TELOXIDE_TOKEN"))
        .unwrap_or_else(|_| String::new())
});

/// Audio format used when the delivery kind is audio
/// Read from AUDIO_FORMAT environment variable (m4a keeps `-acodec copy` cheap)
pub static AUDIO_FORMAT: Lazy<String> = Lazy::new(|| env::var("AUDIO_FORMAT").unwrap_or_else(|_| "m4a".to_string()));

/// Channel that receives a copy of every delivered file, e.g. "-1001234567890"
/// Read from ARCHIVE_CHANNEL environment variable; empty disables forwarding
pub static ARCHIVE_CHANNEL: Lazy<Option<i64>> =
    Lazy::new(|| env::var("ARCHIVE_CHANNEL").ok().and_then(|s| s.trim().parse().ok()));

/// Channel the user must be a member of before the bot serves them, e.g. "@mychannel"
/// Read from REQUIRED_MEMBERSHIP environment variable; empty disables the gate
pub static REQUIRED_MEMBERSHIP: Lazy<Option<String>> = Lazy::new(|| {
    env::var("REQUIRED_MEMBERSHIP").ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
    })
});

/// Quota and token pricing configuration
pub mod quota {
    use super::Duration;
    use once_cell::sync::Lazy;
    use std::env;

    /// Free downloads per reset window for the free tier
    /// Read from FREE_DOWNLOADS environment variable
    pub static FREE_DOWNLOADS: Lazy<i64> = Lazy::new(|| {
        env::var("FREE_DOWNLOADS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5)
    });

    /// Multiplier applied to the free ceiling for VIP users
    /// Read from VIP_MULTIPLIER environment variable
    pub static VIP_MULTIPLIER: Lazy<i64> = Lazy::new(|| {
        env::var("VIP_MULTIPLIER")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5)
    });

    /// Price of one token in cents; a verified payment is credited
    /// amount_cents / TOKEN_PRICE tokens
    /// Read from TOKEN_PRICE environment variable
    pub static TOKEN_PRICE: Lazy<i64> = Lazy::new(|| {
        env::var("TOKEN_PRICE").ok().and_then(|v| v.parse().ok()).unwrap_or(10)
    });

    /// Smallest accepted payment, in cents
    /// Read from MIN_PAYMENT_CENTS environment variable
    pub static MIN_PAYMENT_CENTS: Lazy<i64> = Lazy::new(|| {
        env::var("MIN_PAYMENT_CENTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(100)
    });

    /// Seconds until an initialized free counter resets to the ceiling
    pub const RESET_WINDOW_SECS: u64 = 86_400;

    /// Free counter reset window
    pub fn reset_window() -> Duration {
        Duration::from_secs(RESET_WINDOW_SECS)
    }
}

/// Payment provider configuration
pub mod payment {
    use super::Duration;
    use once_cell::sync::Lazy;
    use std::env;

    /// Base URL of the payment provider order API
    /// Read from PAYMENT_API_URL environment variable; empty disables /redeem
    pub static API_URL: Lazy<Option<String>> = Lazy::new(|| {
        env::var("PAYMENT_API_URL").ok().and_then(|value| {
            let trimmed = value.trim_end_matches('/');
            if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
        })
    });

    /// Bearer token for the payment provider API
    /// Read from PAYMENT_API_TOKEN environment variable
    pub static API_TOKEN: Lazy<String> =
        Lazy::new(|| env::var("PAYMENT_API_TOKEN").unwrap_or_else(|_| String::new()));

    /// Telegram Stars price for one token pack in /buy
    /// Read from TOKEN_PACK_STARS environment variable
    pub static TOKEN_PACK_STARS: Lazy<u32> = Lazy::new(|| {
        env::var("TOKEN_PACK_STARS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(50)
    });

    /// Tokens granted per purchased Stars pack
    pub static TOKEN_PACK_SIZE: Lazy<i64> = Lazy::new(|| {
        env::var("TOKEN_PACK_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10)
    });

    /// Timeout for provider verification requests (in seconds)
    pub const VERIFY_TIMEOUT_SECS: u64 = 15;

    /// Provider verification timeout
    pub fn verify_timeout() -> Duration {
        Duration::from_secs(VERIFY_TIMEOUT_SECS)
    }
}

/// Network configuration
pub mod network {
    use super::Duration;

    /// Request timeout for Bot API calls (in seconds). Generous because a
    /// single call can be a multi-hundred-megabyte upload.
    pub const REQUEST_TIMEOUT_SECS: u64 = 900;

    /// Request timeout duration
    pub fn timeout() -> Duration {
        Duration::from_secs(REQUEST_TIMEOUT_SECS)
    }
}

/// Queue processing configuration
pub mod queue {
    use super::Duration;

    /// Maximum number of concurrent downloads
    /// Kept low to avoid extractor-side 403 rate limiting
    pub const MAX_CONCURRENT_DOWNLOADS: usize = 2;

    /// Maximum number of queued tasks before new ones are rejected
    pub const MAX_QUEUE_SIZE: usize = 1000;

    /// Global delay between starting new download tasks (milliseconds)
    pub const INTER_DOWNLOAD_DELAY_MS: u64 = 3000;

    /// Interval between queue checks (in milliseconds)
    pub const CHECK_INTERVAL_MS: u64 = 100;

    /// Queue check interval duration
    pub fn check_interval() -> Duration {
        Duration::from_millis(CHECK_INTERVAL_MS)
    }

    /// Inter-download delay duration
    pub fn inter_download_delay() -> Duration {
        Duration::from_millis(INTER_DOWNLOAD_DELAY_MS)
    }
}

/// Download configuration
pub mod download {
    use super::Duration;

    /// Timeout for yt-dlp download invocations (in seconds)
    pub const YTDLP_TIMEOUT_SECS: u64 = 1800;

    /// Timeout for yt-dlp metadata probes (in seconds)
    pub const PROBE_TIMEOUT_SECS: u64 = 60;

    /// Timeout for ffmpeg conversion runs (in seconds)
    pub const FFMPEG_TIMEOUT_SECS: u64 = 600;

    /// yt-dlp download timeout duration
    pub fn ytdlp_timeout() -> Duration {
        Duration::from_secs(YTDLP_TIMEOUT_SECS)
    }

    /// yt-dlp probe timeout duration
    pub fn probe_timeout() -> Duration {
        Duration::from_secs(PROBE_TIMEOUT_SECS)
    }

    /// ffmpeg timeout duration
    pub fn ffmpeg_timeout() -> Duration {
        Duration::from_secs(FFMPEG_TIMEOUT_SECS)
    }
}

/// Retry configuration
pub mod retry {
    use super::Duration;

    /// Maximum number of retries for dispatcher reconnection
    pub const MAX_DISPATCHER_RETRIES: u32 = 5;

    /// Delay between dispatcher retry attempts (in seconds)
    pub const DISPATCHER_RETRY_DELAY_SECS: u64 = 5;

    /// Dispatcher retry delay duration
    pub fn dispatcher_delay() -> Duration {
        Duration::from_secs(DISPATCHER_RETRY_DELAY_SECS)
    }

    /// Base for exponential backoff calculation
    pub const EXPONENTIAL_BACKOFF_BASE: u64 = 2;
}

/// Progress message configuration
pub mod progress {
    use super::Duration;

    /// Minimum interval between edits of the same status message (in seconds)
    /// Telegram flood-limits message edits; anything under ~3s risks 429s
    pub const EDIT_INTERVAL_SECS: u64 = 3;

    /// Debouncer entries older than this are dropped by the eviction sweep (in seconds)
    pub const EVICT_AFTER_SECS: u64 = 600;

    /// Interval between eviction sweeps (in seconds)
    pub const EVICTION_SWEEP_SECS: u64 = 300;

    /// Edit debounce window
    pub fn edit_interval() -> Duration {
        Duration::from_secs(EDIT_INTERVAL_SECS)
    }

    /// Stale-entry age threshold
    pub fn evict_after() -> Duration {
        Duration::from_secs(EVICT_AFTER_SECS)
    }

    /// Eviction sweep period
    pub fn eviction_sweep() -> Duration {
        Duration::from_secs(EVICTION_SWEEP_SECS)
    }
}

/// Channel subscription polling configuration
pub mod subscription {
    use super::Duration;

    /// Interval between checks for new channel uploads (in seconds)
    pub const CHECK_INTERVAL_SECS: u64 = 3600;

    /// Subscription poll interval
    pub fn check_interval() -> Duration {
        Duration::from_secs(CHECK_INTERVAL_SECS)
    }
}

/// Admin configuration
pub mod admin {
    use once_cell::sync::Lazy;
    use std::env;

    fn parse_id_list(raw: &str) -> Vec<i64> {
        raw.split([',', ' ', '\n', '\t'])
            .filter_map(|part| part.trim().parse::<i64>().ok())
            .collect()
    }

    /// Admin user IDs (comma-separated)
    /// Read from ADMIN_IDS environment variable
    pub static ADMIN_IDS: Lazy<Vec<i64>> = Lazy::new(|| {
        env::var("ADMIN_IDS")
            .ok()
            .map(|raw| parse_id_list(&raw))
            .unwrap_or_default()
    });

    /// Allow-list of user IDs permitted to use the bot
    /// Read from AUTHORIZED_USERS environment variable; empty means everyone
    pub static AUTHORIZED_USERS: Lazy<Vec<i64>> = Lazy::new(|| {
        env::var("AUTHORIZED_USERS")
            .ok()
            .map(|raw| parse_id_list(&raw))
            .unwrap_or_default()
    });

    /// Whether the given user is an admin
    pub fn is_admin(user_id: i64) -> bool {
        ADMIN_IDS.contains(&user_id)
    }
}

/// Validation configuration
pub mod validation {
    use once_cell::sync::Lazy;
    use std::env;

    /// Maximum URL length (RFC 7230 recommends 8000, but we use 2048 for safety)
    pub const MAX_URL_LENGTH: usize = 2048;

    /// Maximum file size for the standard Bot API (50 MB)
    pub const STANDARD_API_MAX_BYTES: u64 = 50 * 1024 * 1024;

    /// Maximum file size for a local Bot API server, shaved by 1% the way
    /// Telegram actually enforces it (2 GB nominal)
    pub const LOCAL_API_MAX_BYTES: u64 = 2 * 1024 * 1024 * 1024 / 100 * 99;

    /// Local Bot API server URL, if any
    /// Read from BOT_API_URL environment variable
    pub static BOT_API_URL: Lazy<Option<String>> = Lazy::new(|| {
        env::var("BOT_API_URL").ok().and_then(|value| {
            let trimmed = value.trim();
            if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
        })
    });

    /// Maximum attachment size the platform will accept from us.
    ///
    /// Standard Bot API (api.telegram.org): 50 MB.
    /// Local Bot API server: 2 GB (detected via BOT_API_URL not pointing
    /// at api.telegram.org). TG_MAX_BYTES overrides both when set.
    pub fn max_file_bytes() -> u64 {
        if let Ok(raw) = env::var("TG_MAX_BYTES") {
            if let Ok(v) = raw.trim().parse::<u64>() {
                return v;
            }
        }
        match BOT_API_URL.as_deref() {
            Some(url) if !url.contains("api.telegram.org") => LOCAL_API_MAX_BYTES,
            _ => STANDARD_API_MAX_BYTES,
        }
    }
}
