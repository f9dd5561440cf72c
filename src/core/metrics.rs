//! Prometheus metrics for the bot.
//!
//! Tracks download outcomes, cache effectiveness, quota rejections,
//! payments, and queue health. Counters are registered lazily on first
//! touch; `init_metrics` forces registration at startup so the scrape
//! endpoint never shows a partial set.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, register_histogram_vec, Counter,
    CounterVec, Gauge, HistogramVec,
};

/// Successful deliveries by delivery kind and quality.
pub static DOWNLOAD_SUCCESS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tubegrab_download_success_total",
        "Total number of successfully delivered downloads",
        &["kind", "quality"]
    )
    .unwrap()
});

/// Failed downloads by error kind (timeout/unsupported/rate_limited/too_large/unknown).
pub static DOWNLOAD_FAILURE_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tubegrab_download_failure_total",
        "Total number of failed downloads by error kind",
        &["error_kind"]
    )
    .unwrap()
});

/// Wall-clock time from task start to delivery, by delivery kind.
pub static DOWNLOAD_DURATION_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "tubegrab_download_duration_seconds",
        "Time spent downloading and delivering files",
        &["kind"],
        vec![1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]
    )
    .unwrap()
});

/// Requests answered straight from the delivery cache.
pub static CACHE_HITS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "tubegrab_cache_hits_total",
        "Requests served by re-sending a cached file_id"
    )
    .unwrap()
});

/// Requests that missed the delivery cache and went to the downloader.
pub static CACHE_MISSES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "tubegrab_cache_misses_total",
        "Requests that required a fresh download"
    )
    .unwrap()
});

/// Requests refused because both free and paid balances were empty.
pub static QUOTA_REJECTIONS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "tubegrab_quota_rejections_total",
        "Requests refused for exhausted quota"
    )
    .unwrap()
});

/// Successfully redeemed payments by provider (stars/external).
pub static PAYMENT_SUCCESS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tubegrab_payment_success_total",
        "Total number of redeemed payments",
        &["provider"]
    )
    .unwrap()
});

/// Rejected redemption attempts by reason (duplicate/invalid/below_minimum).
pub static PAYMENT_FAILURE_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tubegrab_payment_failure_total",
        "Total number of rejected payment redemptions",
        &["reason"]
    )
    .unwrap()
});

/// Total revenue credited, in Telegram Stars.
pub static REVENUE_TOTAL_STARS: Lazy<Counter> = Lazy::new(|| {
    register_counter!("tubegrab_revenue_total_stars", "Total revenue in Telegram Stars").unwrap()
});

/// Tasks currently waiting in the download queue.
pub static QUEUE_DEPTH: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("tubegrab_queue_depth", "Number of tasks waiting in the queue").unwrap()
});

/// Downloads currently running.
pub static ACTIVE_DOWNLOADS: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!("tubegrab_active_downloads", "Number of downloads in flight").unwrap()
});

/// Retried Telegram send attempts (flood wait, transient API errors).
pub static SEND_RETRIES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "tubegrab_send_retries_total",
        "Telegram send attempts that had to be retried"
    )
    .unwrap()
});

/// Downloads by source platform.
pub static PLATFORM_DOWNLOADS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "tubegrab_platform_downloads_total",
        "Downloads by source platform",
        &["platform"]
    )
    .unwrap()
});

/// Forces registration of every metric so all series exist from startup.
pub fn init_metrics() {
    let _ = &*DOWNLOAD_SUCCESS_TOTAL;
    let _ = &*DOWNLOAD_FAILURE_TOTAL;
    let _ = &*DOWNLOAD_DURATION_SECONDS;
    let _ = &*CACHE_HITS_TOTAL;
    let _ = &*CACHE_MISSES_TOTAL;
    let _ = &*QUOTA_REJECTIONS_TOTAL;
    let _ = &*PAYMENT_SUCCESS_TOTAL;
    let _ = &*PAYMENT_FAILURE_TOTAL;
    let _ = &*REVENUE_TOTAL_STARS;
    let _ = &*QUEUE_DEPTH;
    let _ = &*ACTIVE_DOWNLOADS;
    let _ = &*SEND_RETRIES_TOTAL;
    let _ = &*PLATFORM_DOWNLOADS_TOTAL;

    DOWNLOAD_FAILURE_TOTAL.with_label_values(&["timeout"]);
    DOWNLOAD_FAILURE_TOTAL.with_label_values(&["unsupported"]);
    DOWNLOAD_FAILURE_TOTAL.with_label_values(&["rate_limited"]);
    DOWNLOAD_FAILURE_TOTAL.with_label_values(&["too_large"]);
    DOWNLOAD_FAILURE_TOTAL.with_label_values(&["unknown"]);

    PAYMENT_FAILURE_TOTAL.with_label_values(&["duplicate"]);
    PAYMENT_FAILURE_TOTAL.with_label_values(&["invalid"]);
    PAYMENT_FAILURE_TOTAL.with_label_values(&["below_minimum"]);

    log::info!("Metrics registry initialized");
}

pub fn record_download_success(kind: &str, quality: &str) {
    DOWNLOAD_SUCCESS_TOTAL.with_label_values(&[kind, quality]).inc();
}

pub fn record_download_failure(error_kind: &str) {
    DOWNLOAD_FAILURE_TOTAL.with_label_values(&[error_kind]).inc();
}

pub fn record_cache_hit() {
    CACHE_HITS_TOTAL.inc();
}

pub fn record_cache_miss() {
    CACHE_MISSES_TOTAL.inc();
}

pub fn record_quota_rejection() {
    QUOTA_REJECTIONS_TOTAL.inc();
}

pub fn record_payment_success(provider: &str, stars: u64) {
    PAYMENT_SUCCESS_TOTAL.with_label_values(&[provider]).inc();
    REVENUE_TOTAL_STARS.inc_by(stars as f64);
}

pub fn record_payment_failure(reason: &str) {
    PAYMENT_FAILURE_TOTAL.with_label_values(&[reason]).inc();
}

pub fn update_queue_depth(depth: usize) {
    QUEUE_DEPTH.set(depth as f64);
}

pub fn record_send_retry() {
    SEND_RETRIES_TOTAL.inc();
}

pub fn record_platform_download(platform: &str) {
    PLATFORM_DOWNLOADS_TOTAL.with_label_values(&[platform]).inc();
}

/// Returns a timer whose drop observes elapsed time into the duration histogram.
pub fn start_download_timer(kind: &str) -> prometheus::HistogramTimer {
    DOWNLOAD_DURATION_SECONDS.with_label_values(&[kind]).start_timer()
}

/// Extracts a platform label from a URL.
pub fn extract_platform(url: &str) -> &'static str {
    let url_lower = url.to_lowercase();
    if url_lower.contains("youtube.com") || url_lower.contains("youtu.be") {
        "youtube"
    } else if url_lower.contains("tiktok.com") {
        "tiktok"
    } else if url_lower.contains("instagram.com") {
        "instagram"
    } else if url_lower.contains("twitter.com") || url_lower.contains("x.com") {
        "twitter"
    } else if url_lower.contains("vimeo.com") {
        "vimeo"
    } else if url_lower.contains("soundcloud.com") {
        "soundcloud"
    } else if url_lower.contains("twitch.tv") {
        "twitch"
    } else {
        "other"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        init_metrics();
        // If this doesn't panic, every metric registered cleanly
    }

    #[test]
    fn test_record_download_failure() {
        record_download_failure("timeout");
        let metric = DOWNLOAD_FAILURE_TOTAL.with_label_values(&["timeout"]).get();
        assert!(metric >= 1.0);
    }

    #[test]
    fn test_update_queue_depth() {
        update_queue_depth(7);
        assert_eq!(QUEUE_DEPTH.get(), 7.0);
    }

    #[test]
    fn test_extract_platform() {
        assert_eq!(extract_platform("https://www.youtube.com/watch?v=abc"), "youtube");
        assert_eq!(extract_platform("https://youtu.be/abc"), "youtube");
        assert_eq!(extract_platform("https://x.com/user/status/1"), "twitter");
        assert_eq!(extract_platform("https://example.com/video"), "other");
    }
}
