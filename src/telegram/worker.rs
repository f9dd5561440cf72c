//! Runs accepted tasks: the queue worker loop and the shared pipeline body.
//!
//! `run_download_task` is the whole life of one task after acceptance:
//! status edits, orchestrator, dispatcher, cleanup. Queued tasks reach it
//! through `process_queue`; local-mode tasks are spawned straight into it.

use std::sync::Arc;
use std::time::Instant;

use teloxide::prelude::*;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::time::interval;
use url::Url;

use crate::core::utils::truncate_tail;
use crate::core::{config, metrics};
use crate::download::orchestrator::fetch_media;
use crate::download::progress::{DownloadStatus, EditDebouncer, StatusMessage};
use crate::download::queue::DownloadTask;
use crate::storage::cache::fingerprint;
use crate::storage::db;
use crate::storage::get_connection;
use crate::telegram::dispatch::DeliveryMeta;
use crate::telegram::handlers::HandlerDeps;

/// Pulls tasks off the priority queue and runs them under a permit cap.
///
/// A global minimum delay between task starts keeps extractors from seeing
/// a thundering herd when the queue is deep.
pub async fn process_queue(bot: Bot, deps: HandlerDeps) {
    let semaphore = Arc::new(Semaphore::new(config::queue::MAX_CONCURRENT_DOWNLOADS));
    let mut interval = interval(config::queue::check_interval());
    let last_download_start = Arc::new(Mutex::new(Instant::now()));

    loop {
        interval.tick().await;
        if let Some(task) = deps.queue.get_task().await {
            log::info!("Got task {} from queue", task.id);
            let bot = bot.clone();
            let deps = deps.clone();
            let semaphore = Arc::clone(&semaphore);
            let last_download_start = Arc::clone(&last_download_start);

            tokio::spawn(async move {
                // acquire() only fails when the semaphore is closed, which
                // never happens to this one
                let Ok(_permit) = semaphore.acquire().await else {
                    return;
                };

                {
                    let mut last_start = last_download_start.lock().await;
                    let elapsed = last_start.elapsed();
                    let delay = config::queue::inter_download_delay();
                    if elapsed < delay {
                        log::info!("Waiting {:?} before starting task {}", delay - elapsed, task.id);
                        tokio::time::sleep(delay - elapsed).await;
                    }
                    *last_start = Instant::now();
                }

                run_download_task(&bot, &deps, task).await;
            });
        }
    }
}

/// Periodically drops debouncer entries for messages nobody edits anymore.
pub fn spawn_debounce_eviction(debouncer: Arc<EditDebouncer>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = interval(config::progress::eviction_sweep());
        loop {
            interval.tick().await;
            debouncer.evict_stale(config::progress::evict_after());
        }
    })
}

/// Downloads, converts, and delivers one task, narrating into its status
/// message. Never returns an error: every failure ends as an edited status
/// message, and the duplicate-guard slot is always released.
pub async fn run_download_task(bot: &Bot, deps: &HandlerDeps, task: DownloadTask) {
    let chat_id = task.chat_id;
    let mut status = match task.status_message_id {
        Some(id) => StatusMessage::attached(chat_id, id),
        None => StatusMessage::new(chat_id),
    };

    let placeholder = display_name(&task.url);
    let _ = status.update(bot, &DownloadStatus::Starting { title: placeholder.clone() }).await;

    let source = match &task.source_name {
        Some(name) => deps.registry.get(name),
        None => deps.registry.resolve(&task.url),
    };
    let Some(source) = source else {
        let _ = status
            .update(bot, &DownloadStatus::Failed { reason: "⚠️ No backend can handle this link.".to_string() })
            .await;
        finish_task(deps, &task, &status).await;
        return;
    };

    metrics::record_platform_download(metrics::extract_platform(task.url.as_str()));
    metrics::ACTIVE_DOWNLOADS.inc();
    let timer = metrics::start_download_timer(&task.settings.send_as.to_string());

    // The forwarder owns a second handle onto the same status message and
    // applies the debounce window; state transitions below bypass it.
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
    let forwarder = {
        let bot = bot.clone();
        let debouncer = Arc::clone(&deps.debouncer);
        let editor = task.status_message_id.map(|id| StatusMessage::attached(chat_id, id));
        let title = placeholder.clone();
        tokio::spawn(async move {
            let Some(mut editor) = editor else {
                while progress_rx.recv().await.is_some() {}
                return;
            };
            let mut saw_progress = false;
            while let Some(progress) = progress_rx.recv().await {
                saw_progress = true;
                let Some(key) = editor.key() else { continue };
                if !debouncer.should_edit(key) {
                    continue;
                }
                let _ = editor.update(&bot, &DownloadStatus::Downloading { title: title.clone(), progress }).await;
            }
            // Channel closed: the bytes are down, ffmpeg may still run for
            // a while. Skipped when nothing was ever downloaded.
            if saw_progress {
                let _ = editor.update(&bot, &DownloadStatus::Processing { title: title.clone() }).await;
            }
        })
    };

    let result = fetch_media(source.as_ref(), &task.url, &task.settings, progress_tx).await;
    // fetch_media dropped its sender; wait out the last queued edit so the
    // final state below is not overwritten by a stale progress line.
    let _ = forwarder.await;

    match result {
        Err(e) => {
            metrics::record_download_failure(e.kind.as_str());
            timer.stop_and_discard();
            log::warn!("Download failed for {} in chat {}: {}", task.url, chat_id, e);
            let _ = status
                .update(bot, &DownloadStatus::Failed { reason: e.user_message().to_string() })
                .await;
        }
        Ok(fetched) => {
            let _ = status.update(bot, &DownloadStatus::Uploading { title: fetched.title.clone() }).await;

            let canonical = deps.resolver.resolve(&task.url).await;
            let meta = DeliveryMeta {
                fingerprint: fingerprint(
                    &canonical,
                    &task.settings.quality.to_string(),
                    &task.settings.send_as.to_string(),
                ),
                canonical_url: canonical,
                history_enabled: history_enabled(deps, chat_id.0),
            };

            match deps.dispatcher.deliver(bot, chat_id, &fetched, &task.settings, &meta).await {
                Ok(delivered) => {
                    timer.observe_duration();
                    log::info!("Delivered {} to chat {} as {}", task.url, chat_id, delivered.kind);
                    status.remove(bot).await;
                }
                Err(e) => {
                    timer.stop_and_discard();
                    metrics::record_download_failure("upload");
                    log::error!("Upload failed for {} in chat {}: {}", task.url, chat_id, e);
                    let reason = format!("⚠️ Upload failed: {}", truncate_tail(&e.to_string(), 160));
                    let _ = status.update(bot, &DownloadStatus::Failed { reason }).await;
                }
            }
            fetched.cleanup().await;
        }
    }

    metrics::ACTIVE_DOWNLOADS.dec();
    finish_task(deps, &task, &status).await;
}

/// Releases everything tied to the task's identity.
async fn finish_task(deps: &HandlerDeps, task: &DownloadTask, status: &StatusMessage) {
    if let Some(key) = status.key() {
        deps.debouncer.forget(key);
    }
    // Harmless no-op for local-mode tasks, which never enter the queue.
    deps.queue.remove_active_task(task.chat_id, task.message_id, &task.url).await;
}

fn history_enabled(deps: &HandlerDeps, chat_id: i64) -> bool {
    get_connection(&deps.db_pool)
        .ok()
        .and_then(|conn| db::get_user(&conn, chat_id).ok().flatten())
        .map(|u| u.history_enabled())
        .unwrap_or(false)
}

/// Something readable to show before the real title is known.
fn display_name(url: &Url) -> String {
    let text = url.as_str();
    if text.chars().count() <= 64 {
        return text.to_string();
    }
    let kept: String = text.chars().take(64).collect();
    format!("{}…", kept)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_shortens_long_urls() {
        let url = Url::parse(&format!("https://example.com/{}", "a".repeat(200))).unwrap();
        let name = display_name(&url);
        assert!(name.chars().count() <= 65);
        assert!(name.ends_with('…'));

        let short = Url::parse("https://example.com/v").unwrap();
        assert_eq!(display_name(&short), "https://example.com/v");
    }
}
