//! Priority queue feeding the bounded download workers.
//!
//! Tasks are held in a single `VecDeque` ordered by priority class, FIFO
//! within a class. A second set tracks every task that is queued or being
//! processed, keyed by (chat, message, url), so repeated taps on the same
//! link do not pile up duplicate work. Entries leave that set only through
//! `remove_active_task`, called when processing finishes either way.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use teloxide::types::{ChatId, MessageId};
use tokio::sync::Mutex;
use url::Url;

use crate::core::{config, metrics};
use crate::download::orchestrator::DownloadSettings;

/// Scheduling class of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    /// Free users
    Low = 0,
    /// VIP users
    High = 1,
}

impl TaskPriority {
    pub fn from_plan(plan: &str) -> Self {
        match plan {
            "vip" => TaskPriority::High,
            _ => TaskPriority::Low,
        }
    }
}

/// One accepted download request waiting for (or holding) a worker slot.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    /// Unique task identifier (UUID)
    pub id: String,
    /// Requesting chat
    pub chat_id: ChatId,
    /// The message that carried the link
    pub message_id: MessageId,
    /// Validated source URL
    pub url: Url,
    /// Settings snapshot taken at acceptance time
    pub settings: DownloadSettings,
    /// Status message the worker edits with progress
    pub status_message_id: Option<MessageId>,
    /// Forced backend name, set by /direct and /ytdl
    pub source_name: Option<String>,
    pub priority: TaskPriority,
    pub created_timestamp: DateTime<Utc>,
}

impl DownloadTask {
    pub fn new(chat_id: ChatId, message_id: MessageId, url: Url, settings: DownloadSettings, plan: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            chat_id,
            message_id,
            url,
            settings,
            status_message_id: None,
            source_name: None,
            priority: TaskPriority::from_plan(plan),
            created_timestamp: Utc::now(),
        }
    }

    pub fn with_status_message(mut self, message_id: MessageId) -> Self {
        self.status_message_id = Some(message_id);
        self
    }

    pub fn with_source(mut self, source_name: &str) -> Self {
        self.source_name = Some(source_name.to_string());
        self
    }

    fn dedup_key(&self) -> (i64, i32, String) {
        (self.chat_id.0, self.message_id.0, self.url.to_string())
    }
}

/// What `add_task` did with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Accepted; 1-based position in the queue
    Queued { position: usize },
    /// The same chat/message/url is already queued or running
    Duplicate,
    /// The queue is at capacity
    Full,
}

/// Thread-safe priority queue of download tasks.
pub struct DownloadQueue {
    queue: Mutex<VecDeque<DownloadTask>>,
    /// Tasks queued or in flight, keyed by (chat, message, url)
    active: Mutex<HashSet<(i64, i32, String)>>,
    max_size: usize,
}

impl DownloadQueue {
    pub fn new() -> Self {
        Self::with_capacity(config::queue::MAX_QUEUE_SIZE)
    }

    pub fn with_capacity(max_size: usize) -> Self {
        Self { queue: Mutex::new(VecDeque::new()), active: Mutex::new(HashSet::new()), max_size }
    }

    /// Inserts a task at its priority position. Higher priority goes ahead
    /// of lower; ties keep arrival order.
    pub async fn add_task(&self, task: DownloadTask) -> EnqueueOutcome {
        let key = task.dedup_key();

        let mut active = self.active.lock().await;
        if active.contains(&key) {
            log::warn!("Duplicate task for {} in chat {}, skipping", task.url, task.chat_id);
            return EnqueueOutcome::Duplicate;
        }

        let mut queue = self.queue.lock().await;
        if queue.len() >= self.max_size {
            log::warn!("Queue is full ({} tasks), rejecting {}", queue.len(), task.url);
            return EnqueueOutcome::Full;
        }
        active.insert(key);

        let position = queue.iter().position(|t| t.priority < task.priority).unwrap_or(queue.len());
        log::info!("Queueing {} for chat {} at position {} ({:?})", task.url, task.chat_id, position + 1, task.priority);
        queue.insert(position, task);
        metrics::update_queue_depth(queue.len());

        EnqueueOutcome::Queued { position: position + 1 }
    }

    /// Pops the highest-priority task. The task stays in the active set
    /// until `remove_active_task` is called for it.
    pub async fn get_task(&self) -> Option<DownloadTask> {
        let mut queue = self.queue.lock().await;
        let task = queue.pop_front();
        if task.is_some() {
            metrics::update_queue_depth(queue.len());
        }
        task
    }

    /// Releases a finished task's duplicate-guard slot.
    pub async fn remove_active_task(&self, chat_id: ChatId, message_id: MessageId, url: &Url) {
        let key = (chat_id.0, message_id.0, url.to_string());
        let mut active = self.active.lock().await;
        if !active.remove(&key) {
            log::warn!("Tried to release unknown task {} for chat {}", url, chat_id);
        }
    }

    /// 1-based queue position of the chat's first waiting task.
    pub async fn position_of(&self, chat_id: ChatId) -> Option<usize> {
        let queue = self.queue.lock().await;
        queue.iter().position(|t| t.chat_id == chat_id).map(|p| p + 1)
    }

    pub async fn size(&self) -> usize {
        self.queue.lock().await.len()
    }
}

impl Default for DownloadQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::formats::{Quality, SendAs};

    fn settings() -> DownloadSettings {
        DownloadSettings { quality: Quality::High, send_as: SendAs::Video, custom_height: None }
    }

    fn task(chat: i64, msg: i32, url: &str, plan: &str) -> DownloadTask {
        DownloadTask::new(
            ChatId(chat),
            MessageId(msg),
            Url::parse(url).unwrap(),
            settings(),
            plan,
        )
    }

    #[test]
    fn priority_maps_from_plan() {
        assert_eq!(TaskPriority::from_plan("vip"), TaskPriority::High);
        assert_eq!(TaskPriority::from_plan("free"), TaskPriority::Low);
        assert_eq!(TaskPriority::from_plan("anything"), TaskPriority::Low);
        assert!(TaskPriority::High > TaskPriority::Low);
    }

    #[tokio::test]
    async fn vip_tasks_jump_ahead_of_free_ones() {
        let queue = DownloadQueue::with_capacity(10);
        queue.add_task(task(1, 1, "https://example.com/a", "free")).await;
        queue.add_task(task(2, 1, "https://example.com/b", "free")).await;
        let outcome = queue.add_task(task(3, 1, "https://example.com/c", "vip")).await;
        assert_eq!(outcome, EnqueueOutcome::Queued { position: 1 });

        assert_eq!(queue.get_task().await.unwrap().chat_id, ChatId(3));
        assert_eq!(queue.get_task().await.unwrap().chat_id, ChatId(1));
        assert_eq!(queue.get_task().await.unwrap().chat_id, ChatId(2));
        assert!(queue.get_task().await.is_none());
    }

    #[tokio::test]
    async fn same_chat_message_url_is_rejected_until_released() {
        let queue = DownloadQueue::with_capacity(10);
        assert!(matches!(
            queue.add_task(task(1, 7, "https://example.com/v", "free")).await,
            EnqueueOutcome::Queued { .. }
        ));
        assert_eq!(queue.add_task(task(1, 7, "https://example.com/v", "free")).await, EnqueueOutcome::Duplicate);

        // Still a duplicate while the task is being processed
        let running = queue.get_task().await.unwrap();
        assert_eq!(queue.add_task(task(1, 7, "https://example.com/v", "free")).await, EnqueueOutcome::Duplicate);

        queue.remove_active_task(running.chat_id, running.message_id, &running.url).await;
        assert!(matches!(
            queue.add_task(task(1, 7, "https://example.com/v", "free")).await,
            EnqueueOutcome::Queued { .. }
        ));
    }

    #[tokio::test]
    async fn a_new_message_with_the_same_url_is_not_a_duplicate() {
        let queue = DownloadQueue::with_capacity(10);
        queue.add_task(task(1, 7, "https://example.com/v", "free")).await;
        assert!(matches!(
            queue.add_task(task(1, 8, "https://example.com/v", "free")).await,
            EnqueueOutcome::Queued { .. }
        ));
    }

    #[tokio::test]
    async fn full_queue_rejects_without_poisoning_the_dedup_set() {
        let queue = DownloadQueue::with_capacity(2);
        queue.add_task(task(1, 1, "https://example.com/a", "free")).await;
        queue.add_task(task(2, 1, "https://example.com/b", "free")).await;
        assert_eq!(queue.add_task(task(3, 1, "https://example.com/c", "free")).await, EnqueueOutcome::Full);

        // The rejected task can come back once a slot frees up
        queue.get_task().await;
        assert!(matches!(
            queue.add_task(task(3, 1, "https://example.com/c", "free")).await,
            EnqueueOutcome::Queued { .. }
        ));
    }

    #[tokio::test]
    async fn position_is_one_based_and_per_chat() {
        let queue = DownloadQueue::with_capacity(10);
        queue.add_task(task(1, 1, "https://example.com/a", "free")).await;
        queue.add_task(task(2, 1, "https://example.com/b", "free")).await;

        assert_eq!(queue.position_of(ChatId(2)).await, Some(2));
        assert_eq!(queue.position_of(ChatId(9)).await, None);
        assert_eq!(queue.size().await, 2);
    }
}
