//! Tubegrab - Telegram bot that fetches media links through yt-dlp
//!
//! This library provides all the functionality behind the bot: download
//! orchestration, the task queue, quota and payment bookkeeping, the
//! delivery cache, and the Telegram handler tree.
//!
//! # Module Structure
//!
//! - `core`: configuration, errors, logging, metrics, and small utilities
//! - `storage`: user settings database and the delivery cache
//! - `download`: link handling, backends, format fallback, post-processing
//! - `payment`: free quota, paid tokens, and receipt redemption
//! - `telegram`: bot wiring, handlers, upload dispatch, queue workers

pub mod cli;
pub mod core;
pub mod download;
pub mod payment;
pub mod storage;
pub mod telegram;

// Re-export commonly used types for convenience
pub use core::{config, AppError, AppResult};
pub use download::{DownloadQueue, DownloadTask, EnqueueOutcome};
pub use storage::{create_pool, get_connection, DbConnection, DbPool};
pub use telegram::{create_bot, schema, HandlerDeps};
