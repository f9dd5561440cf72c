//! Telegram bot integration and handlers

pub mod bot;
pub mod caption;
pub mod dispatch;
pub mod handlers;
pub mod keyboard;
pub mod subscriptions;
pub mod worker;

// Re-exports for convenience
pub use bot::{create_bot, setup_bot_commands, Command};
pub use dispatch::UploadDispatcher;
pub use handlers::{schema, HandlerDeps, HandlerError};
pub use worker::{process_queue, run_download_task, spawn_debounce_eviction};
