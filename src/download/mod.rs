//! Download pipeline: link handling, backends, orchestration, progress.

pub mod convert;
pub mod error;
pub mod formats;
pub mod link;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod source;
pub mod ytdlp;

// Re-exports for convenience
pub use error::{DownloadError, DownloadErrorKind};
pub use formats::{format_candidates, DownloadMode, Quality, SendAs};
pub use orchestrator::{fetch_media, DownloadSettings, Fetched};
pub use queue::{DownloadQueue, DownloadTask, EnqueueOutcome, TaskPriority};
pub use source::{MediaSource, SourceRegistry};
