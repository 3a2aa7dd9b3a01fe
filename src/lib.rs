//! blockfetch — multi-connection download engine
//!
//! `blockfetch` downloads files over HTTP in parallel byte-range blocks,
//! with pause/resume that survives process restarts, a global bandwidth
//! ceiling, and a queue that bounds how many downloads run at once.
//!
//! The engine is a library first; the bundled CLI is a thin shell over the
//! same API. The entry point is [`DownloadManager`]: add a URL, get a task
//! id back, then drive it with `pause`/`resume`/`cancel` and poll
//! [`DownloadManager::all_tasks`] for progress.
//!
//! # Example
//!
//! ```no_run
//! use blockfetch::{DownloadManager, ManagerConfig};
//!
//! # async fn run() {
//! let manager = DownloadManager::new(ManagerConfig::default());
//! let id = manager.add("https://example.com/large.iso", None, None, None);
//! // ... poll manager.all_tasks() until the task reports Completed ...
//! # let _ = id;
//! # }
//! ```
//!
//! # How a download runs
//!
//! A HEAD probe discovers the size, range support and validators, the
//! destination file is preallocated, the range is split into up to 32
//! blocks, and each block streams its slice through the shared token-bucket
//! limiter into its file offset. Block progress and the `.meta` resume
//! record on disk make pause, crash recovery and server-change detection
//! possible.

mod block;
pub mod classifier;
pub mod config;
pub mod error;
pub mod http;
pub mod limiter;
pub mod manager;
pub mod metadata;
pub mod pool;
pub mod progress;
pub mod queue;
pub mod splitter;
pub mod task;
pub mod utils;

pub use classifier::{Categorize, FileClassifier, NoopCategorizer};
pub use config::{HttpConfig, ManagerConfig};
pub use error::{DownloadError, Result};
pub use http::{FileInfo, HttpFetcher};
pub use limiter::TokenBucket;
pub use manager::DownloadManager;
pub use metadata::{BlockRecord, TaskMeta};
pub use pool::{JobHandle, WorkerPool};
pub use progress::{ProgressInfo, ProgressTracker};
pub use queue::TaskQueue;
pub use splitter::split_blocks;
pub use task::{Task, TaskInfo, TaskState};
