//! Engine and per-request HTTP configuration.
//!
//! Values arriving from the outside are not trusted: the [`DownloadManager`]
//! clamps them into their valid ranges via [`ManagerConfig::clamped`] instead
//! of rejecting them.
//!
//! [`DownloadManager`]: crate::manager::DownloadManager
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Top-level configuration consumed by the [`DownloadManager`].
///
/// [`DownloadManager`]: crate::manager::DownloadManager
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Directory where files and their `.meta` resume records are written.
    #[serde(default = "default_save_dir")]
    pub default_save_dir: PathBuf,

    /// Parallel connections per file, clamped to `[1, 32]`.
    #[serde(default = "default_max_blocks")]
    pub max_blocks_per_task: u32,

    /// Number of tasks allowed in `Downloading` at once, clamped to `[1, 10]`.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: u32,

    /// Worker pool size; at least 1.
    #[serde(default = "default_pool_size")]
    pub thread_pool_size: usize,

    /// Global download ceiling in bytes/sec. 0 means unlimited.
    #[serde(default)]
    pub speed_limit: i64,

    /// Category name → file extensions used to sort completed files.
    /// Empty means the built-in rule set.
    #[serde(default)]
    pub classification_rules: HashMap<String, Vec<String>>,
}

fn default_save_dir() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_max_blocks() -> u32 {
    8
}

fn default_max_concurrent() -> u32 {
    3
}

fn default_pool_size() -> usize {
    16
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_save_dir: default_save_dir(),
            max_blocks_per_task: default_max_blocks(),
            max_concurrent_tasks: default_max_concurrent(),
            thread_pool_size: default_pool_size(),
            speed_limit: 0,
            classification_rules: HashMap::new(),
        }
    }
}

impl ManagerConfig {
    /// Return a copy with every field forced into its valid range.
    pub fn clamped(mut self) -> Self {
        self.max_blocks_per_task = self.max_blocks_per_task.clamp(1, 32);
        self.max_concurrent_tasks = self.max_concurrent_tasks.clamp(1, 10);
        if self.thread_pool_size < 1 {
            self.thread_pool_size = default_pool_size();
        }
        if self.speed_limit < 0 {
            self.speed_limit = 0;
        }
        self
    }
}

/// Per-request HTTP behavior.
///
/// One of these travels with every [`HttpFetcher`]; tasks fold their
/// Referer/Cookie overrides into a copy of the manager's defaults.
///
/// [`HttpFetcher`]: crate::http::HttpFetcher
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpConfig {
    /// TCP connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Whole-transfer timeout in seconds. 0 disables it — large files need
    /// unbounded transfer time.
    #[serde(default)]
    pub transfer_timeout_secs: u64,

    /// Nominal stall floor in bytes/sec paired with [`low_speed_time_secs`]:
    /// a transfer sustained below it counts as stalled.
    ///
    /// [`low_speed_time_secs`]: HttpConfig::low_speed_time_secs
    #[serde(default = "default_low_speed_limit")]
    pub low_speed_limit: u32,

    /// Window for the stall rule: if no data arrives for this many seconds
    /// the attempt is aborted as stalled (retryable).
    #[serde(default = "default_low_speed_time")]
    pub low_speed_time_secs: u64,

    /// Redirect-following depth.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,

    /// Retries per transfer on top of the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Verify TLS certificates. Disable only for servers with broken chains.
    #[serde(default = "default_true")]
    pub verify_tls: bool,

    /// Optional HTTP basic-auth credentials.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,

    /// Optional `Referer` header, typically captured from a browser.
    #[serde(default)]
    pub referer: Option<String>,

    /// Optional `Cookie` header, typically captured from a browser.
    #[serde(default)]
    pub cookie: Option<String>,
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_low_speed_limit() -> u32 {
    1000
}

fn default_low_speed_time() -> u64 {
    60
}

fn default_max_redirects() -> usize {
    10
}

fn default_max_retries() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            transfer_timeout_secs: 0,
            low_speed_limit: default_low_speed_limit(),
            low_speed_time_secs: default_low_speed_time(),
            max_redirects: default_max_redirects(),
            max_retries: default_max_retries(),
            verify_tls: true,
            username: None,
            password: None,
            referer: None,
            cookie: None,
        }
    }
}
