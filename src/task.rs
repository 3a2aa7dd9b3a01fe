//! One logical download: URL → file, split into parallel blocks.
//!
//! The task owns the state machine and orchestrates probe → allocate →
//! split → block submission, plus pause/resume/cancel and completion. All
//! heavy work runs as worker-pool jobs; the public methods only flip state
//! and enqueue.
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::block::{Block, BlockProgressFn};
use crate::classifier::Categorize;
use crate::config::HttpConfig;
use crate::error::{DownloadError, Result};
use crate::http::HttpFetcher;
use crate::limiter::TokenBucket;
use crate::metadata::{self, BlockRecord, TaskMeta};
use crate::pool::WorkerPool;
use crate::progress::{ProgressInfo, ProgressTracker};
use crate::splitter;
use crate::utils;

/// Whole-task restarts on transient probe failures. Independent of the
/// per-transfer retry budget inside the fetchers: a fully transient outage
/// can therefore be retried up to (retries + 1) * (restarts + 1) times.
const MAX_AUTO_RETRIES: u32 = 3;

/// Lifecycle states of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Downloading,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            TaskState::Queued => "queued",
            TaskState::Downloading => "downloading",
            TaskState::Paused => "paused",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

/// Invoked on every state transition with `(task_id, new_state)`.
pub type StateCallback = Arc<dyn Fn(u64, TaskState) + Send + Sync>;

/// Point-in-time view of a task. Produced on demand; never mutated.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub task_id: u64,
    pub url: String,
    pub file_path: PathBuf,
    pub file_name: String,
    /// -1 while unknown.
    pub file_size: i64,
    pub state: TaskState,
    pub progress: ProgressInfo,
    /// Human-readable description of the last failure; empty otherwise.
    pub error_message: String,
}

/// Shared engine services every task borrows.
#[derive(Clone)]
pub(crate) struct TaskContext {
    pub pool: Arc<WorkerPool>,
    pub limiter: Arc<TokenBucket>,
    pub categorizer: Arc<dyn Categorize>,
}

pub struct Task {
    id: u64,
    save_dir: PathBuf,
    max_blocks: u32,
    http_config: HttpConfig,
    ctx: TaskContext,
    on_state_change: StateCallback,
    state: Mutex<TaskState>,
    inner: Mutex<TaskInner>,
    progress: ProgressTracker,
}

struct TaskInner {
    url: String,
    file_name: String,
    file_path: PathBuf,
    meta_path: PathBuf,
    /// -1 until the probe announces a size (and when it never does).
    file_size: i64,
    etag: String,
    last_modified: String,
    accept_ranges: bool,
    blocks: Vec<Arc<Block>>,
    /// Blocks submitted to the pool that have not returned yet.
    outstanding: usize,
    /// Completion has been scheduled; guards against double finish.
    finishing: bool,
    error_message: String,
    auto_retries: u32,
}

impl Task {
    pub(crate) fn new(
        id: u64,
        url: String,
        save_dir: PathBuf,
        max_blocks: u32,
        http_config: HttpConfig,
        ctx: TaskContext,
        on_state_change: StateCallback,
    ) -> Arc<Self> {
        let file_name = utils::file_name_from_url(&url);
        let file_path = save_dir.join(&file_name);
        let meta_path = metadata::meta_path(&file_path);

        Arc::new(Self {
            id,
            save_dir,
            max_blocks: max_blocks.clamp(1, splitter::MAX_BLOCKS),
            http_config,
            ctx,
            on_state_change,
            state: Mutex::new(TaskState::Queued),
            inner: Mutex::new(TaskInner {
                url,
                file_name,
                file_path,
                meta_path,
                file_size: -1,
                etag: String::new(),
                last_modified: String::new(),
                accept_ranges: false,
                blocks: Vec::new(),
                outstanding: 0,
                finishing: false,
                error_message: String::new(),
                auto_retries: 0,
            }),
            progress: ProgressTracker::new(0),
        })
    }

    /// Rebuild a task from a persisted resume record, in `Paused` state and
    /// ready to [`resume`](Task::resume). `None` when the record is missing
    /// or corrupt.
    pub(crate) async fn from_metadata(
        id: u64,
        meta_path: &Path,
        http_config: HttpConfig,
        ctx: TaskContext,
        on_state_change: StateCallback,
    ) -> Option<Arc<Self>> {
        let meta = metadata::load(meta_path).await?;
        let file_path = PathBuf::from(&meta.file_path);
        let save_dir = file_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let already_downloaded: i64 = meta.blocks.iter().map(|b| b.downloaded).sum();

        let task = Arc::new(Self {
            id,
            save_dir,
            max_blocks: meta.max_blocks.clamp(1, splitter::MAX_BLOCKS),
            http_config,
            ctx,
            on_state_change,
            state: Mutex::new(TaskState::Paused),
            inner: Mutex::new(TaskInner {
                url: meta.url,
                file_name: meta.file_name,
                file_path,
                meta_path: meta_path.to_path_buf(),
                file_size: meta.file_size,
                etag: meta.etag,
                last_modified: meta.last_modified,
                // A persisted block list implies ranges worked before.
                accept_ranges: true,
                blocks: Vec::new(),
                outstanding: 0,
                finishing: false,
                error_message: String::new(),
                auto_retries: 0,
            }),
            progress: ProgressTracker::new(meta.file_size.max(0)),
        });
        if already_downloaded > 0 {
            task.progress.add_bytes(already_downloaded);
        }
        Some(task)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock().unwrap()
    }

    pub fn info(&self) -> TaskInfo {
        let state = self.state();
        let inner = self.inner.lock().unwrap();
        TaskInfo {
            task_id: self.id,
            url: inner.url.clone(),
            file_path: inner.file_path.clone(),
            file_name: inner.file_name.clone(),
            file_size: inner.file_size,
            state,
            progress: self.progress.snapshot(),
            error_message: inner.error_message.clone(),
        }
    }

    /// Begin downloading. Only valid from `Queued`; anything else is a no-op.
    pub fn start(self: &Arc<Self>) {
        if !self.try_transition(&[TaskState::Queued], TaskState::Downloading) {
            return;
        }
        self.emit(TaskState::Downloading);

        let task = Arc::clone(self);
        if self
            .ctx
            .pool
            .submit(async move { task.run_start().await })
            .is_err()
        {
            self.fail_deferred("worker pool is stopped");
        }
    }

    /// Pause a downloading task: flag every block, abort their transfers,
    /// persist the resume record. Bytes already on disk stay there.
    pub async fn pause(&self) {
        if !self.try_transition(&[TaskState::Downloading], TaskState::Paused) {
            return;
        }
        let blocks = self.inner.lock().unwrap().blocks.clone();
        for block in &blocks {
            block.pause();
        }
        self.save_meta().await;
        self.emit(TaskState::Paused);
        tracing::info!(task = self.id, "paused");
    }

    /// Resume from `Paused` (or retry from `Failed`). Probes again first:
    /// if the server's validators changed, all progress is discarded and the
    /// download restarts from scratch.
    pub fn resume(self: &Arc<Self>) {
        if !self.try_transition(
            &[TaskState::Paused, TaskState::Failed],
            TaskState::Downloading,
        ) {
            return;
        }
        self.emit(TaskState::Downloading);

        let task = Arc::clone(self);
        if self
            .ctx
            .pool
            .submit(async move { task.run_resume().await })
            .is_err()
        {
            self.fail_deferred("worker pool is stopped");
        }
    }

    /// Cancel from any non-terminal state. Blocks are flagged and left in
    /// place — pool workers may still be inside them; they unwind on their
    /// own. The destination file and the resume record are deleted.
    pub async fn cancel(&self) {
        let cancellable = [
            TaskState::Queued,
            TaskState::Downloading,
            TaskState::Paused,
            TaskState::Failed,
        ];
        if !self.try_transition(&cancellable, TaskState::Cancelled) {
            return;
        }

        let (blocks, file_path, meta_path) = {
            let mut inner = self.inner.lock().unwrap();
            inner.error_message.clear();
            (
                inner.blocks.clone(),
                inner.file_path.clone(),
                inner.meta_path.clone(),
            )
        };
        for block in &blocks {
            block.pause();
        }

        let _ = tokio::fs::remove_file(&file_path).await;
        metadata::remove(&meta_path).await;
        self.emit(TaskState::Cancelled);
        tracing::info!(task = self.id, "cancelled");
    }

    // ── Orchestration ──────────────────────────────────────────

    async fn run_start(self: Arc<Self>) {
        if let Err(e) = self.prepare_fresh().await {
            self.handle_orchestration_failure(e).await;
        }
    }

    async fn run_resume(self: Arc<Self>) {
        if let Err(e) = self.prepare_resume().await {
            self.handle_orchestration_failure(e).await;
        }
    }

    /// Probe, resolve the final file name, then allocate/split/submit.
    async fn prepare_fresh(self: &Arc<Self>) -> Result<()> {
        let url = self.inner.lock().unwrap().url.clone();
        let fetcher = HttpFetcher::new(self.http_config.clone())?;
        let info = fetcher.probe(&url).await?;
        tracing::info!(
            task = self.id,
            size = info.content_length,
            ranges = info.accept_ranges,
            content_type = %info.content_type,
            final_url = %info.final_url,
            "probe finished"
        );

        // A pause or cancel that raced the probe wins.
        if self.state() != TaskState::Downloading {
            return Ok(());
        }

        let url_derived_name = {
            let mut inner = self.inner.lock().unwrap();
            inner.file_size = if info.content_length > 0 {
                info.content_length
            } else {
                -1
            };
            inner.accept_ranges = info.accept_ranges && inner.file_size > 0;
            inner.etag = info.etag.clone();
            inner.last_modified = info.last_modified.clone();
            if !info.final_url.is_empty() {
                inner.url = info.final_url.clone();
            }
            inner.file_name.clone()
        };

        // File name preference: Content-Disposition, then the post-redirect
        // URL, then the name derived from the original URL.
        let mut name = url_derived_name;
        if let Some(cd_name) = utils::parse_content_disposition(&info.content_disposition) {
            name = cd_name;
        } else if !info.final_url.is_empty() {
            let redirected = utils::file_name_from_url(&info.final_url);
            if redirected != "download" {
                name = redirected;
            }
        }
        let name = utils::resolve_collision(&self.save_dir, &name);
        {
            let mut inner = self.inner.lock().unwrap();
            inner.file_name = name.clone();
            inner.file_path = self.save_dir.join(&name);
            inner.meta_path = metadata::meta_path(&inner.file_path);
        }

        self.arm_blocks().await
    }

    async fn prepare_resume(self: &Arc<Self>) -> Result<()> {
        let (url, old_etag, old_last_modified, meta_path) = {
            let inner = self.inner.lock().unwrap();
            (
                inner.url.clone(),
                inner.etag.clone(),
                inner.last_modified.clone(),
                inner.meta_path.clone(),
            )
        };

        let fetcher = HttpFetcher::new(self.http_config.clone())?;
        let info = fetcher.probe(&url).await?;

        if self.state() != TaskState::Downloading {
            return Ok(());
        }

        // Either validator disagreeing means the server's bytes changed.
        let server_changed = (!old_etag.is_empty()
            && !info.etag.is_empty()
            && old_etag != info.etag)
            || (!old_last_modified.is_empty()
                && !info.last_modified.is_empty()
                && old_last_modified != info.last_modified);

        if server_changed {
            tracing::warn!(task = self.id, "server file changed, discarding progress");
            {
                let mut inner = self.inner.lock().unwrap();
                // No worker is running while Paused/Failed, safe to drop.
                inner.blocks.clear();
                inner.file_size = if info.content_length > 0 {
                    info.content_length
                } else {
                    -1
                };
                inner.accept_ranges = info.accept_ranges && inner.file_size > 0;
                inner.etag = info.etag;
                inner.last_modified = info.last_modified;
            }
            return self.arm_blocks().await;
        }

        let Some(meta) = metadata::load(&meta_path).await else {
            // Resume record vanished or rotted: start over.
            tracing::warn!(task = self.id, "resume record unusable, starting fresh");
            return self.prepare_fresh().await;
        };
        if meta.blocks.is_empty() {
            return self.prepare_fresh().await;
        }

        let already_downloaded: i64 = meta.blocks.iter().map(|b| b.downloaded).sum();
        let blocks = self.build_blocks(meta.blocks)?;
        let total = {
            let mut inner = self.inner.lock().unwrap();
            inner.blocks = blocks;
            inner.finishing = false;
            inner.file_size
        };
        self.progress.reset(total.max(0));
        self.progress.add_bytes(already_downloaded);
        self.submit_blocks();
        Ok(())
    }

    /// Allocate the destination, split into blocks, persist the record, then
    /// hand every block to the pool. The record hits disk before the first
    /// block write, so a crash can never observe stale block ranges.
    async fn arm_blocks(self: &Arc<Self>) -> Result<()> {
        self.allocate_file().await?;

        let records = {
            let inner = self.inner.lock().unwrap();
            if inner.file_size > 0 {
                splitter::split_blocks(inner.file_size, self.max_blocks, inner.accept_ranges)?
            } else {
                // Size unknown: one open-ended block, no preallocation.
                vec![BlockRecord {
                    block_id: 0,
                    range_start: -1,
                    range_end: -1,
                    downloaded: 0,
                    completed: false,
                }]
            }
        };

        let blocks = self.build_blocks(records)?;
        let total = {
            let mut inner = self.inner.lock().unwrap();
            inner.blocks = blocks;
            inner.finishing = false;
            inner.file_size
        };
        self.progress.reset(total.max(0));
        self.save_meta().await;
        self.submit_blocks();
        Ok(())
    }

    async fn allocate_file(&self) -> Result<()> {
        let (file_path, file_size) = {
            let inner = self.inner.lock().unwrap();
            (inner.file_path.clone(), inner.file_size)
        };

        if let Some(parent) = file_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        if file_size > 0 {
            // Full-size allocation up front: every range write lands at its
            // final offset.
            let file = tokio::fs::File::create(&file_path).await?;
            file.set_len(file_size as u64).await?;
        }
        Ok(())
    }

    fn build_blocks(self: &Arc<Self>, records: Vec<BlockRecord>) -> Result<Vec<Arc<Block>>> {
        let (url, file_path) = {
            let inner = self.inner.lock().unwrap();
            (inner.url.clone(), inner.file_path.clone())
        };

        // Blocks get a weak handle so a removed task can actually drop.
        let weak = Arc::downgrade(self);
        let on_progress: BlockProgressFn = Arc::new(move |block_id, delta| {
            if let Some(task) = weak.upgrade() {
                task.on_block_progress(block_id, delta);
            }
        });

        records
            .into_iter()
            .map(|record| {
                let fetcher = HttpFetcher::new(self.http_config.clone())?;
                Ok(Arc::new(Block::new(
                    record,
                    url.clone(),
                    file_path.clone(),
                    fetcher,
                    Arc::clone(&self.ctx.limiter),
                    Arc::clone(&on_progress),
                )))
            })
            .collect()
    }

    fn submit_blocks(self: &Arc<Self>) {
        // A pause that raced block construction could not flag these blocks;
        // it wins, and they must not start.
        if self.state() != TaskState::Downloading {
            return;
        }

        let pending: Vec<Arc<Block>> = {
            let mut inner = self.inner.lock().unwrap();
            let pending: Vec<_> = inner
                .blocks
                .iter()
                .filter(|b| !b.is_completed())
                .cloned()
                .collect();
            inner.outstanding = pending.len();
            pending
        };

        if pending.is_empty() {
            // Every block was already complete in the resume record; jump
            // straight to completion.
            self.schedule_finish();
            return;
        }

        for block in pending {
            let task = Arc::clone(self);
            let job_block = Arc::clone(&block);
            let submitted = self.ctx.pool.submit(async move {
                let result = job_block.run().await;
                task.on_block_finished(result);
            });
            if submitted.is_err() {
                self.on_block_finished(Err(DownloadError::PoolStopped));
            }
        }
    }

    // ── Progress & completion ──────────────────────────────────

    /// Called by blocks for every written chunk (`delta > 0`) and once on
    /// completion (`delta == 0`).
    fn on_block_progress(self: &Arc<Self>, _block_id: u32, delta: i64) {
        if self.state() == TaskState::Cancelled {
            return;
        }
        if delta > 0 {
            self.progress.add_bytes(delta);
            return;
        }

        let all_done = {
            let inner = self.inner.lock().unwrap();
            !inner.blocks.is_empty() && inner.blocks.iter().all(|b| b.is_completed())
        };
        if all_done && self.state() == TaskState::Downloading {
            self.schedule_finish();
        }
    }

    fn schedule_finish(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.finishing {
                return;
            }
            inner.finishing = true;
        }
        let task = Arc::clone(self);
        if self
            .ctx
            .pool
            .submit(async move { task.finish().await })
            .is_err()
        {
            self.fail("worker pool is stopped".to_string());
        }
    }

    /// Every block has returned. Errors are aggregated here: if the task is
    /// still nominally downloading but some block gave up, it failed.
    fn on_block_finished(&self, result: Result<()>) {
        let all_returned = {
            let mut inner = self.inner.lock().unwrap();
            if let Err(e) = &result {
                inner.error_message = e.to_string();
            }
            inner.outstanding = inner.outstanding.saturating_sub(1);
            inner.outstanding == 0
        };
        if !all_returned {
            return;
        }

        let failed = {
            let inner = self.inner.lock().unwrap();
            !inner.blocks.iter().all(|b| b.is_completed()) && !inner.finishing
        };
        if failed && self.state() == TaskState::Downloading {
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.error_message.is_empty() {
                    inner.error_message = "not all blocks completed".to_string();
                }
            }
            tracing::error!(task = self.id, "download failed");
            if self.try_transition(&[TaskState::Downloading], TaskState::Failed) {
                self.emit(TaskState::Failed);
            }
        }
    }

    /// Verify size, mark completed, sort the file into its category and drop
    /// the resume record.
    async fn finish(self: Arc<Self>) {
        let (file_path, file_name, file_size, meta_path) = {
            let inner = self.inner.lock().unwrap();
            (
                inner.file_path.clone(),
                inner.file_name.clone(),
                inner.file_size,
                inner.meta_path.clone(),
            )
        };

        if file_size > 0 {
            let actual = match tokio::fs::metadata(&file_path).await {
                Ok(md) => md.len() as i64,
                Err(e) => {
                    self.fail(format!("completed file unreadable: {e}"));
                    return;
                }
            };
            if actual != file_size {
                self.fail(
                    DownloadError::Integrity {
                        expected: file_size,
                        actual,
                    }
                    .to_string(),
                );
                return;
            }
        }

        if !self.try_transition(&[TaskState::Downloading], TaskState::Completed) {
            return;
        }
        self.inner.lock().unwrap().error_message.clear();
        self.emit(TaskState::Completed);

        // Best-effort categorization; a failed move leaves the file in the
        // save directory.
        let category = self.ctx.categorizer.classify(&file_name);
        if !category.is_empty()
            && self
                .ctx
                .categorizer
                .move_to_category(&file_path, &self.save_dir)
        {
            let mut inner = self.inner.lock().unwrap();
            inner.file_path = self.save_dir.join(&category).join(&file_name);
        }

        metadata::remove(&meta_path).await;
        tracing::info!(task = self.id, file = %file_name, "download completed");
    }

    // ── Failure handling ───────────────────────────────────────

    /// Probe/setup failures: auto-restart transient ones a few times before
    /// giving up. Cancellation during the restart delay wins.
    async fn handle_orchestration_failure(self: &Arc<Self>, error: DownloadError) {
        if matches!(error, DownloadError::Cancelled)
            || matches!(self.state(), TaskState::Cancelled | TaskState::Paused)
        {
            return;
        }

        let message = error.to_string();
        tracing::error!(task = self.id, error = %message, "task setup failed");

        let retry_attempt = {
            let mut inner = self.inner.lock().unwrap();
            inner.error_message = message;
            if error.is_retryable() && inner.auto_retries < MAX_AUTO_RETRIES {
                inner.auto_retries += 1;
                Some(inner.auto_retries)
            } else {
                None
            }
        };

        let Some(attempt) = retry_attempt else {
            if self.try_transition(
                &[TaskState::Downloading, TaskState::Queued],
                TaskState::Failed,
            ) {
                self.emit(TaskState::Failed);
            }
            return;
        };

        // Quietly back to Queued so start() accepts the restart; no callback,
        // the queue still counts this task against its cap.
        {
            let mut state = self.state.lock().unwrap();
            if *state != TaskState::Downloading {
                return;
            }
            *state = TaskState::Queued;
        }

        tracing::info!(
            task = self.id,
            attempt,
            max = MAX_AUTO_RETRIES,
            "auto-restarting after transient failure"
        );
        let delay = Duration::from_secs(2 * attempt as u64);
        let step = Duration::from_millis(100);
        let mut waited = Duration::ZERO;
        while waited < delay {
            tokio::time::sleep(step).await;
            waited += step;
            if self.state() == TaskState::Cancelled {
                return;
            }
        }
        self.start();
    }

    fn fail(&self, message: String) {
        self.inner.lock().unwrap().error_message = message;
        let from = [TaskState::Queued, TaskState::Downloading, TaskState::Paused];
        if self.try_transition(&from, TaskState::Failed) {
            self.emit(TaskState::Failed);
        }
    }

    /// Fail from a context that may hold the queue lock (admission calls
    /// `start()` under it): the state-change callback re-enters the queue, so
    /// it must run on a fresh task.
    fn fail_deferred(self: &Arc<Self>, message: &str) {
        let task = Arc::clone(self);
        let message = message.to_string();
        tokio::spawn(async move { task.fail(message) });
    }

    // ── Persistence & state plumbing ───────────────────────────

    async fn save_meta(&self) {
        let (meta, path) = {
            let inner = self.inner.lock().unwrap();
            (
                TaskMeta {
                    url: inner.url.clone(),
                    file_path: inner.file_path.to_string_lossy().into_owned(),
                    file_name: inner.file_name.clone(),
                    file_size: inner.file_size,
                    etag: inner.etag.clone(),
                    last_modified: inner.last_modified.clone(),
                    max_blocks: self.max_blocks,
                    blocks: inner.blocks.iter().map(|b| b.record()).collect(),
                },
                inner.meta_path.clone(),
            )
        };
        if let Err(e) = metadata::save(&path, &meta).await {
            tracing::warn!(task = self.id, error = %e, "failed to persist resume record");
        }
    }

    fn try_transition(&self, from: &[TaskState], to: TaskState) -> bool {
        let mut state = self.state.lock().unwrap();
        if !from.contains(&*state) {
            return false;
        }
        *state = to;
        true
    }

    fn emit(&self, state: TaskState) {
        (self.on_state_change)(self.id, state);
    }
}
