//! Public facade of the download engine.
//!
//! The manager owns every subsystem — worker pool, rate limiter, queue and
//! categorizer — wires task state changes back into queue admission, and
//! exposes the id-based control surface (`add`, `pause`, `resume`, `cancel`,
//! `remove`, reordering, config updates, recovery).
//!
//! Public methods never fail on an unknown id; they are silent no-ops.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::classifier::{Categorize, FileClassifier};
use crate::config::{HttpConfig, ManagerConfig};
use crate::limiter::TokenBucket;
use crate::pool::WorkerPool;
use crate::queue::TaskQueue;
use crate::task::{StateCallback, Task, TaskContext, TaskInfo, TaskState};

pub struct DownloadManager {
    config: Mutex<ManagerConfig>,
    pool: Arc<WorkerPool>,
    limiter: Arc<TokenBucket>,
    queue: Arc<TaskQueue>,
    categorizer: Arc<dyn Categorize>,
    /// Set when the built-in classifier is in use, so rule updates apply.
    file_classifier: Option<Arc<FileClassifier>>,
    tasks_by_id: Mutex<HashMap<u64, Arc<Task>>>,
    next_task_id: AtomicU64,
}

impl DownloadManager {
    /// Build an engine with the rule-based [`FileClassifier`]. Must be
    /// called inside a tokio runtime (the worker pool spawns immediately).
    pub fn new(config: ManagerConfig) -> Self {
        let classifier = Arc::new(FileClassifier::with_rules(
            config.classification_rules.clone(),
        ));
        Self::build(config, Arc::clone(&classifier) as Arc<dyn Categorize>, Some(classifier))
    }

    /// Build an engine with a caller-supplied categorizer (tests typically
    /// pass [`NoopCategorizer`](crate::classifier::NoopCategorizer)).
    pub fn with_categorizer(config: ManagerConfig, categorizer: Arc<dyn Categorize>) -> Self {
        Self::build(config, categorizer, None)
    }

    fn build(
        config: ManagerConfig,
        categorizer: Arc<dyn Categorize>,
        file_classifier: Option<Arc<FileClassifier>>,
    ) -> Self {
        let config = config.clamped();

        if let Err(e) = std::fs::create_dir_all(&config.default_save_dir) {
            tracing::warn!(dir = %config.default_save_dir.display(), error = %e,
                "could not create save directory");
        }

        Self {
            pool: Arc::new(WorkerPool::new(config.thread_pool_size)),
            limiter: Arc::new(TokenBucket::new(config.speed_limit)),
            queue: Arc::new(TaskQueue::new(config.max_concurrent_tasks as usize)),
            categorizer,
            file_classifier,
            tasks_by_id: Mutex::new(HashMap::new()),
            next_task_id: AtomicU64::new(1),
            config: Mutex::new(config),
        }
    }

    /// Queue a new download and return its task id.
    ///
    /// A URL already being downloaded (any live state) is deduplicated: the
    /// existing task's id comes back instead of a second download. Finished,
    /// failed and cancelled tasks do not block re-adding.
    pub fn add(
        &self,
        url: &str,
        save_dir: Option<PathBuf>,
        referer: Option<String>,
        cookie: Option<String>,
    ) -> u64 {
        {
            let tasks = self.tasks_by_id.lock().unwrap();
            for (id, task) in tasks.iter() {
                let state = task.state();
                if task.info().url == url
                    && !matches!(
                        state,
                        TaskState::Completed | TaskState::Cancelled | TaskState::Failed
                    )
                {
                    tracing::info!(url, existing = id, "duplicate URL, reusing task");
                    return *id;
                }
            }
        }

        let (dir, max_blocks, http_config) = {
            let config = self.config.lock().unwrap();
            let dir = save_dir.unwrap_or_else(|| config.default_save_dir.clone());
            (dir, config.max_blocks_per_task, HttpConfig::default())
        };
        let http_config = HttpConfig {
            referer,
            cookie,
            ..http_config
        };

        let task_id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
        let task = Task::new(
            task_id,
            url.to_string(),
            dir,
            max_blocks,
            http_config,
            self.task_context(),
            self.state_callback(),
        );

        tracing::info!(task = task_id, url, "download added");
        self.tasks_by_id
            .lock()
            .unwrap()
            .insert(task_id, Arc::clone(&task));
        self.queue.add(task);
        task_id
    }

    pub async fn pause(&self, task_id: u64) {
        if let Some(task) = self.find(task_id) {
            task.pause().await;
        }
    }

    pub fn resume(&self, task_id: u64) {
        if let Some(task) = self.find(task_id) {
            task.resume();
        }
    }

    pub async fn cancel(&self, task_id: u64) {
        if let Some(task) = self.find(task_id) {
            task.cancel().await;
        }
    }

    /// Cancel a task and drop it from the queue and the id map.
    ///
    /// The local handle keeps the task alive past both removals, so pool
    /// workers that are still observing its pause flag unwind against a
    /// living task.
    pub async fn remove(&self, task_id: u64) {
        let kept_alive = self.find(task_id);

        self.queue.remove(task_id).await;
        self.tasks_by_id.lock().unwrap().remove(&task_id);

        drop(kept_alive);
    }

    pub fn move_up(&self, task_id: u64) -> bool {
        self.queue.move_up(task_id)
    }

    pub fn move_down(&self, task_id: u64) -> bool {
        self.queue.move_down(task_id)
    }

    /// Update the global bandwidth ceiling. 0 disables limiting.
    pub fn set_speed_limit(&self, bytes_per_sec: i64) {
        let limit = bytes_per_sec.max(0);
        self.limiter.set_rate(limit);
        self.config.lock().unwrap().speed_limit = limit;
    }

    /// Re-clamp and apply a new configuration to the queue cap, the rate
    /// limiter and the classification rules.
    pub fn update_config(&self, new_config: ManagerConfig) {
        let new_config = new_config.clamped();

        self.queue
            .set_max_concurrent(new_config.max_concurrent_tasks as usize);
        self.limiter.set_rate(new_config.speed_limit);
        if let Some(classifier) = &self.file_classifier {
            classifier.update_rules(new_config.classification_rules.clone());
        }

        let mut config = self.config.lock().unwrap();
        // The pool size is fixed at construction; keep the old value.
        let pool_size = config.thread_pool_size;
        *config = new_config;
        config.thread_pool_size = pool_size;
    }

    pub fn config(&self) -> ManagerConfig {
        self.config.lock().unwrap().clone()
    }

    /// Snapshot every task in queue order.
    pub fn all_tasks(&self) -> Vec<TaskInfo> {
        self.queue.all_snapshots()
    }

    pub fn task_info(&self, task_id: u64) -> Option<TaskInfo> {
        self.find(task_id).map(|t| t.info())
    }

    /// Scan the save directory for `*.meta` resume records and re-register
    /// each as a `Paused` task awaiting an explicit resume. Corrupt records
    /// are deleted. Returns the ids of the recovered tasks.
    pub async fn recover(&self) -> Vec<u64> {
        let dir = self.config.lock().unwrap().default_save_dir.clone();
        let mut recovered = Vec::new();

        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            return recovered;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("meta") {
                continue;
            }

            let task_id = self.next_task_id.fetch_add(1, Ordering::SeqCst);
            match Task::from_metadata(
                task_id,
                &path,
                HttpConfig::default(),
                self.task_context(),
                self.state_callback(),
            )
            .await
            {
                Some(task) => {
                    tracing::info!(task = task_id, record = %path.display(), "recovered download");
                    self.tasks_by_id
                        .lock()
                        .unwrap()
                        .insert(task_id, Arc::clone(&task));
                    self.queue.add(task);
                    recovered.push(task_id);
                }
                None => {
                    tracing::warn!(record = %path.display(), "deleting corrupt resume record");
                    crate::metadata::remove(&path).await;
                }
            }
        }

        recovered
    }

    /// Wake any rate-limited workers and stop the pool. Call before drop for
    /// a clean teardown.
    pub async fn shutdown(&self) {
        self.limiter.cancel();
        self.pool.shutdown().await;
    }

    fn find(&self, task_id: u64) -> Option<Arc<Task>> {
        self.tasks_by_id.lock().unwrap().get(&task_id).cloned()
    }

    fn task_context(&self) -> TaskContext {
        TaskContext {
            pool: Arc::clone(&self.pool),
            limiter: Arc::clone(&self.limiter),
            categorizer: Arc::clone(&self.categorizer),
        }
    }

    /// Terminal transitions free the task's admission slot. The callback
    /// holds the queue weakly: tasks must never keep the queue (and thereby
    /// each other) alive.
    fn state_callback(&self) -> StateCallback {
        let queue = Arc::downgrade(&self.queue);
        Arc::new(move |task_id, state| {
            if matches!(
                state,
                TaskState::Completed | TaskState::Failed | TaskState::Cancelled
            ) && let Some(queue) = queue.upgrade()
            {
                queue.on_task_finished(task_id);
            }
        })
    }
}
