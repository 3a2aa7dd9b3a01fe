//! Ordered task queue with an admission cap.
//!
//! Tasks enter in submission order; at most `max_concurrent` of them run at
//! once. The queue tracks `active_count` itself and admits the next `Queued`
//! task whenever a slot frees up (task finished, task removed, cap raised).
use std::sync::{Arc, Mutex};

use crate::task::{Task, TaskInfo, TaskState};

/// Admission cap bounds.
const MIN_CONCURRENT: usize = 1;
const MAX_CONCURRENT: usize = 10;

pub struct TaskQueue {
    inner: Mutex<QueueInner>,
}

struct QueueInner {
    tasks: Vec<Arc<Task>>,
    active_count: usize,
    max_concurrent: usize,
    /// Disabled in tests that must not hit the network.
    auto_start: bool,
}

impl TaskQueue {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                tasks: Vec::new(),
                active_count: 0,
                max_concurrent: max_concurrent.clamp(MIN_CONCURRENT, MAX_CONCURRENT),
                auto_start: true,
            }),
        }
    }

    /// Append a task; start it right away if a slot is free.
    pub fn add(&self, task: Arc<Task>) {
        let mut inner = self.inner.lock().unwrap();
        inner.tasks.push(task);
        Self::try_start_next(&mut inner);
    }

    /// Remove a task by id and cancel it. Returns whether it was found.
    ///
    /// The cancel runs after the queue lock is released: cancellation fires
    /// the state-change callback, which re-enters the queue.
    pub async fn remove(&self, task_id: u64) -> bool {
        let task = {
            let mut inner = self.inner.lock().unwrap();
            let Some(index) = inner.tasks.iter().position(|t| t.id() == task_id) else {
                return false;
            };
            let task = inner.tasks.remove(index);
            if task.state() == TaskState::Downloading {
                inner.active_count = inner.active_count.saturating_sub(1);
            }
            Self::try_start_next(&mut inner);
            task
        };
        task.cancel().await;
        true
    }

    /// Swap the task with its predecessor. False at the front or if missing.
    pub fn move_up(&self, task_id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.tasks.iter().position(|t| t.id() == task_id) {
            Some(index) if index > 0 => {
                inner.tasks.swap(index, index - 1);
                true
            }
            _ => false,
        }
    }

    /// Swap the task with its successor. False at the back or if missing.
    pub fn move_down(&self, task_id: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let last = inner.tasks.len().saturating_sub(1);
        match inner.tasks.iter().position(|t| t.id() == task_id) {
            Some(index) if index < last => {
                inner.tasks.swap(index, index + 1);
                true
            }
            _ => false,
        }
    }

    /// A task reached a terminal state: free its slot and admit the next.
    ///
    /// Only counts tasks still present — if `remove` already took this one
    /// out, it also already decremented, and decrementing again would leak
    /// an admission slot.
    pub fn on_task_finished(&self, task_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.tasks.iter().any(|t| t.id() == task_id) {
            return;
        }
        inner.active_count = inner.active_count.saturating_sub(1);
        Self::try_start_next(&mut inner);
    }

    /// Change the admission cap (clamped to `[1, 10]`); a raise admits
    /// waiting tasks immediately.
    pub fn set_max_concurrent(&self, max: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.max_concurrent = max.clamp(MIN_CONCURRENT, MAX_CONCURRENT);
        Self::try_start_next(&mut inner);
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.lock().unwrap().max_concurrent
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().active_count
    }

    /// Turn automatic admission off (for tests driving tasks manually).
    pub fn set_auto_start(&self, enabled: bool) {
        let mut inner = self.inner.lock().unwrap();
        inner.auto_start = enabled;
        if enabled {
            Self::try_start_next(&mut inner);
        }
    }

    /// Snapshot every task in queue order.
    pub fn all_snapshots(&self) -> Vec<TaskInfo> {
        let inner = self.inner.lock().unwrap();
        inner.tasks.iter().map(|t| t.info()).collect()
    }

    /// Admission: walk the queue in order, starting `Queued` tasks while
    /// slots remain. Caller must hold the queue lock.
    fn try_start_next(inner: &mut QueueInner) {
        if !inner.auto_start {
            return;
        }
        for task in &inner.tasks {
            if inner.active_count >= inner.max_concurrent {
                break;
            }
            if task.state() == TaskState::Queued {
                task.start();
                inner.active_count += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::NoopCategorizer;
    use crate::config::HttpConfig;
    use crate::limiter::TokenBucket;
    use crate::pool::WorkerPool;
    use crate::task::TaskContext;
    use std::path::PathBuf;

    fn make_task(id: u64) -> Arc<Task> {
        Task::new(
            id,
            format!("https://example.com/file-{id}.bin"),
            PathBuf::from("/tmp"),
            4,
            HttpConfig::default(),
            TaskContext {
                pool: Arc::new(WorkerPool::new(1)),
                limiter: Arc::new(TokenBucket::new(0)),
                categorizer: Arc::new(NoopCategorizer),
            },
            Arc::new(|_, _| {}),
        )
    }

    fn queue_without_auto_start(cap: usize) -> TaskQueue {
        let queue = TaskQueue::new(cap);
        queue.set_auto_start(false);
        queue
    }

    fn order(queue: &TaskQueue) -> Vec<u64> {
        queue.all_snapshots().iter().map(|i| i.task_id).collect()
    }

    #[tokio::test]
    async fn cap_is_clamped() {
        assert_eq!(TaskQueue::new(0).max_concurrent(), 1);
        assert_eq!(TaskQueue::new(99).max_concurrent(), 10);

        let queue = TaskQueue::new(3);
        queue.set_max_concurrent(0);
        assert_eq!(queue.max_concurrent(), 1);
        queue.set_max_concurrent(50);
        assert_eq!(queue.max_concurrent(), 10);
    }

    #[tokio::test]
    async fn reordering_matches_the_expected_permutation() {
        let queue = queue_without_auto_start(3);
        for id in [1, 2, 3] {
            queue.add(make_task(id));
        }
        assert_eq!(order(&queue), vec![1, 2, 3]);

        assert!(queue.move_up(2));
        assert_eq!(order(&queue), vec![2, 1, 3]);

        assert!(queue.move_down(1));
        assert_eq!(order(&queue), vec![2, 3, 1]);

        assert!(queue.move_up(1));
        assert_eq!(order(&queue), vec![2, 1, 3]);
    }

    #[tokio::test]
    async fn endpoint_moves_return_false() {
        let queue = queue_without_auto_start(3);
        for id in [1, 2, 3] {
            queue.add(make_task(id));
        }

        assert!(!queue.move_up(1));
        assert!(!queue.move_down(3));
        assert!(!queue.move_up(42));
        assert!(!queue.move_down(42));
        assert_eq!(order(&queue), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn remove_reports_presence_and_cancels() {
        let queue = queue_without_auto_start(3);
        let task = make_task(1);
        queue.add(Arc::clone(&task));
        queue.add(make_task(2));

        assert!(queue.remove(1).await);
        assert_eq!(order(&queue), vec![2]);
        assert_eq!(task.state(), TaskState::Cancelled);
        assert!(!queue.is_empty());

        assert!(!queue.remove(1).await);
    }

    #[tokio::test]
    async fn on_task_finished_ignores_removed_tasks() {
        let queue = queue_without_auto_start(2);
        queue.add(make_task(1));

        // Task 1 was never active and is then removed; a late finished
        // notification must not underflow or admit anything.
        queue.remove(1).await;
        queue.on_task_finished(1);
        assert_eq!(queue.active_count(), 0);
    }

    #[tokio::test]
    async fn active_count_matches_downloading_tasks_without_auto_start() {
        let queue = queue_without_auto_start(5);
        for id in [1, 2, 3] {
            queue.add(make_task(id));
        }
        let downloading = queue
            .all_snapshots()
            .iter()
            .filter(|i| i.state == TaskState::Downloading)
            .count();
        assert_eq!(queue.active_count(), downloading);
        assert_eq!(queue.len(), 3);
    }
}
