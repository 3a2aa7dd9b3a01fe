//! Fixed-size worker pool for download jobs.
//!
//! Both task orchestration (probe, split, submit) and individual block
//! transfers run as jobs on this pool, so the number of simultaneously
//! executing jobs — not just connections — is bounded. Jobs are consumed in
//! FIFO order from a shared queue.
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};

use futures_util::FutureExt;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{DownloadError, Result};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Bounded group of workers executing submitted futures.
pub struct WorkerPool {
    sender: StdMutex<Option<mpsc::UnboundedSender<Job>>>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
    size: usize,
}

/// Handle to a submitted job; resolves to the job's output.
pub struct JobHandle<T> {
    receiver: oneshot::Receiver<std::thread::Result<T>>,
}

impl<T> JobHandle<T> {
    /// Wait for the job to finish.
    ///
    /// # Errors
    ///
    /// [`DownloadError::JobPanicked`] if the job panicked, or
    /// [`DownloadError::PoolStopped`] if the pool shut down before the job
    /// ran to completion.
    pub async fn join(self) -> Result<T> {
        match self.receiver.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(panic)) => Err(DownloadError::JobPanicked(panic_message(&panic))),
            Err(_) => Err(DownloadError::PoolStopped),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl WorkerPool {
    /// Spawn a pool of `size` workers. Must be called inside a tokio runtime.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::unbounded_channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size)
            .map(|_| {
                let receiver = Arc::clone(&receiver);
                tokio::spawn(async move {
                    loop {
                        // The receiver lock is held only while dequeuing; idle
                        // workers queue up on the lock, not on the job.
                        let job = { receiver.lock().await.recv().await };
                        match job {
                            Some(job) => job.await,
                            None => break,
                        }
                    }
                })
            })
            .collect();

        Self {
            sender: StdMutex::new(Some(sender)),
            workers: StdMutex::new(workers),
            size,
        }
    }

    /// Enqueue a future for execution and return a handle to its result.
    ///
    /// # Errors
    ///
    /// [`DownloadError::PoolStopped`] when called after [`shutdown`].
    ///
    /// [`shutdown`]: WorkerPool::shutdown
    pub fn submit<F, T>(&self, future: F) -> Result<JobHandle<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            // A panicking job must not take its worker down with it; the
            // panic is forwarded to whoever holds the handle.
            let outcome = AssertUnwindSafe(future).catch_unwind().await;
            let _ = done_tx.send(outcome);
        });

        let guard = self.sender.lock().unwrap();
        match guard.as_ref() {
            Some(sender) => sender
                .send(job)
                .map_err(|_| DownloadError::PoolStopped)
                .map(|()| JobHandle { receiver: done_rx }),
            None => Err(DownloadError::PoolStopped),
        }
    }

    /// Number of workers.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Stop accepting jobs, drain the queue and join every worker.
    pub async fn shutdown(&self) {
        // Closing the channel lets workers finish queued jobs, then exit.
        self.sender.lock().unwrap().take();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn jobs_run_and_return_their_results() {
        let pool = WorkerPool::new(4);
        assert_eq!(pool.size(), 4);
        let handle = pool.submit(async { 21 * 2 }).unwrap();
        assert_eq!(handle.join().await.unwrap(), 42);
        pool.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn jobs_execute_concurrently() {
        let pool = WorkerPool::new(4);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(
                pool.submit(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .unwrap(),
            );
        }
        for handle in handles {
            handle.join().await.unwrap();
        }

        assert!(
            peak.load(Ordering::SeqCst) > 1,
            "expected overlapping execution, peak was {}",
            peak.load(Ordering::SeqCst)
        );
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn a_panicking_job_surfaces_through_its_handle() {
        let pool = WorkerPool::new(2);
        let handle = pool
            .submit(async {
                panic!("boom");
            })
            .unwrap();

        match handle.join().await {
            Err(DownloadError::JobPanicked(message)) => assert!(message.contains("boom")),
            other => panic!("expected JobPanicked, got {other:?}"),
        }

        // The worker that ran the panicking job is still alive.
        let handle = pool.submit(async { 7 }).unwrap();
        assert_eq!(handle.join().await.unwrap(), 7);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn submitting_after_shutdown_fails() {
        let pool = WorkerPool::new(2);
        pool.shutdown().await;
        assert!(matches!(
            pool.submit(async {}),
            Err(DownloadError::PoolStopped)
        ));
    }

    #[tokio::test]
    async fn shutdown_drains_pending_jobs() {
        let pool = WorkerPool::new(1);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counter = Arc::clone(&counter);
            pool.submit(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown().await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }
}
