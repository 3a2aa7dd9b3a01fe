//! Block worker: downloads one byte range of the target file.
//!
//! Each block owns its fetcher and streams the range
//! `[range_start + downloaded, range_end]`, so a paused or retried block
//! resumes exactly where it stopped and already-written bytes are never
//! fetched twice. Writes are unbuffered on purpose: the `downloaded` counter
//! must never run ahead of the bytes actually on disk.
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::error::{DownloadError, Result};
use crate::http::HttpFetcher;
use crate::limiter::TokenBucket;
use crate::metadata::BlockRecord;

/// Progress callback: `(block_id, bytes_delta)`. A delta of 0 signals that
/// the block just completed.
pub(crate) type BlockProgressFn = Arc<dyn Fn(u32, i64) + Send + Sync>;

/// One contiguous range in flight. Created fresh on every start/resume.
pub(crate) struct Block {
    record: Mutex<BlockRecord>,
    paused: AtomicBool,
    fetcher: HttpFetcher,
    url: String,
    file_path: PathBuf,
    limiter: Arc<TokenBucket>,
    on_progress: BlockProgressFn,
}

impl Block {
    pub(crate) fn new(
        record: BlockRecord,
        url: String,
        file_path: PathBuf,
        fetcher: HttpFetcher,
        limiter: Arc<TokenBucket>,
        on_progress: BlockProgressFn,
    ) -> Self {
        Self {
            record: Mutex::new(record),
            paused: AtomicBool::new(false),
            fetcher,
            url,
            file_path,
            limiter,
            on_progress,
        }
    }

    /// Request pause. The transfer loop observes the flag at the next chunk
    /// boundary; the fetcher cancellation interrupts a blocked socket read.
    pub(crate) fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
        self.fetcher.cancel();
    }

    /// Snapshot of the current range state, taken under the record lock.
    pub(crate) fn record(&self) -> BlockRecord {
        self.record.lock().unwrap().clone()
    }

    pub(crate) fn is_completed(&self) -> bool {
        self.record.lock().unwrap().completed
    }

    /// Run the transfer to completion, retrying transient failures with
    /// backoff. Returns `Ok(())` both on completion and on a pause/cancel
    /// abort — the latter leaves `completed` unset, which is how the owning
    /// task tells the two apart.
    pub(crate) async fn run(&self) -> Result<()> {
        if self.is_completed() {
            return Ok(());
        }

        let max_attempts = self.fetcher.max_attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            if self.is_paused() {
                return Ok(());
            }

            match self.attempt().await {
                Ok(true) => {
                    let block_id = {
                        let mut record = self.record.lock().unwrap();
                        record.completed = true;
                        record.block_id
                    };
                    // 0-delta event lets the task notice all-blocks-done.
                    (self.on_progress)(block_id, 0);
                    return Ok(());
                }
                Ok(false) => return Ok(()), // paused mid-stream
                Err(e) => {
                    if self.is_paused() || matches!(e, DownloadError::Cancelled) {
                        return Ok(());
                    }
                    if !e.is_retryable() || attempt >= max_attempts {
                        return Err(e);
                    }
                    tracing::warn!(
                        block = self.record.lock().unwrap().block_id,
                        attempt,
                        error = %e,
                        "block transfer failed, retrying"
                    );
                    if self.fetcher.backoff_sleep(attempt).await.is_err() {
                        // Cancelled while backing off.
                        return Ok(());
                    }
                }
            }
        }
    }

    /// One transfer attempt. `Ok(true)` when the range was drained,
    /// `Ok(false)` when a pause aborted it.
    async fn attempt(&self) -> Result<bool> {
        let record = self.record.lock().unwrap().clone();
        let base = if record.is_open_ended() {
            0
        } else {
            record.range_start
        };
        let write_offset = base + record.downloaded;

        let request_start = if record.is_open_ended() {
            // Unknown total size: fetch the whole file, but pick up at the
            // current offset if a previous attempt made progress.
            if record.downloaded > 0 {
                record.downloaded
            } else {
                -1
            }
        } else {
            record.range_start + record.downloaded
        };

        let mut response = self
            .fetcher
            .request_range(&self.url, request_start, record.range_end)
            .await?;

        // A mid-file resume needs partial content; a server that answers a
        // range request with the whole file would corrupt the resume offset.
        if request_start > 0 && response.status().as_u16() != 206 {
            return Err(DownloadError::Transfer {
                message: "server ignored the range request".to_string(),
                status: response.status().as_u16(),
                retryable: false,
            });
        }

        // Known-size files were preallocated; the unknown-size single block
        // creates its destination on first write.
        let mut file = OpenOptions::new()
            .write(true)
            .create(record.is_open_ended())
            .open(&self.file_path)
            .await?;
        file.seek(SeekFrom::Start(write_offset as u64)).await?;

        while let Some(chunk) = self.fetcher.next_chunk(&mut response).await? {
            if chunk.is_empty() {
                continue;
            }
            let mut position = 0;
            while position < chunk.len() {
                if self.is_paused() {
                    file.flush().await?;
                    return Ok(false);
                }

                let wanted = (chunk.len() - position) as i64;
                let granted = self.limiter.acquire(wanted).await;
                if granted == 0 {
                    // Limiter cancelled: the engine is shutting down.
                    file.flush().await?;
                    return Ok(false);
                }
                let granted = granted.min(wanted) as usize;

                file.write_all(&chunk[position..position + granted]).await?;
                position += granted;

                let block_id = {
                    let mut record = self.record.lock().unwrap();
                    record.downloaded += granted as i64;
                    record.block_id
                };
                (self.on_progress)(block_id, granted as i64);
            }
        }

        file.flush().await?;
        Ok(!self.is_paused())
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }
}
