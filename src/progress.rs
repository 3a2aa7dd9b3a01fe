//! Per-task progress accounting with sliding-window speed.
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Width of the speed-measurement window.
const WINDOW: Duration = Duration::from_secs(5);

/// Snapshot of a task's progress. Produced on demand; never mutated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressInfo {
    pub total_bytes: i64,
    pub downloaded_bytes: i64,
    /// Percent in `[0, 100]`; 0 when the total is unknown.
    pub progress_percent: f64,
    /// Bytes/sec over the last five seconds; 0 until enough samples exist.
    pub speed_bytes_per_sec: f64,
    /// Estimated seconds to completion; -1 when it cannot be computed.
    pub remaining_seconds: i64,
}

/// Accumulates byte deltas and answers speed/ETA queries.
pub struct ProgressTracker {
    state: Mutex<TrackerState>,
}

struct TrackerState {
    total: i64,
    downloaded: i64,
    /// (sample time, cumulative bytes at that time)
    samples: VecDeque<(Instant, i64)>,
}

impl ProgressTracker {
    /// `total_bytes` of 0 means "unknown" — percent stays 0 and the ETA -1.
    pub fn new(total_bytes: i64) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                total: total_bytes.max(0),
                downloaded: 0,
                samples: VecDeque::new(),
            }),
        }
    }

    /// Forget everything and start over with a new total. Used when a resume
    /// discovers the server's file changed.
    pub fn reset(&self, total_bytes: i64) {
        let mut state = self.state.lock().unwrap();
        state.total = total_bytes.max(0);
        state.downloaded = 0;
        state.samples.clear();
    }

    /// Record `delta` freshly downloaded bytes.
    pub fn add_bytes(&self, delta: i64) {
        if delta <= 0 {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.downloaded += delta;
        let cumulative = state.downloaded;
        state.samples.push_back((Instant::now(), cumulative));
    }

    /// Current progress, speed and ETA.
    pub fn snapshot(&self) -> ProgressInfo {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();

        while let Some(&(time, _)) = state.samples.front() {
            if now.duration_since(time) > WINDOW {
                state.samples.pop_front();
            } else {
                break;
            }
        }

        let mut info = ProgressInfo {
            total_bytes: state.total,
            downloaded_bytes: state.downloaded,
            remaining_seconds: -1,
            ..Default::default()
        };

        if state.total > 0 {
            info.progress_percent =
                (state.downloaded as f64 / state.total as f64 * 100.0).min(100.0);
        }

        if state.samples.len() >= 2 {
            let (oldest_time, oldest_bytes) = *state.samples.front().unwrap();
            let (newest_time, newest_bytes) = *state.samples.back().unwrap();
            let elapsed = newest_time.duration_since(oldest_time).as_secs_f64();
            if elapsed > 0.0 {
                info.speed_bytes_per_sec = (newest_bytes - oldest_bytes) as f64 / elapsed;
            }
        }

        if info.speed_bytes_per_sec > 0.0 && state.total > 0 {
            let remaining = (state.total - state.downloaded) as f64;
            info.remaining_seconds = (remaining / info.speed_bytes_per_sec) as i64;
        }

        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_accumulate() {
        let tracker = ProgressTracker::new(1000);
        tracker.add_bytes(100);
        tracker.add_bytes(250);
        tracker.add_bytes(0); // ignored
        tracker.add_bytes(-5); // ignored

        let info = tracker.snapshot();
        assert_eq!(info.downloaded_bytes, 350);
        assert_eq!(info.total_bytes, 1000);
        assert!((info.progress_percent - 35.0).abs() < f64::EPSILON);
    }

    #[test]
    fn percent_is_bounded() {
        let tracker = ProgressTracker::new(100);
        tracker.add_bytes(150);
        assert!((tracker.snapshot().progress_percent - 100.0).abs() < f64::EPSILON);

        let unknown = ProgressTracker::new(0);
        unknown.add_bytes(150);
        assert_eq!(unknown.snapshot().progress_percent, 0.0);
    }

    #[test]
    fn speed_needs_at_least_two_samples() {
        let tracker = ProgressTracker::new(1000);
        assert_eq!(tracker.snapshot().speed_bytes_per_sec, 0.0);
        assert_eq!(tracker.snapshot().remaining_seconds, -1);

        tracker.add_bytes(10);
        assert_eq!(tracker.snapshot().speed_bytes_per_sec, 0.0);
    }

    #[test]
    fn speed_and_eta_emerge_from_spaced_samples() {
        let tracker = ProgressTracker::new(10_000);
        tracker.add_bytes(1000);
        std::thread::sleep(Duration::from_millis(120));
        tracker.add_bytes(1000);

        let info = tracker.snapshot();
        assert!(info.speed_bytes_per_sec > 0.0);
        assert!(info.remaining_seconds >= 0);
    }

    #[test]
    fn reset_discards_history() {
        let tracker = ProgressTracker::new(1000);
        tracker.add_bytes(500);
        tracker.reset(2000);

        let info = tracker.snapshot();
        assert_eq!(info.downloaded_bytes, 0);
        assert_eq!(info.total_bytes, 2000);
        assert_eq!(info.progress_percent, 0.0);
    }
}
