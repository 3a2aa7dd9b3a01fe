//! Error types shared across the download engine.
//!
//! Every public operation returns [`Result`]. Transport failures are folded
//! into [`DownloadError::Transfer`] together with the HTTP status (0 when the
//! request never produced one) and a retryability verdict, which drives both
//! the per-transfer retry loop and the task-level auto-restart.
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, DownloadError>;

/// All failure modes surfaced by the engine.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// A caller passed an out-of-range or nonsensical value.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An HTTP transfer failed.
    ///
    /// `status` is 0 when no HTTP response was received (DNS, connect,
    /// timeout). `retryable` reflects whether the condition is transient:
    /// timeouts, connection/DNS failures, interrupted bodies and 5xx are
    /// retryable; 4xx and TLS certificate failures are not.
    #[error("{message} (HTTP {status})")]
    Transfer {
        message: String,
        status: u16,
        retryable: bool,
    },

    /// The completed file does not have the size the server announced.
    #[error("size mismatch: expected {expected} bytes, found {actual}")]
    Integrity { expected: i64, actual: i64 },

    /// File creation, preallocation or a positional write failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation was aborted by pause, cancel or shutdown.
    #[error("operation cancelled")]
    Cancelled,

    /// A job submitted to the worker pool panicked.
    #[error("worker pool job panicked: {0}")]
    JobPanicked(String),

    /// The worker pool has been shut down.
    #[error("worker pool is stopped")]
    PoolStopped,
}

impl DownloadError {
    /// Whether retrying the failed operation can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DownloadError::Transfer { retryable: true, .. })
    }
}

/// Build a [`DownloadError::Transfer`] from a transport-level reqwest error.
pub(crate) fn transfer_from_reqwest(context: &str, err: &reqwest::Error) -> DownloadError {
    let status = err.status().map(|s| s.as_u16()).unwrap_or(0);
    // Certificate problems must not be retried; everything that looks like a
    // transient network condition may be.
    let retryable = if is_certificate_error(err) {
        false
    } else {
        err.is_timeout() || err.is_connect() || err.is_body() || err.is_request()
    };
    DownloadError::Transfer {
        message: format!("{context}: {err}"),
        status,
        retryable,
    }
}

/// Build a [`DownloadError::Transfer`] from an HTTP status line.
///
/// 4xx responses are client errors and never retried; 5xx are treated as
/// transient server conditions.
pub(crate) fn transfer_from_status(context: &str, status: u16) -> DownloadError {
    DownloadError::Transfer {
        message: format!("{context}: HTTP error {status}"),
        status,
        retryable: !(400..500).contains(&status),
    }
}

fn is_certificate_error(err: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        let text = inner.to_string();
        if text.contains("certificate") || text.contains("Certificate") {
            return true;
        }
        source = inner.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_are_retryable() {
        let err = transfer_from_status("probe", 503);
        assert!(err.is_retryable());
        match err {
            DownloadError::Transfer { status, .. } => assert_eq!(status, 503),
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn client_errors_are_not_retryable() {
        assert!(!transfer_from_status("probe", 404).is_retryable());
        assert!(!transfer_from_status("probe", 403).is_retryable());
    }

    #[test]
    fn cancellation_is_never_retryable() {
        assert!(!DownloadError::Cancelled.is_retryable());
    }

    #[test]
    fn io_errors_are_not_retryable() {
        let err = DownloadError::from(std::io::Error::other("disk on fire"));
        assert!(!err.is_retryable());
    }
}
