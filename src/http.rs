//! Per-transfer HTTP client.
//!
//! One [`HttpFetcher`] exists per concurrent transfer; it is never shared
//! between blocks. It probes URLs (HEAD with a GET fallback), issues ranged
//! GETs, applies the retry/backoff policy for probes and exposes the
//! cancellation and stall plumbing the block workers build their transfer
//! loop on.
use bytes::Bytes;
use reqwest::header::{
    ACCEPT, ACCEPT_LANGUAGE, ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE,
    COOKIE, ETAG, HeaderMap, HeaderValue, LAST_MODIFIED, RANGE, REFERER,
};
use reqwest::{Client, RequestBuilder, Response, redirect};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::HttpConfig;
use crate::error::{self, DownloadError, Result};

/// Many servers reject requests without a browser-looking User-Agent.
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Probes are small; bound them even when the transfer timeout is unbounded.
const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// Backoff before retry attempts, clamped to the last entry.
const BACKOFF_SECS: [u64; 3] = [1, 2, 4];

/// Metadata retrieved by [`HttpFetcher::probe`].
#[derive(Debug, Clone, Default)]
pub struct FileInfo {
    /// File size in bytes; -1 when the server did not announce one.
    pub content_length: i64,
    /// Whether the server accepts `Range` requests.
    pub accept_ranges: bool,
    /// Validator pair, kept verbatim for server-change detection.
    pub etag: String,
    pub last_modified: String,
    pub content_type: String,
    /// Effective URL after redirects.
    pub final_url: String,
    /// Raw `Content-Disposition` header, if any.
    pub content_disposition: String,
}

/// HTTP client for a single transfer, cancellable from other tasks.
pub struct HttpFetcher {
    client: Client,
    config: HttpConfig,
    cancel: CancellationToken,
}

impl HttpFetcher {
    /// Build a fetcher whose client reflects `config` (timeouts, redirect
    /// depth, TLS verification, browser-like headers).
    pub fn new(config: HttpConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(
            ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.9"),
        );

        let mut builder = Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .redirect(redirect::Policy::limited(config.max_redirects))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .danger_accept_invalid_certs(!config.verify_tls)
            .tcp_keepalive(Duration::from_secs(60));
        if config.transfer_timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(config.transfer_timeout_secs));
        }

        let client = builder.build().map_err(|e| DownloadError::Transfer {
            message: format!("failed to build HTTP client: {e}"),
            status: 0,
            retryable: false,
        })?;

        Ok(Self {
            client,
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Abort the in-flight request and suppress any further retries.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// First attempt plus configured retries.
    pub(crate) fn max_attempts(&self) -> u32 {
        self.config.max_retries + 1
    }

    /// Sleep out the backoff for retry number `attempt` (1-based), waking
    /// early with [`DownloadError::Cancelled`] if the fetcher is cancelled.
    pub(crate) async fn backoff_sleep(&self, attempt: u32) -> Result<()> {
        let index = (attempt.saturating_sub(1) as usize).min(BACKOFF_SECS.len() - 1);
        tokio::select! {
            _ = self.cancel.cancelled() => Err(DownloadError::Cancelled),
            _ = tokio::time::sleep(Duration::from_secs(BACKOFF_SECS[index])) => Ok(()),
        }
    }

    /// Fetch file metadata with a HEAD request.
    ///
    /// Servers answering HEAD with 403 or 405 get a second chance as a GET
    /// whose body is dropped as soon as the headers arrive. Transient
    /// failures are retried with backoff.
    pub async fn probe(&self, url: &str) -> Result<FileInfo> {
        match self.probe_with(url, false).await {
            Err(DownloadError::Transfer { status, .. }) if status == 403 || status == 405 => {
                tracing::debug!(url, status, "HEAD rejected, probing with GET");
                self.probe_with(url, true).await
            }
            other => other,
        }
    }

    async fn probe_with(&self, url: &str, use_get: bool) -> Result<FileInfo> {
        let mut last_error = DownloadError::Transfer {
            message: format!("probe failed: {url}"),
            status: 0,
            retryable: false,
        };

        for attempt in 0..self.max_attempts() {
            if attempt > 0 {
                self.backoff_sleep(attempt).await?;
            }
            if self.cancel.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }

            let request = if use_get {
                self.client.get(url)
            } else {
                self.client.head(url)
            };
            let request = self.apply_request_headers(request);

            let sent = tokio::select! {
                _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
                sent = tokio::time::timeout(PROBE_TIMEOUT, request.send()) => sent,
            };

            let error = match sent {
                Err(_) => DownloadError::Transfer {
                    message: format!("probe timed out after {}s", PROBE_TIMEOUT.as_secs()),
                    status: 0,
                    retryable: true,
                },
                Ok(Err(e)) => error::transfer_from_reqwest("probe", &e),
                Ok(Ok(response)) => {
                    let status = response.status().as_u16();
                    if status < 400 {
                        // For a GET probe the body is never read; dropping the
                        // response aborts it right after the headers.
                        return Ok(extract_file_info(&response));
                    }
                    error::transfer_from_status("probe", status)
                }
            };

            if !error.is_retryable() {
                return Err(error);
            }
            tracing::debug!(url, attempt, error = %error, "probe attempt failed");
            last_error = error;
        }

        Err(last_error)
    }

    /// Issue a GET for `[range_start, range_end]` (inclusive).
    ///
    /// `range_end < 0` leaves the range open-ended; `range_start < 0` omits
    /// the `Range` header entirely (whole file). One attempt — the caller's
    /// transfer loop owns retries so a resumed attempt re-requests from its
    /// advanced offset.
    pub async fn request_range(
        &self,
        url: &str,
        range_start: i64,
        range_end: i64,
    ) -> Result<Response> {
        if self.cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        let mut request = self.client.get(url);
        if range_start >= 0 {
            let range = if range_end >= 0 {
                format!("bytes={range_start}-{range_end}")
            } else {
                format!("bytes={range_start}-")
            };
            request = request.header(RANGE, range);
        }
        request = self.apply_request_headers(request);

        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
            sent = request.send() => sent.map_err(|e| error::transfer_from_reqwest("transfer", &e))?,
        };

        let status = response.status().as_u16();
        if status >= 400 {
            return Err(error::transfer_from_status("transfer", status));
        }
        Ok(response)
    }

    /// Pull the next body chunk, enforcing cancellation and the stall rule:
    /// no data for `low_speed_time_secs` aborts the attempt as stalled
    /// (retryable).
    pub async fn next_chunk(&self, response: &mut Response) -> Result<Option<Bytes>> {
        let stall_window = Duration::from_secs(self.config.low_speed_time_secs.max(1));
        tokio::select! {
            _ = self.cancel.cancelled() => Err(DownloadError::Cancelled),
            chunk = tokio::time::timeout(stall_window, response.chunk()) => match chunk {
                Err(_) => Err(DownloadError::Transfer {
                    message: format!(
                        "transfer stalled: no data for {}s",
                        stall_window.as_secs()
                    ),
                    status: 0,
                    retryable: true,
                }),
                Ok(Ok(chunk)) => Ok(chunk),
                Ok(Err(e)) => Err(error::transfer_from_reqwest("transfer", &e)),
            },
        }
    }

    fn apply_request_headers(&self, mut request: RequestBuilder) -> RequestBuilder {
        if let Some(user) = &self.config.username {
            request = request.basic_auth(user, self.config.password.as_deref());
        }
        if let Some(referer) = &self.config.referer {
            request = request.header(REFERER, referer);
        }
        if let Some(cookie) = &self.config.cookie {
            request = request.header(COOKIE, cookie);
        }
        request
    }
}

fn extract_file_info(response: &Response) -> FileInfo {
    let headers = response.headers();
    let header_string = |name| {
        headers
            .get(name)
            .and_then(|v: &HeaderValue| v.to_str().ok())
            .unwrap_or("")
            .trim()
            .to_string()
    };

    let content_length = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .unwrap_or(-1);

    let accept_ranges = headers
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .map(|v| !v.eq_ignore_ascii_case("none"))
        .unwrap_or(false);

    FileInfo {
        content_length,
        accept_ranges,
        etag: header_string(ETAG),
        last_modified: header_string(LAST_MODIFIED),
        content_type: header_string(CONTENT_TYPE),
        final_url: response.url().to_string(),
        content_disposition: header_string(CONTENT_DISPOSITION),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn probe_falls_back_to_get_on_405() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(405))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"hello".to_vec())
                    .insert_header("Accept-Ranges", "bytes")
                    .insert_header("ETag", "\"v1\"")
                    .insert_header("Last-Modified", "Wed, 21 Oct 2015 07:28:00 GMT")
                    .insert_header("Content-Type", "application/octet-stream"),
            )
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpConfig::default()).unwrap();
        let info = fetcher.probe(&server.uri()).await.unwrap();

        assert_eq!(info.content_length, 5);
        assert!(info.accept_ranges);
        assert_eq!(info.etag, "\"v1\"");
        assert_eq!(info.last_modified, "Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(info.content_type, "application/octet-stream");
    }

    #[tokio::test]
    async fn probe_propagates_client_errors_without_retrying() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpConfig::default()).unwrap();
        match fetcher.probe(&server.uri()).await {
            Err(DownloadError::Transfer {
                status, retryable, ..
            }) => {
                assert_eq!(status, 404);
                assert!(!retryable);
            }
            other => panic!("expected 404 transfer error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ranged_request_streams_the_slice() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(wiremock::matchers::header("Range", "bytes=2-6"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(b"cdefg".to_vec()))
            .mount(&server)
            .await;

        let fetcher = HttpFetcher::new(HttpConfig::default()).unwrap();
        let mut response = fetcher.request_range(&server.uri(), 2, 6).await.unwrap();

        let mut body = Vec::new();
        while let Some(chunk) = fetcher.next_chunk(&mut response).await.unwrap() {
            body.extend_from_slice(&chunk);
        }
        assert_eq!(body, b"cdefg");
    }

    #[tokio::test]
    async fn cancelled_fetcher_refuses_requests() {
        let fetcher = HttpFetcher::new(HttpConfig::default()).unwrap();
        fetcher.cancel();
        assert!(matches!(
            fetcher.request_range("http://127.0.0.1:9/file", 0, 10).await,
            Err(DownloadError::Cancelled)
        ));
        assert!(matches!(
            fetcher.backoff_sleep(1).await,
            Err(DownloadError::Cancelled)
        ));
    }
}
