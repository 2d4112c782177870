use futures::StreamExt;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_MAX_SIZE: usize = 10 * 1024 * 1024; // 10MB
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Upper bound accepted for [`FetchSettings::max_retries`] from configuration.
pub const MAX_RETRIES: u32 = 10;

/// Errors that can occur while downloading a feed or image.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Network-level error (DNS, connection, TLS, etc.)
    #[error("Request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// HTTP response with non-2xx status code
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),
    #[error("Request timed out")]
    Timeout,
    /// Server returned 429 Too Many Requests after max retries
    #[error("Rate limited after {0} retries")]
    RateLimited(u32),
    #[error("Response too large")]
    ResponseTooLarge,
    /// Received fewer bytes than Content-Length announced
    #[error("Incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: u64, received: usize },
    /// The caller's cancellation token fired before the download finished
    #[error("Fetch cancelled")]
    Cancelled,
}

/// Limits applied to every request.
#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub timeout: Duration,
    pub max_size: usize,
    pub max_retries: u32,
    /// First backoff delay; doubles on each retry
    pub retry_base_delay: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_size: DEFAULT_MAX_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
        }
    }
}

/// Bounded HTTP GET on top of a shared `reqwest::Client`.
#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    settings: FetchSettings,
}

impl Fetcher {
    pub fn new(client: reqwest::Client, settings: FetchSettings) -> Self {
        Self { client, settings }
    }

    pub fn settings(&self) -> &FetchSettings {
        &self.settings
    }

    /// Download `url`, retrying with exponential backoff on 429, 5xx and
    /// truncated bodies. 4xx responses fail immediately. Cancelling the
    /// token aborts the download (including backoff sleeps).
    pub async fn fetch(&self, url: &str, cancel: &CancellationToken) -> Result<Vec<u8>, FetchError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            result = self.fetch_with_retries(url) => result,
        }
    }

    /// [`fetch`](Self::fetch), decoded as UTF-8 (invalid sequences replaced).
    pub async fn fetch_text(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<String, FetchError> {
        let bytes = self.fetch(url, cancel).await?;
        Ok(String::from_utf8(bytes)
            .unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned()))
    }

    /// Single attempt, no retries. Used for best-effort image lookups where
    /// the next fallback is cheaper than waiting on backoff.
    pub async fn fetch_once(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.attempt(url).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let max_retries = self.settings.max_retries;
        let mut retry_count = 0;

        loop {
            let error = match self.attempt(url).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => e,
            };

            let retryable = match &error {
                FetchError::HttpStatus(429) => true,
                FetchError::HttpStatus(status) => (500..600).contains(status),
                FetchError::IncompleteResponse { .. } => true,
                _ => false,
            };
            if !retryable {
                return Err(error);
            }
            if retry_count >= max_retries {
                return Err(match error {
                    FetchError::HttpStatus(429) => FetchError::RateLimited(max_retries),
                    other => other,
                });
            }

            let delay = backoff_delay(self.settings.retry_base_delay, retry_count);
            tracing::warn!(
                url = %url,
                error = %error,
                retry = retry_count,
                delay_ms = delay.as_millis() as u64,
                "Fetch failed, backing off"
            );
            tokio::time::sleep(delay).await;
            retry_count += 1;
        }
    }

    async fn attempt(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = tokio::time::timeout(self.settings.timeout, self.client.get(url).send())
            .await
            .map_err(|_| FetchError::Timeout)?
            .map_err(FetchError::Network)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus(status.as_u16()));
        }

        tokio::time::timeout(
            self.settings.timeout,
            read_limited_bytes(response, self.settings.max_size),
        )
        .await
        .map_err(|_| FetchError::Timeout)?
    }
}

/// `base * 2^retry`, saturating and capped at [`MAX_RETRY_DELAY`].
fn backoff_delay(base: Duration, retry: u32) -> Duration {
    let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(MAX_RETRY_DELAY)
}

async fn read_limited_bytes(
    response: reqwest::Response,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let expected_length = response.content_length();

    // Fast path: the server told us up front
    if let Some(len) = expected_length {
        if len as usize > limit {
            return Err(FetchError::ResponseTooLarge);
        }
    }

    let mut bytes = Vec::new();
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(FetchError::Network)?;
        if bytes.len().saturating_add(chunk.len()) > limit {
            return Err(FetchError::ResponseTooLarge);
        }
        bytes.extend_from_slice(&chunk);
    }

    if let Some(expected) = expected_length {
        if (bytes.len() as u64) < expected {
            return Err(FetchError::IncompleteResponse {
                expected,
                received: bytes.len(),
            });
        }
    }

    Ok(bytes)
}
