//! HTTP client for upstream time-series hosts, with retry and backoff

use crate::error::{DeltaError, Result};
use bytes::Bytes;
use reqwest::Client;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Retry policy for failed upstream requests
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries
    pub max_retries: usize,
    /// Backoff durations in milliseconds for each retry attempt
    pub backoff_ms: Vec<u64>,
}

impl RetryPolicy {
    /// Create a new retry policy with exponential backoff
    pub fn new(max_retries: usize) -> Self {
        // 100ms, 200ms, 400ms, 800ms, ...
        let backoff_ms = (0..max_retries)
            .map(|i| 100 * 2u64.pow(i as u32))
            .collect();

        RetryPolicy {
            max_retries,
            backoff_ms,
        }
    }

    /// Check if we should retry based on the attempt number and error
    pub fn should_retry(&self, attempt: usize, error: &DeltaError) -> bool {
        attempt < self.max_retries && error.should_retry()
    }

    /// Get the backoff duration for a given attempt
    pub fn backoff_duration(&self, attempt: usize) -> Duration {
        let ms = self
            .backoff_ms
            .get(attempt)
            .copied()
            .unwrap_or_else(|| *self.backoff_ms.last().unwrap_or(&1000));
        Duration::from_millis(ms)
    }
}

/// Shared HTTP client used by backend providers
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http_client: Client,
    retry_policy: RetryPolicy,
}

impl UpstreamClient {
    /// Create a new UpstreamClient
    ///
    /// # Arguments
    /// * `timeout` - Per-attempt request timeout
    /// * `max_retries` - Maximum number of retry attempts for transient failures
    pub fn new(timeout: Duration, max_retries: usize) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| DeltaError::ConfigError(format!("Failed to create HTTP client: {}", e)))?;

        Ok(UpstreamClient {
            http_client,
            retry_policy: RetryPolicy::new(max_retries),
        })
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Single GET attempt, returning the body of a 2xx response
    async fn try_get(&self, url: &str, params: &[(&str, String)]) -> Result<Bytes> {
        let response = self
            .http_client
            .get(url)
            .query(params)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeltaError::Timeout(format!("Request to {} timed out", url))
                } else {
                    DeltaError::HttpError(format!("Request failed: {}", e))
                }
            })?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| DeltaError::HttpError(format!("Failed to read response body: {}", e)))?;

        if !(200..300).contains(&status) {
            let message = String::from_utf8_lossy(&body).chars().take(512).collect::<String>();
            return Err(DeltaError::from_http_status(status, message));
        }
        Ok(body)
    }

    /// GET `url` with query `params`, retrying transient failures with backoff
    ///
    /// # Returns
    /// * `Ok(Bytes)` - the response body once a 2xx status is received
    /// * `Err(DeltaError)` - the last error once retries are exhausted or the
    ///   error is not retryable
    pub async fn get(&self, url: &str, params: &[(&str, String)]) -> Result<Bytes> {
        let mut attempt = 0;

        loop {
            match self.try_get(url, params).await {
                Ok(body) => {
                    debug!("Upstream GET ok: url={}, attempts={}, bytes={}", url, attempt + 1, body.len());
                    return Ok(body);
                }
                Err(e) => {
                    if !self.retry_policy.should_retry(attempt, &e) {
                        return Err(e);
                    }

                    let backoff = self.retry_policy.backoff_duration(attempt);
                    warn!(
                        "Upstream request failed for {} (attempt {}), retrying after {:?}: {}",
                        url,
                        attempt + 1,
                        backoff,
                        e
                    );
                    sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}
