//! Retry with exponential backoff for upstream HTTP calls.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Classified upstream failure. Only transient failures are retried;
/// a rejection is the upstream answering clearly, so retrying it would
/// just repeat the same answer.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("upstream rejected request: {0}")]
    Rejected(String),
}

impl UpstreamError {
    pub fn from_status(status: reqwest::StatusCode, body: String) -> Self {
        if status.is_server_error() {
            Self::Transient(format!("{}: {}", status, body))
        } else {
            Self::Rejected(format!("{}: {}", status, body))
        }
    }

    pub fn from_request_error(err: reqwest::Error) -> Self {
        Self::Transient(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    pub add_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(300),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff.as_millis() as f64);

        let millis = if self.add_jitter {
            // Up to 25% of the computed backoff, seeded from the clock.
            let nanos = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.subsec_nanos())
                .unwrap_or(0);
            let jitter = (nanos % 1000) as f64 / 1000.0 * capped * 0.25;
            capped + jitter
        } else {
            capped
        };

        Duration::from_millis(millis as u64)
    }
}

/// Run `operation` until it succeeds, fails with a rejection, or the retry
/// budget is exhausted.
pub async fn retry_http<F, Fut, T>(
    config: &RetryConfig,
    description: &str,
    mut operation: F,
) -> Result<T, UpstreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err @ UpstreamError::Rejected(_)) => return Err(err),
            Err(UpstreamError::Transient(msg)) => {
                if attempt >= config.max_retries {
                    tracing::warn!(
                        operation = description,
                        attempts = attempt + 1,
                        error = %msg,
                        "upstream call failed, retries exhausted"
                    );
                    return Err(UpstreamError::Transient(msg));
                }
                let backoff = config.backoff_for_attempt(attempt);
                tracing::debug!(
                    operation = description,
                    attempt = attempt + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %msg,
                    "retrying upstream call"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}
