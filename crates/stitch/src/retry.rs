// Retry helper for the fetch primitive: exponential backoff with capped jitter.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::FetcherConfig;
use crate::error::FetchError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on every further retry.
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Adds up to `base_delay / 2` of random delay, never past `max_delay`.
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &FetcherConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
            jitter: config.jitter,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Delay after failed attempt `attempt` (0-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        let delay = self
            .base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay));

        let headroom = self.max_delay.saturating_sub(delay);
        let spread = (self.base_delay / 2).min(headroom);
        if !self.jitter || spread.is_zero() {
            return delay;
        }

        let spread_ms = u64::try_from(spread.as_millis()).unwrap_or(u64::MAX);
        if spread_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..spread_ms))
    }
}

/// Outcome of one attempt.
pub enum RetryAction<T> {
    Success(T),
    /// Worth another attempt (network failure, 5xx, 408/429, truncated body).
    Retry(FetchError),
    /// Permanent for this request.
    Fail(FetchError),
}

/// Runs `operation` until it succeeds, fails permanently, or the retry budget
/// is spent. Running out of retries yields [`FetchError::Exhausted`].
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T, FetchError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let mut attempt = 0u32;
    loop {
        if token.is_cancelled() {
            return Err(FetchError::Cancelled);
        }

        let err = match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) => err,
        };

        if attempt >= policy.max_retries {
            return Err(FetchError::Exhausted {
                attempts: attempt + 1,
                reason: err.to_string(),
            });
        }

        let delay = policy.backoff(attempt);
        warn!(
            attempt = attempt + 1,
            max_retries = policy.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Fetch attempt failed, retrying"
        );
        tokio::select! {
            _ = token.cancelled() => return Err(FetchError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

/// Connection, timeout, request and body errors are worth retrying.
pub fn is_retryable_reqwest_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request() || e.is_body() || e.is_decode()
}
