//! Retry/backoff combinator shared by the stream consumer, crawler and
//! batch flusher.
//!
//! Transient errors are retried with capped exponential backoff plus jitter.
//! Rate-limit responses are handled on a separate budget: the delay grows
//! with the number of consecutive rate-limit hits and they do not consume
//! generic retries.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{AppError, Result};
use crate::models::RetryConfig;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Generic retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive rate-limit hits tolerated before giving up
    pub max_rate_limit_hits: u32,
    /// Add up to 25% random delay to each generic backoff
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_rate_limit_hits: config.max_rate_limit_hits,
            jitter: true,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_rate_limit_hits: 0,
            jitter: false,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before generic retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let spread = (delay.as_millis() as u64 / 4).max(1);
        let jitter = Duration::from_millis(rand::rng().random_range(0..=spread));
        (delay + jitter).min(self.max_delay)
    }

    /// Delay after the `hits`-th consecutive rate-limit response. A
    /// server `retry_after` hint is honored up to `max_delay`.
    pub fn rate_limit_backoff(&self, hits: u32, retry_after: Option<Duration>) -> Duration {
        let scaled = self.base_delay.saturating_mul(hits.max(1)).min(self.max_delay);
        match retry_after {
            Some(hint) => scaled.max(hint.min(self.max_delay)),
            None => scaled,
        }
    }
}

/// Run `op` under `policy`.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, label: &str, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_observed(policy, label, op, |_| {}).await
}

/// Run `op` under `policy`, calling `observe` with every failed attempt.
pub async fn retry_observed<T, F, Fut, O>(
    policy: &RetryPolicy,
    label: &str,
    mut op: F,
    mut observe: O,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    O: FnMut(&AppError),
{
    let mut attempt = 0u32;
    let mut rate_limit_hits = 0u32;

    loop {
        let error = match op().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };
        observe(&error);

        let delay = if let AppError::RateLimited { retry_after } = error {
            rate_limit_hits += 1;
            if rate_limit_hits > policy.max_rate_limit_hits {
                log::warn!("{label}: giving up after {rate_limit_hits} rate-limit responses");
                return Err(error);
            }
            policy.rate_limit_backoff(rate_limit_hits, retry_after)
        } else if error.is_retryable() && attempt < policy.max_retries {
            rate_limit_hits = 0;
            let delay = policy.backoff(attempt);
            attempt += 1;
            delay
        } else {
            return Err(error);
        };

        log::warn!(
            "{label}: {error}; retrying in {delay:?} (attempt {}/{}, rate-limit hits {rate_limit_hits})",
            attempt,
            policy.max_retries
        );
        tokio::time::sleep(delay).await;
    }
}
