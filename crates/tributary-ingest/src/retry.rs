//! Bounded exponential backoff for sink writes.
//!
//! A failed write is retried up to `max_retries` more times, sleeping
//! `base_delay`, `2 * base_delay`, ... between attempts, capped at
//! `max_delay`. Once retries are exhausted the last error is returned and
//! recovery is left to transport redelivery.

use crate::Result;
use std::future::Future;
use std::time::Duration;

/// Retry schedule for one sink branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: usize,

    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: usize) -> Duration {
        let shift = retry.saturating_sub(1).min(31) as u32;
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

/// Run `op` until it succeeds or the policy is exhausted.
///
/// `branch` labels the `sink_retries_total` metric; `destination` identifies
/// the key or table in logs.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    branch: &'static str,
    destination: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retry_no = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if retry_no < policy.max_retries => {
                retry_no += 1;
                let delay = policy.delay_for(retry_no);
                metrics::counter!("sink_retries_total", "branch" => branch).increment(1);
                tracing::warn!(
                    branch,
                    destination,
                    attempt = retry_no,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "sink write failed, will retry"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
