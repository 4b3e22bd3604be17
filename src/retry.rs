//! Bounded exponential backoff for transient backend failures.

use crate::config::RetryConfig;
use crate::error::Result;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// Retry policy applied around every network-bound backend call.
///
/// Only transient errors are retried; fatal errors and non-backend
/// errors propagate immediately.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    /// Build a policy from configuration.
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
        }
    }

    /// Policy that never retries (single attempt).
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    /// Total attempts including the first call.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff before retry number `attempt` (1-based), with jitter.
    ///
    /// The jitter is derived from the hash of `(key, attempt)` so reruns
    /// of the same workload produce identical schedules.
    pub fn delay(&self, attempt: u32, key: &str) -> Duration {
        let capped = attempt.min(5);
        let backoff = self.base_delay.saturating_mul(1 << capped);

        let half_base = self.base_delay.as_millis() as u64 / 2;
        if half_base == 0 {
            return backoff;
        }
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        attempt.hash(&mut hasher);
        let jitter = Duration::from_millis(hasher.finish() % half_base);

        backoff + jitter
    }

    /// Run `op`, retrying transient failures up to the attempt bound.
    pub async fn run<T, F, Fut>(&self, key: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < self.max_attempts => {
                    attempt += 1;
                    let delay = self.delay(attempt, key);
                    tracing::debug!(
                        key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient backend failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
