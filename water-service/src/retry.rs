//! Retry with exponential backoff for calls to remote collaborators.

use std::{fmt::Display, future::Future, time::Duration};

use rand::Rng;

use crate::config::RetryConfig;

/// Classifies an error as transient (worth another attempt) or final.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Rate limiting and server-side failures are transient; everything else is not.
pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_jitter: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_jitter,
        }
    }

    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self::new(
            cfg.max_attempts,
            Duration::from_millis(cfg.base_delay_ms),
            Duration::from_millis(cfg.max_jitter_ms),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `attempt + 1`, without jitter: `base * 2^attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let jitter_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        self.backoff(attempt).saturating_add(jitter)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned as-is.
    pub async fn run<T, E, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt + 1 < self.max_attempts => {
                    let sleep_for = self.delay_for(attempt);
                    attempt += 1;
                    tracing::warn!(
                        error = %e,
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = sleep_for.as_millis() as u64,
                        "transient failure, retrying with backoff"
                    );
                    metrics::counter!("remote_retry_total", "operation" => operation).increment(1);
                    tokio::time::sleep(sleep_for).await;
                }
                Err(e) => {
                    if e.is_retryable() {
                        tracing::error!(error = %e, operation, attempts = attempt + 1, "giving up after retries");
                        metrics::counter!("remote_retry_exhausted_total", "operation" => operation).increment(1);
                    }
                    return Err(e);
                }
            }
        }
    }
}
