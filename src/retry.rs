//! Retry utilities with exponential backoff and jitter.
//!
//! One profile is used for nearly every write in the system: six steps
//! starting at 10ms with a 5x factor and ±10% jitter, capping the total
//! wait around 35 seconds. Status updates on migrations use it for *any*
//! error, because abandoning a sweep over a transient status-write failure
//! costs far more than a blind retry.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Configuration for operations that may fail transiently
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Total number of attempts, including the first
    pub steps: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each attempt
    pub factor: f64,
    /// Fraction of the delay randomized in both directions
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            steps: 6,
            initial_delay: Duration::from_millis(10),
            factor: 5.0,
            jitter: 0.1,
        }
    }
}

impl RetryConfig {
    /// Profile for optimistic-concurrency retries on small writes: flat
    /// short delays, a handful of attempts.
    pub fn on_conflict() -> Self {
        Self {
            steps: 5,
            initial_delay: Duration::from_millis(10),
            factor: 1.0,
            jitter: 0.1,
        }
    }

    /// The jittered delay to sleep after the given zero-based attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.factor.powi(attempt as i32);
        let spread = rand::thread_rng().gen_range(-1.0..1.0) * self.jitter;
        Duration::from_secs_f64(base * (1.0 + spread))
    }
}

/// Execute an async operation with exponential backoff.
///
/// Retries until the operation succeeds, the step budget is exhausted, or
/// `cancel` fires. The last error is returned in the latter two cases;
/// callers that must distinguish shutdown from exhaustion check the token.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempt += 1;
                if attempt >= config.steps || cancel.is_cancelled() {
                    return Err(e);
                }

                let delay = config.delay_for(attempt - 1);
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "operation failed, retrying"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(e),
                }
            }
        }
    }
}
