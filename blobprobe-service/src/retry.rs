//! Opt-in retries for transient backend failures.
//!
//! Runs are measured without retries by default, so a slow or flaky backend shows up
//! in the timings and outcomes instead of being hidden behind repeated attempts.

use std::time::Duration;

use crate::backend::BackendResult;

/// How often and how fast a failed backend call is repeated.
///
/// Only errors that are [transient](crate::backend::BackendError::is_transient) are
/// retried. Delays grow exponentially: `base_delay * multiplier^(attempt - 1)`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one. `1` disables retries.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Growth factor of the delay for each further retry.
    pub multiplier: f64,
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_millis(500),
            multiplier: 2.0,
        }
    }

    /// Returns `true` if this policy makes more than one attempt.
    pub fn is_enabled(&self) -> bool {
        self.max_attempts > 1
    }

    /// The delay after `attempts` failed attempts (1-indexed).
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(delay).unwrap_or(Duration::MAX)
    }

    /// Runs `operation` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `step` names the operation in logs.
    pub async fn run<T, F, Fut>(&self, step: &'static str, mut operation: F) -> BackendResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BackendResult<T>>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match operation().await {
                Ok(value) => {
                    if attempts > 1 {
                        tracing::info!(step, attempts, "Succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(error) if error.is_transient() && attempts < self.max_attempts => {
                    let delay = self.next_delay(attempts);
                    tracing::warn!(
                        step,
                        attempts,
                        ?delay,
                        error = &error as &dyn std::error::Error,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    if attempts > 1 {
                        tracing::debug!(step, attempts, "Giving up after retrying");
                    }
                    return Err(error);
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}
