//! Exponential backoff for calls that cross a process boundary.
//!
//! The coordinator retries phase-two deliveries forever (no attempt limit) and
//! only uses [`RetryPolicy::delay_for_attempt`]. Participants and the TM client
//! wrap their calls to the coordinator in [`retry_with_backoff`] with a bounded
//! policy.

use std::{fmt::Display, future::Future, time::Duration};

use tokio::time::sleep;

/// # Default Values
///
/// - `initial_delay`: 100ms
/// - `max_delay`: 10 seconds
/// - `multiplier`: 2.0
/// - `max_attempts`: unbounded
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    /// Ceiling for the exponential delay.
    pub max_delay: Duration,
    pub multiplier: f64,
    /// `None` retries until the operation succeeds.
    pub max_attempts: Option<usize>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// delay = initial_delay * multiplier ^ attempt, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);

        if !delay_ms.is_finite() || delay_ms >= self.max_delay.as_millis() as f64 {
            self.max_delay
        } else {
            Duration::from_millis(delay_ms as u64)
        }
    }

    /// Whether the failure of `attempt` (counted from zero) was the last one allowed.
    pub fn is_exhausted(&self, attempt: usize) -> bool {
        self.max_attempts.map_or(false, |max| attempt + 1 >= max)
    }
}

/// Retry `operation` while `is_retryable` accepts its error and the policy
/// still allows another attempt. Returns the last error otherwise.
pub async fn retry_with_backoff<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::info!(attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if is_retryable(&err) && !policy.is_exhausted(attempt) => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "operation failed, retrying"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
