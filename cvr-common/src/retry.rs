//! Bounded exponential-backoff retries for fallible async operations.
//!
//! Only wrap operations that are safe to repeat (network fetch, outbound
//! notification). Operations with non-idempotent side effects must be made
//! idempotent before being retried.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Retry policy with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt: a policy with `max_retries = 3`
    /// invokes the operation at most 4 times.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling for any single backoff delay.
    pub max_delay: Duration,
    /// Backoff growth factor.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Policy used for git fetches: 3 retries, 2s → 16s.
    pub fn fetch() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(16),
            multiplier: 2.0,
        }
    }

    /// Backoff delay after the given failed attempt (0-based):
    /// `min(initial × multiplier^attempt, max)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let initial = self.initial_delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64().max(0.0);
        let delay = (initial * self.multiplier.powi(attempt as i32)).min(max);
        Duration::from_secs_f64(delay.max(0.0))
    }
}

/// Run an async operation with retries, re-returning the last failure when
/// retries are exhausted.
pub async fn retry<F, Fut, T, E>(label: &str, policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;

    loop {
        debug!(label, attempt, "starting attempt");

        match op().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(label, attempt, "succeeded after retries");
                }
                return Ok(value);
            }
            Err(err) if attempt < policy.max_retries => {
                let delay = policy.backoff_delay(attempt);
                warn!(
                    label,
                    attempt,
                    error = %err,
                    delay_secs = delay.as_secs_f64(),
                    "attempt failed, backing off"
                );
                sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                warn!(label, attempt, error = %err, "retries exhausted");
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn always_failing_op_runs_max_retries_plus_one_times() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<(), &str> = retry("test", &fast_policy(3), move || {
            let attempts_clone = attempts_clone.clone();
            async move {
                attempts_clone.fetch_add(1, Ordering::SeqCst);
                Err("nope")
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn succeeds_on_third_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result = retry("test", &fast_policy(3), move || {
            let attempts_clone = attempts_clone.clone();
            async move {
                let count = attempts_clone.fetch_add(1, Ordering::SeqCst);
                if count < 2 { Err("transient") } else { Ok(42u32) }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_retries_means_single_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<(), &str> = retry("test", &fast_policy(0), move || {
            let attempts_clone = attempts_clone.clone();
            async move {
                attempts_clone.fetch_add(1, Ordering::SeqCst);
                Err("nope")
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(16),
            multiplier: 2.0,
        };

        assert_eq!(policy.backoff_delay(0), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(4));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(8));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(16));
        // Capped from here on.
        assert_eq!(policy.backoff_delay(4), Duration::from_secs(16));
        assert_eq!(policy.backoff_delay(9), Duration::from_secs(16));
    }

    #[test]
    fn fetch_policy_matches_sync_contract() {
        let policy = RetryPolicy::fetch();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.backoff_delay(0), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(16));
    }
}
