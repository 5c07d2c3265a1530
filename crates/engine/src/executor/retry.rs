//! Retry logic with bounded exponential backoff for transient provider errors.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::provider::ProviderError;

/// How often and how patiently transient failures are retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 200,
            multiplier: 2.0,
            max_delay_ms: 5_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the given zero-based attempt failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let delay_ms = (self.base_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }
}

/// Final result of a retried call and how many attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, ProviderError>,
    pub attempts: u32,
}

/// Run `operation` until it succeeds, fails fatally or the attempts run out.
///
/// `on_retry` is told the one-based attempt that failed, the delay before the
/// next one and the error.
pub async fn with_retry<T, F, Fut, C>(policy: &RetryPolicy, mut on_retry: C, mut operation: F) -> Attempted<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
    C: FnMut(u32, Duration, &ProviderError),
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    attempts: attempt + 1,
                };
            }
            Err(error) => {
                if !error.is_transient() || attempt + 1 >= max_attempts {
                    return Attempted {
                        result: Err(error),
                        attempts: attempt + 1,
                    };
                }
                let delay = policy.delay_for_attempt(attempt);
                on_retry(attempt + 1, delay, &error);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 1,
            multiplier: 2.0,
            max_delay_ms: 4,
        }
    }

    #[test]
    fn delays_grow_and_are_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(1_600));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(5_000));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_millis(5_000));
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut notices = Vec::new();
        let attempted = with_retry(
            &fast_policy(5),
            |attempt, _, error: &ProviderError| notices.push((attempt, error.code.clone())),
            || {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ProviderError::transient("Throttling", "slow down"))
                    } else {
                        Ok("vpc-1")
                    }
                }
            },
        )
        .await;
        assert_eq!(attempted.result.unwrap(), "vpc-1");
        assert_eq!(attempted.attempts, 3);
        assert_eq!(notices, vec![(1, "Throttling".to_string()), (2, "Throttling".to_string())]);
    }

    #[tokio::test]
    async fn fatal_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let attempted: Attempted<()> = with_retry(
            &fast_policy(5),
            |_, _, _: &ProviderError| {},
            || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ProviderError::fatal("InvalidParameterValue", "bad cidr"))
                }
            },
        )
        .await;
        assert_eq!(attempted.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!attempted.result.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let attempted: Attempted<()> = with_retry(
            &fast_policy(3),
            |_, _, _: &ProviderError| {},
            || async { Err(ProviderError::transient("RequestLimitExceeded", "busy")) },
        )
        .await;
        assert_eq!(attempted.attempts, 3);
        assert!(attempted.result.unwrap_err().is_transient());
    }
}
