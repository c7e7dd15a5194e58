//! Exponential-backoff retry policy shared by every external call site.
//!
//! The wait before retry `n` (1-based) is
//! `base_delay * multiplier^(n-1)`, capped at `max_delay`. With the defaults
//! (500 ms, ×2, 3 attempts) a failing call waits 500 ms then 1 s before the
//! last error is returned.
//!
//! Each call site decides which failures are worth another attempt by
//! passing its own predicate: the parser and extractor retry anything
//! retryable, while the Q/A generator leaves rate limiting to its batch loop.

use crate::error::ServiceError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Decides whether a failed call should be attempted again.
pub type RetryPredicate = fn(&ServiceError) -> bool;

/// Retry/backoff parameters for one call site.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first. Always ≥ 1.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
    pub max_delay: Duration,
    retryable: RetryPredicate,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500))
    }
}

/// The error of the final attempt, plus how many attempts were made.
#[derive(Debug, Clone)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last: ServiceError,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            multiplier: 2,
            max_delay: Duration::from_secs(60),
            retryable: ServiceError::is_retryable,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    pub fn with_multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier.max(1);
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn retry_if(mut self, predicate: RetryPredicate) -> Self {
        self.retryable = predicate;
        self
    }

    pub fn should_retry(&self, error: &ServiceError) -> bool {
        (self.retryable)(error)
    }

    /// Backoff before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.saturating_pow(retry - 1);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails non-retryably, or attempts run out.
    ///
    /// A server-supplied `Retry-After` stretches the wait but never shortens
    /// it below the computed backoff.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T, RetryExhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts && self.should_retry(&e) => {
                    let mut backoff = self.delay_for(attempt);
                    if let ServiceError::RateLimited {
                        retry_after: Some(hint),
                    } = &e
                    {
                        backoff = backoff.max(*hint);
                    }
                    warn!(
                        "{}: attempt {}/{} failed ({}), retrying in {}ms",
                        label,
                        attempt,
                        self.max_attempts,
                        e,
                        backoff.as_millis()
                    );
                    sleep(backoff).await;
                }
                Err(last) => {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(1))
    }

    #[test]
    fn delays_grow_exponentially_and_cap() {
        let p = RetryPolicy::new(5, Duration::from_millis(500))
            .with_max_delay(Duration::from_millis(1500));
        assert_eq!(p.delay_for(1), Duration::from_millis(500));
        assert_eq!(p.delay_for(2), Duration::from_millis(1000));
        assert_eq!(p.delay_for(3), Duration::from_millis(1500));
        assert_eq!(p.delay_for(10), Duration::from_millis(1500));
    }

    #[test]
    fn zero_attempts_is_clamped_to_one() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = fast(3)
            .run("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ServiceError::Transient("blip".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast(5)
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ServiceError::Auth("bad key".into())) }
            })
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.attempts, 1);
        assert!(matches!(err.last, ServiceError::Auth(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_carry_last_error() {
        let result: Result<(), _> = fast(3)
            .run("test", || async { Err(ServiceError::Timeout("slow".into())) })
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert!(err.last.is_transient());
    }

    #[tokio::test]
    async fn custom_predicate_skips_rate_limits() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = fast(4)
            .retry_if(ServiceError::is_transient)
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ServiceError::RateLimited { retry_after: None }) }
            })
            .await;
        assert!(result.unwrap_err().last.is_rate_limited());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
