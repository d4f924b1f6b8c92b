//! Bounded retry for transient persistence failures.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Errors that can tell whether retrying the same call may succeed.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Backoff policy: linear growth per attempt, capped.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub attempts: u32,
    pub step: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            step: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Policy without sleeping, for tests.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            step: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt).min(self.max_backoff)
    }
}

/// Run `op`, retrying while it fails with a transient error.
///
/// Non-transient errors and the last transient error are returned as-is.
pub async fn retry_transient<T, E, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<T, E>
where
    E: Transient + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match op().await {
            Err(err) if err.is_transient() && attempts < policy.attempts.max(1) => {
                let backoff = policy.backoff(attempts);
                log::warn!(
                    "{} failed (attempt {}/{}), retrying in {:?}: {}",
                    what,
                    attempts,
                    policy.attempts,
                    backoff,
                    err
                );
                tokio::time::sleep(backoff).await;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    enum TestError {
        Busy,
        Fatal,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl Transient for TestError {
        fn is_transient(&self) -> bool {
            matches!(self, TestError::Busy)
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, TestError> =
            retry_transient(RetryPolicy::immediate(5), "op", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 { Err(TestError::Busy) } else { Ok(n) }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), TestError> =
            retry_transient(RetryPolicy::immediate(3), "op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Busy)
            })
            .await;
        assert!(matches!(result, Err(TestError::Busy)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_fatal() {
        let calls = AtomicU32::new(0);
        let result: Result<(), TestError> =
            retry_transient(RetryPolicy::immediate(5), "op", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError::Fatal)
            })
            .await;
        assert!(matches!(result, Err(TestError::Fatal)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(100), Duration::from_secs(2));
    }
}
