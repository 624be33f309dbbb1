//! Bounded retry with exponential backoff for collaborator calls.
//!
//! Every external call (LLM, Google Books, cover download, OCR) goes through
//! one [`RetryPolicy`] so the attempt budget and the backoff curve are set in
//! a single place. Only [`CollaboratorError::Transient`] is retried; a
//! permanent failure is returned on the spot, and running out of attempts
//! yields [`CollaboratorError::Exhausted`] naming the service and the last
//! error seen.
//!
//! With the defaults (3 retries, 500 ms base) the waits are
//! 500 ms → 1 s → 2 s, so a dead endpoint costs a file under four seconds.

use crate::error::CollaboratorError;
use std::future::Future;
use tokio::time::{sleep, Duration};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt. `0` disables retrying.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each subsequent one.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(base_delay_ms),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }

    /// Run `op` until it succeeds, fails permanently, or the budget runs out.
    pub async fn run<T, F, Fut>(&self, service: &str, mut op: F) -> Result<T, CollaboratorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(CollaboratorError::Exhausted {
                            service: service.to_string(),
                            attempts: attempt + 1,
                            last: e.to_string(),
                        });
                    }
                    attempt += 1;
                    let wait = self.backoff(attempt);
                    warn!(
                        "{}: retry {}/{} after {}ms: {}",
                        service,
                        attempt,
                        self.max_retries,
                        wait.as_millis(),
                        e
                    );
                    sleep(wait).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_doubles() {
        let p = RetryPolicy::new(3, 500);
        assert_eq!(p.backoff(1), Duration::from_millis(500));
        assert_eq!(p.backoff(2), Duration::from_millis(1000));
        assert_eq!(p.backoff(3), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, 1);
        let out = policy
            .run("flaky", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(CollaboratorError::transient("flaky", "503"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(out.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let out: Result<(), _> = RetryPolicy::new(5, 1)
            .run("auth", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CollaboratorError::permanent("auth", "401")) }
            })
            .await;
        assert!(matches!(out, Err(CollaboratorError::Permanent { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exhaustion_reports_attempts() {
        let out: Result<(), _> = tokio_test::block_on(RetryPolicy::new(2, 0).run("down", || async {
            Err(CollaboratorError::transient("down", "connection refused"))
        }));
        match out {
            Err(CollaboratorError::Exhausted {
                service, attempts, ..
            }) => {
                assert_eq!(service, "down");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }
}
