//! Retry routing for rejected tasks and backoff for transient backend errors.

use std::future::Future;
use std::time::Duration;

use super::QueueError;

/// Cap on a single backoff sleep.
const MAX_BACKOFF_MS: u64 = 30_000;

/// Where a rejected task goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryRoute {
    /// Republish to the delayed retry queue with this retry count.
    Retry { retries: u32 },
    /// Retries exhausted; park in the dead-letter queue.
    DeadLetter { retries: u32 },
}

/// Broker-side retry policy for tasks whose processing failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Route a task that just failed after `retries_so_far` earlier retries.
    ///
    /// A task is dead-lettered on its `max_attempts + 1`-th failure.
    pub fn route(&self, retries_so_far: u32) -> RetryRoute {
        let retries = retries_so_far.saturating_add(1);
        if retries > self.max_attempts {
            RetryRoute::DeadLetter { retries }
        } else {
            RetryRoute::Retry { retries }
        }
    }
}

/// Exponential backoff for retrying backend calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Total attempts, including the first call.
    pub attempts: u32,
    pub base_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_ms: 200,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(self.base_ms.saturating_mul(factor).min(MAX_BACKOFF_MS))
    }

    /// Run `op`, retrying transient failures until attempts run out.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    let delay = self.delay(attempt);
                    tracing::warn!(
                        operation,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Backend call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_route_dead_letters_after_max_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        assert_eq!(policy.route(0), RetryRoute::Retry { retries: 1 });
        assert_eq!(policy.route(2), RetryRoute::Retry { retries: 3 });
        assert_eq!(policy.route(3), RetryRoute::DeadLetter { retries: 4 });
    }

    #[test]
    fn test_route_zero_attempts_dead_letters_immediately() {
        let policy = RetryPolicy::new(0, Duration::from_secs(1));
        assert_eq!(policy.route(0), RetryRoute::DeadLetter { retries: 1 });
    }

    #[test]
    fn test_backoff_delay_grows_and_caps() {
        let backoff = Backoff {
            attempts: 5,
            base_ms: 100,
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(40), Duration::from_millis(MAX_BACKOFF_MS));
    }

    #[tokio::test]
    async fn test_run_retries_transient_errors() {
        let backoff = Backoff {
            attempts: 3,
            base_ms: 1,
        };
        let calls = AtomicU32::new(0);
        let result = backoff
            .run("test", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(QueueError::Unavailable("down".into()))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_gives_up_after_attempts() {
        let backoff = Backoff {
            attempts: 2,
            base_ms: 1,
        };
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = backoff
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(QueueError::Unavailable("down".into()))
            })
            .await;
        assert!(matches!(result, Err(QueueError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_run_does_not_retry_permanent_errors() {
        let backoff = Backoff::default();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = backoff
            .run("test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(QueueError::Backend("WRONGTYPE".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
