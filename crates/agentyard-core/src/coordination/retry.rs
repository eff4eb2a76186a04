//! Per-attempt timeout and exponential backoff

use crate::error::{Error, Result, TaskError};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Exponential backoff between attempts, capped at `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1000),
            max: Duration::from_millis(10_000),
        }
    }
}

impl Backoff {
    /// Delay after failed attempt number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Race `work` against `timeout`
pub async fn with_timeout<T, F>(task_id: &str, timeout: Duration, work: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, work).await {
        Ok(result) => result,
        Err(_) => Err(Error::Task(TaskError::Timeout {
            task_id: task_id.to_string(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        })),
    }
}

/// Result of a retried operation along with the attempts it took
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

/// Run `attempt` up to `max_attempts` times, each raced against `timeout`,
/// sleeping per `backoff` between failures.
///
/// Gives up early on errors that are not retryable. The final error is
/// always [`TaskError::RetryExhausted`].
pub async fn retry_with_backoff<T, F, Fut>(
    task_id: &str,
    max_attempts: u32,
    backoff: Backoff,
    timeout: Duration,
    mut attempt: F,
) -> Attempted<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = max_attempts.max(1);
    let mut number = 1;

    loop {
        match with_timeout(task_id, timeout, attempt(number)).await {
            Ok(value) => {
                debug!("Task {} succeeded on attempt {}", task_id, number);
                return Attempted {
                    result: Ok(value),
                    attempts: number,
                };
            }
            Err(e) if number >= max_attempts || !e.is_retryable() => {
                warn!("Task {} giving up after {} attempt(s): {}", task_id, number, e);
                return Attempted {
                    result: Err(Error::Task(TaskError::RetryExhausted {
                        task_id: task_id.to_string(),
                        attempts: number,
                        last_error: e.to_string(),
                    })),
                    attempts: number,
                };
            }
            Err(e) => {
                let delay = backoff.delay(number);
                warn!(
                    "Task {} attempt {}/{} failed, retrying in {:?}: {}",
                    task_id, number, max_attempts, delay, e
                );
                tokio::time::sleep(delay).await;
                number += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::time::Instant;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let backoff = Backoff::default();
        let delays: Vec<u128> = (1..=6).map(|n| backoff.delay(n).as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 10_000, 10_000]);
        assert_eq!(backoff.delay(40), Duration::from_millis(10_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_task_exhausts_with_two_delays() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let started = Instant::now();

        let recorded = Arc::clone(&calls);
        let outcome: Attempted<()> = retry_with_backoff(
            "t1",
            3,
            Backoff::default(),
            Duration::from_secs(300),
            move |n| {
                let recorded = Arc::clone(&recorded);
                async move {
                    recorded.lock().push((n, started.elapsed().as_millis()));
                    Err(Error::Task(TaskError::ExecutionFailed("boom".to_string())))
                }
            },
        )
        .await;

        assert_eq!(outcome.attempts, 3);
        assert!(matches!(
            outcome.result,
            Err(Error::Task(TaskError::RetryExhausted { attempts: 3, .. }))
        ));
        let calls = calls.lock().clone();
        let attempts: Vec<u32> = calls.iter().map(|(n, _)| *n).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        // ~1000ms then ~2000ms between attempts
        let gaps = [calls[1].1 - calls[0].1, calls[2].1 - calls[1].1];
        assert!((1000..1010).contains(&gaps[0]), "first gap {}", gaps[0]);
        assert!((2000..2010).contains(&gaps[1]), "second gap {}", gaps[1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failed_attempt() {
        let outcome = retry_with_backoff(
            "t2",
            2,
            Backoff::default(),
            Duration::from_millis(50),
            |n| async move {
                if n == 1 {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                }
                Ok::<_, Error>(n)
            },
        )
        .await;

        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.result.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_early() {
        let outcome: Attempted<()> = retry_with_backoff(
            "t3",
            5,
            Backoff::default(),
            Duration::from_secs(1),
            |_| async {
                Err(Error::Agent(crate::error::AgentError::NotFound("gone".to_string())))
            },
        )
        .await;
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_timeout_reports_budget() {
        let result = with_timeout("t4", Duration::from_millis(25), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
        match result {
            Err(Error::Task(TaskError::Timeout { timeout_ms, .. })) => assert_eq!(timeout_ms, 25),
            other => panic!("Expected timeout, got {:?}", other),
        }
    }
}
