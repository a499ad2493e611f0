//! Queue and retry configuration.

use rand::Rng;
use serde::Deserialize;
use std::future::Future;
use tokio::time::{Duration, sleep};

/// Settings of one consumed queue.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue name, declared durable on start
    pub name: String,
    /// A disabled queue is not consumed at all
    pub enabled: bool,
    /// Unacknowledged deliveries the broker hands out at once
    pub prefetch_count: u16,
    /// Workers pulling from the delivery stream
    pub threads_count: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            enabled: true,
            prefetch_count: 10,
            threads_count: 1,
        }
    }
}

impl QueueConfig {
    /// An enabled queue with default limits.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Bounded retry with exponential backoff, used to settle deliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt. Doubles with each further attempt.
    pub initial_delay: Duration,
    /// Upper bound of the delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// The delay after the failed attempt number `attempt` (0-indexed).
    ///
    /// Doubles from `initial_delay` up to `max_delay` and is spread by ±10%.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        if base.is_zero() {
            return base;
        }
        let spread = rand::thread_rng().gen_range(0.9..=1.1);
        base.mul_f64(spread).min(self.max_delay)
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Runs `op` until it succeeds or `max_attempts` is reached.
    ///
    /// On exhaustion returns the number of attempts made and the last error.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, (u32, E)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if attempt >= max_attempts {
                        log::error!("{} failed after {} attempts: {}", what, attempt, e);
                        return Err((attempt, e));
                    }
                    let delay = self.delay(attempt - 1);
                    log::warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                        what,
                        attempt,
                        max_attempts,
                        e,
                        delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn queue_defaults() {
        let config = QueueConfig::new("mt_manager");
        assert_eq!(config.name, "mt_manager");
        assert!(config.enabled);
        assert_eq!(config.prefetch_count, 10);
        assert_eq!(config.threads_count, 1);
    }

    #[test]
    fn delay_backs_off_exponentially() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            ..Default::default()
        };
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(6), Duration::from_secs(60));
        assert_eq!(policy.backoff(100), Duration::from_secs(60));
    }

    #[test]
    fn delay_jitter_stays_within_bounds() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
            ..Default::default()
        };
        for _ in 0..100 {
            let delay = policy.delay(0);
            assert!(
                delay >= Duration::from_secs(9) && delay <= Duration::from_secs(11),
                "Delay {:?} out of expected range",
                delay
            );
        }
    }

    #[test]
    fn zero_initial_delay_never_waits() {
        let policy = RetryPolicy {
            initial_delay: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(policy.delay(3), Duration::ZERO);
    }

    #[tokio::test]
    async fn run_retries_until_success() {
        let calls = &AtomicU32::new(0);
        let result: Result<u32, (u32, String)> = policy(5)
            .run("ack", || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err(format!("fail {}", n)) } else { Ok(n) }
            })
            .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_gives_up_after_max_attempts() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), (u32, String)> = policy(3)
            .run("nack", || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("channel closed".to_string())
            })
            .await;
        assert_eq!(result, Err((3, "channel closed".to_string())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
