//! Exponential backoff for rate-limited spreadsheet calls

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use super::SheetsError;
use crate::util::sanitize;

/// Backoff schedule applied to rate-limit rejections only.
///
/// Attempt `n` (1-based) that fails with a rate limit waits
/// `min(base * 2^(n-1), max_delay)` plus up to `base / 2` of jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(32),
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt`, without jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    fn jitter(&self) -> Duration {
        let cap = u64::try_from(self.base_delay.as_millis() / 2).unwrap_or(u64::MAX);
        if cap == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..cap))
    }

    /// Run `op` until it succeeds, fails with a non-rate-limit error, or the
    /// attempt budget is spent. `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, SheetsError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, SheetsError>>,
    {
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_rate_limited() && attempt < self.max_attempts => {
                    let delay = self.backoff(attempt) + self.jitter();
                    tracing::warn!(
                        operation,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %sanitize(&error),
                        "Sheets API rate limited, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn rate_limited() -> SheetsError {
        SheetsError::RateLimited {
            status: 429,
            message: "slow down".to_string(),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
        assert_eq!(policy.backoff(10), Duration::from_secs(32));
        assert_eq!(policy.backoff(64), Duration::from_secs(32));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_rate_limits_with_growing_delays() {
        let calls = std::sync::Mutex::new(Vec::new());
        let policy = RetryPolicy::default();

        let result = policy
            .run("append", |attempt| {
                calls.lock().unwrap().push(Instant::now());
                async move {
                    if attempt < 3 {
                        Err(rate_limited())
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;

        assert_eq!(result, Ok(3));
        let calls = calls.into_inner().unwrap();
        assert_eq!(calls.len(), 3);
        let first_gap = calls[1] - calls[0];
        let second_gap = calls[2] - calls[1];
        assert!(first_gap >= Duration::from_secs(1));
        assert!(second_gap >= Duration::from_secs(2));
        assert!(second_gap > first_gap);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::default()
            .run("update", |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(rate_limited()) }
            })
            .await;

        assert!(result.unwrap_err().is_rate_limited());
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn other_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = RetryPolicy::default()
            .run("update", |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(SheetsError::Api {
                        status: 400,
                        message: "bad range".to_string(),
                    })
                }
            })
            .await;

        assert!(matches!(result, Err(SheetsError::Api { status: 400, .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
