//! # Exponential Backoff
//!
//! Retry delays for transient host and Docker failures. Each delay doubles
//! the previous one up to a cap, and a random jitter of up to half the delay
//! is added so hosts retrying in parallel do not hit a registry in lockstep.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Exponential backoff calculator
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay returned by the next call, before jitter
    current: Duration,
    /// Cap on the delay before jitter
    max: Duration,
}

impl ExponentialBackoff {
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { current: base, max }
    }

    /// Next delay, advancing the sequence
    pub fn next_backoff(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(self.current.saturating_mul(2), self.max);
        if !delay.is_zero() {
            let half = u64::try_from(delay.as_millis() / 2).unwrap_or(u64::MAX);
            delay + Duration::from_millis(rand::thread_rng().gen_range(0..=half))
        } else {
            delay
        }
    }
}

/// Bounded retry with exponential backoff
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base: Duration::from_secs(2),
            max: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Retry `op` while `retryable` says so and attempts remain
    ///
    /// # Errors
    ///
    /// Returns the last error once attempts are exhausted, or the first
    /// error `retryable` rejects.
    pub async fn run<T, E, F, Fut>(&self, what: &str, retryable: impl Fn(&E) -> bool, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut backoff = ExponentialBackoff::new(self.base, self.max);
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.attempts && retryable(&e) => {
                    let delay = backoff.next_backoff();
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        what, attempt, self.attempts, delay, e
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
    fn test_exponential_sequence_caps() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10));
        for expected in [1u64, 2, 4, 8, 10, 10] {
            let delay = backoff.next_backoff();
            assert!(delay >= Duration::from_secs(expected), "{delay:?}");
            assert!(delay <= Duration::from_millis(expected * 1500), "{delay:?}");
        }
    }

    #[test]
    fn test_jitter_stays_within_half() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(100), Duration::from_secs(1));
        for expected in [100u128, 200, 400] {
            let delay = backoff.next_backoff().as_millis();
            assert!(delay >= expected && delay <= expected + expected / 2, "{delay}");
        }
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            attempts: 3,
            base: Duration::from_millis(1),
            max: Duration::from_millis(2),
        };
        let result: Result<u32, String> = policy
            .run("flaky", |_| true, || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 { Err(format!("attempt {n}")) } else { Ok(n) }
            })
            .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn test_retry_stops_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy {
            attempts: 5,
            base: Duration::from_millis(1),
            max: Duration::from_millis(2),
        };
        let result: Result<(), String> = policy
            .run("permanent", |e: &String| e != "fatal", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("fatal".to_string())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
