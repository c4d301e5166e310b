//! Retry with exponential backoff
//!
//! The delay before retry `n` (1-based) is `backoff_base * 2^(n-1)`, capped at
//! `max_backoff`. There is no jitter, so with a non-zero base the delays are
//! strictly increasing until the cap.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

use super::FetchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base: Duration::from_secs(2),
            max_backoff: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Run `op` until it succeeds, fails terminally, or attempts run out
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "{} failed, retrying",
                        what
                    );
                    tokio::time::sleep(delay).await;
                },
                Err(e) if e.is_transient() => {
                    return Err(FetchError::Exhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                },
                Err(e) => return Err(e),
            }
        }
    }
}
