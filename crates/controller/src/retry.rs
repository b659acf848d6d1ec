//! Bounded retry with exponential backoff for store operations.
//!
//! The delay before retry `n` (0-indexed) is `first × factor^n`, clamped to
//! `max`. The base is derived from the attempt number alone, so delays never
//! drift.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total tries, including the first one. `0` is treated as `1`.
    pub attempts: u32,
    pub first_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            first_delay_ms: 200,
            max_delay_ms: 2_000,
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub const fn once() -> Self {
        Self {
            attempts: 1,
            first_delay_ms: 0,
            max_delay_ms: 0,
            factor: 1.0,
        }
    }

    /// Delay before retry number `retry` (0 is the first retry).
    pub fn delay(&self, retry: u32) -> Duration {
        let max = Duration::from_millis(self.max_delay_ms);
        let exp = retry.min(i32::MAX as u32) as i32;
        let secs = Duration::from_millis(self.first_delay_ms).as_secs_f64() * self.factor.powi(exp);

        if !secs.is_finite() || secs < 0.0 || secs > max.as_secs_f64() {
            max
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Run `op` until it succeeds or the attempts are used up, sleeping
    /// between tries. Returns the last error.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let attempts = self.attempts.max(1);
        let mut retry = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if retry + 1 >= attempts => return Err(e),
                Err(e) => {
                    let wait = self.delay(retry);
                    tracing::warn!(
                        op = what,
                        attempt = retry + 1,
                        of = attempts,
                        wait_ms = wait.as_millis() as u64,
                        "{e}; retrying"
                    );
                    tokio::time::sleep(wait).await;
                    retry += 1;
                }
            }
        }
    }
}
