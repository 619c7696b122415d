//! Retry with exponential backoff and jitter.
//!
//! delay(k) = base * 2^k + uniform(0, base), capped. Only errors flagged
//! retryable are retried, and a 429's Retry-After takes precedence over the
//! computed backoff.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Implemented by error types the retry engine can classify.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
    /// Server-requested delay (Retry-After), when present.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts,
            base,
            cap,
        }
    }

    /// Backoff before attempt `k+1` (zero-based `k`), jittered.
    pub fn delay(&self, k: u32) -> Duration {
        let exp = self.base.as_secs_f64() * 2f64.powi(k as i32);
        let jitter = rand::thread_rng().gen_range(0.0..self.base.as_secs_f64().max(1e-9));
        Duration::from_secs_f64((exp + jitter).min(self.cap.as_secs_f64()))
    }

    /// Worst-case total backoff across all attempts (for deadline sizing).
    pub fn max_total_delay(&self) -> Duration {
        let mut total = Duration::ZERO;
        for k in 0..self.max_attempts.saturating_sub(1) {
            let exp = self.base.as_secs_f64() * 2f64.powi(k as i32) + self.base.as_secs_f64();
            total += Duration::from_secs_f64(exp.min(self.cap.as_secs_f64()));
        }
        total
    }

    /// Run `op` up to `max_attempts` times.
    ///
    /// `admit` is polled before each retry so an opened circuit stops the
    /// loop early; the last error is returned as-is.
    pub async fn run<T, E, Op, Fut, Admit, AdmitFut>(&self, mut op: Op, admit: Admit) -> Result<T, E>
    where
        E: Retryable,
        Op: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        Admit: Fn() -> AdmitFut,
        AdmitFut: Future<Output = bool>,
    {
        let mut attempt = 0u32;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    attempt += 1;
                    if !err.is_retryable() || attempt >= self.max_attempts {
                        return Err(err);
                    }
                    let delay = err.retry_after().unwrap_or_else(|| self.delay(attempt - 1));
                    debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after error");
                    tokio::time::sleep(delay).await;
                    if !admit().await {
                        return Err(err);
                    }
                }
            }
        }
    }
}
