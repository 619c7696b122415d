//! Per-provider token-bucket rate limiting.
//!
//! Two budgets per bucket: a burst budget refilled proportionally to elapsed
//! time, and a daily quota that resets exactly at 00:00 UTC (never local
//! midnight). All mutation happens under one mutex per bucket.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::observability::metric;

#[derive(Debug, Clone)]
pub struct BucketSnapshot {
    pub provider: String,
    pub tokens: f64,
    pub capacity: f64,
    pub refill_per_second: f64,
    pub daily_remaining: u64,
    pub daily_reset_at: DateTime<Utc>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    daily_remaining: u64,
    daily_date: NaiveDate,
}

/// Token bucket with a UTC-day quota on top of the burst budget.
pub struct TokenBucket {
    provider: String,
    capacity: f64,
    refill_per_second: f64,
    daily_limit: u64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(provider: &str, capacity: f64, refill_per_second: f64, daily_limit: u64) -> Self {
        Self {
            provider: provider.to_string(),
            capacity,
            refill_per_second,
            daily_limit,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
                daily_remaining: daily_limit,
                daily_date: Utc::now().date_naive(),
            }),
        }
    }

    /// Consume `n` tokens if both the burst and daily budgets allow it.
    pub fn try_consume(&self, n: u32) -> bool {
        self.try_consume_at(n, Instant::now(), Utc::now())
    }

    fn try_consume_at(&self, n: u32, now: Instant, wall: DateTime<Utc>) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state, now, wall);

        let n_f = f64::from(n);
        let n_u = u64::from(n);
        if state.daily_remaining < n_u || state.tokens < n_f {
            return false;
        }
        state.tokens -= n_f;
        state.daily_remaining -= n_u;
        true
    }

    fn refill(&self, state: &mut BucketState, now: Instant, wall: DateTime<Utc>) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        state.tokens =
            (state.tokens + elapsed.as_secs_f64() * self.refill_per_second).min(self.capacity);
        state.last_refill = now;

        let today = wall.date_naive();
        if today != state.daily_date {
            debug!(provider = %self.provider, "daily quota reset");
            state.daily_date = today;
            state.daily_remaining = self.daily_limit;
        }
    }

    /// Wait until `n` tokens are available or the deadline passes.
    ///
    /// Returns false on deadline, or when the daily quota cannot satisfy the
    /// request before the deadline (the next reset is at UTC midnight).
    pub async fn wait_for(&self, n: u32, deadline: Instant) -> bool {
        loop {
            if self.try_consume(n) {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            let wait = {
                let mut state = self.state.lock();
                self.refill(&mut state, now, Utc::now());
                if state.daily_remaining < u64::from(n) {
                    // Burst refill cannot help; only the UTC-midnight reset can.
                    Duration::from_secs(1)
                } else {
                    let deficit = (f64::from(n) - state.tokens).max(0.0);
                    if self.refill_per_second > 0.0 {
                        Duration::from_secs_f64(deficit / self.refill_per_second)
                    } else {
                        Duration::from_secs(1)
                    }
                }
            };

            metrics::counter!(metric::RATE_LIMIT_WAITS, 1, "provider" => self.provider.clone());
            let remaining = deadline.saturating_duration_since(now);
            tokio::time::sleep(wait.min(remaining).max(Duration::from_millis(10))).await;
        }
    }

    pub fn snapshot(&self) -> BucketSnapshot {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now(), Utc::now());

        let next_midnight = state
            .daily_date
            .succ_opt()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| Utc.from_utc_datetime(&naive))
            .unwrap_or_else(Utc::now);

        BucketSnapshot {
            provider: self.provider.clone(),
            tokens: state.tokens,
            capacity: self.capacity,
            refill_per_second: self.refill_per_second,
            daily_remaining: state.daily_remaining,
            daily_reset_at: next_midnight,
        }
    }
}
