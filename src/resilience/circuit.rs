//! Distributed circuit breaker.
//!
//! State lives in the shared KV (`cb:{provider}:*`) so every worker process
//! sees the same circuit. Transitions run under a short-lived NX lock; a
//! worker that loses the lock skips the transition, another instance is
//! already handling it.
//!
//! CLOSED -> OPEN      after `failure_threshold` consecutive failures
//! OPEN -> HALF_OPEN   on the first probe after `recovery_time`
//! HALF_OPEN -> CLOSED after `success_threshold` consecutive successes
//! HALF_OPEN -> OPEN   on any failure

use chrono::Utc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::BreakerConfig;
use crate::kv::{KvError, KvLock, KvStore};
use crate::observability::metric;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "open" => CircuitState::Open,
            "half_open" => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure modes of a breaker-guarded call.
#[derive(Debug, thiserror::Error)]
pub enum BreakerCallError<E> {
    #[error("circuit open for {0}, fast-failing")]
    Open(String),
    #[error("guarded call timed out")]
    Timeout,
    #[error("guarded call failed")]
    Inner(E),
    #[error(transparent)]
    Kv(#[from] KvError),
}

#[derive(Debug, Clone)]
pub struct BreakerMetrics {
    pub provider: String,
    pub state: CircuitState,
    pub consecutive_failures: i64,
    pub successes_in_half_open: i64,
    pub opened_at_unix: Option<i64>,
}

/// Circuit breaker guarding calls to one provider.
pub struct CircuitBreaker {
    provider: String,
    config: BreakerConfig,
    state_key: String,
    failures_key: String,
    successes_key: String,
    opened_at_key: String,
    lock_name: String,
}

impl CircuitBreaker {
    pub fn new(provider: &str, config: BreakerConfig) -> Self {
        Self {
            provider: provider.to_string(),
            config,
            state_key: format!("cb:{provider}:state"),
            failures_key: format!("cb:{provider}:failures"),
            successes_key: format!("cb:{provider}:successes"),
            opened_at_key: format!("cb:{provider}:opened_at"),
            lock_name: format!("cb:{provider}"),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.config.call_timeout
    }

    async fn state(&self, kv: &dyn KvStore) -> Result<CircuitState, KvError> {
        Ok(kv
            .get(&self.state_key)
            .await?
            .map(|s| CircuitState::parse(&s))
            .unwrap_or(CircuitState::Closed))
    }

    async fn set_state(&self, kv: &dyn KvStore, state: CircuitState) -> Result<(), KvError> {
        kv.set(&self.state_key, state.as_str(), None).await?;
        metrics::counter!(
            metric::BREAKER_TRANSITIONS,
            1,
            "provider" => self.provider.clone(),
            "state" => state.as_str()
        );
        info!(provider = %self.provider, state = %state, "breaker state changed");
        Ok(())
    }

    async fn counter(&self, kv: &dyn KvStore, key: &str) -> Result<i64, KvError> {
        Ok(kv
            .get(key)
            .await?
            .and_then(|s| s.parse().ok())
            .unwrap_or(0))
    }

    /// True in CLOSED and HALF_OPEN; in OPEN the first probe past
    /// `recovery_time` flips the circuit to HALF_OPEN and is admitted.
    pub async fn can_execute(&self, kv: &dyn KvStore) -> Result<bool, KvError> {
        match self.state(kv).await? {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(true),
            CircuitState::Open => {
                let opened_at = self.counter(kv, &self.opened_at_key).await?;
                let elapsed = Utc::now().timestamp() - opened_at;
                if elapsed < self.config.recovery_time.as_secs() as i64 {
                    return Ok(false);
                }
                // One probe at a time: the transition lock decides who goes.
                match KvLock::try_acquire(kv, &self.lock_name, Duration::from_secs(5)).await? {
                    Some(lock) => {
                        self.set_state(kv, CircuitState::HalfOpen).await?;
                        kv.del(&self.successes_key).await?;
                        lock.release().await;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
        }
    }

    pub async fn record_success(&self, kv: &dyn KvStore) -> Result<(), KvError> {
        let Some(lock) = KvLock::try_acquire(kv, &self.lock_name, Duration::from_secs(5)).await?
        else {
            // Another instance is mid-transition; its bookkeeping wins.
            return Ok(());
        };

        let result = async {
            match self.state(kv).await? {
                CircuitState::Closed => kv.del(&self.failures_key).await,
                CircuitState::HalfOpen => {
                    let successes = kv.incr_by(&self.successes_key, 1).await?;
                    if successes >= i64::from(self.config.success_threshold) {
                        self.set_state(kv, CircuitState::Closed).await?;
                        kv.del(&self.failures_key).await?;
                        kv.del(&self.successes_key).await?;
                        info!(
                            provider = %self.provider,
                            successes,
                            "breaker closed after recovery"
                        );
                    }
                    Ok(())
                }
                CircuitState::Open => Ok(()),
            }
        }
        .await;

        lock.release().await;
        result
    }

    pub async fn record_failure(&self, kv: &dyn KvStore) -> Result<(), KvError> {
        let Some(lock) = KvLock::try_acquire(kv, &self.lock_name, Duration::from_secs(5)).await?
        else {
            return Ok(());
        };

        let result = async {
            match self.state(kv).await? {
                CircuitState::Closed => {
                    let failures = kv.incr_by(&self.failures_key, 1).await?;
                    if failures >= i64::from(self.config.failure_threshold) {
                        self.open(kv).await?;
                        warn!(
                            provider = %self.provider,
                            failures,
                            "breaker opened"
                        );
                    }
                    Ok(())
                }
                CircuitState::HalfOpen => {
                    self.open(kv).await?;
                    kv.del(&self.successes_key).await?;
                    warn!(provider = %self.provider, "breaker re-opened from half-open");
                    Ok(())
                }
                CircuitState::Open => Ok(()),
            }
        }
        .await;

        lock.release().await;
        result
    }

    async fn open(&self, kv: &dyn KvStore) -> Result<(), KvError> {
        self.set_state(kv, CircuitState::Open).await?;
        kv.set(
            &self.opened_at_key,
            &Utc::now().timestamp().to_string(),
            None,
        )
        .await
    }

    /// Run `fut` under the breaker: fast-fail while open, apply the
    /// configured call timeout, record the outcome.
    pub async fn execute<T, E, Fut>(
        &self,
        kv: &dyn KvStore,
        fut: Fut,
    ) -> Result<T, BreakerCallError<E>>
    where
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        if !self.can_execute(kv).await? {
            return Err(BreakerCallError::Open(self.provider.clone()));
        }

        let result = match self.config.call_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_) => {
                    self.record_failure(kv).await?;
                    return Err(BreakerCallError::Timeout);
                }
            },
            None => fut.await,
        };

        match result {
            Ok(value) => {
                self.record_success(kv).await?;
                Ok(value)
            }
            Err(inner) => {
                self.record_failure(kv).await?;
                Err(BreakerCallError::Inner(inner))
            }
        }
    }

    pub async fn metrics(&self, kv: &dyn KvStore) -> Result<BreakerMetrics, KvError> {
        let opened_at = kv
            .get(&self.opened_at_key)
            .await?
            .and_then(|s| s.parse().ok());
        Ok(BreakerMetrics {
            provider: self.provider.clone(),
            state: self.state(kv).await?,
            consecutive_failures: self.counter(kv, &self.failures_key).await?,
            successes_in_half_open: self.counter(kv, &self.successes_key).await?,
            opened_at_unix: opened_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;

    fn breaker(failure_threshold: u32, recovery_secs: u64, success_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test_provider",
            BreakerConfig {
                failure_threshold,
                recovery_time: Duration::from_secs(recovery_secs),
                success_threshold,
                call_timeout: None,
            },
        )
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let kv = MemoryKv::new();
        let cb = breaker(3, 60, 2);

        for _ in 0..2 {
            cb.record_failure(&kv).await.unwrap();
            assert!(cb.can_execute(&kv).await.unwrap());
        }
        cb.record_failure(&kv).await.unwrap();
        assert!(!cb.can_execute(&kv).await.unwrap());
        assert_eq!(cb.metrics(&kv).await.unwrap().state, CircuitState::Open);
    }

    #[tokio::test]
    async fn success_in_closed_resets_failures() {
        let kv = MemoryKv::new();
        let cb = breaker(3, 60, 2);

        cb.record_failure(&kv).await.unwrap();
        cb.record_failure(&kv).await.unwrap();
        cb.record_success(&kv).await.unwrap();
        assert_eq!(cb.metrics(&kv).await.unwrap().consecutive_failures, 0);

        // The old failures are forgotten.
        cb.record_failure(&kv).await.unwrap();
        cb.record_failure(&kv).await.unwrap();
        assert!(cb.can_execute(&kv).await.unwrap());
    }

    #[tokio::test]
    async fn trip_recover_close_cycle() {
        let kv = MemoryKv::new();
        let cb = breaker(3, 1, 2);

        for _ in 0..3 {
            cb.record_failure(&kv).await.unwrap();
        }
        // Fast-fail while open.
        assert!(!cb.can_execute(&kv).await.unwrap());

        tokio::time::sleep(Duration::from_millis(1100)).await;

        // First probe flips to half-open and is admitted.
        assert!(cb.can_execute(&kv).await.unwrap());
        assert_eq!(cb.metrics(&kv).await.unwrap().state, CircuitState::HalfOpen);

        cb.record_success(&kv).await.unwrap();
        assert_eq!(cb.metrics(&kv).await.unwrap().state, CircuitState::HalfOpen);
        cb.record_success(&kv).await.unwrap();
        assert_eq!(cb.metrics(&kv).await.unwrap().state, CircuitState::Closed);
        assert!(cb.can_execute(&kv).await.unwrap());
    }

    #[tokio::test]
    async fn execute_drives_the_full_trip_and_recovery() {
        let kv = MemoryKv::new();
        let cb = breaker(3, 1, 2);

        async fn failing() -> Result<(), &'static str> {
            Err("provider down")
        }
        async fn succeeding() -> Result<u32, &'static str> {
            Ok(7)
        }

        for _ in 0..3 {
            let err = cb.execute(&kv, failing()).await.unwrap_err();
            assert!(matches!(err, BreakerCallError::Inner(_)));
        }

        // Open: fast-fail without touching the provider.
        let err = cb.execute(&kv, succeeding()).await.unwrap_err();
        assert!(matches!(err, BreakerCallError::Open(_)));

        tokio::time::sleep(Duration::from_millis(1100)).await;

        // Probe succeeds -> half-open; second success -> closed.
        assert_eq!(cb.execute(&kv, succeeding()).await.unwrap(), 7);
        assert_eq!(cb.metrics(&kv).await.unwrap().state, CircuitState::HalfOpen);
        assert_eq!(cb.execute(&kv, succeeding()).await.unwrap(), 7);
        assert_eq!(cb.metrics(&kv).await.unwrap().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn execute_timeout_counts_as_failure() {
        let kv = MemoryKv::new();
        let cb = CircuitBreaker::new(
            "slow_provider",
            BreakerConfig {
                failure_threshold: 2,
                recovery_time: Duration::from_secs(60),
                success_threshold: 1,
                call_timeout: Some(Duration::from_millis(50)),
            },
        );

        let slow = || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<(), &'static str>(())
        };
        assert!(matches!(
            cb.execute(&kv, slow()).await.unwrap_err(),
            BreakerCallError::Timeout
        ));
        assert!(matches!(
            cb.execute(&kv, slow()).await.unwrap_err(),
            BreakerCallError::Timeout
        ));
        assert_eq!(cb.metrics(&kv).await.unwrap().state, CircuitState::Open);
    }

    #[tokio::test]
    async fn failure_in_half_open_reopens() {
        let kv = MemoryKv::new();
        let cb = breaker(2, 1, 2);

        cb.record_failure(&kv).await.unwrap();
        cb.record_failure(&kv).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(cb.can_execute(&kv).await.unwrap());

        cb.record_failure(&kv).await.unwrap();
        assert_eq!(cb.metrics(&kv).await.unwrap().state, CircuitState::Open);
        assert!(!cb.can_execute(&kv).await.unwrap());
    }
}
