//! Distributed KV contract.
//!
//! One trait covers everything the core needs from the shared store:
//! GET/SET with TTL, SET-if-absent (NX+EX), atomic INCRBY, EXPIRE and DEL.
//! The L2 cache, circuit breaker, budget firewall and single-flight lock all
//! speak this interface; backends are in-memory (default, tests) and Redis.
//!
//! Key namespaces:
//! - `cb:{provider}`     circuit breaker state
//! - `cache:{sha256}`    L2 cache entries
//! - `lock:{key}`        single-flight / transition locks
//! - `budget:{scope}`    budget counters
//! - `bucket:{provider}` reserved for shared-quota token draws

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use std::time::Duration;

pub use self::memory::MemoryKv;
pub use self::redis::RedisKv;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("kv backend unavailable: {0}")]
    Unavailable(String),
    #[error("kv value for {key} is not an integer")]
    NotAnInteger { key: String },
}

/// Shared KV store with TTL semantics.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    /// SET, with optional expiry.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError>;

    /// SET NX EX: returns true when the key was absent and is now set.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError>;

    /// Atomic increment; missing keys start at zero. Returns the new value.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, KvError>;

    /// Returns false when the key did not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError>;

    async fn del(&self, key: &str) -> Result<(), KvError>;
}

/// Acquire-or-skip distributed lock over `lock:{name}`.
///
/// Not a blocking mutex: callers that lose the race are expected to retry
/// their read path, exactly like single-flight losers re-reading the cache.
pub struct KvLock<'a> {
    kv: &'a dyn KvStore,
    key: String,
    held: bool,
}

impl<'a> KvLock<'a> {
    pub async fn try_acquire(
        kv: &'a dyn KvStore,
        name: &str,
        ttl: Duration,
    ) -> Result<Option<KvLock<'a>>, KvError> {
        let key = format!("lock:{name}");
        if kv.set_nx(&key, "1", ttl).await? {
            Ok(Some(KvLock {
                kv,
                key,
                held: true,
            }))
        } else {
            Ok(None)
        }
    }

    pub async fn release(mut self) {
        if self.held {
            self.held = false;
            // Best effort; the TTL reaps abandoned locks anyway.
            let _ = self.kv.del(&self.key).await;
        }
    }
}
