//! In-process KV backend.
//!
//! Default backend when no `REDIS_URL` is configured, and the backend every
//! test runs against. TTLs are enforced lazily on access plus a periodic
//! sweep so the map does not grow without bound.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::{KvError, KvStore};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at <= now).unwrap_or(false)
    }
}

/// TTL-aware in-memory store.
pub struct MemoryKv {
    entries: Mutex<HashMap<String, Entry>>,
    sweep_every: u64,
    ops_since_sweep: Mutex<u64>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            sweep_every: 512,
            ops_since_sweep: Mutex::new(0),
        }
    }

    fn maybe_sweep(&self) {
        let mut ops = self.ops_since_sweep.lock();
        *ops += 1;
        if *ops < self.sweep_every {
            return;
        }
        *ops = 0;
        drop(ops);

        let now = Instant::now();
        self.entries.lock().retain(|_, e| !e.is_expired(now));
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .values()
            .filter(|e| !e.is_expired(now))
            .count()
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.maybe_sweep();
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(e) if e.is_expired(now) => {
                entries.remove(key);
                Ok(None)
            }
            Some(e) => Ok(Some(e.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        self.maybe_sweep();
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, KvError> {
        self.maybe_sweep();
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let occupied = entries.get(key).map(|e| !e.is_expired(now)).unwrap_or(false);
        if occupied {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, KvError> {
        self.maybe_sweep();
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let current = match entries.get(key) {
            Some(e) if !e.is_expired(now) => {
                e.value.parse::<i64>().map_err(|_| KvError::NotAnInteger {
                    key: key.to_string(),
                })?
            }
            _ => 0,
        };
        let next = current + delta;
        let expires_at = entries.get(key).and_then(|e| e.expires_at);
        entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, KvError> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(e) if !e.is_expired(now) => {
                e.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn del(&self, key: &str) -> Result<(), KvError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_del_roundtrip() {
        let kv = MemoryKv::new();
        kv.set("k", "v", None).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
        kv.del("k").await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn ttl_expires_entries() {
        let kv = MemoryKv::new();
        kv.set("k", "v", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(kv.get("k").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_nx_respects_live_entry() {
        let kv = MemoryKv::new();
        assert!(kv
            .set_nx("lock", "a", Duration::from_millis(30))
            .await
            .unwrap());
        assert!(!kv
            .set_nx("lock", "b", Duration::from_millis(30))
            .await
            .unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Expired entry behaves like an absent one.
        assert!(kv
            .set_nx("lock", "c", Duration::from_millis(30))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn incr_starts_at_zero_and_accumulates() {
        let kv = MemoryKv::new();
        assert_eq!(kv.incr_by("n", 3).await.unwrap(), 3);
        assert_eq!(kv.incr_by("n", -1).await.unwrap(), 2);
        kv.set("s", "abc", None).await.unwrap();
        assert!(kv.incr_by("s", 1).await.is_err());
    }

    #[tokio::test]
    async fn expire_reports_missing_keys() {
        let kv = MemoryKv::new();
        assert!(!kv.expire("nope", Duration::from_secs(1)).await.unwrap());
        kv.set("k", "v", None).await.unwrap();
        assert!(kv.expire("k", Duration::from_millis(20)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }
}
