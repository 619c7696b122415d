//! Tiered cache with stale-while-revalidate.
//!
//! L1 is an in-process bounded cache, L2 the shared KV. Entries carry their
//! own freshness windows (`fresh_until`, `stale_until`); the KV TTL is only
//! the physical reaper. Payload and metadata live under separate keys
//! (`cache:{key}:data` / `cache:{key}:meta`) so a refresh that produces an
//! unchanged checksum extends the TTL without rewriting the payload.
//!
//! Read path for `get_with`:
//! 1. L1 fresh hit -> return.
//! 2. L2 read, promote to L1; fresh -> return.
//! 3. Stale (past `fresh_until`, before `stale_until`) -> return stale and
//!    kick off at most one background refresh.
//! 4. Cold or expired -> single-flight refresh; concurrent callers wait on
//!    the in-process lock, losers across processes re-poll the cache.
//!
//! A failed refresh with a stale entry in hand extends `stale_until` by the
//! configured grace and keeps serving stale (stale-if-error).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::fingerprint::payload_checksum;
use crate::kv::{KvError, KvLock, KvStore};
use crate::observability::metric;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("refresh failed: {0}")]
    Refresh(String),
    #[error(transparent)]
    Kv(#[from] KvError),
}

/// Where a `get_with` answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    HitFreshL1,
    HitFreshL2,
    HitStale,
    Refreshed,
    /// Refresh failed but the stale payload was still within its window.
    StaleOnError,
}

impl CacheOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheOutcome::HitFreshL1 => "hit_fresh_l1",
            CacheOutcome::HitFreshL2 => "hit_fresh_l2",
            CacheOutcome::HitStale => "hit_stale",
            CacheOutcome::Refreshed => "refreshed",
            CacheOutcome::StaleOnError => "stale_on_error",
        }
    }
}

/// One cached value with its freshness windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub payload: Value,
    pub checksum: String,
    pub stored_at: DateTime<Utc>,
    pub fresh_until: DateTime<Utc>,
    pub stale_until: DateTime<Utc>,
}

impl CacheEntry {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.fresh_until
    }

    fn is_servable(&self, now: DateTime<Utc>) -> bool {
        now < self.stale_until
    }
}

/// Metadata half of an L2 entry; the payload lives under its own key.
#[derive(Debug, Serialize, Deserialize)]
struct EntryMeta {
    checksum: String,
    stored_at: DateTime<Utc>,
    fresh_until: DateTime<Utc>,
    stale_until: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct CacheStats {
    pub l1_hits: AtomicU64,
    pub l2_hits: AtomicU64,
    pub stale_hits: AtomicU64,
    pub misses: AtomicU64,
    pub refreshes: AtomicU64,
    pub refresh_failures: AtomicU64,
    pub singleflight_waits: AtomicU64,
}

impl CacheStats {
    pub fn summary(&self) -> String {
        format!(
            "l1={} l2={} stale={} miss={} refresh={} refresh_err={} waits={}",
            self.l1_hits.load(Ordering::Relaxed),
            self.l2_hits.load(Ordering::Relaxed),
            self.stale_hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.refreshes.load(Ordering::Relaxed),
            self.refresh_failures.load(Ordering::Relaxed),
            self.singleflight_waits.load(Ordering::Relaxed),
        )
    }
}

type InFlightMap = DashMap<String, Arc<Mutex<()>>>;

/// RAII removal of the in-flight marker, survives early returns.
struct InFlightGuard<'a> {
    map: &'a InFlightMap,
    key: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.map.remove(&self.key);
    }
}

pub struct TieredCache {
    l1: moka::sync::Cache<String, CacheEntry>,
    kv: Arc<dyn KvStore>,
    config: CacheConfig,
    in_flight: Arc<InFlightMap>,
    stats: Arc<CacheStats>,
}

impl TieredCache {
    pub fn new(kv: Arc<dyn KvStore>, config: CacheConfig) -> Self {
        let l1 = moka::sync::Cache::builder()
            .max_capacity(config.l1_max_size)
            .time_to_live(config.l1_ttl + config.stale_window)
            .build();
        Self {
            l1,
            kv,
            config,
            in_flight: Arc::new(DashMap::new()),
            stats: Arc::new(CacheStats::default()),
        }
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    fn data_key(key: &str) -> String {
        format!("cache:{key}:data")
    }

    fn meta_key(key: &str) -> String {
        format!("cache:{key}:meta")
    }

    /// Read-through get with a caller-supplied refresher.
    ///
    /// `fresh_for` is the freshness window applied when the refresher runs.
    pub async fn get_with<F, Fut>(
        self: &Arc<Self>,
        key: &str,
        fresh_for: Duration,
        refresher: F,
    ) -> Result<(Value, CacheOutcome), CacheError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let now = Utc::now();

        // 1. L1
        if let Some(entry) = self.l1.get(key) {
            if entry.is_fresh(now) {
                self.stats.l1_hits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(metric::CACHE_HITS, 1, "tier" => "l1", "freshness" => "fresh");
                return Ok((entry.payload, CacheOutcome::HitFreshL1));
            }
        }

        // 2. L2 (promotes to L1)
        let entry = match self.l1.get(key) {
            Some(entry) => Some(entry),
            None => {
                let fetched = self.l2_read(key).await?;
                if let Some(entry) = &fetched {
                    self.l1.insert(key.to_string(), entry.clone());
                }
                fetched
            }
        };

        if let Some(entry) = &entry {
            if entry.is_fresh(now) {
                self.stats.l2_hits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(metric::CACHE_HITS, 1, "tier" => "l2", "freshness" => "fresh");
                return Ok((entry.payload.clone(), CacheOutcome::HitFreshL2));
            }

            // 3. Stale-while-revalidate
            if entry.is_servable(now) && self.config.enable_swr {
                self.stats.stale_hits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(metric::CACHE_HITS, 1, "tier" => "l2", "freshness" => "stale");
                self.spawn_background_refresh(key, fresh_for, refresher);
                return Ok((entry.payload.clone(), CacheOutcome::HitStale));
            }
        }

        // 4. Cold or expired: single-flight refresh.
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        self.refresh_single_flight(key, fresh_for, &refresher, entry)
            .await
    }

    /// Drop a key from both tiers.
    pub async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.l1.invalidate(key);
        self.kv.del(&Self::data_key(key)).await?;
        self.kv.del(&Self::meta_key(key)).await?;
        Ok(())
    }

    async fn l2_read(&self, key: &str) -> Result<Option<CacheEntry>, KvError> {
        let Some(meta_raw) = self.kv.get(&Self::meta_key(key)).await? else {
            return Ok(None);
        };
        let Some(data_raw) = self.kv.get(&Self::data_key(key)).await? else {
            return Ok(None);
        };
        let Ok(meta) = serde_json::from_str::<EntryMeta>(&meta_raw) else {
            return Ok(None);
        };
        let Ok(payload) = serde_json::from_str::<Value>(&data_raw) else {
            return Ok(None);
        };
        Ok(Some(CacheEntry {
            payload,
            checksum: meta.checksum,
            stored_at: meta.stored_at,
            fresh_until: meta.fresh_until,
            stale_until: meta.stale_until,
        }))
    }

    async fn write_entry(&self, key: &str, entry: &CacheEntry, write_payload: bool) {
        let now = Utc::now();
        let ttl = (entry.stale_until - now)
            .to_std()
            .unwrap_or(Duration::from_secs(1));

        let meta = EntryMeta {
            checksum: entry.checksum.clone(),
            stored_at: entry.stored_at,
            fresh_until: entry.fresh_until,
            stale_until: entry.stale_until,
        };
        let meta_json = match serde_json::to_string(&meta) {
            Ok(s) => s,
            Err(e) => {
                warn!(key, error = %e, "cache meta serialization failed");
                return;
            }
        };

        if let Err(e) = self.kv.set(&Self::meta_key(key), &meta_json, Some(ttl)).await {
            warn!(key, error = %e, "cache meta write failed");
        }

        if write_payload {
            match serde_json::to_string(&entry.payload) {
                Ok(data_json) => {
                    if let Err(e) = self.kv.set(&Self::data_key(key), &data_json, Some(ttl)).await {
                        warn!(key, error = %e, "cache payload write failed");
                    }
                }
                Err(e) => warn!(key, error = %e, "cache payload serialization failed"),
            }
        } else {
            // Checksum unchanged: only push the physical expiry out.
            if let Err(e) = self.kv.expire(&Self::data_key(key), ttl).await {
                warn!(key, error = %e, "cache payload ttl extension failed");
            }
        }

        self.l1.insert(key.to_string(), entry.clone());
    }

    fn build_entry(&self, payload: Value, fresh_for: Duration) -> CacheEntry {
        let now = Utc::now();
        let fresh_until = now + chrono::Duration::from_std(fresh_for).unwrap_or_else(|_| chrono::Duration::zero());
        let stale_until =
            fresh_until + chrono::Duration::from_std(self.config.stale_window).unwrap_or_else(|_| chrono::Duration::zero());
        CacheEntry {
            checksum: payload_checksum(&payload),
            payload,
            stored_at: now,
            fresh_until,
            stale_until,
        }
    }

    /// Run the refresher under the in-process and cross-process locks.
    async fn refresh_single_flight<F, Fut>(
        self: &Arc<Self>,
        key: &str,
        fresh_for: Duration,
        refresher: &F,
        known_stale: Option<CacheEntry>,
    ) -> Result<(Value, CacheOutcome), CacheError>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = anyhow::Result<Value>> + Send,
    {
        let lock = self
            .in_flight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let waited = lock.try_lock().is_err();
        if waited {
            self.stats.singleflight_waits.fetch_add(1, Ordering::Relaxed);
        }
        let _guard = lock.lock().await;
        let _cleanup = InFlightGuard {
            map: &self.in_flight,
            key: key.to_string(),
        };

        // Someone may have refreshed while this task waited on the lock.
        let now = Utc::now();
        if let Some(entry) = self.l1.get(key) {
            if entry.is_fresh(now) {
                return Ok((entry.payload, CacheOutcome::HitFreshL1));
            }
        }
        if let Some(entry) = self.l2_read(key).await? {
            if entry.is_fresh(now) {
                self.l1.insert(key.to_string(), entry.clone());
                return Ok((entry.payload, CacheOutcome::HitFreshL2));
            }
        }

        // Cross-process gate. Losers poll the cache while the winner works.
        let kv_lock =
            match KvLock::try_acquire(self.kv.as_ref(), &format!("cache:{key}"), self.config.lock_ttl)
                .await?
            {
                Some(lock) => lock,
                None => {
                    if let Some(stale) = &known_stale {
                        if stale.is_servable(Utc::now()) {
                            return Ok((stale.payload.clone(), CacheOutcome::HitStale));
                        }
                    }
                    return self.poll_for_winner(key, fresh_for, refresher).await;
                }
            };

        let result = refresher().await;
        let outcome = match result {
            Ok(payload) => {
                self.stats.refreshes.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(metric::CACHE_REFRESHES, 1, "result" => "ok");
                let entry = self.store_refreshed(key, payload, fresh_for).await;
                Ok((entry.payload, CacheOutcome::Refreshed))
            }
            Err(err) => {
                self.stats.refresh_failures.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(metric::CACHE_REFRESHES, 1, "result" => "error");
                self.handle_refresh_failure(key, known_stale, err).await
            }
        };

        kv_lock.release().await;
        outcome
    }

    /// Compare checksums and store; unchanged payloads only get new windows.
    async fn store_refreshed(&self, key: &str, payload: Value, fresh_for: Duration) -> CacheEntry {
        let entry = self.build_entry(payload, fresh_for);
        let previous = self.l1.get(key);
        let unchanged = previous
            .as_ref()
            .map(|p| p.checksum == entry.checksum)
            .unwrap_or(false);
        if unchanged {
            debug!(key, "refresh produced identical payload, extending ttl");
        }
        self.write_entry(key, &entry, !unchanged).await;
        entry
    }

    async fn handle_refresh_failure(
        &self,
        key: &str,
        known_stale: Option<CacheEntry>,
        err: anyhow::Error,
    ) -> Result<(Value, CacheOutcome), CacheError> {
        let stale = match known_stale {
            Some(entry) => Some(entry),
            None => self.l2_read(key).await?.or_else(|| self.l1.get(key)),
        };

        match stale {
            Some(mut entry)
                if self.config.enable_stale_if_error && entry.is_servable(Utc::now()) =>
            {
                // Keep serving the old payload, pushed out by the grace period.
                entry.stale_until = entry.stale_until
                    + chrono::Duration::from_std(self.config.stale_if_error_grace)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                self.write_entry(key, &entry, false).await;
                warn!(key, error = %err, "refresh failed, serving stale");
                Ok((entry.payload, CacheOutcome::StaleOnError))
            }
            _ => Err(CacheError::Refresh(err.to_string())),
        }
    }

    /// Loser path across processes: wait for the winner's write to land.
    async fn poll_for_winner<F, Fut>(
        self: &Arc<Self>,
        key: &str,
        fresh_for: Duration,
        refresher: &F,
    ) -> Result<(Value, CacheOutcome), CacheError>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = anyhow::Result<Value>> + Send,
    {
        let deadline = tokio::time::Instant::now() + self.config.lock_ttl;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Some(entry) = self.l2_read(key).await? {
                if entry.is_fresh(Utc::now()) {
                    self.l1.insert(key.to_string(), entry.clone());
                    return Ok((entry.payload, CacheOutcome::HitFreshL2));
                }
            }
        }

        // The lock holder died; its lock will have expired, so take over.
        debug!(key, "single-flight winner never wrote, refreshing directly");
        match refresher().await {
            Ok(payload) => {
                let entry = self.store_refreshed(key, payload, fresh_for).await;
                Ok((entry.payload, CacheOutcome::Refreshed))
            }
            Err(err) => self.handle_refresh_failure(key, None, err).await,
        }
    }

    /// At most one background refresh per key; extra requests are dropped.
    fn spawn_background_refresh<F, Fut>(self: &Arc<Self>, key: &str, fresh_for: Duration, refresher: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        if self.in_flight.contains_key(key) {
            return;
        }
        let cache = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            let stale = cache.l1.get(&key);
            if let Err(err) = cache
                .refresh_single_flight(&key, fresh_for, &refresher, stale)
                .await
            {
                // Stale consumers were already answered; log and move on.
                debug!(key = %key, error = %err, "background refresh failed");
            }
        });
    }
}
