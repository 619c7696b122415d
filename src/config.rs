//! Runtime configuration.
//!
//! Everything is read from the environment with coded defaults; per-provider
//! blocks may additionally be overridden by an optional `providers.toml`.
//! `BRAIN_KEY` is the one hard requirement: without it the process refuses
//! to start, because the audit table cannot be encrypted.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::registry::SourcePriority;

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> T {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(var: &str, default: bool) -> bool {
    std::env::var(var)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
        .unwrap_or(default)
}

/// Tiered cache settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub l1_max_size: u64,
    pub l1_ttl: Duration,
    pub l2_ttl: Duration,
    /// How long past `fresh_until` an entry may still be served stale.
    pub stale_window: Duration,
    pub enable_swr: bool,
    pub enable_stale_if_error: bool,
    /// `stale_until` extension applied when a refresh fails.
    pub stale_if_error_grace: Duration,
    /// TTL on the cross-process single-flight lock.
    pub lock_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_max_size: 10_000,
            l1_ttl: Duration::from_secs(120),
            l2_ttl: Duration::from_secs(1800),
            stale_window: Duration::from_secs(300),
            enable_swr: true,
            enable_stale_if_error: true,
            stale_if_error_grace: Duration::from_secs(120),
            lock_ttl: Duration::from_secs(30),
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            l1_max_size: env_parse("L1_MAX_SIZE", d.l1_max_size),
            l1_ttl: Duration::from_secs(env_parse("L1_TTL", d.l1_ttl.as_secs())),
            l2_ttl: Duration::from_secs(env_parse("L2_TTL", d.l2_ttl.as_secs())),
            stale_window: Duration::from_secs(env_parse("STALE_WINDOW", d.stale_window.as_secs())),
            enable_swr: env_flag("ENABLE_SWR", d.enable_swr),
            enable_stale_if_error: env_flag("ENABLE_STALE_IF_ERROR", d.enable_stale_if_error),
            stale_if_error_grace: Duration::from_secs(env_parse(
                "STALE_IF_ERROR_GRACE",
                d.stale_if_error_grace.as_secs(),
            )),
            lock_ttl: d.lock_ttl,
        }
    }
}

/// Circuit breaker settings, shared by all providers unless overridden.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_time: Duration,
    pub success_threshold: u32,
    /// Per-call timeout applied by `execute`.
    pub call_timeout: Option<Duration>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_time: Duration::from_secs(60),
            success_threshold: 3,
            call_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl BreakerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let timeout = env_parse("TIMEOUT_SEC", 30u64);
        Self {
            failure_threshold: env_parse("FAILURE_THRESHOLD", d.failure_threshold),
            recovery_time: Duration::from_secs(env_parse(
                "RECOVERY_TIME_SEC",
                d.recovery_time.as_secs(),
            )),
            success_threshold: env_parse("SUCCESS_THRESHOLD", d.success_threshold),
            call_timeout: (timeout > 0).then(|| Duration::from_secs(timeout)),
        }
    }
}

/// Budget firewall settings. Amounts are micro-dollars.
#[derive(Debug, Clone)]
pub struct BudgetConfig {
    pub default_budget_micros: i64,
    pub period: Duration,
    /// Fraction of the hard limit at which a warning is emitted.
    pub soft_threshold: f64,
    pub hard_limit_micros: i64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            default_budget_micros: 10_000_000, // $10
            period: Duration::from_secs(86_400),
            soft_threshold: 0.8,
            hard_limit_micros: 10_000_000,
        }
    }
}

impl BudgetConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            default_budget_micros: env_parse("DEFAULT_BUDGET", d.default_budget_micros),
            period: Duration::from_secs(env_parse("BUDGET_PERIOD_SEC", d.period.as_secs())),
            soft_threshold: env_parse("SOFT_THRESHOLD", d.soft_threshold),
            hard_limit_micros: env_parse("HARD_LIMIT", d.hard_limit_micros),
        }
    }
}

/// Compression codec for the columnar sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkCompression {
    Lz4,
    Snappy,
}

/// Durable sink settings.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub data_root: PathBuf,
    pub buffer_size_bytes: usize,
    pub max_buffer_items: usize,
    pub flush_interval: Duration,
    pub compression: SinkCompression,
    pub row_group_size: usize,
    pub audit_enabled: bool,
    pub audit_db_path: PathBuf,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("./data"),
            buffer_size_bytes: 512 * 1024 * 1024,
            max_buffer_items: 50_000,
            flush_interval: Duration::from_secs(300),
            compression: SinkCompression::Lz4,
            row_group_size: 10_000,
            audit_enabled: false,
            audit_db_path: PathBuf::from("./data/audit.db"),
        }
    }
}

impl SinkConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let data_root = PathBuf::from(
            std::env::var("DATA_ROOT").unwrap_or_else(|_| "./data".to_string()),
        );
        let compression = match std::env::var("COMPRESSION").as_deref() {
            Ok("SNAPPY") | Ok("snappy") => SinkCompression::Snappy,
            _ => SinkCompression::Lz4,
        };
        let audit_db_path = data_root.join("audit.db");
        Self {
            buffer_size_bytes: env_parse("BUFFER_SIZE_MB", 512usize) * 1024 * 1024,
            max_buffer_items: env_parse("MAX_BUFFER_ITEMS", d.max_buffer_items),
            flush_interval: Duration::from_secs(env_parse(
                "FLUSH_INTERVAL_SEC",
                d.flush_interval.as_secs(),
            )),
            compression,
            row_group_size: env_parse("ROW_GROUP_SIZE", d.row_group_size),
            audit_enabled: env_flag("AUDIT_ENABLED", d.audit_enabled),
            audit_db_path,
            data_root,
        }
    }
}

/// Scheduler tier intervals.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub high: Duration,
    pub medium: Duration,
    pub low: Duration,
    pub daily: Duration,
    pub tick: Duration,
    pub max_retries: u32,
    pub retry_base: Duration,
    pub retry_cap: Duration,
    pub shutdown_grace: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            high: Duration::from_secs(60),
            medium: Duration::from_secs(900),
            low: Duration::from_secs(3600),
            daily: Duration::from_secs(86_400),
            tick: Duration::from_secs(10),
            max_retries: 3,
            retry_base: Duration::from_secs(60),
            retry_cap: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl SchedulerConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            high: Duration::from_secs(env_parse("SCHED_HIGH", d.high.as_secs())),
            medium: Duration::from_secs(env_parse("SCHED_MEDIUM", d.medium.as_secs())),
            low: Duration::from_secs(env_parse("SCHED_LOW", d.low.as_secs())),
            daily: Duration::from_secs(env_parse("SCHED_DAILY", d.daily.as_secs())),
            tick: d.tick,
            max_retries: env_parse("SCHED_MAX_RETRIES", d.max_retries),
            retry_base: d.retry_base,
            retry_cap: d.retry_cap,
            shutdown_grace: Duration::from_secs(env_parse(
                "SHUTDOWN_GRACE_SEC",
                d.shutdown_grace.as_secs(),
            )),
        }
    }
}

/// Per-provider settings resolved from env (`<PROVIDER>_API_KEY` etc.) with
/// optional `providers.toml` overrides.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub name: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub rate_limit_capacity: f64,
    pub rate_limit_refill_per_sec: f64,
    pub daily_limit: u64,
    pub priority: SourcePriority,
    pub enabled: bool,
    /// Extra provider-specific knobs (RSS feed URLs, watchlists).
    pub extra: HashMap<String, String>,
}

impl ProviderSettings {
    fn new(name: &str, priority: SourcePriority) -> Self {
        Self {
            name: name.to_string(),
            api_key: None,
            base_url: None,
            rate_limit_capacity: 10.0,
            rate_limit_refill_per_sec: 0.5,
            daily_limit: 10_000,
            priority,
            enabled: true,
            extra: HashMap::new(),
        }
    }

    fn apply_env(mut self) -> Self {
        let prefix = self.name.to_uppercase();
        if let Ok(v) = std::env::var(format!("{prefix}_API_KEY")) {
            self.api_key = Some(v);
        }
        if let Ok(v) = std::env::var(format!("{prefix}_BASE_URL")) {
            self.base_url = Some(v);
        }
        self.rate_limit_capacity =
            env_parse(&format!("{prefix}_RATE_LIMIT_CAPACITY"), self.rate_limit_capacity);
        self.rate_limit_refill_per_sec = env_parse(
            &format!("{prefix}_RATE_LIMIT_REFILL"),
            self.rate_limit_refill_per_sec,
        );
        self.daily_limit = env_parse(&format!("{prefix}_DAILY_LIMIT"), self.daily_limit);
        if let Ok(v) = std::env::var(format!("{prefix}_PRIORITY")) {
            if let Some(p) = SourcePriority::parse(&v) {
                self.priority = p;
            }
        }
        self.enabled = env_flag(&format!("{prefix}_ENABLED"), self.enabled);
        self
    }
}

#[derive(Debug, Deserialize)]
struct ProviderFileEntry {
    api_key: Option<String>,
    base_url: Option<String>,
    rate_limit_capacity: Option<f64>,
    rate_limit_refill_per_sec: Option<f64>,
    daily_limit: Option<u64>,
    priority: Option<String>,
    enabled: Option<bool>,
    #[serde(default)]
    extra: HashMap<String, String>,
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Symmetric key for at-rest encryption of the audit table. Required.
    pub brain_key: String,
    pub redis_url: Option<String>,
    pub metrics_addr: Option<String>,
    pub cache: CacheConfig,
    pub breaker: BreakerConfig,
    pub budget: BudgetConfig,
    pub sink: SinkConfig,
    pub scheduler: SchedulerConfig,
    pub providers: HashMap<String, ProviderSettings>,
    /// Symbols scanned for in news titles to produce `symbols_mentioned`.
    pub watchlist: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let brain_key = match std::env::var("BRAIN_KEY") {
            Ok(k) if !k.trim().is_empty() => k,
            _ => bail!("BRAIN_KEY is not set; refusing to start without the at-rest encryption key"),
        };

        let redis_url = std::env::var("REDIS_URL").ok().filter(|s| !s.is_empty());
        let metrics_addr = std::env::var("METRICS_ADDR").ok().filter(|s| !s.is_empty());

        let watchlist = std::env::var("WATCHLIST")
            .unwrap_or_else(|_| "AAPL,GOOGL,MSFT,AMZN,TSLA,NVDA,META,JPM".to_string())
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        let mut providers = default_providers();
        for settings in providers.values_mut() {
            *settings = settings.clone().apply_env();
        }

        if let Ok(path) = std::env::var("PROVIDERS_FILE") {
            apply_provider_file(&mut providers, &path)
                .with_context(|| format!("Failed to load providers file {path}"))?;
        }

        Ok(Self {
            brain_key,
            redis_url,
            metrics_addr,
            cache: CacheConfig::from_env(),
            breaker: BreakerConfig::from_env(),
            budget: BudgetConfig::from_env(),
            sink: SinkConfig::from_env(),
            scheduler: SchedulerConfig::from_env(),
            providers,
            watchlist,
        })
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderSettings> {
        self.providers.get(name)
    }
}

fn default_providers() -> HashMap<String, ProviderSettings> {
    let mut map = HashMap::new();

    // Keyless-first: generous quotas before authenticated APIs.
    let mut yahoo = ProviderSettings::new("yahoo_finance", SourcePriority::Primary);
    yahoo.rate_limit_capacity = 20.0;
    yahoo.rate_limit_refill_per_sec = 2.0;
    yahoo.daily_limit = 50_000;
    map.insert(yahoo.name.clone(), yahoo);

    let mut fred = ProviderSettings::new("fred", SourcePriority::Secondary);
    fred.rate_limit_capacity = 10.0;
    fred.rate_limit_refill_per_sec = 1.0;
    fred.daily_limit = 20_000;
    map.insert(fred.name.clone(), fred);

    let mut frankfurter = ProviderSettings::new("frankfurter", SourcePriority::Fallback);
    frankfurter.rate_limit_capacity = 5.0;
    frankfurter.rate_limit_refill_per_sec = 0.5;
    frankfurter.daily_limit = 5_000;
    map.insert(frankfurter.name.clone(), frankfurter);

    let mut google = ProviderSettings::new("google_news", SourcePriority::Secondary);
    google.rate_limit_capacity = 5.0;
    google.rate_limit_refill_per_sec = 0.1;
    google.daily_limit = 1_000;
    map.insert(google.name.clone(), google);

    let mut rss = ProviderSettings::new("rss_news", SourcePriority::Primary);
    rss.rate_limit_capacity = 10.0;
    rss.rate_limit_refill_per_sec = 0.2;
    rss.daily_limit = 2_000;
    rss.extra.insert(
        "feeds".to_string(),
        "https://feeds.reuters.com/reuters/businessNews".to_string(),
    );
    map.insert(rss.name.clone(), rss);

    map
}

fn apply_provider_file(
    providers: &mut HashMap<String, ProviderSettings>,
    path: &str,
) -> Result<()> {
    let text = std::fs::read_to_string(path)?;
    let parsed: HashMap<String, ProviderFileEntry> = toml::from_str(&text)?;

    for (name, entry) in parsed {
        let settings = providers
            .entry(name.clone())
            .or_insert_with(|| ProviderSettings::new(&name, SourcePriority::Fallback));
        if entry.api_key.is_some() {
            settings.api_key = entry.api_key;
        }
        if entry.base_url.is_some() {
            settings.base_url = entry.base_url;
        }
        if let Some(v) = entry.rate_limit_capacity {
            settings.rate_limit_capacity = v;
        }
        if let Some(v) = entry.rate_limit_refill_per_sec {
            settings.rate_limit_refill_per_sec = v;
        }
        if let Some(v) = entry.daily_limit {
            settings.daily_limit = v;
        }
        if let Some(p) = entry.priority.as_deref().and_then(SourcePriority::parse) {
            settings.priority = p;
        }
        if let Some(v) = entry.enabled {
            settings.enabled = v;
        }
        settings.extra.extend(entry.extra);
    }
    Ok(())
}
