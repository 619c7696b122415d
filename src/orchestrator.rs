//! Orchestrator.
//!
//! For every fired task this module consults the cache, and on miss or
//! staleness drives the adapter pipeline behind the full guard chain
//! (budget firewall -> token bucket -> circuit breaker -> retry). Normalized
//! records are published to the durable sink and to subscribers the moment a
//! refresh succeeds, so background SWR refreshes publish too.
//!
//! Fan-out: one task tick queries all of its symbols concurrently, each with
//! its own deadline; slow providers never hold up fast ones. Fan-in unions
//! results by `(source, symbol, timestamp)`. When several providers can
//! answer the same data type they are tried in `(priority, -reliability)`
//! order and the first non-empty answer wins; falling through is logged.

use async_trait::async_trait;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::adapter::{run_pipeline, FetchRequest, Stage, StageError};
use crate::cache::{CacheError, CacheOutcome, TieredCache};
use crate::config::Config;
use crate::fingerprint::cache_key;
use crate::kv::KvStore;
use crate::observability::{metric, CorrelationId};
use crate::registry::ProviderRegistry;
use crate::resilience::{BudgetError, BudgetFirewall, CircuitBreaker, RetryPolicy, TokenBucket};
use crate::scheduler::{SourceStatus, TaskExecutor, TaskRunReport, TaskSpec};
use crate::schema::{DataType, UnifiedRecord};
use crate::sink::SinkHandle;

const SUBSCRIBER_QUEUE: usize = 1024;
/// Spend scope until multi-tenant budgets are wired through.
const DEFAULT_USER: &str = "default";

/// Symbol filter for a subscription; `None` passes everything.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    pub symbols: Option<HashSet<String>>,
}

impl SubscriptionFilter {
    pub fn symbols<I: IntoIterator<Item = S>, S: Into<String>>(symbols: I) -> Self {
        Self {
            symbols: Some(symbols.into_iter().map(|s| s.into().to_uppercase()).collect()),
        }
    }

    fn matches(&self, record: &UnifiedRecord) -> bool {
        match &self.symbols {
            None => true,
            Some(set) => set.contains(&record.symbol),
        }
    }
}

/// Live record stream for one data type.
///
/// Backpressure is lossy: a subscriber that cannot keep up loses its oldest
/// queued records first.
pub struct Subscription {
    rx: broadcast::Receiver<UnifiedRecord>,
    filter: SubscriptionFilter,
}

impl Subscription {
    /// Next matching record; `None` once the orchestrator is gone.
    pub async fn recv(&mut self) -> Option<UnifiedRecord> {
        loop {
            match self.rx.recv().await {
                Ok(record) => {
                    if self.filter.matches(&record) {
                        return Some(record);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    metrics::counter!(metric::SUBSCRIBER_LAGGED, missed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

pub struct Orchestrator {
    config: Arc<Config>,
    registry: Arc<ProviderRegistry>,
    cache: Arc<TieredCache>,
    kv: Arc<dyn KvStore>,
    budget: BudgetFirewall,
    retry: RetryPolicy,
    buckets: Mutex<HashMap<String, Arc<TokenBucket>>>,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    subscribers: Mutex<HashMap<DataType, broadcast::Sender<UnifiedRecord>>>,
    sink: Option<SinkHandle>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<ProviderRegistry>,
        cache: Arc<TieredCache>,
        kv: Arc<dyn KvStore>,
        budget: BudgetFirewall,
        sink: Option<SinkHandle>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            registry,
            cache,
            kv,
            budget,
            retry: RetryPolicy::default(),
            buckets: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            sink,
        })
    }

    /// Stream of normalized records for one data type.
    pub fn subscribe(&self, data_type: DataType, filter: SubscriptionFilter) -> Subscription {
        let mut subscribers = self.subscribers.lock();
        let sender = subscribers
            .entry(data_type)
            .or_insert_with(|| broadcast::channel(SUBSCRIBER_QUEUE).0);
        Subscription {
            rx: sender.subscribe(),
            filter,
        }
    }

    fn bucket(&self, provider: &str) -> Arc<TokenBucket> {
        let mut buckets = self.buckets.lock();
        buckets
            .entry(provider.to_string())
            .or_insert_with(|| {
                let settings = self.config.provider(provider);
                let (capacity, refill, daily) = settings
                    .map(|s| (s.rate_limit_capacity, s.rate_limit_refill_per_sec, s.daily_limit))
                    .unwrap_or((10.0, 0.5, 10_000));
                Arc::new(TokenBucket::new(provider, capacity, refill, daily))
            })
            .clone()
    }

    fn breaker(&self, provider: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        breakers
            .entry(provider.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(provider, self.config.breaker.clone()))
            })
            .clone()
    }

    /// Deliver records to the sink and to live subscribers.
    fn publish(&self, records: &[UnifiedRecord]) {
        for record in records {
            if !self.registry.validate(&record.source) {
                // Construction invariant: records must come from registered
                // providers.
                warn!(source = %record.source, "dropping record from unregistered source");
                continue;
            }
            metrics::counter!(
                metric::RECORDS_TOTAL,
                1,
                "source" => record.source.clone(),
                "data_type" => record.data_type.as_str()
            );
            if let Some(sink) = &self.sink {
                sink.append(record.clone());
            }
            let subscribers = self.subscribers.lock();
            if let Some(sender) = subscribers.get(&record.data_type) {
                // Send only fails when nobody is listening.
                let _ = sender.send(record.clone());
            }
        }
    }

    /// The guarded pipeline: budget -> bucket -> breaker -> retry(run).
    async fn guarded_fetch(
        self: &Arc<Self>,
        provider: &str,
        request: &FetchRequest,
        corr: &CorrelationId,
    ) -> Result<Vec<UnifiedRecord>, StageError> {
        let deadline = self
            .config
            .breaker
            .call_timeout
            .unwrap_or(Duration::from_secs(30));

        // Budget firewall first: a denied call must never reach the wire.
        let estimated = self.budget.cost_micros(provider, 1024, 0);
        match self
            .budget
            .check_request(self.kv.as_ref(), DEFAULT_USER, provider, estimated)
            .await
        {
            Ok(_) => {}
            Err(BudgetError::Exceeded { scope, spent_micros, limit_micros }) => {
                return Err(StageError::new(
                    provider,
                    Stage::Fetch,
                    "budget_exceeded",
                    format!("scope {scope}: spent {spent_micros} of {limit_micros} micro-dollars"),
                    false,
                ));
            }
            Err(BudgetError::Kv(e)) => {
                return Err(StageError::new(
                    provider,
                    Stage::Fetch,
                    "kv_unavailable",
                    e.to_string(),
                    true,
                ));
            }
        }

        // Token bucket: wait briefly, then report as rate-limited.
        let bucket = self.bucket(provider);
        if !bucket
            .wait_for(1, std::time::Instant::now() + Duration::from_secs(2))
            .await
        {
            return Err(StageError::new(
                provider,
                Stage::Fetch,
                "rate_limited",
                "local token bucket exhausted",
                true,
            ));
        }

        // Circuit breaker gate.
        let breaker = self.breaker(provider);
        let admitted = breaker.can_execute(self.kv.as_ref()).await.map_err(|e| {
            StageError::new(provider, Stage::Fetch, "kv_unavailable", e.to_string(), true)
        })?;
        if !admitted {
            metrics::counter!(metric::BREAKER_FAST_FAILS, 1, "provider" => provider.to_string());
            return Err(StageError::new(
                provider,
                Stage::Fetch,
                "circuit_open",
                "breaker is open, fast-failing without calling provider",
                false,
            ));
        }

        let settings = self.config.provider(provider).cloned().unwrap_or_else(|| {
            crate::config::ProviderSettings {
                name: provider.to_string(),
                api_key: None,
                base_url: None,
                rate_limit_capacity: 10.0,
                rate_limit_refill_per_sec: 0.5,
                daily_limit: 10_000,
                priority: crate::registry::SourcePriority::Fallback,
                enabled: true,
                extra: HashMap::new(),
            }
        });
        let adapter = self
            .registry
            .create(provider, &settings)
            .map_err(|e| {
                StageError::new(provider, Stage::Fetch, "adapter_unavailable", e.to_string(), false)
            })?;

        let kv = self.kv.clone();
        let breaker_for_admit = breaker.clone();
        let result = self
            .retry
            .run(
                |attempt| {
                    let adapter = adapter.clone();
                    let request = request.clone();
                    let corr = corr.clone();
                    let provider = provider.to_string();
                    async move {
                        if attempt > 0 {
                            debug!(correlation_id = %corr, provider = %provider, attempt, "retry attempt");
                        }
                        run_pipeline(adapter, &request, deadline).await
                    }
                },
                move || {
                    let breaker = breaker_for_admit.clone();
                    let kv = kv.clone();
                    async move { breaker.can_execute(kv.as_ref()).await.unwrap_or(false) }
                },
            )
            .await;

        match result {
            Ok(output) => {
                breaker.record_success(self.kv.as_ref()).await.ok();
                let cost = self.budget.cost_micros(provider, 1024, output.raw_bytes);
                self.budget
                    .record_spend(self.kv.as_ref(), DEFAULT_USER, provider, cost)
                    .await
                    .ok();
                metrics::histogram!(
                    metric::PIPELINE_LATENCY_MS,
                    output.latency.as_secs_f64() * 1000.0,
                    "provider" => provider.to_string()
                );
                Ok(output.records)
            }
            Err(err) => {
                metrics::counter!(
                    metric::PIPELINE_ERRORS,
                    1,
                    "provider" => provider.to_string(),
                    "stage" => err.stage.as_str(),
                    "error_type" => err.error_type.clone()
                );
                // A provider that answered but sent something unusable is
                // still an answering provider: parse/validate/normalize
                // failures count as breaker successes.
                if err.stage == Stage::Fetch {
                    breaker.record_failure(self.kv.as_ref()).await.ok();
                } else {
                    breaker.record_success(self.kv.as_ref()).await.ok();
                }
                warn!(
                    correlation_id = %corr,
                    provider = %provider,
                    stage = %err.stage,
                    error_type = %err.error_type,
                    retryable = err.retryable,
                    "pipeline call failed"
                );
                Err(err)
            }
        }
    }

    /// One `(provider, request)` read through the cache. Fresh payloads come
    /// straight from the cache; refreshes run the guarded pipeline and
    /// publish before the payload is stored.
    async fn source_once(
        self: &Arc<Self>,
        provider: &str,
        request: &FetchRequest,
        fresh_for: Duration,
        corr: &CorrelationId,
    ) -> Result<Vec<UnifiedRecord>, StageError> {
        let key = cache_key(provider, &request.fingerprint_params());

        let captured_error: Arc<Mutex<Option<StageError>>> = Arc::new(Mutex::new(None));
        let refresher = {
            let orchestrator = self.clone();
            let provider = provider.to_string();
            let request = request.clone();
            let corr = corr.clone();
            let captured = captured_error.clone();
            move || {
                let orchestrator = orchestrator.clone();
                let provider = provider.clone();
                let request = request.clone();
                let corr = corr.clone();
                let captured = captured.clone();
                async move {
                    match orchestrator.guarded_fetch(&provider, &request, &corr).await {
                        Ok(records) => {
                            orchestrator.publish(&records);
                            Ok(serde_json::to_value(&records)?)
                        }
                        Err(err) => {
                            let message = err.to_string();
                            *captured.lock() = Some(err);
                            Err(anyhow::anyhow!(message))
                        }
                    }
                }
            }
        };

        match self.cache.get_with(&key, fresh_for, refresher).await {
            Ok((payload, outcome)) => {
                if matches!(outcome, CacheOutcome::HitStale | CacheOutcome::StaleOnError) {
                    debug!(
                        correlation_id = %corr,
                        provider = %provider,
                        outcome = outcome.as_str(),
                        "serving degraded cache result"
                    );
                }
                let records: Vec<UnifiedRecord> =
                    serde_json::from_value(payload).map_err(|e| {
                        StageError::new(provider, Stage::Normalize, "internal", e.to_string(), false)
                    })?;
                Ok(records)
            }
            Err(CacheError::Refresh(message)) => {
                let err = captured_error.lock().take().unwrap_or_else(|| {
                    StageError::new(provider, Stage::Fetch, "refresh_failed", message, true)
                });
                Err(err)
            }
            Err(CacheError::Kv(e)) => Err(StageError::new(
                provider,
                Stage::Fetch,
                "kv_unavailable",
                e.to_string(),
                true,
            )),
        }
    }

    /// Fetch one symbol, walking the provider list until a non-empty answer.
    async fn fetch_symbol(
        self: &Arc<Self>,
        spec: &TaskSpec,
        symbol: &str,
        fresh_for: Duration,
        corr: &CorrelationId,
    ) -> (Vec<UnifiedRecord>, HashMap<String, SourceStatus>) {
        let providers: Vec<String> = match &spec.provider {
            Some(pinned) => vec![pinned.clone()],
            None => self
                .registry
                .by_data_type(spec.data_type)
                .into_iter()
                .map(|d| d.name)
                .collect(),
        };

        let mut statuses = HashMap::new();
        let mut tried_any = false;

        for provider in &providers {
            if tried_any {
                metrics::counter!(metric::FALLBACK_USED, 1, "provider" => provider.clone());
                info!(
                    correlation_id = %corr,
                    provider = %provider,
                    symbol,
                    "fallback used"
                );
            }
            tried_any = true;

            let request = FetchRequest::new(spec.data_type, symbol);
            match self.source_once(provider, &request, fresh_for, corr).await {
                Ok(records) if !records.is_empty() => {
                    statuses.insert(provider.clone(), SourceStatus::Ok { records: records.len() });
                    return (records, statuses);
                }
                Ok(_) => {
                    statuses.insert(provider.clone(), SourceStatus::Empty);
                }
                Err(err) => {
                    statuses.insert(
                        provider.clone(),
                        SourceStatus::Error {
                            error_type: err.error_type.clone(),
                            message: err.message.clone(),
                        },
                    );
                }
            }
        }

        (Vec::new(), statuses)
    }

    fn fresh_for(&self, spec: &TaskSpec) -> Duration {
        // Entries go stale when the next scheduled run is due.
        spec.tier.interval(&self.config.scheduler)
    }

    /// Operator snapshot of every live bucket and breaker.
    pub async fn resilience_report(&self) -> ResilienceReport {
        let buckets: Vec<crate::resilience::BucketSnapshot> = self
            .buckets
            .lock()
            .values()
            .map(|b| b.snapshot())
            .collect();

        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.lock().values().cloned().collect();
        let mut breaker_metrics = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            if let Ok(m) = breaker.metrics(self.kv.as_ref()).await {
                breaker_metrics.push(m);
            }
        }

        ResilienceReport {
            buckets,
            breakers: breaker_metrics,
            cache: self.cache.stats().summary(),
        }
    }
}

/// Point-in-time view of the resilience layer, for operators.
#[derive(Debug)]
pub struct ResilienceReport {
    pub buckets: Vec<crate::resilience::BucketSnapshot>,
    pub breakers: Vec<crate::resilience::BreakerMetrics>,
    pub cache: String,
}

#[async_trait]
impl TaskExecutor for Arc<Orchestrator> {
    async fn execute(&self, spec: &TaskSpec) -> anyhow::Result<TaskRunReport> {
        self.execute_task(spec).await
    }
}

impl Orchestrator {
    /// Fan out across the task's symbols, fan results back in.
    pub async fn execute_task(self: &Arc<Self>, spec: &TaskSpec) -> anyhow::Result<TaskRunReport> {
        let corr = CorrelationId::new();
        let fresh_for = self.fresh_for(spec);

        // Batch sources (general news) run one symbol-less request.
        let symbols: Vec<String> = if spec.symbols.is_empty() {
            vec![String::new()]
        } else {
            spec.symbols.clone()
        };

        debug!(
            correlation_id = %corr,
            task = %spec.name,
            symbols = symbols.len(),
            "task fan-out"
        );

        let futures = symbols.iter().map(|symbol| {
            let this = self.clone();
            let corr = corr.clone();
            let spec = spec.clone();
            let symbol = symbol.clone();
            async move { this.fetch_symbol(&spec, &symbol, fresh_for, &corr).await }
        });
        let outcomes = join_all(futures).await;

        // Union by (source, symbol, timestamp).
        let mut seen = HashSet::new();
        let mut records = Vec::new();
        let mut source_status: HashMap<String, SourceStatus> = HashMap::new();

        for (symbol_records, statuses) in outcomes {
            for record in symbol_records {
                if seen.insert(record.union_key()) {
                    records.push(record);
                }
            }
            for (provider, status) in statuses {
                merge_status(&mut source_status, provider, status);
            }
        }

        let any_ok = source_status
            .values()
            .any(|s| matches!(s, SourceStatus::Ok { .. }));
        let all_failed = !source_status.is_empty()
            && source_status
                .values()
                .all(|s| matches!(s, SourceStatus::Error { .. }));

        info!(
            correlation_id = %corr,
            task = %spec.name,
            records = records.len(),
            sources = source_status.len(),
            "task fan-in complete"
        );

        if all_failed && !any_ok {
            let detail = source_status
                .iter()
                .map(|(p, s)| format!("{p}: {s:?}"))
                .collect::<Vec<_>>()
                .join("; ");
            anyhow::bail!("all sources failed for task {}: {detail}", spec.name);
        }

        Ok(TaskRunReport {
            records_published: records.len(),
            source_status,
        })
    }
}

/// Keep the most informative status per source across symbols: Ok beats
/// Error beats Empty.
fn merge_status(map: &mut HashMap<String, SourceStatus>, provider: String, status: SourceStatus) {
    let merged = match map.remove(&provider) {
        None => status,
        Some(existing) => match (existing, status) {
            (SourceStatus::Ok { records: a }, SourceStatus::Ok { records: b }) => {
                SourceStatus::Ok { records: a + b }
            }
            (keep @ SourceStatus::Ok { .. }, _) => keep,
            (_, take @ SourceStatus::Ok { .. }) => take,
            (keep @ SourceStatus::Error { .. }, _) => keep,
            (_, take @ SourceStatus::Error { .. }) => take,
            (keep, _) => keep,
        },
    };
    map.insert(provider, merged);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{RawFetch, SourceAdapter};
    use crate::config::{
        BreakerConfig, BudgetConfig, CacheConfig, ProviderSettings, SchedulerConfig, SinkConfig,
    };
    use crate::kv::MemoryKv;
    use crate::registry::SourcePriority;
    use crate::resilience::CostWeights;
    use crate::scheduler::Tier;
    use crate::schema::{RecordPayload, SourceType};
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
    use std::time::Duration;

    /// Test adapter whose behavior is fixed at construction.
    struct ScriptedAdapter {
        name: &'static str,
        records: Vec<UnifiedRecord>,
        fail: bool,
        fetch_calls: Arc<AtomicU32>,
    }

    impl ScriptedAdapter {
        fn empty(name: &'static str) -> Self {
            Self {
                name,
                records: vec![],
                fail: false,
                fetch_calls: Arc::new(AtomicU32::new(0)),
            }
        }

        fn with_record(name: &'static str, symbol: &str) -> Self {
            let ts = Utc.with_ymd_and_hms(2026, 7, 31, 12, 0, 0).unwrap();
            Self {
                name,
                records: vec![UnifiedRecord::new(
                    DataType::Equity,
                    name,
                    SourceType::Rest,
                    symbol,
                    ts,
                    RecordPayload::price(Decimal::new(10050, 2)),
                    serde_json::json!({}),
                )],
                fail: false,
                fetch_calls: Arc::new(AtomicU32::new(0)),
            }
        }

        fn failing(name: &'static str) -> Self {
            Self {
                name,
                records: vec![],
                fail: true,
                fetch_calls: Arc::new(AtomicU32::new(0)),
            }
        }
    }

    #[async_trait]
    impl SourceAdapter for ScriptedAdapter {
        fn name(&self) -> &str {
            self.name
        }
        fn source_type(&self) -> SourceType {
            SourceType::Rest
        }
        async fn fetch(&self, _request: &FetchRequest) -> Result<RawFetch, StageError> {
            self.fetch_calls.fetch_add(1, AtomicOrdering::SeqCst);
            if self.fail {
                return Err(StageError::new(
                    self.name,
                    Stage::Fetch,
                    "upstream_error",
                    "scripted failure",
                    true,
                ));
            }
            Ok(RawFetch::new(b"{}".to_vec(), 200))
        }
        fn parse(&self, _raw: &RawFetch) -> Result<Value, StageError> {
            Ok(serde_json::json!({}))
        }
        fn validate(&self, _parsed: &Value) -> Result<(), StageError> {
            Ok(())
        }
        fn normalize(
            &self,
            _parsed: Value,
            _request: &FetchRequest,
        ) -> Result<Vec<UnifiedRecord>, StageError> {
            Ok(self.records.clone())
        }
        async fn health_check(&self) -> bool {
            !self.fail
        }
    }

    fn test_config(providers: &[&str]) -> Config {
        let mut provider_map = HashMap::new();
        for name in providers {
            let mut settings = crate::config::test_support::provider_settings(name);
            settings.rate_limit_capacity = 1000.0;
            settings.rate_limit_refill_per_sec = 1000.0;
            settings.daily_limit = 1_000_000;
            provider_map.insert(name.to_string(), settings);
        }
        Config {
            brain_key: "test-key".to_string(),
            redis_url: None,
            metrics_addr: None,
            cache: CacheConfig {
                enable_swr: false,
                stale_window: Duration::ZERO,
                enable_stale_if_error: false,
                ..CacheConfig::default()
            },
            breaker: BreakerConfig {
                failure_threshold: 50,
                ..BreakerConfig::default()
            },
            budget: BudgetConfig {
                hard_limit_micros: 1_000_000_000,
                ..BudgetConfig::default()
            },
            sink: SinkConfig::default(),
            scheduler: SchedulerConfig {
                high: Duration::ZERO,
                ..SchedulerConfig::default()
            },
            providers: provider_map,
            watchlist: vec![],
        }
    }

    fn build(
        config: Config,
        adapters: Vec<(Arc<ScriptedAdapter>, SourcePriority)>,
        budget: Option<BudgetFirewall>,
    ) -> Arc<Orchestrator> {
        let registry = Arc::new(ProviderRegistry::new());
        for (adapter, priority) in adapters {
            let name = adapter.name;
            registry.register(
                crate::registry::SourceDescriptor {
                    name: name.to_string(),
                    priority,
                    data_types: vec![DataType::Equity],
                    rate_limit_per_hour: 100_000,
                    reliability_score: 0.9,
                    enabled: true,
                },
                move |_settings| Ok(adapter.clone() as Arc<dyn SourceAdapter>),
            );
        }
        let config = Arc::new(config);
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
        let cache = Arc::new(TieredCache::new(kv.clone(), config.cache.clone()));
        let budget = budget.unwrap_or_else(|| BudgetFirewall::new(&config.budget));
        Orchestrator::new(config, registry, cache, kv, budget, None)
    }

    fn spec(symbols: &[&str]) -> TaskSpec {
        TaskSpec {
            name: "test_task".to_string(),
            data_type: DataType::Equity,
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            tier: Tier::High,
            provider: None,
        }
    }

    #[tokio::test]
    async fn fallback_is_tried_when_primary_returns_empty() {
        let primary = Arc::new(ScriptedAdapter::empty("primary_feed"));
        let secondary = Arc::new(ScriptedAdapter::with_record("secondary_feed", "AAPL"));
        let orchestrator = build(
            test_config(&["primary_feed", "secondary_feed"]),
            vec![
                (primary.clone(), SourcePriority::Primary),
                (secondary.clone(), SourcePriority::Secondary),
            ],
            None,
        );

        let report = orchestrator.execute_task(&spec(&["AAPL"])).await.unwrap();
        assert_eq!(report.records_published, 1);
        assert_eq!(
            report.source_status.get("primary_feed"),
            Some(&SourceStatus::Empty)
        );
        assert_eq!(
            report.source_status.get("secondary_feed"),
            Some(&SourceStatus::Ok { records: 1 })
        );
        assert_eq!(primary.fetch_calls.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(secondary.fetch_calls.load(AtomicOrdering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_primary_still_falls_through() {
        let primary = Arc::new(ScriptedAdapter::failing("primary_feed"));
        let secondary = Arc::new(ScriptedAdapter::with_record("secondary_feed", "AAPL"));
        let mut config = test_config(&["primary_feed", "secondary_feed"]);
        // One attempt per provider keeps the test fast.
        config.breaker.call_timeout = Some(Duration::from_secs(5));
        let orchestrator = build(
            config,
            vec![
                (primary, SourcePriority::Primary),
                (secondary, SourcePriority::Secondary),
            ],
            None,
        );

        let report = orchestrator.execute_task(&spec(&["AAPL"])).await.unwrap();
        assert_eq!(report.records_published, 1);
        assert!(matches!(
            report.source_status.get("primary_feed"),
            Some(SourceStatus::Error { .. })
        ));
    }

    #[tokio::test]
    async fn budget_hard_limit_blocks_before_the_provider() {
        let metered = Arc::new(ScriptedAdapter::with_record("metered", "AAPL"));
        let mut config = test_config(&["metered"]);
        config.budget.hard_limit_micros = 10_000_000; // $10
        let budget = BudgetFirewall::new(&config.budget).with_weights(
            "metered",
            CostWeights {
                base_micros: 1_000_000, // $1 per request
                per_request_kb_micros: 0,
                per_response_kb_micros: 0,
            },
        );
        let orchestrator = build(config, vec![(metered.clone(), SourcePriority::Primary)], Some(budget));

        for i in 0..10 {
            let report = orchestrator.execute_task(&spec(&["AAPL"])).await;
            assert!(report.is_ok(), "request {i} should pass");
        }
        let err = orchestrator.execute_task(&spec(&["AAPL"])).await.unwrap_err();
        assert!(err.to_string().contains("budget_exceeded"), "{err}");
        // The provider was never called for the denied request.
        assert_eq!(metered.fetch_calls.load(AtomicOrdering::SeqCst), 10);
    }

    #[tokio::test]
    async fn fan_in_unions_by_source_symbol_timestamp() {
        // The adapter returns the same (source, symbol, timestamp) record
        // regardless of the requested symbol.
        let dup = Arc::new(ScriptedAdapter::with_record("dup_feed", "AAPL"));
        let orchestrator = build(
            test_config(&["dup_feed"]),
            vec![(dup, SourcePriority::Primary)],
            None,
        );

        let report = orchestrator
            .execute_task(&spec(&["AAPL", "MSFT", "TSLA"]))
            .await
            .unwrap();
        assert_eq!(report.records_published, 1);
    }

    #[tokio::test]
    async fn subscribers_receive_published_records() {
        let feed = Arc::new(ScriptedAdapter::with_record("live_feed", "AAPL"));
        let orchestrator = build(
            test_config(&["live_feed"]),
            vec![(feed, SourcePriority::Primary)],
            None,
        );

        let mut all = orchestrator.subscribe(DataType::Equity, SubscriptionFilter::default());
        let mut filtered =
            orchestrator.subscribe(DataType::Equity, SubscriptionFilter::symbols(["MSFT"]));

        orchestrator.execute_task(&spec(&["AAPL"])).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), all.recv())
            .await
            .expect("subscriber should receive a record")
            .expect("stream open");
        assert_eq!(received.symbol, "AAPL");
        assert_eq!(received.source, "live_feed");

        // The MSFT-filtered subscriber sees nothing.
        let nothing = tokio::time::timeout(Duration::from_millis(100), filtered.recv()).await;
        assert!(nothing.is_err());
    }

    #[tokio::test]
    async fn pinned_provider_skips_registry_ordering() {
        let pinned = Arc::new(ScriptedAdapter::with_record("pinned_feed", "GDP"));
        let other = Arc::new(ScriptedAdapter::with_record("other_feed", "GDP"));
        let orchestrator = build(
            test_config(&["pinned_feed", "other_feed"]),
            vec![
                (pinned.clone(), SourcePriority::Fallback),
                (other.clone(), SourcePriority::Primary),
            ],
            None,
        );

        let mut task = spec(&["GDP"]);
        task.provider = Some("pinned_feed".to_string());
        let report = orchestrator.execute_task(&task).await.unwrap();

        assert_eq!(report.records_published, 1);
        assert_eq!(pinned.fetch_calls.load(AtomicOrdering::SeqCst), 1);
        assert_eq!(other.fetch_calls.load(AtomicOrdering::SeqCst), 0);
    }

    #[tokio::test]
    async fn all_sources_failing_is_a_task_error() {
        let bad = Arc::new(ScriptedAdapter::failing("bad_feed"));
        let orchestrator = build(
            test_config(&["bad_feed"]),
            vec![(bad, SourcePriority::Primary)],
            None,
        );
        let err = orchestrator.execute_task(&spec(&["AAPL"])).await.unwrap_err();
        assert!(err.to_string().contains("all sources failed"));
    }
}
