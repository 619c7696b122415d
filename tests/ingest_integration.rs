//! End-to-end exercise of the ingestion core through the public API:
//! a scripted provider feeds the scheduler -> orchestrator -> cache ->
//! sink path, with subscribers and the encrypted audit trail attached.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use marketbrain::adapter::{FetchRequest, RawFetch, SourceAdapter, Stage, StageError};
use marketbrain::config::{
    BreakerConfig, BudgetConfig, CacheConfig, Config, ProviderSettings, SchedulerConfig,
    SinkConfig,
};
use marketbrain::kv::{KvStore, MemoryKv};
use marketbrain::orchestrator::Orchestrator;
use marketbrain::registry::{ProviderRegistry, SourceDescriptor, SourcePriority};
use marketbrain::resilience::BudgetFirewall;
use marketbrain::scheduler::{TaskExecutor, TaskSpec, Tier, TieredScheduler};
use marketbrain::sink::{AuditLog, DataSink};
use marketbrain::{DataType, RecordPayload, SourceType, SubscriptionFilter, TieredCache, UnifiedRecord};

/// Deterministic in-memory market feed.
struct MockFeed {
    fetches: AtomicU32,
}

#[async_trait]
impl SourceAdapter for MockFeed {
    fn name(&self) -> &str {
        "mock_feed"
    }

    fn source_type(&self) -> SourceType {
        SourceType::Rest
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<RawFetch, StageError> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst);
        let body = serde_json::to_vec(&serde_json::json!({
            "symbol": request.symbol,
            "price": format!("100.{:02}", n % 100),
        }))
        .map_err(|e| StageError::new("mock_feed", Stage::Fetch, "internal", e.to_string(), false))?;
        Ok(RawFetch::new(body, 200))
    }

    fn parse(&self, raw: &RawFetch) -> Result<Value, StageError> {
        serde_json::from_slice(&raw.body).map_err(|e| {
            StageError::new("mock_feed", Stage::Parse, "decode_error", e.to_string(), false)
        })
    }

    fn validate(&self, parsed: &Value) -> Result<(), StageError> {
        if parsed.get("price").is_none() {
            return Err(StageError::new(
                "mock_feed",
                Stage::Validate,
                "schema_violation",
                "missing price",
                false,
            ));
        }
        Ok(())
    }

    fn normalize(
        &self,
        parsed: Value,
        request: &FetchRequest,
    ) -> Result<Vec<UnifiedRecord>, StageError> {
        let price: Decimal = parsed["price"]
            .as_str()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                StageError::new(
                    "mock_feed",
                    Stage::Normalize,
                    "schema_violation",
                    "unparsable price",
                    false,
                )
            })?;
        Ok(vec![UnifiedRecord::new(
            request.data_type,
            "mock_feed",
            SourceType::Rest,
            &request.symbol,
            Utc::now(),
            RecordPayload::price(price),
            Value::Null,
        )])
    }

    async fn health_check(&self) -> bool {
        true
    }
}

fn fast_config() -> Config {
    let mut providers = HashMap::new();
    providers.insert(
        "mock_feed".to_string(),
        ProviderSettings {
            name: "mock_feed".to_string(),
            api_key: None,
            base_url: None,
            rate_limit_capacity: 1_000.0,
            rate_limit_refill_per_sec: 1_000.0,
            daily_limit: 1_000_000,
            priority: SourcePriority::Primary,
            enabled: true,
            extra: HashMap::new(),
        },
    );

    Config {
        brain_key: "integration-test-key".to_string(),
        redis_url: None,
        metrics_addr: None,
        cache: CacheConfig::default(),
        breaker: BreakerConfig::default(),
        budget: BudgetConfig::default(),
        sink: SinkConfig::default(),
        scheduler: SchedulerConfig {
            high: Duration::from_millis(200),
            medium: Duration::from_secs(900),
            low: Duration::from_secs(3600),
            daily: Duration::from_secs(86_400),
            tick: Duration::from_millis(50),
            max_retries: 3,
            retry_base: Duration::from_millis(100),
            retry_cap: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(2),
        },
        providers,
        watchlist: vec!["AAPL".to_string()],
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scheduler_to_sink_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config();
    config.sink.data_root = dir.path().to_path_buf();
    config.sink.audit_enabled = true;
    config.sink.audit_db_path = dir.path().join("audit.db");
    let config = Arc::new(config);

    let registry = Arc::new(ProviderRegistry::new());
    registry.register(
        SourceDescriptor {
            name: "mock_feed".to_string(),
            priority: SourcePriority::Primary,
            data_types: vec![DataType::Equity],
            rate_limit_per_hour: 100_000,
            reliability_score: 1.0,
            enabled: true,
        },
        |_| {
            Ok(Arc::new(MockFeed {
                fetches: AtomicU32::new(0),
            }) as Arc<dyn SourceAdapter>)
        },
    );

    let audit = Arc::new(AuditLog::open(&config.sink.audit_db_path, &config.brain_key).unwrap());
    let sink = DataSink::start(config.sink.clone(), Some(audit.clone()));

    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let cache = Arc::new(TieredCache::new(kv.clone(), config.cache.clone()));
    let budget = BudgetFirewall::new(&config.budget);
    let orchestrator = Orchestrator::new(
        config.clone(),
        registry,
        cache,
        kv,
        budget,
        Some(sink.handle()),
    );

    let mut subscription =
        orchestrator.subscribe(DataType::Equity, SubscriptionFilter::symbols(["AAPL"]));

    let scheduler = Arc::new(TieredScheduler::new(
        config.scheduler.clone(),
        Arc::new(orchestrator.clone()) as Arc<dyn TaskExecutor>,
    ));
    scheduler.add_task(TaskSpec {
        name: "mock_equities".to_string(),
        data_type: DataType::Equity,
        symbols: vec!["AAPL".to_string(), "MSFT".to_string()],
        tier: Tier::High,
        provider: None,
    });

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let scheduler_handle = tokio::spawn(scheduler.clone().run(shutdown_rx));

    // The live subscriber sees a record from the first firing.
    let received = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("subscriber timed out")
        .expect("stream closed");
    assert_eq!(received.source, "mock_feed");
    assert_eq!(received.symbol, "AAPL");
    assert_eq!(received.timestamp.timezone(), Utc);
    match received.payload {
        RecordPayload::Price { price, .. } => assert!(price > Decimal::ZERO),
        other => panic!("unexpected payload {other:?}"),
    }

    // Let at least one full schedule interval elapse, then stop.
    tokio::time::sleep(Duration::from_millis(400)).await;
    shutdown_tx.send(true).unwrap();
    scheduler_handle.await.unwrap();

    let task = scheduler.task("mock_equities").unwrap();
    assert!(task.stats.success_count >= 1);
    assert_eq!(task.retry_count, 0);

    // Everything published must be durable and queryable after a flush.
    sink.flush_now().await;
    let stored = sink
        .query(DataType::Equity, Some("AAPL".to_string()), None, None, None)
        .await
        .unwrap();
    assert!(!stored.is_empty(), "sink should hold flushed records");
    assert!(stored.iter().all(|r| r.symbol == "AAPL"));
    assert!(
        stored.windows(2).all(|w| w[0].timestamp >= w[1].timestamp),
        "query results must be timestamp-descending"
    );

    // Both symbols made it into the store.
    let all = sink.query(DataType::Equity, None, None, None, None).await.unwrap();
    let symbols: std::collections::HashSet<String> =
        all.iter().map(|r| r.symbol.clone()).collect();
    assert!(symbols.contains("AAPL") && symbols.contains("MSFT"));

    // The audit trail saw the same flushes and decrypts with the right key.
    assert!(audit.count().unwrap() >= all.len() as i64);
    let audited = audit.read_for_source("mock_feed", 100).unwrap();
    assert!(!audited.is_empty());

    sink.shutdown().await;
}

#[tokio::test]
async fn cache_collapses_repeated_task_runs() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config();
    config.sink.data_root = dir.path().to_path_buf();
    // Long freshness: the second run must be served from cache.
    config.scheduler.high = Duration::from_secs(300);
    let config = Arc::new(config);

    let feed = Arc::new(MockFeed {
        fetches: AtomicU32::new(0),
    });
    let registry = Arc::new(ProviderRegistry::new());
    let feed_for_factory = feed.clone();
    registry.register(
        SourceDescriptor {
            name: "mock_feed".to_string(),
            priority: SourcePriority::Primary,
            data_types: vec![DataType::Equity],
            rate_limit_per_hour: 100_000,
            reliability_score: 1.0,
            enabled: true,
        },
        move |_| Ok(feed_for_factory.clone() as Arc<dyn SourceAdapter>),
    );

    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let cache = Arc::new(TieredCache::new(kv.clone(), config.cache.clone()));
    let orchestrator = Orchestrator::new(
        config.clone(),
        registry,
        cache,
        kv,
        BudgetFirewall::new(&config.budget),
        None,
    );

    let spec = TaskSpec {
        name: "cached".to_string(),
        data_type: DataType::Equity,
        symbols: vec!["AAPL".to_string()],
        tier: Tier::High,
        provider: None,
    };

    let first = orchestrator.execute_task(&spec).await.unwrap();
    let second = orchestrator.execute_task(&spec).await.unwrap();
    assert_eq!(first.records_published, 1);
    assert_eq!(second.records_published, 1);
    // One fetch: the second run was a fresh cache hit.
    assert_eq!(feed.fetches.load(Ordering::SeqCst), 1);
}
