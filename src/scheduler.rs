//! Tiered scheduler.
//!
//! Tasks are partitioned into four cadence tiers (1m / 15m / 1h / 24h). One
//! loop wakes every ten seconds, fires everything whose `next_run` has
//! passed, and applies exponential backoff on failures until a task is
//! disabled. Disabled tasks stay registered so an operator can re-enable
//! them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::SchedulerConfig;
use crate::schema::DataType;

/// Scheduling frequency tiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    High,
    Medium,
    Low,
    Daily,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::High => "high",
            Tier::Medium => "medium",
            Tier::Low => "low",
            Tier::Daily => "daily",
        }
    }

    pub fn interval(&self, config: &SchedulerConfig) -> Duration {
        match self {
            Tier::High => config.high,
            Tier::Medium => config.medium,
            Tier::Low => config.low,
            Tier::Daily => config.daily,
        }
    }
}

/// What a task asks the orchestrator to do.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub data_type: DataType,
    pub symbols: Vec<String>,
    pub tier: Tier,
    /// Pin to one provider; `None` lets the registry pick by priority.
    pub provider: Option<String>,
}

/// Per-source outcome of one task run, reported back to operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceStatus {
    Ok { records: usize },
    Empty,
    Error { error_type: String, message: String },
}

/// Result of one executed task.
#[derive(Debug, Clone, Default)]
pub struct TaskRunReport {
    pub records_published: usize,
    pub source_status: HashMap<String, SourceStatus>,
}

/// Executes fired tasks; implemented by the orchestrator.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, spec: &TaskSpec) -> anyhow::Result<TaskRunReport>;
}

#[derive(Debug, Clone, Default)]
pub struct TaskStats {
    pub success_count: u64,
    pub error_count: u64,
    pub records_total: u64,
    pub last_error: Option<String>,
}

/// Registered task plus its scheduling state.
#[derive(Clone)]
pub struct ScheduledTask {
    pub spec: TaskSpec,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: DateTime<Utc>,
    pub enabled: bool,
    pub retry_count: u32,
    pub stats: TaskStats,
}

pub struct TieredScheduler {
    config: SchedulerConfig,
    executor: Arc<dyn TaskExecutor>,
    tasks: Arc<Mutex<HashMap<String, ScheduledTask>>>,
    running: Arc<Mutex<HashSet<String>>>,
}

impl TieredScheduler {
    pub fn new(config: SchedulerConfig, executor: Arc<dyn TaskExecutor>) -> Self {
        Self {
            config,
            executor,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            running: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn add_task(&self, spec: TaskSpec) {
        let name = spec.name.clone();
        let task = ScheduledTask {
            spec,
            last_run: None,
            next_run: Utc::now(),
            enabled: true,
            retry_count: 0,
            stats: TaskStats::default(),
        };
        let mut tasks = self.tasks.lock();
        if tasks.insert(name.clone(), task).is_some() {
            warn!(task = %name, "task replaced");
        } else {
            info!(task = %name, "task added");
        }
    }

    pub fn remove_task(&self, name: &str) -> bool {
        self.tasks.lock().remove(name).is_some()
    }

    /// Re-enabling clears the retry counter and fires on the next tick.
    pub fn enable_task(&self, name: &str) -> bool {
        let mut tasks = self.tasks.lock();
        match tasks.get_mut(name) {
            Some(task) => {
                task.enabled = true;
                task.retry_count = 0;
                task.next_run = Utc::now();
                info!(task = %name, "task enabled");
                true
            }
            None => false,
        }
    }

    pub fn disable_task(&self, name: &str) -> bool {
        let mut tasks = self.tasks.lock();
        match tasks.get_mut(name) {
            Some(task) => {
                task.enabled = false;
                info!(task = %name, "task disabled");
                true
            }
            None => false,
        }
    }

    pub fn tasks(&self) -> Vec<ScheduledTask> {
        self.tasks.lock().values().cloned().collect()
    }

    pub fn task(&self, name: &str) -> Option<ScheduledTask> {
        self.tasks.lock().get(name).cloned()
    }

    /// Names of tasks due at `now` that are not already in flight.
    fn due_tasks(&self, now: DateTime<Utc>) -> Vec<TaskSpec> {
        let running = self.running.lock();
        self.tasks
            .lock()
            .values()
            .filter(|t| t.enabled && t.next_run <= now && !running.contains(&t.spec.name))
            .map(|t| t.spec.clone())
            .collect()
    }

    fn record_success(&self, name: &str, report: &TaskRunReport) {
        let mut tasks = self.tasks.lock();
        if let Some(task) = tasks.get_mut(name) {
            let now = Utc::now();
            task.last_run = Some(now);
            task.next_run = now
                + chrono::Duration::from_std(task.spec.tier.interval(&self.config))
                    .unwrap_or_else(|_| chrono::Duration::zero());
            task.retry_count = 0;
            task.stats.success_count += 1;
            task.stats.records_total += report.records_published as u64;
        }
    }

    fn record_failure(&self, name: &str, message: &str) {
        let mut tasks = self.tasks.lock();
        if let Some(task) = tasks.get_mut(name) {
            let now = Utc::now();
            task.last_run = Some(now);
            task.retry_count += 1;
            task.stats.error_count += 1;
            task.stats.last_error = Some(message.to_string());

            if task.retry_count >= self.config.max_retries {
                task.enabled = false;
                error!(
                    task = %name,
                    retries = task.retry_count,
                    "task disabled after repeated failures"
                );
            } else {
                let backoff = self
                    .config
                    .retry_base
                    .checked_mul(2u32.saturating_pow(task.retry_count))
                    .unwrap_or(self.config.retry_cap)
                    .min(self.config.retry_cap);
                task.next_run =
                    now + chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero());
                warn!(
                    task = %name,
                    retry = task.retry_count,
                    backoff_secs = backoff.as_secs(),
                    "task failed, backing off"
                );
            }
        }
    }

    /// Main loop. Returns once shutdown flips, after the grace period.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.config.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut in_flight: JoinSet<()> = JoinSet::new();

        info!(
            tick_secs = self.config.tick.as_secs(),
            tasks = self.tasks.lock().len(),
            "scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Reap whatever finished since the last tick.
                    while in_flight.try_join_next().is_some() {}

                    for spec in self.due_tasks(Utc::now()) {
                        let scheduler = self.clone();
                        let name = spec.name.clone();
                        scheduler.running.lock().insert(name.clone());
                        in_flight.spawn(async move {
                            scheduler.execute_one(spec).await;
                            scheduler.running.lock().remove(&name);
                        });
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Grace period for in-flight work, then hard cancellation.
        info!(
            grace_secs = self.config.shutdown_grace.as_secs(),
            "scheduler stopping"
        );
        let drain = async {
            while in_flight.join_next().await.is_some() {}
        };
        if tokio::time::timeout(self.config.shutdown_grace, drain)
            .await
            .is_err()
        {
            warn!("grace period elapsed, aborting in-flight tasks");
            in_flight.shutdown().await;
        }
        info!("scheduler stopped");
    }

    async fn execute_one(&self, spec: TaskSpec) {
        debug!(task = %spec.name, tier = spec.tier.as_str(), "executing task");
        match self.executor.execute(&spec).await {
            Ok(report) => {
                debug!(
                    task = %spec.name,
                    records = report.records_published,
                    "task completed"
                );
                self.record_success(&spec.name, &report);
            }
            Err(err) => {
                self.record_failure(&spec.name, &err.to_string());
            }
        }
    }
}

/// The out-of-the-box schedule: high-frequency equities, medium forex,
/// low-frequency macro, daily news.
pub fn default_tasks(watchlist: &[String]) -> Vec<TaskSpec> {
    vec![
        TaskSpec {
            name: "equities_realtime".to_string(),
            data_type: DataType::Equity,
            symbols: watchlist.to_vec(),
            tier: Tier::High,
            provider: None,
        },
        TaskSpec {
            name: "forex_majors".to_string(),
            data_type: DataType::Forex,
            symbols: ["EURUSD=X", "GBPUSD=X", "USDJPY=X", "USDCHF=X"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            tier: Tier::Medium,
            provider: None,
        },
        TaskSpec {
            name: "commodities".to_string(),
            data_type: DataType::Commodity,
            symbols: ["GC=F", "CL=F", "SI=F"].iter().map(|s| s.to_string()).collect(),
            tier: Tier::Medium,
            provider: None,
        },
        TaskSpec {
            name: "us_indices".to_string(),
            data_type: DataType::Index,
            symbols: ["^GSPC", "^DJI", "^IXIC", "DX-Y.NYB"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            tier: Tier::Medium,
            provider: None,
        },
        TaskSpec {
            name: "us_macro".to_string(),
            data_type: DataType::Macro,
            symbols: ["GDP", "UNRATE", "CPIAUCSL", "FEDFUNDS"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            tier: Tier::Low,
            provider: Some("fred".to_string()),
        },
        TaskSpec {
            name: "market_news".to_string(),
            data_type: DataType::News,
            symbols: vec![],
            tier: Tier::Daily,
            // Unpinned: the registry falls back from the curated feeds to
            // Google News when they come up empty.
            provider: None,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingExecutor {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl TaskExecutor for CountingExecutor {
        async fn execute(&self, _spec: &TaskSpec) -> anyhow::Result<TaskRunReport> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("simulated failure");
            }
            Ok(TaskRunReport {
                records_published: 3,
                source_status: HashMap::new(),
            })
        }
    }

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            high: Duration::from_millis(200),
            medium: Duration::from_secs(900),
            low: Duration::from_secs(3600),
            daily: Duration::from_secs(86_400),
            tick: Duration::from_millis(20),
            max_retries: 3,
            retry_base: Duration::from_millis(50),
            retry_cap: Duration::from_millis(200),
            shutdown_grace: Duration::from_millis(200),
        }
    }

    fn spec(name: &str, tier: Tier) -> TaskSpec {
        TaskSpec {
            name: name.to_string(),
            data_type: DataType::Equity,
            symbols: vec!["AAPL".to_string()],
            tier,
            provider: None,
        }
    }

    #[tokio::test]
    async fn due_task_fires_and_reschedules() {
        let executor = Arc::new(CountingExecutor {
            calls: AtomicU32::new(0),
            fail: false,
        });
        let scheduler = Arc::new(TieredScheduler::new(test_config(), executor.clone()));
        scheduler.add_task(spec("t", Tier::High));

        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(scheduler.clone().run(rx));

        tokio::time::sleep(Duration::from_millis(120)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(executor.calls.load(Ordering::SeqCst) >= 1);
        let task = scheduler.task("t").unwrap();
        assert_eq!(task.retry_count, 0);
        assert!(task.stats.success_count >= 1);
        assert_eq!(task.stats.records_total, 3 * task.stats.success_count);
        assert!(task.next_run > Utc::now() - chrono::Duration::seconds(1));
    }

    #[tokio::test]
    async fn failing_task_backs_off_then_disables() {
        let executor = Arc::new(CountingExecutor {
            calls: AtomicU32::new(0),
            fail: true,
        });
        let scheduler = Arc::new(TieredScheduler::new(test_config(), executor.clone()));
        scheduler.add_task(spec("flaky", Tier::High));

        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(scheduler.clone().run(rx));

        // Enough wall time for three attempts through the backoff ladder.
        tokio::time::sleep(Duration::from_millis(900)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let task = scheduler.task("flaky").unwrap();
        assert!(!task.enabled, "task should disable after max retries");
        assert_eq!(task.retry_count, 3);
        assert_eq!(task.stats.error_count, 3);
        assert!(task.stats.last_error.as_deref().unwrap_or("").contains("simulated"));
    }

    #[tokio::test]
    async fn operator_can_reenable_disabled_task() {
        let executor = Arc::new(CountingExecutor {
            calls: AtomicU32::new(0),
            fail: true,
        });
        let scheduler = Arc::new(TieredScheduler::new(test_config(), executor));
        scheduler.add_task(spec("flaky", Tier::High));
        scheduler.disable_task("flaky");
        assert!(!scheduler.task("flaky").unwrap().enabled);

        assert!(scheduler.enable_task("flaky"));
        let task = scheduler.task("flaky").unwrap();
        assert!(task.enabled);
        assert_eq!(task.retry_count, 0);
    }

    #[tokio::test]
    async fn disabled_tasks_never_fire() {
        let executor = Arc::new(CountingExecutor {
            calls: AtomicU32::new(0),
            fail: false,
        });
        let scheduler = Arc::new(TieredScheduler::new(test_config(), executor.clone()));
        scheduler.add_task(spec("idle", Tier::High));
        scheduler.disable_task("idle");

        let (tx, rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(scheduler.clone().run(rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn default_schedule_covers_all_tiers() {
        let tasks = default_tasks(&["AAPL".to_string()]);
        let tiers: HashSet<Tier> = tasks.iter().map(|t| t.tier).collect();
        assert!(tiers.contains(&Tier::High));
        assert!(tiers.contains(&Tier::Medium));
        assert!(tiers.contains(&Tier::Low));
        assert!(tiers.contains(&Tier::Daily));
    }
}
