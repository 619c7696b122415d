//! marketbrain - market-intelligence ingestion service
//!
//! Wires the core together: config, KV backend, provider registry, tiered
//! cache, durable sink, orchestrator and scheduler. All services are
//! constructed once here and passed down; there is no global mutable state.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};

use marketbrain::config::Config;
use marketbrain::kv::{KvStore, MemoryKv, RedisKv};
use marketbrain::observability;
use marketbrain::orchestrator::Orchestrator;
use marketbrain::registry::{register_builtin_adapters, ProviderRegistry};
use marketbrain::resilience::BudgetFirewall;
use marketbrain::scheduler::{default_tasks, TaskExecutor, TieredScheduler};
use marketbrain::sink::{AuditLog, DataSink};
use marketbrain::TieredCache;

#[derive(Parser, Debug)]
#[command(name = "marketbrain", about = "Market-intelligence ingestion core")]
struct Args {
    /// Override the durable sink root directory.
    #[arg(long, env = "DATA_ROOT")]
    data_root: Option<std::path::PathBuf>,

    /// Print the resolved provider table and exit.
    #[arg(long)]
    print_providers: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();
    let args = Args::parse();

    let mut config = Config::from_env().context("configuration error")?;
    if let Some(root) = args.data_root {
        config.sink.audit_db_path = root.join("audit.db");
        config.sink.data_root = root;
    }
    let config = Arc::new(config);

    if args.print_providers {
        for (name, settings) in &config.providers {
            println!(
                "{name:20} priority={:9} enabled={} daily_limit={}",
                settings.priority.as_str(),
                settings.enabled,
                settings.daily_limit
            );
        }
        return Ok(());
    }

    observability::init_metrics(config.metrics_addr.as_deref())?;

    // Shared KV: Redis when configured, in-process otherwise.
    let kv: Arc<dyn KvStore> = match &config.redis_url {
        Some(url) => {
            let kv = RedisKv::connect(url)
                .await
                .with_context(|| format!("failed to connect to KV at {url}"))?;
            info!(url = %url, "using redis KV backend");
            Arc::new(kv)
        }
        None => {
            warn!("REDIS_URL not set, breaker/budget/cache state is process-local");
            Arc::new(MemoryKv::new())
        }
    };

    // Provider registry with the built-in adapter set.
    let registry = Arc::new(ProviderRegistry::new());
    register_builtin_adapters(&registry, &config);
    registry.build_all(&config).await;
    info!(providers = registry.list().len(), "registry initialized");

    // Durable sink (+ optional encrypted audit trail).
    let audit = if config.sink.audit_enabled {
        Some(Arc::new(
            AuditLog::open(&config.sink.audit_db_path, &config.brain_key)
                .context("failed to open audit log")?,
        ))
    } else {
        None
    };
    let sink = DataSink::start(config.sink.clone(), audit);

    let cache = Arc::new(TieredCache::new(kv.clone(), config.cache.clone()));
    let budget = BudgetFirewall::new(&config.budget);

    let orchestrator = Orchestrator::new(
        config.clone(),
        registry.clone(),
        cache,
        kv,
        budget,
        Some(sink.handle()),
    );

    // Schedule the default task set.
    let scheduler = Arc::new(TieredScheduler::new(
        config.scheduler.clone(),
        Arc::new(orchestrator.clone()) as Arc<dyn TaskExecutor>,
    ));
    for task in default_tasks(&config.watchlist) {
        scheduler.add_task(task);
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let health_handle = tokio::spawn(
        registry
            .clone()
            .run_health_loop(std::time::Duration::from_secs(300), shutdown_rx.clone()),
    );
    let scheduler_handle = tokio::spawn(scheduler.clone().run(shutdown_rx));

    info!("marketbrain running, ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("shutdown requested");

    shutdown_tx.send(true).ok();
    scheduler_handle.await.ok();
    health_handle.await.ok();
    sink.shutdown().await;

    info!("shutdown complete");
    Ok(())
}
