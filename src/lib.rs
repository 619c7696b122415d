//! Market-intelligence ingestion core.
//!
//! Continuously pulls financial data and news from heterogeneous providers,
//! normalizes everything into one schema, shields itself from provider
//! failures and quota exhaustion, caches with stale-while-revalidate
//! semantics, and lands the normalized stream in a partitioned columnar
//! store while streaming it to subscribers.

pub mod adapter;
pub mod cache;
pub mod config;
pub mod fingerprint;
pub mod kv;
pub mod observability;
pub mod orchestrator;
pub mod registry;
pub mod resilience;
pub mod scheduler;
pub mod schema;
pub mod sink;

// The types most integrations need, at the crate root.
pub use cache::{CacheEntry, CacheOutcome, TieredCache};
pub use config::Config;
pub use kv::{KvStore, MemoryKv, RedisKv};
pub use orchestrator::{Orchestrator, Subscription, SubscriptionFilter};
pub use registry::{register_builtin_adapters, ProviderRegistry, SourceDescriptor, SourcePriority};
pub use scheduler::{default_tasks, TaskSpec, Tier, TieredScheduler};
pub use schema::{DataType, RecordPayload, SourceType, UnifiedRecord};
pub use sink::{AuditLog, DataSink};
