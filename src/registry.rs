//! Provider registry.
//!
//! Adapters are registered explicitly at startup (no reflective discovery):
//! each built-in calls `register` with a descriptor and a factory. The
//! orchestrator asks the registry which providers can answer a data type and
//! walks them in `(priority, -reliability)` order. A background loop health
//! checks providers and disables ones that fail repeatedly.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::adapter::SourceAdapter;
use crate::config::{Config, ProviderSettings};
use crate::schema::DataType;

/// PRIMARY providers are keyless or generously quota'd and used first;
/// SECONDARY are authenticated APIs; FALLBACK is the last resort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SourcePriority {
    Primary,
    Secondary,
    Fallback,
}

impl SourcePriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourcePriority::Primary => "primary",
            SourcePriority::Secondary => "secondary",
            SourcePriority::Fallback => "fallback",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "primary" => Some(SourcePriority::Primary),
            "secondary" => Some(SourcePriority::Secondary),
            "fallback" => Some(SourcePriority::Fallback),
            _ => None,
        }
    }
}

/// Registry row describing one provider.
#[derive(Clone)]
pub struct SourceDescriptor {
    pub name: String,
    pub priority: SourcePriority,
    pub data_types: Vec<DataType>,
    pub rate_limit_per_hour: u32,
    /// Rolling health score in [0, 1]; decays on failed health checks.
    pub reliability_score: f64,
    pub enabled: bool,
}

type AdapterFactory =
    Arc<dyn Fn(&ProviderSettings) -> anyhow::Result<Arc<dyn SourceAdapter>> + Send + Sync>;

struct Registration {
    descriptor: SourceDescriptor,
    factory: AdapterFactory,
    /// Instantiated at startup, held for process lifetime.
    instance: Option<Arc<dyn SourceAdapter>>,
    consecutive_health_failures: u32,
}

/// Explicit registration table for provider adapters.
pub struct ProviderRegistry {
    entries: RwLock<HashMap<String, Registration>>,
    /// Health failures before a provider is disabled.
    disable_after: u32,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            disable_after: 3,
        }
    }

    pub fn register<F>(&self, descriptor: SourceDescriptor, factory: F)
    where
        F: Fn(&ProviderSettings) -> anyhow::Result<Arc<dyn SourceAdapter>> + Send + Sync + 'static,
    {
        let name = descriptor.name.clone();
        let mut entries = self.entries.write();
        if entries.contains_key(&name) {
            warn!(provider = %name, "provider already registered, replacing");
        }
        entries.insert(
            name.clone(),
            Registration {
                descriptor,
                factory: Arc::new(factory),
                instance: None,
                consecutive_health_failures: 0,
            },
        );
        info!(provider = %name, "provider registered");
    }

    /// Is this name a registered provider?
    pub fn validate(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    pub fn list(&self) -> Vec<SourceDescriptor> {
        self.entries
            .read()
            .values()
            .map(|r| r.descriptor.clone())
            .collect()
    }

    pub fn descriptor(&self, name: &str) -> Option<SourceDescriptor> {
        self.entries.read().get(name).map(|r| r.descriptor.clone())
    }

    /// Enabled providers serving `dt`, ordered `(priority, -reliability)`.
    pub fn by_data_type(&self, dt: DataType) -> Vec<SourceDescriptor> {
        let mut matching: Vec<SourceDescriptor> = self
            .entries
            .read()
            .values()
            .map(|r| r.descriptor.clone())
            .filter(|d| d.enabled && d.data_types.contains(&dt))
            .collect();
        matching.sort_by(|a, b| {
            a.priority.cmp(&b.priority).then(
                b.reliability_score
                    .partial_cmp(&a.reliability_score)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
        });
        matching
    }

    pub fn by_priority(&self, priority: SourcePriority) -> Vec<SourceDescriptor> {
        self.entries
            .read()
            .values()
            .map(|r| r.descriptor.clone())
            .filter(|d| d.priority == priority)
            .collect()
    }

    /// Build (or return the already-built) adapter instance for `name`.
    pub fn create(
        &self,
        name: &str,
        settings: &ProviderSettings,
    ) -> anyhow::Result<Arc<dyn SourceAdapter>> {
        {
            let entries = self.entries.read();
            if let Some(instance) = entries.get(name).and_then(|r| r.instance.clone()) {
                return Ok(instance);
            }
        }

        let mut entries = self.entries.write();
        let registration = entries
            .get_mut(name)
            .ok_or_else(|| anyhow::anyhow!("provider {name} is not registered"))?;
        if let Some(instance) = registration.instance.clone() {
            return Ok(instance);
        }
        let instance = (registration.factory)(settings)?;
        registration.instance = Some(instance.clone());
        Ok(instance)
    }

    /// Get the instantiated adapter, if startup built one.
    pub fn instance(&self, name: &str) -> Option<Arc<dyn SourceAdapter>> {
        self.entries.read().get(name).and_then(|r| r.instance.clone())
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut entries = self.entries.write();
        match entries.get_mut(name) {
            Some(r) => {
                if r.descriptor.enabled != enabled {
                    info!(provider = %name, enabled, "provider availability changed");
                }
                r.descriptor.enabled = enabled;
                if enabled {
                    r.consecutive_health_failures = 0;
                }
                true
            }
            None => false,
        }
    }

    /// Instantiate every enabled provider and run its first health check.
    pub async fn build_all(&self, config: &Config) {
        let names: Vec<String> = self.entries.read().keys().cloned().collect();
        for name in names {
            let Some(settings) = config.provider(&name).cloned() else {
                warn!(provider = %name, "no settings for registered provider, disabling");
                self.set_enabled(&name, false);
                continue;
            };
            if !settings.enabled {
                self.set_enabled(&name, false);
                continue;
            }
            match self.create(&name, &settings) {
                Ok(_) => {}
                Err(err) => {
                    warn!(provider = %name, error = %err, "provider construction failed, disabling");
                    self.set_enabled(&name, false);
                }
            }
        }
    }

    /// One pass of the periodic health check.
    pub async fn health_check_pass(&self) {
        let instances: Vec<(String, Arc<dyn SourceAdapter>)> = self
            .entries
            .read()
            .iter()
            .filter(|(_, r)| r.descriptor.enabled)
            .filter_map(|(name, r)| r.instance.clone().map(|i| (name.clone(), i)))
            .collect();

        for (name, adapter) in instances {
            let healthy = adapter.health_check().await;
            let mut entries = self.entries.write();
            let Some(registration) = entries.get_mut(&name) else {
                continue;
            };
            if healthy {
                registration.consecutive_health_failures = 0;
                registration.descriptor.reliability_score =
                    (registration.descriptor.reliability_score * 0.9 + 0.1).min(1.0);
            } else {
                registration.consecutive_health_failures += 1;
                registration.descriptor.reliability_score *= 0.7;
                warn!(
                    provider = %name,
                    failures = registration.consecutive_health_failures,
                    "health check failed"
                );
                if registration.consecutive_health_failures >= self.disable_after {
                    registration.descriptor.enabled = false;
                    warn!(provider = %name, "provider disabled after repeated health failures");
                }
            }
        }
    }

    /// Background health loop until shutdown flips.
    pub async fn run_health_loop(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.health_check_pass().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Register the built-in adapter set.
pub fn register_builtin_adapters(registry: &ProviderRegistry, config: &Config) {
    use crate::adapter::{frankfurter, fred, google_news, rss, yahoo};

    registry.register(
        SourceDescriptor {
            name: yahoo::NAME.to_string(),
            priority: config
                .provider(yahoo::NAME)
                .map(|p| p.priority)
                .unwrap_or(SourcePriority::Primary),
            data_types: vec![
                DataType::Equity,
                DataType::Forex,
                DataType::Commodity,
                DataType::Index,
            ],
            rate_limit_per_hour: 7_200,
            reliability_score: 0.9,
            enabled: true,
        },
        |settings| Ok(Arc::new(yahoo::YahooFinanceAdapter::new(settings)?) as Arc<dyn SourceAdapter>),
    );

    registry.register(
        SourceDescriptor {
            name: fred::NAME.to_string(),
            priority: config
                .provider(fred::NAME)
                .map(|p| p.priority)
                .unwrap_or(SourcePriority::Secondary),
            data_types: vec![DataType::Macro],
            rate_limit_per_hour: 3_600,
            reliability_score: 0.95,
            enabled: true,
        },
        |settings| Ok(Arc::new(fred::FredAdapter::new(settings)?) as Arc<dyn SourceAdapter>),
    );

    registry.register(
        SourceDescriptor {
            name: frankfurter::NAME.to_string(),
            priority: config
                .provider(frankfurter::NAME)
                .map(|p| p.priority)
                .unwrap_or(SourcePriority::Fallback),
            data_types: vec![DataType::Forex],
            rate_limit_per_hour: 1_800,
            reliability_score: 0.8,
            enabled: true,
        },
        |settings| {
            Ok(Arc::new(frankfurter::FrankfurterAdapter::new(settings)?) as Arc<dyn SourceAdapter>)
        },
    );

    registry.register(
        SourceDescriptor {
            name: google_news::NAME.to_string(),
            priority: config
                .provider(google_news::NAME)
                .map(|p| p.priority)
                .unwrap_or(SourcePriority::Secondary),
            data_types: vec![DataType::News],
            rate_limit_per_hour: 360,
            reliability_score: 0.75,
            enabled: true,
        },
        |settings| {
            Ok(Arc::new(google_news::GoogleNewsAdapter::new(settings)?) as Arc<dyn SourceAdapter>)
        },
    );

    let watchlist = config.watchlist.clone();
    registry.register(
        SourceDescriptor {
            name: rss::NAME.to_string(),
            priority: config
                .provider(rss::NAME)
                .map(|p| p.priority)
                .unwrap_or(SourcePriority::Primary),
            data_types: vec![DataType::News],
            rate_limit_per_hour: 720,
            reliability_score: 0.85,
            enabled: true,
        },
        move |settings| {
            Ok(Arc::new(rss::RssNewsAdapter::new(settings, &watchlist)?) as Arc<dyn SourceAdapter>)
        },
    );
}
