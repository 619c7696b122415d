//! Structured logging and metrics plumbing.
//!
//! Tracing is initialized once by the binary; every orchestrated call gets a
//! short correlation id that is attached to all of its log lines.

use anyhow::{Context, Result};
use std::net::SocketAddr;

/// Correlation id attached to one orchestrated pipeline invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new() -> Self {
        // Eight hex chars is enough to join log lines within a retention window.
        let id = uuid::Uuid::new_v4().simple().to_string();
        Self(id[..8].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Metric names, kept in one place so dashboards do not chase typos.
pub mod metric {
    pub const RECORDS_TOTAL: &str = "ingest_records_total";
    pub const PIPELINE_LATENCY_MS: &str = "pipeline_latency_ms";
    pub const PIPELINE_ERRORS: &str = "pipeline_errors_total";
    pub const CACHE_HITS: &str = "cache_hits_total";
    pub const CACHE_REFRESHES: &str = "cache_refreshes_total";
    pub const BREAKER_TRANSITIONS: &str = "breaker_transitions_total";
    pub const BREAKER_FAST_FAILS: &str = "breaker_fast_fails_total";
    pub const RATE_LIMIT_WAITS: &str = "rate_limit_waits_total";
    pub const BUDGET_DENIED: &str = "budget_denied_total";
    pub const BUDGET_SOFT_WARNINGS: &str = "budget_soft_warnings_total";
    pub const FALLBACK_USED: &str = "fallback_used_total";
    pub const SINK_FLUSHES: &str = "sink_flushes_total";
    pub const SINK_FLUSH_BYTES: &str = "sink_flush_bytes";
    pub const SINK_DROPPED: &str = "sink_dropped_total";
    pub const SUBSCRIBER_LAGGED: &str = "subscriber_lagged_total";
}

/// Install the tracing subscriber (env-filter + fmt layer).
pub fn init_tracing() {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,marketbrain=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Install the Prometheus exporter when an address is configured.
pub fn init_metrics(addr: Option<&str>) -> Result<()> {
    let Some(addr) = addr else {
        return Ok(());
    };
    let socket: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid METRICS_ADDR {addr}"))?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(socket)
        .install()
        .context("Failed to install Prometheus exporter")?;
    tracing::info!(addr = %socket, "metrics exporter listening");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correlation_ids_are_short_and_unique() {
        let a = CorrelationId::new();
        let b = CorrelationId::new();
        assert_eq!(a.as_str().len(), 8);
        assert_ne!(a, b);
    }
}
