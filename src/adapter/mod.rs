//! Source adapter pipeline.
//!
//! Every provider implements the same four stages: fetch (I/O), parse
//! (structural decode), validate (business rules), normalize (map to
//! [`UnifiedRecord`]). Stages are pure with respect to the adapter: no
//! mutable state between calls, `&self` everywhere, re-entrant by
//! construction.
//!
//! No raw provider error ever escapes this module. Every failure is wrapped
//! into [`StageError`], whose serialized shape is identical across all
//! adapters and stages.

pub mod frankfurter;
pub mod fred;
pub mod google_news;
pub mod http;
pub mod rss;
pub mod yahoo;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::resilience::retry::Retryable;
use crate::schema::{DataType, SourceType, UnifiedRecord};

// =============================================================================
// STAGES & ERROR ENVELOPE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Fetch,
    Parse,
    Validate,
    Normalize,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fetch => "fetch",
            Stage::Parse => "parse",
            Stage::Validate => "validate",
            Stage::Normalize => "normalize",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform error envelope returned by every adapter stage.
///
/// Serialized shape is part of the contract: `source`, `stage`, `status`,
/// `error_type`, `message`, `retryable`, `timestamp` — nothing else.
#[derive(Debug, Clone, Serialize, thiserror::Error)]
#[error("[{source_name}/{stage}] {error_type}: {message}")]
pub struct StageError {
    #[serde(rename = "source")]
    pub source_name: String,
    pub stage: Stage,
    pub status: &'static str,
    pub error_type: String,
    pub message: String,
    pub retryable: bool,
    pub timestamp: DateTime<Utc>,
    /// Server-requested delay from a 429; transport detail, not envelope.
    #[serde(skip)]
    pub retry_after: Option<Duration>,
}

impl StageError {
    pub fn new(
        source: &str,
        stage: Stage,
        error_type: &str,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self {
            source_name: source.to_string(),
            stage,
            status: "error",
            error_type: error_type.to_string(),
            message: message.into(),
            retryable,
            timestamp: Utc::now(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, delay: Option<Duration>) -> Self {
        self.retry_after = delay;
        self
    }

    pub fn timeout(source: &str, stage: Stage, after: Duration) -> Self {
        Self::new(
            source,
            stage,
            "timeout",
            format!("stage did not complete within {}ms", after.as_millis()),
            true,
        )
    }
}

impl Retryable for StageError {
    fn is_retryable(&self) -> bool {
        self.retryable
    }
    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

// =============================================================================
// REQUEST / RAW PAYLOAD
// =============================================================================

/// One pipeline invocation: what to fetch and for which symbol.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub data_type: DataType,
    /// Empty for batch sources (general news feeds).
    pub symbol: String,
    /// Provider-specific parameters; part of the cache fingerprint.
    pub params: Value,
}

impl FetchRequest {
    pub fn new(data_type: DataType, symbol: &str) -> Self {
        Self {
            data_type,
            symbol: symbol.trim().to_uppercase(),
            params: Value::Null,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Parameters used for cache fingerprinting.
    pub fn fingerprint_params(&self) -> Value {
        serde_json::json!({
            "data_type": self.data_type.as_str(),
            "symbol": self.symbol,
            "params": self.params,
        })
    }
}

/// Opaque provider payload as fetched off the wire.
#[derive(Debug, Clone)]
pub struct RawFetch {
    pub body: Vec<u8>,
    pub http_status: u16,
    pub fetched_at: DateTime<Utc>,
}

impl RawFetch {
    pub fn new(body: Vec<u8>, http_status: u16) -> Self {
        Self {
            body,
            http_status,
            fetched_at: Utc::now(),
        }
    }

    /// Raw blob kept on the record for audit. Large bodies are summarized.
    pub fn audit_value(&self) -> Value {
        const RAW_AUDIT_CAP: usize = 64 * 1024;
        if self.body.len() <= RAW_AUDIT_CAP {
            match serde_json::from_slice::<Value>(&self.body) {
                Ok(v) => v,
                Err(_) => Value::String(String::from_utf8_lossy(&self.body).into_owned()),
            }
        } else {
            serde_json::json!({
                "truncated": true,
                "bytes": self.body.len(),
            })
        }
    }
}

// =============================================================================
// ADAPTER TRAIT
// =============================================================================

/// Per-provider fetch/parse/validate/normalize implementation.
///
/// `parse`, `validate` and `normalize` are synchronous; the pipeline runner
/// moves `parse` onto the blocking pool since structural decoding is the
/// CPU-heavy part.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &str;
    fn source_type(&self) -> SourceType;

    async fn fetch(&self, request: &FetchRequest) -> Result<RawFetch, StageError>;

    fn parse(&self, raw: &RawFetch) -> Result<Value, StageError>;

    fn validate(&self, parsed: &Value) -> Result<(), StageError>;

    fn normalize(
        &self,
        parsed: Value,
        request: &FetchRequest,
    ) -> Result<Vec<UnifiedRecord>, StageError>;

    /// Cheap liveness probe used by the registry.
    async fn health_check(&self) -> bool;
}

// =============================================================================
// PIPELINE RUNNER
// =============================================================================

/// Successful pipeline output.
#[derive(Debug)]
pub struct PipelineOutput {
    pub records: Vec<UnifiedRecord>,
    pub raw_bytes: usize,
    pub latency: Duration,
}

/// Run the full fetch→parse→validate→normalize pipeline under a deadline.
///
/// Stage failures come back as the uniform envelope; the deadline maps to a
/// retryable fetch timeout. Records carry the measured end-to-end latency.
pub async fn run_pipeline(
    adapter: Arc<dyn SourceAdapter>,
    request: &FetchRequest,
    deadline: Duration,
) -> Result<PipelineOutput, StageError> {
    let started = Instant::now();
    let source = adapter.name().to_string();

    let raw = match tokio::time::timeout(deadline, adapter.fetch(request)).await {
        Ok(result) => result?,
        Err(_) => return Err(StageError::timeout(&source, Stage::Fetch, deadline)),
    };
    let raw_bytes = raw.body.len();

    // Structural decode runs on the blocking pool so large payloads do not
    // stall the I/O workers.
    let parsed = {
        let adapter = adapter.clone();
        tokio::task::spawn_blocking(move || {
            let parsed = adapter.parse(&raw)?;
            Ok::<(Value, RawFetch), StageError>((parsed, raw))
        })
        .await
        .map_err(|e| {
            StageError::new(
                &source,
                Stage::Parse,
                "internal",
                format!("parse task failed: {e}"),
                false,
            )
        })??
    };
    let (parsed, raw) = parsed;

    adapter.validate(&parsed)?;

    let mut records = adapter.normalize(parsed, request)?;

    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
    let raw_value = raw.audit_value();
    for record in &mut records {
        record.processing_latency_ms = latency_ms;
        if record.raw.is_null() {
            record.raw = raw_value.clone();
        }
    }

    Ok(PipelineOutput {
        records,
        raw_bytes,
        latency: started.elapsed(),
    })
}

// =============================================================================
// SHARED NORMALIZATION HELPERS
// =============================================================================

/// Pull a Decimal out of a JSON number or numeric string without a float
/// detour where possible.
pub(crate) fn decimal_from_value(value: &Value) -> Option<rust_decimal::Decimal> {
    use std::str::FromStr;
    match value {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(rust_decimal::Decimal::from(i))
            } else {
                // serde_json renders f64 with the shortest roundtrip form,
                // which is the precision the provider gave us.
                rust_decimal::Decimal::from_str(&n.to_string()).ok()
            }
        }
        Value::String(s) => rust_decimal::Decimal::from_str(s.trim()).ok(),
        _ => None,
    }
}

/// Missing-field validation error, shared by the adapters.
pub(crate) fn missing_field(source: &str, field: &str) -> StageError {
    StageError::new(
        source,
        Stage::Validate,
        "schema_violation",
        format!("required field `{field}` is missing"),
        false,
    )
}
