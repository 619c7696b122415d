//! Unified record schema.
//!
//! Every provider, regardless of wire format, normalizes into
//! [`UnifiedRecord`]. Monetary fields are fixed-precision `Decimal`,
//! timestamps are tz-aware UTC. The payload is a tagged union keyed by
//! [`DataType`] so downstream consumers never probe loose maps.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Category of market data carried by a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Equity,
    Forex,
    Commodity,
    Index,
    Macro,
    News,
    Tick,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Equity => "equity",
            DataType::Forex => "forex",
            DataType::Commodity => "commodity",
            DataType::Index => "index",
            DataType::Macro => "macro",
            DataType::News => "news",
            DataType::Tick => "tick",
        }
    }

    /// Directory bucket used by the durable sink.
    pub fn sink_bucket(&self) -> &'static str {
        match self {
            DataType::Equity | DataType::Index | DataType::Tick => "stocks",
            DataType::Forex | DataType::Commodity => "forex",
            DataType::Macro => "macro",
            DataType::News => "news",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "equity" => Some(DataType::Equity),
            "forex" => Some(DataType::Forex),
            "commodity" => Some(DataType::Commodity),
            "index" => Some(DataType::Index),
            "macro" => Some(DataType::Macro),
            "news" => Some(DataType::News),
            "tick" => Some(DataType::Tick),
            _ => None,
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport used to reach the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Rest,
    Webscrape,
    Rss,
    Websocket,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Rest => "rest",
            SourceType::Webscrape => "webscrape",
            SourceType::Rss => "rss",
            SourceType::Websocket => "websocket",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rest" => Some(SourceType::Rest),
            "webscrape" => Some(SourceType::Webscrape),
            "rss" => Some(SourceType::Rss),
            "websocket" => Some(SourceType::Websocket),
            _ => None,
        }
    }
}

/// Payload variants, tagged by the record's data type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RecordPayload {
    Price {
        price: Decimal,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        volume: Option<Decimal>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        open: Option<Decimal>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        high: Option<Decimal>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        low: Option<Decimal>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        close: Option<Decimal>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        change: Option<Decimal>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        change_percent: Option<Decimal>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        currency: Option<String>,
    },
    Macro {
        value: Decimal,
        unit: String,
        period: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_value: Option<Decimal>,
    },
    News {
        title: String,
        content: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        author: Option<String>,
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sentiment: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relevance_score: Option<f64>,
        #[serde(default)]
        symbols_mentioned: Vec<String>,
    },
}

impl RecordPayload {
    /// Simple price payload, everything else unset.
    pub fn price(price: Decimal) -> Self {
        RecordPayload::Price {
            price,
            volume: None,
            open: None,
            high: None,
            low: None,
            close: None,
            change: None,
            change_percent: None,
            currency: None,
        }
    }
}

/// Canonical normalized record emitted by every adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedRecord {
    pub data_type: DataType,
    /// Logical provider name, registered in the provider registry.
    pub source: String,
    pub source_type: SourceType,
    /// Normalized upper-case identifier; empty for general news.
    pub symbol: String,
    /// Observation time, always tz-aware UTC.
    pub timestamp: DateTime<Utc>,
    pub payload: RecordPayload,
    /// Original provider blob, retained for audit.
    pub raw: serde_json::Value,
    /// End-to-end latency measured inside the pipeline.
    pub processing_latency_ms: f64,
}

impl UnifiedRecord {
    pub fn new(
        data_type: DataType,
        source: impl Into<String>,
        source_type: SourceType,
        symbol: &str,
        timestamp: DateTime<Utc>,
        payload: RecordPayload,
        raw: serde_json::Value,
    ) -> Self {
        Self {
            data_type,
            source: source.into(),
            source_type,
            symbol: symbol.trim().to_uppercase(),
            timestamp,
            payload,
            raw,
            processing_latency_ms: 0.0,
        }
    }

    /// Union key used by fan-in: records from different sources are kept,
    /// identical `(source, symbol, timestamp)` triples collapse.
    pub fn union_key(&self) -> (String, String, i64) {
        (
            self.source.clone(),
            self.symbol.clone(),
            self.timestamp.timestamp_micros(),
        )
    }
}
