//! Yahoo Finance chart API adapter.
//!
//! Keyless primary source for equities, FX pairs (`EURUSD=X`), commodity
//! futures (`GC=F`) and indices (`^GSPC`, `DX-Y.NYB`) via the v8 chart
//! endpoint. Yahoo rejects default HTTP clients, so the desktop User-Agent
//! from the shared builder is required.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::Value;
use std::time::Duration;

use super::{
    decimal_from_value, http, missing_field, FetchRequest, RawFetch, SourceAdapter, Stage,
    StageError,
};
use crate::config::ProviderSettings;
use crate::schema::{RecordPayload, SourceType, UnifiedRecord};

const DEFAULT_BASE_URL: &str = "https://query1.finance.yahoo.com";

pub const NAME: &str = "yahoo_finance";

pub struct YahooFinanceAdapter {
    client: Client,
    base_url: String,
}

impl YahooFinanceAdapter {
    pub fn new(settings: &ProviderSettings) -> Result<Self, StageError> {
        let client = http::build_client(Duration::from_secs(15), None)?;
        Ok(Self {
            client,
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        })
    }

    fn chart_url(&self, symbol: &str) -> String {
        format!("{}/v8/finance/chart/{}", self.base_url, symbol)
    }

    /// Yahoo symbols keep their native casing conventions (`EURUSD=X`,
    /// `GC=F`, `^GSPC`); the normalized record symbol strips decoration.
    fn normalized_symbol(symbol: &str) -> String {
        symbol
            .trim_start_matches('^')
            .trim_end_matches("=X")
            .trim_end_matches("=F")
            .to_uppercase()
    }

    fn meta<'v>(parsed: &'v Value) -> Option<&'v Value> {
        parsed
            .get("chart")?
            .get("result")?
            .get(0)?
            .get("meta")
    }
}

#[async_trait]
impl SourceAdapter for YahooFinanceAdapter {
    fn name(&self) -> &str {
        NAME
    }

    fn source_type(&self) -> SourceType {
        SourceType::Rest
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<RawFetch, StageError> {
        if request.symbol.is_empty() {
            return Err(StageError::new(
                NAME,
                Stage::Fetch,
                "invalid_request",
                "yahoo_finance requires a symbol",
                false,
            ));
        }
        let url = self.chart_url(&request.symbol);
        let req = self
            .client
            .get(&url)
            .query(&[("interval", "1d"), ("range", "1d")]);
        http::send(NAME, req).await
    }

    fn parse(&self, raw: &RawFetch) -> Result<Value, StageError> {
        serde_json::from_slice(&raw.body).map_err(|e| {
            StageError::new(NAME, Stage::Parse, "decode_error", e.to_string(), false)
        })
    }

    fn validate(&self, parsed: &Value) -> Result<(), StageError> {
        if let Some(err) = parsed.get("chart").and_then(|c| c.get("error")) {
            if !err.is_null() {
                return Err(StageError::new(
                    NAME,
                    Stage::Validate,
                    "provider_error",
                    err.to_string(),
                    false,
                ));
            }
        }
        let meta = Self::meta(parsed).ok_or_else(|| missing_field(NAME, "chart.result[0].meta"))?;
        if decimal_from_value(&meta["regularMarketPrice"]).is_none() {
            return Err(missing_field(NAME, "meta.regularMarketPrice"));
        }
        Ok(())
    }

    fn normalize(
        &self,
        parsed: Value,
        request: &FetchRequest,
    ) -> Result<Vec<UnifiedRecord>, StageError> {
        let meta = Self::meta(&parsed)
            .ok_or_else(|| missing_field(NAME, "chart.result[0].meta"))?
            .clone();

        let price = decimal_from_value(&meta["regularMarketPrice"])
            .ok_or_else(|| missing_field(NAME, "meta.regularMarketPrice"))?;
        let previous_close = decimal_from_value(&meta["chartPreviousClose"])
            .or_else(|| decimal_from_value(&meta["previousClose"]));

        let (change, change_percent) = match previous_close {
            Some(prev) if !prev.is_zero() => {
                let change = price - prev;
                (Some(change), Some(change / prev * Decimal::from(100)))
            }
            _ => (None, None),
        };

        let timestamp = meta["regularMarketTime"]
            .as_i64()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or_else(Utc::now);

        let payload = RecordPayload::Price {
            price,
            volume: decimal_from_value(&meta["regularMarketVolume"]),
            open: decimal_from_value(&meta["regularMarketOpen"]),
            high: decimal_from_value(&meta["regularMarketDayHigh"]),
            low: decimal_from_value(&meta["regularMarketDayLow"]),
            close: previous_close,
            change,
            change_percent,
            currency: meta["currency"].as_str().map(str::to_string),
        };

        let symbol = meta["symbol"]
            .as_str()
            .map(Self::normalized_symbol)
            .unwrap_or_else(|| Self::normalized_symbol(&request.symbol));

        Ok(vec![UnifiedRecord::new(
            request.data_type,
            NAME,
            SourceType::Rest,
            &symbol,
            timestamp,
            payload,
            Value::Null,
        )])
    }

    async fn health_check(&self) -> bool {
        let req = FetchRequest::new(crate::schema::DataType::Index, "^GSPC");
        self.fetch(&req).await.is_ok()
    }
}
