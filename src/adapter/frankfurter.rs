//! Frankfurter FX adapter.
//!
//! Keyless last-resort forex source backed by ECB reference rates. Daily
//! fixings only, so it sits in the FALLBACK tier behind the realtime
//! providers.

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

use super::{
    decimal_from_value, http, missing_field, FetchRequest, RawFetch, SourceAdapter, Stage,
    StageError,
};
use crate::config::ProviderSettings;
use crate::schema::{RecordPayload, SourceType, UnifiedRecord};

const DEFAULT_BASE_URL: &str = "https://api.frankfurter.app";

pub const NAME: &str = "frankfurter";

pub struct FrankfurterAdapter {
    client: Client,
    base_url: String,
}

impl FrankfurterAdapter {
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

    /// Split a six-letter pair like `EURUSD` into base and quote.
    fn split_pair(symbol: &str) -> Result<(&str, &str), StageError> {
        let cleaned = symbol.trim();
        if cleaned.len() != 6 || !cleaned.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(StageError::new(
                NAME,
                Stage::Fetch,
                "invalid_request",
                format!("`{symbol}` is not a six-letter currency pair"),
                false,
            ));
        }
        Ok(cleaned.split_at(3))
    }
}

#[async_trait]
impl SourceAdapter for FrankfurterAdapter {
    fn name(&self) -> &str {
        NAME
    }

    fn source_type(&self) -> SourceType {
        SourceType::Rest
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<RawFetch, StageError> {
        let (base, quote) = Self::split_pair(&request.symbol)?;
        let url = format!("{}/latest", self.base_url);
        let req = self
            .client
            .get(&url)
            .query(&[("from", base), ("to", quote)]);
        http::send(NAME, req).await
    }

    fn parse(&self, raw: &RawFetch) -> Result<Value, StageError> {
        serde_json::from_slice(&raw.body).map_err(|e| {
            StageError::new(NAME, Stage::Parse, "decode_error", e.to_string(), false)
        })
    }

    fn validate(&self, parsed: &Value) -> Result<(), StageError> {
        let rates = parsed
            .get("rates")
            .and_then(Value::as_object)
            .ok_or_else(|| missing_field(NAME, "rates"))?;
        if rates.is_empty() {
            return Err(StageError::new(
                NAME,
                Stage::Validate,
                "schema_violation",
                "rates object is empty",
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
        let rates = parsed
            .get("rates")
            .and_then(Value::as_object)
            .ok_or_else(|| missing_field(NAME, "rates"))?;

        let (_, quote) = Self::split_pair(&request.symbol).map_err(|mut e| {
            e.stage = Stage::Normalize;
            e
        })?;

        let rate = rates
            .get(quote)
            .and_then(decimal_from_value)
            .ok_or_else(|| {
                StageError::new(
                    NAME,
                    Stage::Normalize,
                    "schema_violation",
                    format!("no rate for quote currency {quote}"),
                    false,
                )
            })?;

        // ECB fixings are dated, not timestamped; pin to midnight UTC.
        let timestamp = parsed
            .get("date")
            .and_then(Value::as_str)
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| Utc.from_utc_datetime(&naive))
            .unwrap_or_else(Utc::now);

        let mut payload = RecordPayload::price(rate);
        if let RecordPayload::Price { currency, .. } = &mut payload {
            *currency = Some(quote.to_string());
        }

        Ok(vec![UnifiedRecord::new(
            request.data_type,
            NAME,
            SourceType::Rest,
            &request.symbol,
            timestamp,
            payload,
            Value::Null,
        )])
    }

    async fn health_check(&self) -> bool {
        let req = FetchRequest::new(crate::schema::DataType::Forex, "EURUSD");
        self.fetch(&req).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::DataType;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn adapter() -> FrankfurterAdapter {
        FrankfurterAdapter::new(&crate::config::test_support::provider_settings(NAME)).unwrap()
    }

    #[test]
    fn normalize_maps_rate_and_date() {
        let fixture = serde_json::json!({
            "amount": 1.0,
            "base": "EUR",
            "date": "2026-07-31",
            "rates": {"USD": 1.0921}
        });
        let request = FetchRequest::new(DataType::Forex, "EURUSD");
        let records = adapter().normalize(fixture, &request).unwrap();
        let rec = &records[0];
        assert_eq!(rec.symbol, "EURUSD");
        match &rec.payload {
            RecordPayload::Price { price, currency, .. } => {
                assert_eq!(*price, Decimal::from_str("1.0921").unwrap());
                assert_eq!(currency.as_deref(), Some("USD"));
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(
            rec.timestamp,
            Utc.with_ymd_and_hms(2026, 7, 31, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn bad_pair_is_rejected() {
        let err = FrankfurterAdapter::split_pair("GOLD").unwrap_err();
        assert_eq!(err.error_type, "invalid_request");
        assert!(!err.retryable);
    }

    #[test]
    fn missing_quote_rate_fails_normalize() {
        let fixture = serde_json::json!({
            "base": "EUR", "date": "2026-07-31", "rates": {"JPY": 171.2}
        });
        let request = FetchRequest::new(DataType::Forex, "EURUSD");
        let err = adapter().normalize(fixture, &request).unwrap_err();
        assert_eq!(err.stage, Stage::Normalize);
    }
}
