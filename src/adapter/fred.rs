//! FRED macro-indicator adapter.
//!
//! Authenticated secondary source for US macro series (GDP, UNRATE,
//! CPIAUCSL, FEDFUNDS) through `series/observations`. The latest two
//! observations give the current and previous values.

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

const DEFAULT_BASE_URL: &str = "https://api.stlouisfed.org/fred";

pub const NAME: &str = "fred";

/// Units for the handful of series scheduled out of the box; anything else
/// falls back to the provider's `units` request parameter.
fn default_unit(series: &str) -> &'static str {
    match series {
        "GDP" => "billions_usd",
        "UNRATE" => "percent",
        "CPIAUCSL" => "index_1982_1984",
        "FEDFUNDS" => "percent",
        _ => "value",
    }
}

pub struct FredAdapter {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl FredAdapter {
    pub fn new(settings: &ProviderSettings) -> Result<Self, StageError> {
        let client = http::build_client(Duration::from_secs(20), None)?;
        Ok(Self {
            client,
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: settings.api_key.clone(),
        })
    }
}

#[async_trait]
impl SourceAdapter for FredAdapter {
    fn name(&self) -> &str {
        NAME
    }

    fn source_type(&self) -> SourceType {
        SourceType::Rest
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<RawFetch, StageError> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            StageError::new(
                NAME,
                Stage::Fetch,
                "auth_failed",
                "FRED_API_KEY is not configured",
                false,
            )
        })?;
        if request.symbol.is_empty() {
            return Err(StageError::new(
                NAME,
                Stage::Fetch,
                "invalid_request",
                "fred requires a series id",
                false,
            ));
        }

        let url = format!("{}/series/observations", self.base_url);
        let req = self.client.get(&url).query(&[
            ("series_id", request.symbol.as_str()),
            ("api_key", api_key),
            ("file_type", "json"),
            ("sort_order", "desc"),
            ("limit", "2"),
        ]);
        http::send(NAME, req).await
    }

    fn parse(&self, raw: &RawFetch) -> Result<Value, StageError> {
        serde_json::from_slice(&raw.body).map_err(|e| {
            StageError::new(NAME, Stage::Parse, "decode_error", e.to_string(), false)
        })
    }

    fn validate(&self, parsed: &Value) -> Result<(), StageError> {
        let observations = parsed
            .get("observations")
            .and_then(Value::as_array)
            .ok_or_else(|| missing_field(NAME, "observations"))?;

        // FRED encodes missing data points as ".".
        let usable = observations.iter().any(|obs| {
            obs.get("value")
                .and_then(Value::as_str)
                .map(|v| v != ".")
                .unwrap_or(false)
        });
        if !usable {
            return Err(StageError::new(
                NAME,
                Stage::Validate,
                "schema_violation",
                "no usable observation values",
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
        let observations = parsed
            .get("observations")
            .and_then(Value::as_array)
            .ok_or_else(|| missing_field(NAME, "observations"))?;

        let mut usable = observations.iter().filter_map(|obs| {
            let value = decimal_from_value(obs.get("value")?)?;
            let date = obs.get("date")?.as_str()?;
            Some((value, date.to_string()))
        });

        let (value, period) = usable.next().ok_or_else(|| {
            StageError::new(
                NAME,
                Stage::Normalize,
                "schema_violation",
                "no numeric observation to normalize",
                false,
            )
        })?;
        let previous_value = usable.next().map(|(v, _)| v);

        let timestamp = NaiveDate::parse_from_str(&period, "%Y-%m-%d")
            .ok()
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| Utc.from_utc_datetime(&naive))
            .unwrap_or_else(Utc::now);

        let unit = request
            .params
            .get("units")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| default_unit(&request.symbol).to_string());

        let payload = RecordPayload::Macro {
            value,
            unit,
            period,
            previous_value,
        };

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
        if self.api_key.is_none() {
            return false;
        }
        let req = FetchRequest::new(crate::schema::DataType::Macro, "GDP");
        self.fetch(&req).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::DataType;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn adapter() -> FredAdapter {
        let mut settings = crate::config::test_support::provider_settings(NAME);
        settings.api_key = Some("test-key".to_string());
        FredAdapter::new(&settings).unwrap()
    }

    fn fixture() -> Value {
        serde_json::json!({
            "observations": [
                {"date": "2026-04-01", "value": "27360.934"},
                {"date": "2026-01-01", "value": "27063.012"}
            ]
        })
    }

    #[test]
    fn normalize_maps_latest_and_previous() {
        let request = FetchRequest::new(DataType::Macro, "GDP");
        let records = adapter().normalize(fixture(), &request).unwrap();
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert_eq!(rec.symbol, "GDP");
        match &rec.payload {
            RecordPayload::Macro {
                value,
                previous_value,
                unit,
                period,
            } => {
                assert_eq!(*value, Decimal::from_str("27360.934").unwrap());
                assert_eq!(
                    *previous_value,
                    Some(Decimal::from_str("27063.012").unwrap())
                );
                assert_eq!(unit, "billions_usd");
                assert_eq!(period, "2026-04-01");
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(rec.timestamp.timezone(), Utc);
    }

    #[test]
    fn missing_value_observations_are_skipped() {
        let fixture = serde_json::json!({
            "observations": [
                {"date": "2026-04-01", "value": "."},
                {"date": "2026-01-01", "value": "4.1"}
            ]
        });
        let request = FetchRequest::new(DataType::Macro, "UNRATE");
        let records = adapter().normalize(fixture, &request).unwrap();
        match &records[0].payload {
            RecordPayload::Macro { value, period, .. } => {
                assert_eq!(*value, Decimal::from_str("4.1").unwrap());
                assert_eq!(period, "2026-01-01");
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn validate_rejects_all_missing_values() {
        let fixture = serde_json::json!({
            "observations": [{"date": "2026-04-01", "value": "."}]
        });
        let err = adapter().validate(&fixture).unwrap_err();
        assert_eq!(err.stage, Stage::Validate);
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn fetch_without_key_is_auth_failure() {
        let settings = crate::config::test_support::provider_settings(NAME);
        let adapter = FredAdapter::new(&settings).unwrap();
        let err = adapter
            .fetch(&FetchRequest::new(DataType::Macro, "GDP"))
            .await
            .unwrap_err();
        assert_eq!(err.error_type, "auth_failed");
        assert!(!err.retryable);
    }
}
