//! Google News adapter.
//!
//! Symbol-targeted news via the Google News RSS search endpoint. Sits behind
//! the curated feeds as the SECONDARY news source; shares the RSS item
//! decoding with [`super::rss`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

use super::rss::parse_feed_items;
use super::{http, FetchRequest, RawFetch, SourceAdapter, Stage, StageError};
use crate::config::ProviderSettings;
use crate::schema::{RecordPayload, SourceType, UnifiedRecord};

const DEFAULT_BASE_URL: &str = "https://news.google.com";

pub const NAME: &str = "google_news";

pub struct GoogleNewsAdapter {
    client: Client,
    base_url: String,
}

impl GoogleNewsAdapter {
    pub fn new(settings: &ProviderSettings) -> Result<Self, StageError> {
        let client = http::build_client(Duration::from_secs(20), None)?;
        Ok(Self {
            client,
            base_url: settings
                .base_url
                .clone()
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
        })
    }

    fn feed_url(&self, symbol: &str) -> String {
        if symbol.is_empty() {
            format!("{}/rss?hl=en-US&gl=US&ceid=US:en", self.base_url)
        } else {
            format!(
                "{}/rss/search?q={}+stock&hl=en-US&gl=US&ceid=US:en",
                self.base_url, symbol
            )
        }
    }
}

#[async_trait]
impl SourceAdapter for GoogleNewsAdapter {
    fn name(&self) -> &str {
        NAME
    }

    fn source_type(&self) -> SourceType {
        SourceType::Rss
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<RawFetch, StageError> {
        let url = self.feed_url(&request.symbol);
        http::send(NAME, self.client.get(&url)).await
    }

    fn parse(&self, raw: &RawFetch) -> Result<Value, StageError> {
        let xml = String::from_utf8_lossy(&raw.body);
        let items = parse_feed_items(NAME, &xml, self.base_url.as_str())?;
        Ok(Value::Array(items))
    }

    fn validate(&self, parsed: &Value) -> Result<(), StageError> {
        if !parsed.is_array() {
            return Err(StageError::new(
                NAME,
                Stage::Validate,
                "schema_violation",
                "parsed feed is not an item list",
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
        let items = parsed.as_array().cloned().unwrap_or_default();
        let queried = (!request.symbol.is_empty()).then(|| request.symbol.clone());

        let mut records = Vec::with_capacity(items.len());
        for item in items {
            let Some(title) = item["title"].as_str() else {
                continue;
            };
            let timestamp = item["pubDate"]
                .as_str()
                .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);

            let payload = RecordPayload::News {
                title: title.to_string(),
                content: item["description"].as_str().unwrap_or_default().to_string(),
                url: item["link"].as_str().unwrap_or_default().to_string(),
                author: item["author"].as_str().map(str::to_string),
                tags: vec![],
                sentiment: None,
                relevance_score: None,
                // The search query ties every result to the requested symbol.
                symbols_mentioned: queried.iter().cloned().collect(),
            };

            let mut record = UnifiedRecord::new(
                request.data_type,
                NAME,
                SourceType::Rss,
                "",
                timestamp,
                payload,
                Value::Null,
            );
            record.raw = item;
            records.push(record);
        }

        Ok(records)
    }

    async fn health_check(&self) -> bool {
        let url = self.feed_url("");
        http::send(NAME, self.client.get(&url)).await.is_ok()
    }
}
