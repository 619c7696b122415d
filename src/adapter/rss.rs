//! RSS news adapter.
//!
//! Pulls one or more RSS 2.0 feeds, decodes `<item>` elements with a pull
//! parser and emits News records. General news carries an empty symbol;
//! titles and descriptions are scanned against the watchlist to fill
//! `symbols_mentioned`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

use super::{http, FetchRequest, RawFetch, SourceAdapter, Stage, StageError};
use crate::config::ProviderSettings;
use crate::schema::{RecordPayload, SourceType, UnifiedRecord};

pub const NAME: &str = "rss_news";

pub struct RssNewsAdapter {
    client: Client,
    feeds: Vec<String>,
    watchlist: Vec<String>,
}

impl RssNewsAdapter {
    pub fn new(settings: &ProviderSettings, watchlist: &[String]) -> Result<Self, StageError> {
        let client = http::build_client(Duration::from_secs(20), None)?;
        let feeds = settings
            .extra
            .get("feeds")
            .map(|s| {
                s.split(',')
                    .map(|f| f.trim().to_string())
                    .filter(|f| !f.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            client,
            feeds,
            watchlist: watchlist.to_vec(),
        })
    }

    fn tag_symbols(&self, text: &str) -> Vec<String> {
        let upper = text.to_uppercase();
        self.watchlist
            .iter()
            .filter(|sym| {
                upper
                    .match_indices(sym.as_str())
                    .any(|(idx, _)| is_word_boundary(&upper, idx, sym.len()))
            })
            .cloned()
            .collect()
    }
}

fn is_word_boundary(text: &str, start: usize, len: usize) -> bool {
    let before_ok = start == 0
        || !text[..start]
            .chars()
            .next_back()
            .map(|c| c.is_ascii_alphanumeric())
            .unwrap_or(false);
    let after_ok = !text[start + len..]
        .chars()
        .next()
        .map(|c| c.is_ascii_alphanumeric())
        .unwrap_or(false);
    before_ok && after_ok
}

fn record_field(in_item: bool, field: Option<&str>, text: &str, current: &mut Value) {
    let text = text.trim();
    if !in_item || text.is_empty() {
        return;
    }
    match field {
        Some(f @ ("title" | "link" | "description" | "pubDate" | "author" | "guid")) => {
            current[f] = Value::String(text.to_string());
        }
        Some("dc:creator") => {
            current["author"] = Value::String(text.to_string());
        }
        Some("category") => {
            if let Some(tags) = current["tags"].as_array_mut() {
                tags.push(Value::String(text.to_string()));
            }
        }
        _ => {}
    }
}

/// Decode the `<item>`s of one RSS document. Shared with the other
/// feed-backed adapters.
pub(crate) fn parse_feed_items(
    source: &str,
    xml: &str,
    feed_url: &str,
) -> Result<Vec<Value>, StageError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut items = Vec::new();
    let mut in_item = false;
    let mut field: Option<String> = None;
    let mut current = json!({});

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if name == "item" {
                    in_item = true;
                    current = json!({ "feed_url": feed_url, "tags": [] });
                } else if in_item {
                    field = Some(name);
                }
            }
            Ok(Event::End(e)) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                if name == "item" {
                    in_item = false;
                    items.push(std::mem::replace(&mut current, json!({})));
                }
                field = None;
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().map(|c| c.into_owned()).unwrap_or_default();
                record_field(in_item, field.as_deref(), &text, &mut current);
            }
            Ok(Event::CData(t)) => {
                let text = String::from_utf8_lossy(t.as_ref()).into_owned();
                record_field(in_item, field.as_deref(), &text, &mut current);
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(StageError::new(
                    source,
                    Stage::Parse,
                    "decode_error",
                    format!("malformed feed {feed_url}: {e}"),
                    // Feeds occasionally serve truncated documents.
                    true,
                ));
            }
            _ => {}
        }
    }

    Ok(items)
}

#[async_trait]
impl SourceAdapter for RssNewsAdapter {
    fn name(&self) -> &str {
        NAME
    }

    fn source_type(&self) -> SourceType {
        SourceType::Rss
    }

    async fn fetch(&self, request: &FetchRequest) -> Result<RawFetch, StageError> {
        // Feed list can be narrowed per request.
        let feeds: Vec<String> = request
            .params
            .get("feeds")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_else(|| self.feeds.clone());

        if feeds.is_empty() {
            return Err(StageError::new(
                NAME,
                Stage::Fetch,
                "invalid_request",
                "no RSS feeds configured",
                false,
            ));
        }

        let mut documents = Vec::with_capacity(feeds.len());
        let mut last_err = None;
        for url in &feeds {
            match http::send(NAME, self.client.get(url)).await {
                Ok(raw) => documents.push(json!({
                    "url": url,
                    "xml": String::from_utf8_lossy(&raw.body).into_owned(),
                })),
                Err(err) => {
                    warn!(feed = %url, error = %err, "rss feed fetch failed");
                    last_err = Some(err);
                }
            }
        }

        if documents.is_empty() {
            // Propagate the real transport failure when every feed is down.
            return Err(last_err.unwrap_or_else(|| {
                StageError::new(NAME, Stage::Fetch, "upstream_error", "all feeds failed", true)
            }));
        }

        let body = serde_json::to_vec(&Value::Array(documents)).map_err(|e| {
            StageError::new(NAME, Stage::Fetch, "internal", e.to_string(), false)
        })?;
        Ok(RawFetch::new(body, 200))
    }

    fn parse(&self, raw: &RawFetch) -> Result<Value, StageError> {
        let documents: Vec<Value> = serde_json::from_slice(&raw.body).map_err(|e| {
            StageError::new(NAME, Stage::Parse, "decode_error", e.to_string(), false)
        })?;

        let mut items = Vec::new();
        for doc in &documents {
            let url = doc["url"].as_str().unwrap_or_default();
            let xml = doc["xml"].as_str().unwrap_or_default();
            items.extend(parse_feed_items(NAME, xml, url)?);
        }
        Ok(Value::Array(items))
    }

    fn validate(&self, parsed: &Value) -> Result<(), StageError> {
        let items = parsed.as_array().ok_or_else(|| {
            StageError::new(
                NAME,
                Stage::Validate,
                "schema_violation",
                "parsed feed is not an item list",
                false,
            )
        })?;
        if items.iter().all(|item| item["title"].as_str().is_none()) && !items.is_empty() {
            return Err(StageError::new(
                NAME,
                Stage::Validate,
                "schema_violation",
                "no item carries a title",
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

        let mut records = Vec::with_capacity(items.len());
        for item in items {
            let Some(title) = item["title"].as_str() else {
                // Title-less items are dropped, not fatal.
                continue;
            };
            let content = item["description"].as_str().unwrap_or_default();
            let timestamp = item["pubDate"]
                .as_str()
                .and_then(|d| DateTime::parse_from_rfc2822(d).ok())
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);

            let tags = item["tags"]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();

            let symbols_mentioned = self.tag_symbols(&format!("{title} {content}"));

            let payload = RecordPayload::News {
                title: title.to_string(),
                content: content.to_string(),
                url: item["link"].as_str().unwrap_or_default().to_string(),
                author: item["author"].as_str().map(str::to_string),
                tags,
                sentiment: None,
                relevance_score: None,
                symbols_mentioned,
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
        if self.feeds.is_empty() {
            return false;
        }
        http::send(NAME, self.client.get(&self.feeds[0])).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::DataType;
    use chrono::TimeZone;

    const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:dc="http://purl.org/dc/elements/1.1/">
  <channel>
    <title>Business News</title>
    <item>
      <title>Apple beats expectations as AAPL rallies</title>
      <link>https://example.com/apple</link>
      <description><![CDATA[Shares of AAPL rose 4% after earnings.]]></description>
      <pubDate>Fri, 31 Jul 2026 14:30:00 GMT</pubDate>
      <dc:creator>Jane Doe</dc:creator>
      <category>earnings</category>
      <category>tech</category>
    </item>
    <item>
      <title>Oil prices steady ahead of OPEC meeting</title>
      <link>https://example.com/oil</link>
      <description>Crude held near recent highs.</description>
      <pubDate>Fri, 31 Jul 2026 12:00:00 GMT</pubDate>
    </item>
  </channel>
</rss>"#;

    fn adapter() -> RssNewsAdapter {
        let mut settings = crate::config::test_support::provider_settings(NAME);
        settings
            .extra
            .insert("feeds".to_string(), "https://example.com/feed.xml".to_string());
        RssNewsAdapter::new(&settings, &["AAPL".to_string(), "TSLA".to_string()]).unwrap()
    }

    fn parsed_fixture() -> Value {
        let body = serde_json::to_vec(&json!([{"url": "https://example.com/feed.xml", "xml": FEED}]))
            .unwrap();
        adapter().parse(&RawFetch::new(body, 200)).unwrap()
    }

    #[test]
    fn parse_extracts_items_with_cdata_and_creator() {
        let items = parsed_fixture();
        let items = items.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[0]["title"].as_str().unwrap(),
            "Apple beats expectations as AAPL rallies"
        );
        assert_eq!(items[0]["author"].as_str().unwrap(), "Jane Doe");
        assert_eq!(items[0]["tags"].as_array().unwrap().len(), 2);
        assert!(items[0]["description"].as_str().unwrap().contains("rose 4%"));
    }

    #[test]
    fn normalize_tags_watchlist_symbols() {
        let request = FetchRequest::new(DataType::News, "");
        let records = adapter().normalize(parsed_fixture(), &request).unwrap();
        assert_eq!(records.len(), 2);

        let apple = &records[0];
        assert_eq!(apple.symbol, "");
        assert_eq!(apple.timestamp.timezone(), Utc);
        match &apple.payload {
            RecordPayload::News {
                symbols_mentioned,
                tags,
                author,
                ..
            } => {
                assert_eq!(symbols_mentioned, &vec!["AAPL".to_string()]);
                assert_eq!(tags, &vec!["earnings".to_string(), "tech".to_string()]);
                assert_eq!(author.as_deref(), Some("Jane Doe"));
            }
            other => panic!("unexpected payload {other:?}"),
        }

        match &records[1].payload {
            RecordPayload::News {
                symbols_mentioned, ..
            } => assert!(symbols_mentioned.is_empty()),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn pub_date_is_parsed_as_utc() {
        let request = FetchRequest::new(DataType::News, "");
        let records = adapter().normalize(parsed_fixture(), &request).unwrap();
        assert_eq!(
            records[0].timestamp,
            Utc.with_ymd_and_hms(2026, 7, 31, 14, 30, 0).unwrap()
        );
    }

    #[test]
    fn symbol_tagging_respects_word_boundaries() {
        let adapter = adapter();
        assert!(adapter.tag_symbols("AAPL hits a record").contains(&"AAPL".to_string()));
        // Embedded occurrences do not count.
        assert!(adapter.tag_symbols("SNAAPLE brand launches").is_empty());
    }

    #[test]
    fn mismatched_tags_are_a_parse_error() {
        let body = serde_json::to_vec(&json!([
            {"url": "u", "xml": "<rss><channel><item><title>x</wrong></item></channel></rss>"}
        ]))
        .unwrap();
        let err = adapter().parse(&RawFetch::new(body, 200)).unwrap_err();
        assert_eq!(err.stage, Stage::Parse);
        assert_eq!(err.error_type, "decode_error");
    }
}
