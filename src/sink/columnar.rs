//! Partitioned parquet store.
//!
//! Layout: `<root>/<bucket>/year=YYYY/month=MM/day=DD/part-<id>.parquet`,
//! where the bucket comes from the record's data type. Each flush builds the
//! whole file in memory and lands it with one sequential write, an fsync and
//! an atomic rename; spinning disks never see partial files or per-record
//! seeks.
//!
//! Monetary columns are Decimal128 (scale 8). The full payload and raw blob
//! ride along as JSON columns so a read reconstructs records losslessly.

use arrow::array::{
    Array, ArrayRef, Decimal128Array, Float64Array, StringArray, TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType as ArrowType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use rust_decimal::Decimal;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::{SinkCompression, SinkConfig};
use crate::schema::{DataType, RecordPayload, SourceType, UnifiedRecord};

pub const DECIMAL_PRECISION: u8 = 38;
pub const DECIMAL_SCALE: i8 = 8;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("arrow: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("parquet: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Scale-8 fixed-point mantissa for the Decimal128 columns.
fn decimal_to_i128(d: Decimal) -> Option<i128> {
    let mut scaled = d;
    scaled.rescale(DECIMAL_SCALE as u32);
    if scaled.scale() == DECIMAL_SCALE as u32 {
        Some(scaled.mantissa())
    } else {
        // Value too large to carry eight fractional digits; the JSON payload
        // column still has it exactly.
        None
    }
}

fn file_schema() -> Arc<Schema> {
    let ts = ArrowType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()));
    let dec = ArrowType::Decimal128(DECIMAL_PRECISION, DECIMAL_SCALE);
    Arc::new(Schema::new(vec![
        Field::new("data_type", ArrowType::Utf8, false),
        Field::new("source", ArrowType::Utf8, false),
        Field::new("source_type", ArrowType::Utf8, false),
        Field::new("symbol", ArrowType::Utf8, false),
        Field::new("ts", ts, false),
        Field::new("price", dec.clone(), true),
        Field::new("volume", dec.clone(), true),
        Field::new("open", dec.clone(), true),
        Field::new("high", dec.clone(), true),
        Field::new("low", dec.clone(), true),
        Field::new("close", dec.clone(), true),
        Field::new("change", dec.clone(), true),
        Field::new("change_percent", dec.clone(), true),
        Field::new("value", dec.clone(), true),
        Field::new("previous_value", dec, true),
        Field::new("unit", ArrowType::Utf8, true),
        Field::new("period", ArrowType::Utf8, true),
        Field::new("title", ArrowType::Utf8, true),
        Field::new("url", ArrowType::Utf8, true),
        Field::new("payload_json", ArrowType::Utf8, false),
        Field::new("raw_json", ArrowType::Utf8, false),
        Field::new("latency_ms", ArrowType::Float64, false),
    ]))
}

struct ColumnBuilders {
    data_type: Vec<String>,
    source: Vec<String>,
    source_type: Vec<String>,
    symbol: Vec<String>,
    ts: Vec<i64>,
    price: Vec<Option<i128>>,
    volume: Vec<Option<i128>>,
    open: Vec<Option<i128>>,
    high: Vec<Option<i128>>,
    low: Vec<Option<i128>>,
    close: Vec<Option<i128>>,
    change: Vec<Option<i128>>,
    change_percent: Vec<Option<i128>>,
    value: Vec<Option<i128>>,
    previous_value: Vec<Option<i128>>,
    unit: Vec<Option<String>>,
    period: Vec<Option<String>>,
    title: Vec<Option<String>>,
    url: Vec<Option<String>>,
    payload_json: Vec<String>,
    raw_json: Vec<String>,
    latency_ms: Vec<f64>,
}

impl ColumnBuilders {
    fn with_capacity(n: usize) -> Self {
        Self {
            data_type: Vec::with_capacity(n),
            source: Vec::with_capacity(n),
            source_type: Vec::with_capacity(n),
            symbol: Vec::with_capacity(n),
            ts: Vec::with_capacity(n),
            price: Vec::with_capacity(n),
            volume: Vec::with_capacity(n),
            open: Vec::with_capacity(n),
            high: Vec::with_capacity(n),
            low: Vec::with_capacity(n),
            close: Vec::with_capacity(n),
            change: Vec::with_capacity(n),
            change_percent: Vec::with_capacity(n),
            value: Vec::with_capacity(n),
            previous_value: Vec::with_capacity(n),
            unit: Vec::with_capacity(n),
            period: Vec::with_capacity(n),
            title: Vec::with_capacity(n),
            url: Vec::with_capacity(n),
            payload_json: Vec::with_capacity(n),
            raw_json: Vec::with_capacity(n),
            latency_ms: Vec::with_capacity(n),
        }
    }

    fn push(&mut self, record: &UnifiedRecord) -> Result<(), SinkError> {
        self.data_type.push(record.data_type.as_str().to_string());
        self.source.push(record.source.clone());
        self.source_type
            .push(record.source_type.as_str().to_string());
        self.symbol.push(record.symbol.clone());
        self.ts.push(record.timestamp.timestamp_micros());

        let mut price = None;
        let mut volume = None;
        let mut open = None;
        let mut high = None;
        let mut low = None;
        let mut close = None;
        let mut change = None;
        let mut change_percent = None;
        let mut value = None;
        let mut previous_value = None;
        let mut unit = None;
        let mut period = None;
        let mut title = None;
        let mut url = None;

        match &record.payload {
            RecordPayload::Price {
                price: p,
                volume: v,
                open: o,
                high: h,
                low: l,
                close: c,
                change: ch,
                change_percent: cp,
                ..
            } => {
                price = decimal_to_i128(*p);
                volume = v.and_then(decimal_to_i128);
                open = o.and_then(decimal_to_i128);
                high = h.and_then(decimal_to_i128);
                low = l.and_then(decimal_to_i128);
                close = c.and_then(decimal_to_i128);
                change = ch.and_then(decimal_to_i128);
                change_percent = cp.and_then(decimal_to_i128);
            }
            RecordPayload::Macro {
                value: v,
                unit: u,
                period: p,
                previous_value: pv,
            } => {
                value = decimal_to_i128(*v);
                previous_value = pv.and_then(decimal_to_i128);
                unit = Some(u.clone());
                period = Some(p.clone());
            }
            RecordPayload::News { title: t, url: u, .. } => {
                title = Some(t.clone());
                url = Some(u.clone());
            }
        }

        self.price.push(price);
        self.volume.push(volume);
        self.open.push(open);
        self.high.push(high);
        self.low.push(low);
        self.close.push(close);
        self.change.push(change);
        self.change_percent.push(change_percent);
        self.value.push(value);
        self.previous_value.push(previous_value);
        self.unit.push(unit);
        self.period.push(period);
        self.title.push(title);
        self.url.push(url);
        self.payload_json
            .push(serde_json::to_string(&record.payload)?);
        self.raw_json.push(serde_json::to_string(&record.raw)?);
        self.latency_ms.push(record.processing_latency_ms);
        Ok(())
    }

    fn finish(self, schema: Arc<Schema>) -> Result<RecordBatch, SinkError> {
        fn dec(values: Vec<Option<i128>>) -> Result<ArrayRef, SinkError> {
            Ok(Arc::new(
                Decimal128Array::from(values)
                    .with_precision_and_scale(DECIMAL_PRECISION, DECIMAL_SCALE)?,
            ))
        }

        let columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from(self.data_type)),
            Arc::new(StringArray::from(self.source)),
            Arc::new(StringArray::from(self.source_type)),
            Arc::new(StringArray::from(self.symbol)),
            Arc::new(TimestampMicrosecondArray::from(self.ts).with_timezone("UTC")),
            dec(self.price)?,
            dec(self.volume)?,
            dec(self.open)?,
            dec(self.high)?,
            dec(self.low)?,
            dec(self.close)?,
            dec(self.change)?,
            dec(self.change_percent)?,
            dec(self.value)?,
            dec(self.previous_value)?,
            Arc::new(StringArray::from(self.unit)),
            Arc::new(StringArray::from(self.period)),
            Arc::new(StringArray::from(self.title)),
            Arc::new(StringArray::from(self.url)),
            Arc::new(StringArray::from(self.payload_json)),
            Arc::new(StringArray::from(self.raw_json)),
            Arc::new(Float64Array::from(self.latency_ms)),
        ];
        Ok(RecordBatch::try_new(schema, columns)?)
    }
}

fn partition_dir(root: &Path, data_type: DataType, date: NaiveDate) -> PathBuf {
    root.join(data_type.sink_bucket())
        .join(format!("year={:04}", date.year()))
        .join(format!("month={:02}", date.month()))
        .join(format!("day={:02}", date.day()))
}

/// Write one partition's worth of records; returns (path, bytes written).
pub fn write_partition(
    config: &SinkConfig,
    data_type: DataType,
    date: NaiveDate,
    records: &[UnifiedRecord],
) -> Result<(PathBuf, usize), SinkError> {
    let schema = file_schema();
    let mut builders = ColumnBuilders::with_capacity(records.len());
    for record in records {
        builders.push(record)?;
    }
    let batch = builders.finish(schema.clone())?;

    let compression = match config.compression {
        SinkCompression::Lz4 => Compression::LZ4_RAW,
        SinkCompression::Snappy => Compression::SNAPPY,
    };
    let props = WriterProperties::builder()
        .set_compression(compression)
        .set_max_row_group_size(config.row_group_size)
        .build();

    // Whole file in memory, then one sequential write.
    let mut encoded: Vec<u8> = Vec::new();
    {
        let mut writer = ArrowWriter::try_new(&mut encoded, schema, Some(props))?;
        writer.write(&batch)?;
        writer.close()?;
    }

    let dir = partition_dir(&config.data_root, data_type, date);
    fs::create_dir_all(&dir)?;

    let file_id = uuid::Uuid::new_v4().simple().to_string();
    let final_path = dir.join(format!("part-{}.parquet", &file_id[..12]));
    let tmp_path = dir.join(format!(".part-{}.tmp", &file_id[..12]));

    {
        use std::io::Write;
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(&encoded)?;
        // fsync once per flush, never per record.
        file.sync_all()?;
    }
    fs::rename(&tmp_path, &final_path)?;

    debug!(
        path = %final_path.display(),
        rows = records.len(),
        bytes = encoded.len(),
        "partition written"
    );
    Ok((final_path, encoded.len()))
}

fn partition_date_from_dir(dir: &Path) -> Option<NaiveDate> {
    let mut year = None;
    let mut month = None;
    let mut day = None;
    for component in dir.components() {
        let text = component.as_os_str().to_string_lossy();
        if let Some(v) = text.strip_prefix("year=") {
            year = v.parse::<i32>().ok();
        } else if let Some(v) = text.strip_prefix("month=") {
            month = v.parse::<u32>().ok();
        } else if let Some(v) = text.strip_prefix("day=") {
            day = v.parse::<u32>().ok();
        }
    }
    NaiveDate::from_ymd_opt(year?, month?, day?)
}

fn collect_parquet_files(bucket_dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![bucket_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path
                .extension()
                .map(|e| e == "parquet")
                .unwrap_or(false)
            {
                files.push(path);
            }
        }
    }
    files
}

fn read_file(path: &Path) -> Result<Vec<UnifiedRecord>, SinkError> {
    let file = fs::File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut records = Vec::new();
    for batch in reader {
        let batch = batch?;
        let get_str = |name: &str| -> Option<&StringArray> {
            batch
                .column_by_name(name)
                .and_then(|c| c.as_any().downcast_ref::<StringArray>())
        };
        let (Some(data_type), Some(source), Some(source_type), Some(symbol)) = (
            get_str("data_type"),
            get_str("source"),
            get_str("source_type"),
            get_str("symbol"),
        ) else {
            warn!(path = %path.display(), "unexpected parquet schema, skipping");
            continue;
        };
        let Some(ts) = batch
            .column_by_name("ts")
            .and_then(|c| c.as_any().downcast_ref::<TimestampMicrosecondArray>())
        else {
            continue;
        };
        let (Some(payload_json), Some(raw_json)) = (get_str("payload_json"), get_str("raw_json"))
        else {
            continue;
        };
        let latency = batch
            .column_by_name("latency_ms")
            .and_then(|c| c.as_any().downcast_ref::<Float64Array>());

        for i in 0..batch.num_rows() {
            let Some(dt) = DataType::parse(data_type.value(i)) else {
                continue;
            };
            let Some(st) = SourceType::parse(source_type.value(i)) else {
                continue;
            };
            let Ok(payload) = serde_json::from_str::<RecordPayload>(payload_json.value(i)) else {
                continue;
            };
            let raw = serde_json::from_str(raw_json.value(i))
                .unwrap_or(serde_json::Value::Null);
            let Some(timestamp) = Utc.timestamp_micros(ts.value(i)).single() else {
                continue;
            };
            records.push(UnifiedRecord {
                data_type: dt,
                source: source.value(i).to_string(),
                source_type: st,
                symbol: symbol.value(i).to_string(),
                timestamp,
                payload,
                raw,
                processing_latency_ms: latency.map(|l| l.value(i)).unwrap_or(0.0),
            });
        }
    }
    Ok(records)
}

/// Read records back out of the partition tree, newest first.
pub fn query(
    config: &SinkConfig,
    data_type: DataType,
    symbol: Option<&str>,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    limit: Option<usize>,
) -> Result<Vec<UnifiedRecord>, SinkError> {
    let bucket_dir = config.data_root.join(data_type.sink_bucket());
    if !bucket_dir.exists() {
        return Ok(Vec::new());
    }

    let start_date = start.map(|t| t.date_naive());
    let end_date = end.map(|t| t.date_naive());
    let symbol_upper = symbol.map(str::to_uppercase);

    let mut records = Vec::new();
    for path in collect_parquet_files(&bucket_dir) {
        // Partition pruning by directory date.
        if let Some(date) = path.parent().and_then(partition_date_from_dir) {
            if start_date.map(|s| date < s).unwrap_or(false)
                || end_date.map(|e| date > e).unwrap_or(false)
            {
                continue;
            }
        }
        for record in read_file(&path)? {
            if record.data_type != data_type {
                continue;
            }
            if let Some(sym) = &symbol_upper {
                if &record.symbol != sym {
                    continue;
                }
            }
            if let Some(s) = start {
                if record.timestamp < s {
                    continue;
                }
            }
            if let Some(e) = end {
                if record.timestamp > e {
                    continue;
                }
            }
            records.push(record);
        }
    }

    records.sort_by_key(|r| std::cmp::Reverse(r.timestamp));
    if let Some(limit) = limit {
        records.truncate(limit);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::RecordPayload;
    use serde_json::json;
    use std::str::FromStr;

    fn test_config(root: &Path) -> SinkConfig {
        SinkConfig {
            data_root: root.to_path_buf(),
            row_group_size: 1000,
            ..SinkConfig::default()
        }
    }

    fn price_record(symbol: &str, ts: DateTime<Utc>, price: &str) -> UnifiedRecord {
        let mut record = UnifiedRecord::new(
            DataType::Equity,
            "yahoo_finance",
            SourceType::Rest,
            symbol,
            ts,
            RecordPayload::price(Decimal::from_str(price).unwrap()),
            json!({"fixture": true}),
        );
        record.processing_latency_ms = 4.2;
        record
    }

    #[test]
    fn decimal_mantissa_is_scale_8() {
        let d = Decimal::from_str("189.98").unwrap();
        assert_eq!(decimal_to_i128(d), Some(18_998_000_000));
        let neg = Decimal::from_str("-0.41").unwrap();
        assert_eq!(decimal_to_i128(neg), Some(-41_000_000));
    }

    #[test]
    fn write_then_read_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let ts = Utc.with_ymd_and_hms(2026, 7, 30, 15, 30, 0).unwrap();

        let records = vec![
            price_record("AAPL", ts, "189.98"),
            price_record("MSFT", ts, "431.11"),
        ];
        let (path, bytes) =
            write_partition(&config, DataType::Equity, ts.date_naive(), &records).unwrap();
        assert!(path.exists());
        assert!(bytes > 0);
        assert!(path.to_string_lossy().contains("stocks/year=2026/month=07/day=30"));

        let read = query(&config, DataType::Equity, None, None, None, None).unwrap();
        assert_eq!(read.len(), 2);
        let aapl = read.iter().find(|r| r.symbol == "AAPL").unwrap();
        match &aapl.payload {
            RecordPayload::Price { price, .. } => {
                assert_eq!(*price, Decimal::from_str("189.98").unwrap());
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(aapl.timestamp, ts);
        assert_eq!(aapl.raw, json!({"fixture": true}));
    }

    #[test]
    fn records_spanning_days_land_in_their_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let day1 = Utc.with_ymd_and_hms(2026, 7, 30, 23, 50, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2026, 7, 31, 0, 10, 0).unwrap();

        write_partition(
            &config,
            DataType::Equity,
            day1.date_naive(),
            &[price_record("AAPL", day1, "189.98")],
        )
        .unwrap();
        write_partition(
            &config,
            DataType::Equity,
            day2.date_naive(),
            &[price_record("AAPL", day2, "190.40")],
        )
        .unwrap();

        assert!(config.data_root.join("stocks/year=2026/month=07/day=30").exists());
        assert!(config.data_root.join("stocks/year=2026/month=07/day=31").exists());

        // Re-reading yields both, newest first.
        let read = query(&config, DataType::Equity, Some("AAPL"), None, None, None).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].timestamp, day2);
        assert_eq!(read[1].timestamp, day1);

        // Date-bounded query prunes the other partition.
        let bounded = query(
            &config,
            DataType::Equity,
            Some("AAPL"),
            Some(day2 - chrono::Duration::minutes(5)),
            None,
            None,
        )
        .unwrap();
        assert_eq!(bounded.len(), 1);
        assert_eq!(bounded[0].timestamp, day2);
    }

    #[test]
    fn query_filters_symbol_and_limit() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let base = Utc.with_ymd_and_hms(2026, 7, 30, 12, 0, 0).unwrap();

        let records: Vec<UnifiedRecord> = (0..10)
            .map(|i| {
                price_record(
                    if i % 2 == 0 { "AAPL" } else { "MSFT" },
                    base + chrono::Duration::minutes(i),
                    "100.5",
                )
            })
            .collect();
        write_partition(&config, DataType::Equity, base.date_naive(), &records).unwrap();

        let aapl = query(&config, DataType::Equity, Some("aapl"), None, None, Some(3)).unwrap();
        assert_eq!(aapl.len(), 3);
        assert!(aapl.iter().all(|r| r.symbol == "AAPL"));
        // Descending timestamps.
        assert!(aapl.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
    }

    #[test]
    fn news_records_roundtrip_through_payload_json() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let ts = Utc.with_ymd_and_hms(2026, 7, 30, 9, 0, 0).unwrap();

        let mut record = UnifiedRecord::new(
            DataType::News,
            "rss_news",
            SourceType::Rss,
            "",
            ts,
            RecordPayload::News {
                title: "Fed holds rates".to_string(),
                content: "No change at the July meeting.".to_string(),
                url: "https://example.com/fed".to_string(),
                author: None,
                tags: vec!["macro".to_string()],
                sentiment: Some(0.1),
                relevance_score: None,
                symbols_mentioned: vec![],
            },
            json!(null),
        );
        record.processing_latency_ms = 1.0;

        write_partition(&config, DataType::News, ts.date_naive(), &[record]).unwrap();
        let read = query(&config, DataType::News, None, None, None, None).unwrap();
        assert_eq!(read.len(), 1);
        match &read[0].payload {
            RecordPayload::News { title, tags, sentiment, .. } => {
                assert_eq!(title, "Fed holds rates");
                assert_eq!(tags, &vec!["macro".to_string()]);
                assert_eq!(*sentiment, Some(0.1));
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }
}
