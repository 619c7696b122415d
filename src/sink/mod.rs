//! Durable sink.
//!
//! Producers push normalized records through a channel into one writer task
//! that buffers per data type and flushes to the partitioned columnar store
//! when size, item count or the flush interval trips, whichever comes
//! first. The buffer is only cleared after the filesystem acknowledged the
//! write; a failed flush keeps the records for the next trigger.

pub mod audit;
pub mod columnar;

use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

pub use audit::AuditLog;
pub use columnar::SinkError;

use crate::config::SinkConfig;
use crate::observability::metric;
use crate::schema::{DataType, UnifiedRecord};

/// Queue depth between producers and the writer task.
const CHANNEL_DEPTH: usize = 8_192;

#[derive(Debug, Default)]
pub struct SinkStats {
    pub appended: AtomicU64,
    pub flushed_records: AtomicU64,
    pub flushes: AtomicU64,
    pub flush_failures: AtomicU64,
    pub dropped: AtomicU64,
}

enum SinkCommand {
    Append(Box<UnifiedRecord>),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Cheap cloneable producer handle.
#[derive(Clone)]
pub struct SinkHandle {
    tx: mpsc::Sender<SinkCommand>,
    stats: Arc<SinkStats>,
}

impl SinkHandle {
    /// Enqueue a record. Lossy under overload: when the writer cannot keep
    /// up the record is dropped and counted, never blocking the pipeline.
    pub fn append(&self, record: UnifiedRecord) {
        match self.tx.try_send(SinkCommand::Append(Box::new(record))) {
            Ok(()) => {
                self.stats.appended.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(metric::SINK_DROPPED, 1);
            }
        }
    }
}

pub struct DataSink {
    config: SinkConfig,
    tx: mpsc::Sender<SinkCommand>,
    stats: Arc<SinkStats>,
    worker: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DataSink {
    pub fn start(config: SinkConfig, audit: Option<Arc<AuditLog>>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let stats = Arc::new(SinkStats::default());

        let worker = tokio::spawn(writer_loop(
            config.clone(),
            rx,
            stats.clone(),
            audit,
        ));

        Arc::new(Self {
            config,
            tx,
            stats,
            worker: parking_lot::Mutex::new(Some(worker)),
        })
    }

    pub fn handle(&self) -> SinkHandle {
        SinkHandle {
            tx: self.tx.clone(),
            stats: self.stats.clone(),
        }
    }

    pub fn stats(&self) -> &SinkStats {
        &self.stats
    }

    /// Force a flush and wait for it to complete.
    pub async fn flush_now(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(SinkCommand::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Final flush, then stop the writer.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(SinkCommand::Shutdown).await;
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }

    /// Read back from the durable store.
    pub async fn query(
        &self,
        data_type: DataType,
        symbol: Option<String>,
        start: Option<chrono::DateTime<chrono::Utc>>,
        end: Option<chrono::DateTime<chrono::Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<UnifiedRecord>, SinkError> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || {
            columnar::query(&config, data_type, symbol.as_deref(), start, end, limit)
        })
        .await
        .map_err(|e| SinkError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }
}

struct Buffer {
    segments: HashMap<DataType, Vec<UnifiedRecord>>,
    items: usize,
    bytes: usize,
}

impl Buffer {
    fn new() -> Self {
        Self {
            segments: HashMap::new(),
            items: 0,
            bytes: 0,
        }
    }

    fn push(&mut self, record: UnifiedRecord) {
        // Payload plus raw dominates the on-disk size; a fixed overhead
        // covers the typed columns.
        let estimate = 256
            + record.raw.to_string().len()
            + serde_json::to_string(&record.payload)
                .map(|s| s.len())
                .unwrap_or(128);
        self.bytes += estimate;
        self.items += 1;
        self.segments.entry(record.data_type).or_default().push(record);
    }

    fn take(&mut self) -> HashMap<DataType, Vec<UnifiedRecord>> {
        self.items = 0;
        self.bytes = 0;
        std::mem::take(&mut self.segments)
    }

    fn restore(&mut self, segments: HashMap<DataType, Vec<UnifiedRecord>>) {
        for (_, records) in segments {
            for record in records {
                self.push(record);
            }
        }
    }
}

async fn writer_loop(
    config: SinkConfig,
    mut rx: mpsc::Receiver<SinkCommand>,
    stats: Arc<SinkStats>,
    audit: Option<Arc<AuditLog>>,
) {
    let mut buffer = Buffer::new();
    let mut ticker = tokio::time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; swallow it.
    ticker.tick().await;

    info!(
        root = %config.data_root.display(),
        buffer_mb = config.buffer_size_bytes / (1024 * 1024),
        max_items = config.max_buffer_items,
        "sink writer started"
    );

    loop {
        tokio::select! {
            command = rx.recv() => {
                match command {
                    Some(SinkCommand::Append(record)) => {
                        buffer.push(*record);
                        if buffer.items >= config.max_buffer_items
                            || buffer.bytes >= config.buffer_size_bytes
                        {
                            flush(&config, &mut buffer, &stats, audit.as_deref()).await;
                        }
                    }
                    Some(SinkCommand::Flush(done)) => {
                        flush(&config, &mut buffer, &stats, audit.as_deref()).await;
                        let _ = done.send(());
                    }
                    Some(SinkCommand::Shutdown) | None => {
                        flush(&config, &mut buffer, &stats, audit.as_deref()).await;
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                if buffer.items > 0 {
                    flush(&config, &mut buffer, &stats, audit.as_deref()).await;
                }
            }
        }
    }
    info!("sink writer stopped");
}

async fn flush(
    config: &SinkConfig,
    buffer: &mut Buffer,
    stats: &Arc<SinkStats>,
    audit: Option<&AuditLog>,
) {
    if buffer.items == 0 {
        return;
    }
    let segments = buffer.take();
    let total: usize = segments.values().map(Vec::len).sum();
    let config = config.clone();

    // Group each segment by UTC day, write a partition per group.
    let mut failed: HashMap<DataType, Vec<UnifiedRecord>> = HashMap::new();
    let mut written_records = 0usize;
    let mut written_bytes = 0usize;

    for (data_type, records) in segments {
        let mut by_day: HashMap<NaiveDate, Vec<UnifiedRecord>> = HashMap::new();
        for record in records {
            by_day
                .entry(record.timestamp.date_naive())
                .or_default()
                .push(record);
        }

        for (date, group) in by_day {
            let cfg = config.clone();
            let count = group.len();
            let write = tokio::task::spawn_blocking(move || {
                let result = columnar::write_partition(&cfg, data_type, date, &group);
                (result, group)
            })
            .await;

            match write {
                Ok((Ok((_path, bytes)), group)) => {
                    written_records += count;
                    written_bytes += bytes;
                    if let Some(audit) = audit {
                        if let Err(e) = audit.record_batch(&group) {
                            warn!(error = %e, "audit write failed");
                        }
                    }
                }
                Ok((Err(e), group)) => {
                    error!(
                        data_type = data_type.as_str(),
                        date = %date,
                        error = %e,
                        "partition write failed, keeping records buffered"
                    );
                    failed.entry(data_type).or_default().extend(group);
                }
                Err(join_err) => {
                    error!(error = %join_err, "partition writer panicked, records lost");
                    stats.dropped.fetch_add(count as u64, Ordering::Relaxed);
                }
            }
        }
    }

    stats.flushes.fetch_add(1, Ordering::Relaxed);
    stats
        .flushed_records
        .fetch_add(written_records as u64, Ordering::Relaxed);
    if written_records > 0 {
        metrics::counter!(metric::SINK_FLUSHES, 1);
        metrics::histogram!(metric::SINK_FLUSH_BYTES, written_bytes as f64);
    }

    if !failed.is_empty() {
        stats.flush_failures.fetch_add(1, Ordering::Relaxed);
        // Put unwritten records back, but never let the buffer run away.
        buffer.restore(failed);
        if buffer.items > config.max_buffer_items * 2 {
            let over = buffer.items - config.max_buffer_items;
            warn!(dropping = over, "sink buffer overflow, dropping oldest records");
            for records in buffer.segments.values_mut() {
                let drop_n = records.len().min(over);
                records.drain(..drop_n);
            }
            let remaining: usize = buffer.segments.values().map(Vec::len).sum();
            stats
                .dropped
                .fetch_add((buffer.items - remaining) as u64, Ordering::Relaxed);
            buffer.items = remaining;
        }
    }

    debug!(
        flushed = written_records,
        of = total,
        bytes = written_bytes,
        "sink flush complete"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{RecordPayload, SourceType};
    use chrono::{TimeZone, Utc};
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use std::time::Duration;

    fn test_config(root: &std::path::Path) -> SinkConfig {
        SinkConfig {
            data_root: root.to_path_buf(),
            buffer_size_bytes: 64 * 1024 * 1024,
            max_buffer_items: 100,
            flush_interval: Duration::from_secs(3600),
            row_group_size: 1000,
            ..SinkConfig::default()
        }
    }

    fn record(symbol: &str, ts: chrono::DateTime<Utc>) -> UnifiedRecord {
        UnifiedRecord::new(
            DataType::Equity,
            "yahoo_finance",
            SourceType::Rest,
            symbol,
            ts,
            RecordPayload::price(Decimal::from_str("55.5").unwrap()),
            serde_json::json!({}),
        )
    }

    #[tokio::test]
    async fn explicit_flush_persists_records() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DataSink::start(test_config(dir.path()), None);
        let handle = sink.handle();

        let ts = Utc.with_ymd_and_hms(2026, 7, 30, 10, 0, 0).unwrap();
        handle.append(record("AAPL", ts));
        handle.append(record("MSFT", ts));
        sink.flush_now().await;

        let read = sink
            .query(DataType::Equity, None, None, None, None)
            .await
            .unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(sink.stats().flushed_records.load(Ordering::Relaxed), 2);
        sink.shutdown().await;
    }

    #[tokio::test]
    async fn item_count_triggers_flush() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.max_buffer_items = 10;
        let sink = DataSink::start(config, None);
        let handle = sink.handle();

        let ts = Utc.with_ymd_and_hms(2026, 7, 30, 10, 0, 0).unwrap();
        for i in 0..10 {
            handle.append(record(&format!("SYM{i}"), ts));
        }

        // The writer flushes on its own once the tenth record arrives.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let read = sink
            .query(DataType::Equity, None, None, None, None)
            .await
            .unwrap();
        assert_eq!(read.len(), 10);
        sink.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_flushes_remaining_records() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let sink = DataSink::start(config.clone(), None);
        let handle = sink.handle();

        let ts = Utc.with_ymd_and_hms(2026, 7, 30, 10, 0, 0).unwrap();
        handle.append(record("AAPL", ts));
        sink.shutdown().await;

        let read = columnar::query(&config, DataType::Equity, None, None, None, None).unwrap();
        assert_eq!(read.len(), 1);
    }

    #[tokio::test]
    async fn mixed_days_split_into_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DataSink::start(test_config(dir.path()), None);
        let handle = sink.handle();

        let day1 = Utc.with_ymd_and_hms(2026, 7, 30, 23, 59, 0).unwrap();
        let day2 = Utc.with_ymd_and_hms(2026, 7, 31, 0, 1, 0).unwrap();
        handle.append(record("AAPL", day1));
        handle.append(record("AAPL", day2));
        sink.flush_now().await;

        assert!(dir.path().join("stocks/year=2026/month=07/day=30").exists());
        assert!(dir.path().join("stocks/year=2026/month=07/day=31").exists());
        sink.shutdown().await;
    }

    #[tokio::test]
    async fn audit_log_sees_flushed_records() {
        let dir = tempfile::tempdir().unwrap();
        let audit =
            Arc::new(AuditLog::open(&dir.path().join("audit.db"), "test-key").unwrap());
        let sink = DataSink::start(test_config(dir.path()), Some(audit.clone()));
        let handle = sink.handle();

        let ts = Utc.with_ymd_and_hms(2026, 7, 30, 10, 0, 0).unwrap();
        handle.append(record("AAPL", ts));
        sink.flush_now().await;

        assert_eq!(audit.count().unwrap(), 1);
        sink.shutdown().await;
    }
}
