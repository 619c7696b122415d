//! Encrypted audit table.
//!
//! Optional append-only record of everything the sink persisted, encrypted
//! at rest with AES-256-GCM. The key is derived from `BRAIN_KEY`; the
//! process refuses to start without it, so this module can assume a key.

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{AeadCore, Aes256Gcm, Key, Nonce};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::schema::UnifiedRecord;

const AUDIT_SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT NOT NULL,
    data_type TEXT NOT NULL,
    symbol TEXT NOT NULL,
    observed_at INTEGER NOT NULL,
    nonce BLOB NOT NULL,
    ciphertext BLOB NOT NULL,
    recorded_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

CREATE INDEX IF NOT EXISTS idx_audit_source_time
    ON audit_log(source, observed_at);
"#;

pub struct AuditLog {
    conn: Mutex<Connection>,
    cipher: Aes256Gcm,
}

impl AuditLog {
    pub fn open(path: &Path, brain_key: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open audit db {}", path.display()))?;
        conn.execute_batch(AUDIT_SCHEMA)?;

        // 32-byte key from the configured secret.
        let digest = Sha256::digest(brain_key.as_bytes());
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&digest));

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    pub fn record(&self, record: &UnifiedRecord) -> Result<()> {
        let plaintext = serde_json::to_vec(record)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_slice())
            .map_err(|_| anyhow::anyhow!("audit encryption failed"))?;

        self.conn.lock().execute(
            "INSERT INTO audit_log (source, data_type, symbol, observed_at, nonce, ciphertext)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.source,
                record.data_type.as_str(),
                record.symbol,
                record.timestamp.timestamp_micros(),
                nonce.as_slice(),
                ciphertext,
            ],
        )?;
        Ok(())
    }

    pub fn record_batch(&self, records: &[UnifiedRecord]) -> Result<usize> {
        let mut written = 0;
        for record in records {
            self.record(record)?;
            written += 1;
        }
        Ok(written)
    }

    /// Decrypt rows for a source, most recent first.
    pub fn read_for_source(&self, source: &str, limit: usize) -> Result<Vec<UnifiedRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT nonce, ciphertext FROM audit_log
             WHERE source = ?1 ORDER BY observed_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![source, limit as i64], |row| {
            let nonce: Vec<u8> = row.get(0)?;
            let ciphertext: Vec<u8> = row.get(1)?;
            Ok((nonce, ciphertext))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (nonce, ciphertext) = row?;
            let plaintext = self
                .cipher
                .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
                .map_err(|_| anyhow::anyhow!("audit decryption failed (wrong BRAIN_KEY?)"))?;
            records.push(serde_json::from_slice(&plaintext)?);
        }
        Ok(records)
    }

    pub fn count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?;
        Ok(count)
    }
}
