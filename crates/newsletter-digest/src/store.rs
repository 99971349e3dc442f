//! Persistence of delivered digests.
//!
//! The store answers one question for the pipeline: which content has this
//! user already been sent for an overlapping window. Everything else here
//! exists for the CLI history view.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info};

use crate::models::{Digest, TimeWindow};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("failed to encode digest: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid timestamp in store: {0}")]
    Timestamp(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store lock poisoned")]
    Poisoned,
}

/// Header of a saved digest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredDigest {
    pub id: i64,
    pub user_id: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub theme_count: usize,
    pub item_count: usize,
}

pub trait DigestStore: Send + Sync {
    /// Content hashes delivered to `user_id` in any digest whose window
    /// overlaps `window`.
    fn find_content_hashes_in_overlapping_window(
        &self,
        user_id: &str,
        window: &TimeWindow,
    ) -> Result<HashSet<String>, StoreError>;

    /// Persists a digest and returns its id.
    fn save_digest(&self, digest: &Digest) -> Result<i64, StoreError>;

    /// Saved digests of `user_id`, newest first.
    fn recent_digests(&self, user_id: &str, limit: usize) -> Result<Vec<StoredDigest>, StoreError>;
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS digests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL,
    window_start TEXT NOT NULL,
    window_end TEXT NOT NULL,
    generated_at TEXT NOT NULL,
    theme_count INTEGER NOT NULL,
    item_count INTEGER NOT NULL,
    payload TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_digests_user_window
    ON digests (user_id, window_start, window_end);
CREATE TABLE IF NOT EXISTS digest_items (
    digest_id INTEGER NOT NULL REFERENCES digests(id) ON DELETE CASCADE,
    content_hash TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_digest_items_digest ON digest_items (digest_id);
";

/// Fixed-width UTC timestamps, so SQLite string comparison is chronological.
fn encode_timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| StoreError::Timestamp(format!("{}: {}", value, e)))
}

pub struct SqliteDigestStore {
    conn: Mutex<Connection>,
}

impl SqliteDigestStore {
    /// Opens (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        debug!(path = %path.display(), "Opened digest store");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl DigestStore for SqliteDigestStore {
    fn find_content_hashes_in_overlapping_window(
        &self,
        user_id: &str,
        window: &TimeWindow,
    ) -> Result<HashSet<String>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT di.content_hash
             FROM digest_items di
             INNER JOIN digests d ON d.id = di.digest_id
             WHERE d.user_id = ?1 AND d.window_start < ?3 AND ?2 < d.window_end",
        )?;

        let rows = stmt.query_map(
            params![
                user_id,
                encode_timestamp(&window.start),
                encode_timestamp(&window.end)
            ],
            |row| row.get::<_, String>(0),
        )?;

        let mut hashes = HashSet::new();
        for row in rows {
            hashes.insert(row?);
        }
        Ok(hashes)
    }

    fn save_digest(&self, digest: &Digest) -> Result<i64, StoreError> {
        let payload = serde_json::to_string(digest)?;
        let mut conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO digests
                (user_id, window_start, window_end, generated_at, theme_count, item_count, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                digest.user_id,
                encode_timestamp(&digest.window_start),
                encode_timestamp(&digest.window_end),
                encode_timestamp(&digest.generated_at),
                digest.theme_count() as i64,
                digest.item_count() as i64,
                payload,
            ],
        )?;
        let id = tx.last_insert_rowid();

        {
            let mut insert =
                tx.prepare("INSERT INTO digest_items (digest_id, content_hash) VALUES (?1, ?2)")?;
            for hash in digest.content_hashes() {
                insert.execute(params![id, hash])?;
            }
        }
        tx.commit()?;

        info!(digest_id = id, user_id = %digest.user_id, items = digest.item_count(), "Saved digest");
        Ok(id)
    }

    fn recent_digests(&self, user_id: &str, limit: usize) -> Result<Vec<StoredDigest>, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, window_start, window_end, generated_at, theme_count, item_count
             FROM digests
             WHERE user_id = ?1
             ORDER BY generated_at DESC, id DESC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(params![user_id, limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, i64>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })?;

        let mut digests = Vec::new();
        for row in rows {
            let (id, user_id, start, end, generated_at, theme_count, item_count) = row?;
            digests.push(StoredDigest {
                id,
                user_id,
                window_start: decode_timestamp(&start)?,
                window_end: decode_timestamp(&end)?,
                generated_at: decode_timestamp(&generated_at)?,
                theme_count: theme_count.max(0) as usize,
                item_count: item_count.max(0) as usize,
            });
        }
        Ok(digests)
    }
}

struct MemoryRecord {
    header: StoredDigest,
    hashes: Vec<String>,
}

/// Store kept in process memory; used for dry runs and tests.
#[derive(Default)]
pub struct MemoryDigestStore {
    records: Mutex<Vec<MemoryRecord>>,
}

impl MemoryDigestStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `hashes` were delivered to `user_id` for `window`.
    pub fn record_delivered(
        &self,
        user_id: &str,
        window: TimeWindow,
        hashes: &[&str],
    ) -> Result<i64, StoreError> {
        let mut records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        let id = records.len() as i64 + 1;
        records.push(MemoryRecord {
            header: StoredDigest {
                id,
                user_id: user_id.to_string(),
                window_start: window.start,
                window_end: window.end,
                generated_at: window.end,
                theme_count: 0,
                item_count: hashes.len(),
            },
            hashes: hashes.iter().map(|h| h.to_string()).collect(),
        });
        Ok(id)
    }
}

impl DigestStore for MemoryDigestStore {
    fn find_content_hashes_in_overlapping_window(
        &self,
        user_id: &str,
        window: &TimeWindow,
    ) -> Result<HashSet<String>, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(records
            .iter()
            .filter(|r| r.header.user_id == user_id)
            .filter(|r| TimeWindow::new(r.header.window_start, r.header.window_end).overlaps(window))
            .flat_map(|r| r.hashes.iter().cloned())
            .collect())
    }

    fn save_digest(&self, digest: &Digest) -> Result<i64, StoreError> {
        let mut records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        let id = records.len() as i64 + 1;
        records.push(MemoryRecord {
            header: StoredDigest {
                id,
                user_id: digest.user_id.clone(),
                window_start: digest.window_start,
                window_end: digest.window_end,
                generated_at: digest.generated_at,
                theme_count: digest.theme_count(),
                item_count: digest.item_count(),
            },
            hashes: digest.content_hashes(),
        });
        Ok(id)
    }

    fn recent_digests(&self, user_id: &str, limit: usize) -> Result<Vec<StoredDigest>, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::Poisoned)?;
        let mut headers: Vec<StoredDigest> = records
            .iter()
            .filter(|r| r.header.user_id == user_id)
            .map(|r| r.header.clone())
            .collect();
        headers.sort_by(|a, b| b.generated_at.cmp(&a.generated_at).then(b.id.cmp(&a.id)));
        headers.truncate(limit);
        Ok(headers)
    }
}
