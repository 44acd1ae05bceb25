//! Persistence collaborators: the TTL'd intermediate store for per-unit
//! artifacts, the durable result store and the execution journal.

pub mod intermediate;
pub mod journal;
pub mod results;

use std::fmt;
use std::path::Path;
use std::time::Duration;

use fs2::FileExt;
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub use intermediate::{IntermediateStore, MemoryIntermediateStore, SqliteIntermediateStore};
pub use journal::{ExecutionJournal, JournalEntry, JournalPruneStats};
pub use results::{MemoryResultStore, ReportMeta, ResultStore, SqliteResultStore, StoredReport};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Deterministic intermediate-store key. Each key is written by exactly one
/// sub-unit, so a retry overwrites its own value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StoreKey(String);

impl StoreKey {
    pub fn session_data(team_id: i64, session_id: &str, context_hash: &str) -> Self {
        Self(format!("session-data:{team_id}:{session_id}:{context_hash}"))
    }

    pub fn session_summary(team_id: i64, session_id: &str, context_hash: &str) -> Self {
        Self(format!("session-summary:{team_id}:{session_id}:{context_hash}"))
    }

    pub fn phase(execution_id: &str, phase: &str, unit_id: &str) -> Self {
        Self(format!("phase:{execution_id}:{phase}:{unit_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this key belongs to one execution rather than to the shared
    /// per-session cache.
    pub fn is_execution_scoped(&self) -> bool {
        self.0.starts_with("phase:")
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub async fn put_json<T: Serialize + ?Sized>(
    store: &dyn IntermediateStore,
    key: &StoreKey,
    value: &T,
    ttl: Duration,
) -> Result<(), StoreError> {
    let payload = serde_json::to_vec(value)?;
    store.put(key, payload, ttl).await
}

pub async fn get_json<T: DeserializeOwned>(
    store: &dyn IntermediateStore,
    key: &StoreKey,
) -> Result<Option<T>, StoreError> {
    match store.get(key).await? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Exclusive advisory lock beside a SQLite file, held for maintenance.
#[derive(Debug)]
pub struct StoreLock {
    _file: std::fs::File,
}

impl StoreLock {
    pub fn acquire(db_path: &Path) -> Result<Self, StoreError> {
        let mut lock_path = db_path.to_path_buf();
        lock_path.set_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

fn open_sqlite(path: &Path, schema: &str) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;\
         PRAGMA synchronous=NORMAL;\
         PRAGMA busy_timeout=5000;",
    )?;
    conn.execute_batch(schema)?;
    Ok(conn)
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
