//! Intermediate store: large per-unit payloads under TTL'd keys.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use super::{now_millis, open_sqlite, StoreError, StoreKey, StoreLock};

#[async_trait]
pub trait IntermediateStore: Send + Sync {
    /// Overwrites any previous payload under `key`.
    async fn put(&self, key: &StoreKey, payload: Vec<u8>, ttl: Duration) -> Result<(), StoreError>;
    /// Expired entries read as absent.
    async fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StoreError>;
    /// Returns whether a live entry was removed.
    async fn delete(&self, key: &StoreKey) -> Result<bool, StoreError>;
}

// =============================================================================
// SQLite
// =============================================================================

#[derive(Clone)]
pub struct SqliteIntermediateStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PruneStats {
    pub deleted: usize,
    pub remaining: usize,
}

impl SqliteIntermediateStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = open_sqlite(
            &path,
            "CREATE TABLE IF NOT EXISTS intermediate (\
               store_key TEXT PRIMARY KEY,\
               payload BLOB NOT NULL,\
               created_at INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL,\
               expires_at INTEGER NOT NULL,\
               write_count INTEGER NOT NULL DEFAULT 1\
             );\
             CREATE INDEX IF NOT EXISTS intermediate_expires ON intermediate(expires_at);",
        )?;
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("RECAP_STORE_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".recap_intermediate.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_exclusive(&self) -> Result<StoreLock, StoreError> {
        StoreLock::acquire(&self.path)
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError>,
    {
        let guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&guard)
    }

    async fn blocking<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.with_conn(f))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// How many times `key` has been written since it was created.
    pub async fn write_count(&self, key: &StoreKey) -> Result<Option<u64>, StoreError> {
        let key = key.as_str().to_string();
        self.blocking(move |conn| {
            let count: Option<i64> = conn
                .query_row(
                    "SELECT write_count FROM intermediate WHERE store_key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(count.map(|c| c.max(0) as u64))
        })
        .await
    }

    pub async fn prune_expired(&self) -> Result<PruneStats, StoreError> {
        self.blocking(|conn| {
            let deleted = conn.execute(
                "DELETE FROM intermediate WHERE expires_at <= ?1",
                params![now_millis()],
            )?;
            let remaining: i64 =
                conn.query_row("SELECT COUNT(*) FROM intermediate", [], |row| row.get(0))?;
            Ok(PruneStats {
                deleted,
                remaining: remaining.max(0) as usize,
            })
        })
        .await
    }
}

fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl IntermediateStore for SqliteIntermediateStore {
    async fn put(&self, key: &StoreKey, payload: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        let key = key.as_str().to_string();
        self.blocking(move |conn| {
            let now = now_millis();
            conn.execute(
                "INSERT INTO intermediate (store_key, payload, created_at, updated_at, expires_at)\
                 VALUES (?1, ?2, ?3, ?3, ?4)\
                 ON CONFLICT(store_key) DO UPDATE SET \
                    payload = excluded.payload,\
                    updated_at = excluded.updated_at,\
                    expires_at = excluded.expires_at,\
                    write_count = write_count + 1",
                params![key, payload, now, now.saturating_add(ttl_millis(ttl))],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StoreError> {
        let key = key.as_str().to_string();
        self.blocking(move |conn| {
            let payload = conn
                .query_row(
                    "SELECT payload FROM intermediate WHERE store_key = ?1 AND expires_at > ?2",
                    params![key, now_millis()],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()?;
            Ok(payload)
        })
        .await
    }

    async fn delete(&self, key: &StoreKey) -> Result<bool, StoreError> {
        let key = key.as_str().to_string();
        self.blocking(move |conn| {
            let removed = conn.execute(
                "DELETE FROM intermediate WHERE store_key = ?1 AND expires_at > ?2",
                params![key, now_millis()],
            )?;
            // Expired leftovers go too, they just don't count as a removal.
            conn.execute("DELETE FROM intermediate WHERE store_key = ?1", params![key])?;
            Ok(removed > 0)
        })
        .await
    }
}

// =============================================================================
// In-memory
// =============================================================================

/// Process-local store for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryIntermediateStore {
    entries: Mutex<HashMap<StoreKey, MemoryEntry>>,
}

#[derive(Debug)]
struct MemoryEntry {
    payload: Vec<u8>,
    expires_at: Option<Instant>,
    write_count: u64,
}

impl MemoryIntermediateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live keys, sorted.
    pub fn keys(&self) -> Vec<StoreKey> {
        let now = Instant::now();
        let mut keys: Vec<StoreKey> = match self.entries.lock() {
            Ok(guard) => guard
                .iter()
                .filter(|(_, e)| e.expires_at.map_or(true, |t| t > now))
                .map(|(k, _)| k.clone())
                .collect(),
            Err(_) => Vec::new(),
        };
        keys.sort();
        keys
    }

    pub fn write_count(&self, key: &StoreKey) -> Option<u64> {
        self.entries
            .lock()
            .ok()
            .and_then(|guard| guard.get(key).map(|e| e.write_count))
    }
}

#[async_trait]
impl IntermediateStore for MemoryIntermediateStore {
    async fn put(&self, key: &StoreKey, payload: Vec<u8>, ttl: Duration) -> Result<(), StoreError> {
        let mut guard = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        let expires_at = Instant::now().checked_add(ttl);
        let entry = guard.entry(key.clone()).or_insert(MemoryEntry {
            payload: Vec::new(),
            expires_at,
            write_count: 0,
        });
        entry.payload = payload;
        entry.expires_at = expires_at;
        entry.write_count += 1;
        Ok(())
    }

    async fn get(&self, key: &StoreKey) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        let now = Instant::now();
        Ok(guard
            .get(key)
            .filter(|e| e.expires_at.map_or(true, |t| t > now))
            .map(|e| e.payload.clone()))
    }

    async fn delete(&self, key: &StoreKey) -> Result<bool, StoreError> {
        let mut guard = self.entries.lock().map_err(|_| StoreError::Poisoned)?;
        let now = Instant::now();
        Ok(guard
            .remove(key)
            .is_some_and(|e| e.expires_at.map_or(true, |t| t > now)))
    }
}
