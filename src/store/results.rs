//! Durable storage for final pattern reports.
//!
//! The orchestrator's terminal value is the small id returned by `save`, not
//! the report itself. Saving twice for one execution keeps the first id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{now_millis, open_sqlite, StoreError};
use crate::enrichment::PatternReport;

/// Who and what a report belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportMeta {
    pub execution_id: String,
    pub team_id: i64,
    pub requester_id: i64,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredReport {
    pub result_id: String,
    #[serde(flatten)]
    pub meta: ReportMeta,
    pub created_at: DateTime<Utc>,
    pub report: PatternReport,
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    async fn save(&self, meta: ReportMeta, report: &PatternReport) -> Result<String, StoreError>;
    async fn load(&self, result_id: &str) -> Result<Option<StoredReport>, StoreError>;
}

fn new_result_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

// =============================================================================
// SQLite
// =============================================================================

#[derive(Clone)]
pub struct SqliteResultStore {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteResultStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = open_sqlite(
            &path,
            "CREATE TABLE IF NOT EXISTS pattern_reports (\
               result_id TEXT PRIMARY KEY,\
               execution_id TEXT NOT NULL UNIQUE,\
               team_id INTEGER NOT NULL,\
               requester_id INTEGER NOT NULL,\
               title TEXT,\
               report_json TEXT NOT NULL,\
               created_at INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL\
             );",
        )?;
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("RECAP_RESULTS_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".recap_results.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError>,
    {
        let guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&guard)
    }
}

#[async_trait]
impl ResultStore for SqliteResultStore {
    async fn save(&self, meta: ReportMeta, report: &PatternReport) -> Result<String, StoreError> {
        let report_json = serde_json::to_string(report)?;
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let now = now_millis();
                let existing: Option<String> = conn
                    .query_row(
                        "SELECT result_id FROM pattern_reports WHERE execution_id = ?1",
                        params![meta.execution_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                let result_id = existing.unwrap_or_else(new_result_id);
                conn.execute(
                    "INSERT INTO pattern_reports (\
                        result_id, execution_id, team_id, requester_id, title,\
                        report_json, created_at, updated_at\
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)\
                     ON CONFLICT(result_id) DO UPDATE SET \
                        title = excluded.title,\
                        report_json = excluded.report_json,\
                        updated_at = excluded.updated_at",
                    params![
                        result_id,
                        meta.execution_id,
                        meta.team_id,
                        meta.requester_id,
                        meta.title,
                        report_json,
                        now,
                    ],
                )?;
                Ok(result_id)
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    async fn load(&self, result_id: &str) -> Result<Option<StoredReport>, StoreError> {
        let result_id = result_id.to_string();
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            store.with_conn(|conn| {
                let row = conn
                    .query_row(
                        "SELECT execution_id, team_id, requester_id, title, report_json, created_at \
                         FROM pattern_reports WHERE result_id = ?1",
                        params![result_id],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, i64>(1)?,
                                row.get::<_, i64>(2)?,
                                row.get::<_, Option<String>>(3)?,
                                row.get::<_, String>(4)?,
                                row.get::<_, i64>(5)?,
                            ))
                        },
                    )
                    .optional()?;
                let Some((execution_id, team_id, requester_id, title, report_json, created_at)) =
                    row
                else {
                    return Ok(None);
                };
                Ok(Some(StoredReport {
                    result_id,
                    meta: ReportMeta {
                        execution_id,
                        team_id,
                        requester_id,
                        title,
                    },
                    created_at: Utc
                        .timestamp_millis_opt(created_at)
                        .single()
                        .unwrap_or_default(),
                    report: serde_json::from_str(&report_json)?,
                }))
            })
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

// =============================================================================
// In-memory
// =============================================================================

#[derive(Debug, Default)]
pub struct MemoryResultStore {
    reports: Mutex<HashMap<String, StoredReport>>,
}

impl MemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.reports.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultStore for MemoryResultStore {
    async fn save(&self, meta: ReportMeta, report: &PatternReport) -> Result<String, StoreError> {
        let mut guard = self.reports.lock().map_err(|_| StoreError::Poisoned)?;
        let existing = guard
            .values()
            .find(|r| r.meta.execution_id == meta.execution_id)
            .map(|r| (r.result_id.clone(), r.created_at));
        let (result_id, created_at) = existing.unwrap_or_else(|| (new_result_id(), Utc::now()));
        guard.insert(
            result_id.clone(),
            StoredReport {
                result_id: result_id.clone(),
                meta,
                created_at,
                report: report.clone(),
            },
        );
        Ok(result_id)
    }

    async fn load(&self, result_id: &str) -> Result<Option<StoredReport>, StoreError> {
        let guard = self.reports.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.get(result_id).cloned())
    }
}
