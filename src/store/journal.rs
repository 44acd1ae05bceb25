//! Execution journal: one SQLite row per execution holding the request and
//! the latest workflow state, so status stays queryable after the engine
//! forgets an execution or the process restarts.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::{now_millis, open_sqlite, StoreError};
use crate::session::GroupSummaryRequest;
use crate::workflow::WorkflowState;

#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub execution_id: String,
    pub request: GroupSummaryRequest,
    pub state: WorkflowState,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JournalPruneStats {
    pub deleted: usize,
    pub remaining: usize,
}

#[derive(Clone)]
pub struct ExecutionJournal {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl ExecutionJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let conn = open_sqlite(
            &path,
            "CREATE TABLE IF NOT EXISTS executions (\
               execution_id TEXT PRIMARY KEY,\
               team_id INTEGER NOT NULL,\
               phase TEXT NOT NULL,\
               terminal INTEGER NOT NULL,\
               request_json TEXT NOT NULL,\
               state_json TEXT NOT NULL,\
               created_at INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL\
             );\
             CREATE INDEX IF NOT EXISTS executions_updated ON executions(updated_at);",
        )?;
        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("RECAP_JOURNAL_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".recap_journal.sqlite")
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

    async fn blocking<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let journal = self.clone();
        tokio::task::spawn_blocking(move || journal.with_conn(f))
            .await
            .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Upserts the execution's row with its current state.
    pub async fn record(
        &self,
        request: &GroupSummaryRequest,
        state: &WorkflowState,
    ) -> Result<(), StoreError> {
        let request_json = serde_json::to_string(request)?;
        let state_json = serde_json::to_string(state)?;
        let execution_id = state.execution_id.clone();
        let team_id = request.team_id;
        let phase = state.phase.as_str();
        let terminal = state.phase.is_terminal();
        self.blocking(move |conn| {
            let now = now_millis();
            conn.execute(
                "INSERT INTO executions (\
                    execution_id, team_id, phase, terminal, request_json, state_json,\
                    created_at, updated_at\
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)\
                 ON CONFLICT(execution_id) DO UPDATE SET \
                    phase = excluded.phase,\
                    terminal = excluded.terminal,\
                    request_json = excluded.request_json,\
                    state_json = excluded.state_json,\
                    updated_at = excluded.updated_at",
                params![
                    execution_id,
                    team_id,
                    phase,
                    terminal as i64,
                    request_json,
                    state_json,
                    now
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn load(&self, execution_id: &str) -> Result<Option<JournalEntry>, StoreError> {
        let execution_id = execution_id.to_string();
        self.blocking(move |conn| {
            let row = conn
                .query_row(
                    "SELECT request_json, state_json, updated_at FROM executions \
                     WHERE execution_id = ?1",
                    params![execution_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                        ))
                    },
                )
                .optional()?;
            let Some((request_json, state_json, updated_at)) = row else {
                return Ok(None);
            };
            Ok(Some(JournalEntry {
                execution_id,
                request: serde_json::from_str(&request_json)?,
                state: serde_json::from_str(&state_json)?,
                updated_at: Utc
                    .timestamp_millis_opt(updated_at)
                    .single()
                    .unwrap_or_default(),
            }))
        })
        .await
    }

    /// Deletes terminal executions untouched for `max_age_days`. Running
    /// executions are never pruned.
    pub async fn prune(&self, max_age_days: u64) -> Result<JournalPruneStats, StoreError> {
        self.blocking(move |conn| {
            let age_ms = (max_age_days as i64).saturating_mul(86_400_000);
            let cutoff = now_millis().saturating_sub(age_ms);
            let deleted = conn.execute(
                "DELETE FROM executions WHERE terminal = 1 AND updated_at <= ?1",
                params![cutoff],
            )?;
            let remaining: i64 =
                conn.query_row("SELECT COUNT(*) FROM executions", [], |row| row.get(0))?;
            Ok(JournalPruneStats {
                deleted,
                remaining: remaining.max(0) as usize,
            })
        })
        .await
    }
}
