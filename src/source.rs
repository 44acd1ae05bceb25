//! Session data store collaborator.
//!
//! The orchestrator only needs "give me the events and metadata of this
//! session inside this window". Production deployments plug in their own
//! store; the crate ships a JSON directory source for the CLI and an
//! in-memory source for embedding and tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::session::{SessionData, TimeWindow};

#[derive(Debug, thiserror::Error)]
pub enum UpstreamDataError {
    #[error("session {0} not found")]
    NotFound(String),
    #[error("session {session_id}: malformed data: {message}")]
    Malformed { session_id: String, message: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session store unavailable: {0}")]
    Unavailable(String),
}

impl UpstreamDataError {
    /// Whether a retry of the same fetch could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Io(_))
    }
}

#[async_trait]
pub trait SessionSource: Send + Sync {
    async fn fetch(
        &self,
        team_id: i64,
        session_id: &str,
        window: &TimeWindow,
    ) -> Result<SessionData, UpstreamDataError>;
}

/// Reads `<root>/<session_id>.json`, each file a serialized `SessionData`.
#[derive(Debug, Clone)]
pub struct JsonDirSessionSource {
    root: PathBuf,
}

impl JsonDirSessionSource {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, session_id: &str) -> Option<PathBuf> {
        // Session ids come from callers; refuse anything that could walk out of root.
        if session_id.is_empty()
            || session_id.contains(['/', '\\'])
            || session_id.starts_with('.')
        {
            return None;
        }
        Some(self.root.join(format!("{session_id}.json")))
    }
}

#[async_trait]
impl SessionSource for JsonDirSessionSource {
    async fn fetch(
        &self,
        _team_id: i64,
        session_id: &str,
        window: &TimeWindow,
    ) -> Result<SessionData, UpstreamDataError> {
        let path = self
            .path_for(session_id)
            .ok_or_else(|| UpstreamDataError::NotFound(session_id.to_string()))?;
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(UpstreamDataError::NotFound(session_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let mut data: SessionData =
            serde_json::from_str(&raw).map_err(|e| UpstreamDataError::Malformed {
                session_id: session_id.to_string(),
                message: e.to_string(),
            })?;
        data.events.retain(|e| window.contains(e.timestamp));
        Ok(data)
    }
}

/// Keeps sessions in a map keyed by `(team_id, session_id)`.
#[derive(Debug, Default)]
pub struct MemorySessionSource {
    sessions: RwLock<HashMap<(i64, String), SessionData>>,
}

impl MemorySessionSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, team_id: i64, session_id: impl Into<String>, data: SessionData) {
        if let Ok(mut guard) = self.sessions.write() {
            guard.insert((team_id, session_id.into()), data);
        }
    }
}

#[async_trait]
impl SessionSource for MemorySessionSource {
    async fn fetch(
        &self,
        team_id: i64,
        session_id: &str,
        window: &TimeWindow,
    ) -> Result<SessionData, UpstreamDataError> {
        let guard = self
            .sessions
            .read()
            .map_err(|_| UpstreamDataError::Unavailable("session map poisoned".into()))?;
        let mut data = guard
            .get(&(team_id, session_id.to_string()))
            .cloned()
            .ok_or_else(|| UpstreamDataError::NotFound(session_id.to_string()))?;
        data.events.retain(|e| window.contains(e.timestamp));
        Ok(data)
    }
}
