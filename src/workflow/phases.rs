//! Phase sub-units and the bounded fan-out that runs them.
//!
//! Every unit resolves to a [`UnitOutcome`]; errors are values here, so one
//! failing session never cancels its siblings. The engine tallies outcomes
//! into [`PhaseCounts`] and gates on them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::config::WorkflowConfig;
use super::errors::UnitError;
use super::state::{PhaseCounts, ProgressCounter, ProgressDelta};
use crate::completion::{CallContext, CompletionService};
use crate::schema::{PatternAssignment, RawPattern};
use crate::session::{
    event_id_for, GroupSummaryRequest, PreparedEvent, PreparedSession, SessionData,
    SingleSessionSummary,
};
use crate::source::SessionSource;
use crate::store::{get_json, put_json, IntermediateStore, StoreKey};

pub const EXTRACT_PHASE: &str = "extracting_patterns";
pub const COMBINE_PHASE: &str = "combining_chunks";
pub const ASSIGN_PHASE: &str = "assigning_events";
pub const CHUNK_PLAN_PHASE: &str = "chunking";

/// Why a session was left out without counting as a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    TooShort { duration_ms: i64, min_ms: i64 },
    /// Nothing left once ignored events are filtered out.
    NoEvents,
}

#[derive(Debug)]
pub enum UnitOutcome<T> {
    Succeeded(T),
    Skipped(SkipReason),
    Failed(UnitError),
}

impl<T> UnitOutcome<T> {
    pub fn succeeded(&self) -> Option<&T> {
        match self {
            UnitOutcome::Succeeded(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_succeeded(self) -> Option<T> {
        match self {
            UnitOutcome::Succeeded(value) => Some(value),
            _ => None,
        }
    }

    fn progress_delta(&self) -> ProgressDelta {
        let mut delta = ProgressDelta::default();
        match self {
            UnitOutcome::Succeeded(_) => delta.completed = 1,
            UnitOutcome::Skipped(_) => delta.skipped = 1,
            UnitOutcome::Failed(_) => delta.failed = 1,
        }
        delta
    }
}

impl<T> From<Result<T, UnitError>> for UnitOutcome<T> {
    fn from(result: Result<T, UnitError>) -> Self {
        match result {
            Ok(value) => UnitOutcome::Succeeded(value),
            Err(err) => UnitOutcome::Failed(err),
        }
    }
}

pub fn tally<T>(outcomes: &[UnitOutcome<T>]) -> PhaseCounts {
    let mut counts = PhaseCounts {
        attempted: outcomes.len(),
        ..Default::default()
    };
    for outcome in outcomes {
        match outcome {
            UnitOutcome::Succeeded(_) => counts.succeeded += 1,
            UnitOutcome::Skipped(_) => counts.skipped += 1,
            UnitOutcome::Failed(_) => counts.failed += 1,
        }
    }
    counts
}

// =============================================================================
// Fan-out
// =============================================================================

/// Limits shared by every unit of one phase.
#[derive(Debug, Clone, Copy)]
pub struct FanOut {
    pub concurrency: usize,
    pub unit_timeout: Duration,
}

impl FanOut {
    pub fn from_config(config: &WorkflowConfig) -> Self {
        Self {
            concurrency: config.max_concurrency.max(1),
            unit_timeout: config.unit_timeout(),
        }
    }
}

/// Runs `units` with at most `limits.concurrency` in flight and returns their
/// outcomes in input order. A unit that outlives its timeout, or is still
/// running when `cancel` fires, resolves to a failure.
pub async fn run_units<T, Fut, I>(
    units: I,
    limits: FanOut,
    cancel: &CancellationToken,
    progress: &ProgressCounter,
) -> Vec<UnitOutcome<T>>
where
    I: IntoIterator<Item = Fut>,
    Fut: Future<Output = UnitOutcome<T>>,
{
    let timeout = limits.unit_timeout;
    // Collected first so the stream holds plain futures rather than a
    // borrowing closure; spawned executions need that to be `Send`.
    let guarded: Vec<_> = units
        .into_iter()
        .enumerate()
        .map(|(index, unit)| async move {
            let outcome = if cancel.is_cancelled() {
                UnitOutcome::Failed(UnitError::Cancelled)
            } else {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => UnitOutcome::Failed(UnitError::Cancelled),
                    res = tokio::time::timeout(timeout, unit) => match res {
                        Ok(outcome) => outcome,
                        Err(_) => UnitOutcome::Failed(UnitError::Timeout(timeout)),
                    },
                }
            };
            progress.apply(&outcome.progress_delta());
            (index, outcome)
        })
        .collect();
    let mut results: Vec<(usize, UnitOutcome<T>)> = stream::iter(guarded)
        .buffer_unordered(limits.concurrency.max(1))
        .collect()
        .await;

    results.sort_by_key(|(index, _)| *index);
    results.into_iter().map(|(_, outcome)| outcome).collect()
}

// =============================================================================
// Session preparation
// =============================================================================

/// Turns a fetched session into the prompt-ready payload: ignored events are
/// dropped, the rest sorted by time and given short ids.
pub fn prepare_session(
    session_id: &str,
    data: SessionData,
    config: &WorkflowConfig,
) -> Result<PreparedSession, SkipReason> {
    let SessionData { metadata, events } = data;
    if metadata.duration_ms < config.min_session_duration_ms {
        return Err(SkipReason::TooShort {
            duration_ms: metadata.duration_ms,
            min_ms: config.min_session_duration_ms,
        });
    }

    let mut events: Vec<_> = events
        .into_iter()
        .filter(|e| !config.ignored_events.iter().any(|name| name == &e.event))
        .collect();
    if events.is_empty() {
        return Err(SkipReason::NoEvents);
    }
    events.sort_by_key(|e| e.timestamp);

    let start = metadata.start_time;
    let events = events
        .into_iter()
        .map(|e| PreparedEvent {
            event_id: event_id_for(&e.uuid),
            milliseconds_since_start: (e.timestamp - start).num_milliseconds().max(0),
            event_uuid: e.uuid,
            event: e.event,
            timestamp: e.timestamp,
            current_url: e.current_url,
        })
        .collect();

    Ok(PreparedSession {
        session_id: session_id.to_string(),
        metadata,
        events,
    })
}

// =============================================================================
// Units
// =============================================================================

/// Everything a unit of one execution needs. Cheap to share by reference
/// across the units of a phase.
pub struct UnitEnv {
    pub execution_id: String,
    pub request: Arc<GroupSummaryRequest>,
    pub context_hash: String,
    pub call: CallContext,
    pub config: Arc<WorkflowConfig>,
    pub sessions: Arc<dyn SessionSource>,
    pub intermediate: Arc<dyn IntermediateStore>,
    pub completion: Arc<CompletionService>,
}

impl UnitEnv {
    pub fn new(
        execution_id: impl Into<String>,
        request: Arc<GroupSummaryRequest>,
        config: Arc<WorkflowConfig>,
        sessions: Arc<dyn SessionSource>,
        intermediate: Arc<dyn IntermediateStore>,
        completion: Arc<CompletionService>,
    ) -> Self {
        let execution_id = execution_id.into();
        Self {
            context_hash: request.context_hash(),
            call: CallContext::for_request(&request, execution_id.clone()),
            execution_id,
            request,
            config,
            sessions,
            intermediate,
            completion,
        }
    }

    pub fn session_data_key(&self, session_id: &str) -> StoreKey {
        StoreKey::session_data(self.request.team_id, session_id, &self.context_hash)
    }

    pub fn session_summary_key(&self, session_id: &str) -> StoreKey {
        StoreKey::session_summary(self.request.team_id, session_id, &self.context_hash)
    }

    /// Extraction artifact of one chunk. The key names the chunk's sessions,
    /// so a replanned chunk never picks up another chunk's patterns.
    pub fn extract_key(&self, chunk: &[SingleSessionSummary]) -> StoreKey {
        let unit = format!("chunk-{}", chunk_fingerprint(chunk, None));
        StoreKey::phase(&self.execution_id, EXTRACT_PHASE, &unit)
    }

    pub fn combine_key(&self, lists: &[Vec<RawPattern>]) -> StoreKey {
        let unit = format!("all-{}", fingerprint(lists.iter().map(json_bytes)));
        StoreKey::phase(&self.execution_id, COMBINE_PHASE, &unit)
    }

    /// Assignment artifact of one chunk against one pattern list.
    pub fn assign_key(&self, patterns: &[RawPattern], chunk: &[SingleSessionSummary]) -> StoreKey {
        let unit = format!("chunk-{}", chunk_fingerprint(chunk, Some(patterns)));
        StoreKey::phase(&self.execution_id, ASSIGN_PHASE, &unit)
    }

    pub fn chunk_plan_key(&self) -> StoreKey {
        StoreKey::phase(&self.execution_id, CHUNK_PLAN_PHASE, "plan")
    }

    /// Fetches and prepares one session, always overwriting its key. The
    /// payload depends only on the upstream data, so a retry writes the same
    /// bytes.
    pub async fn fetch_session(&self, session_id: &str) -> UnitOutcome<StoreKey> {
        let data = match self
            .sessions
            .fetch(self.request.team_id, session_id, &self.request.time_window)
            .await
        {
            Ok(data) => data,
            Err(err) => return UnitOutcome::Failed(err.into()),
        };
        let prepared = match prepare_session(session_id, data, &self.config) {
            Ok(prepared) => prepared,
            Err(reason) => {
                debug!(session_id, ?reason, "session skipped");
                return UnitOutcome::Skipped(reason);
            }
        };

        let key = self.session_data_key(session_id);
        match put_json(
            self.intermediate.as_ref(),
            &key,
            &prepared,
            self.config.intermediate_ttl(),
        )
        .await
        {
            Ok(()) => UnitOutcome::Succeeded(key),
            Err(err) => UnitOutcome::Failed(err.into()),
        }
    }

    /// Summarizes one fetched session, reusing a cached summary for the same
    /// team, session and context.
    pub async fn summarize_session(&self, session_id: &str) -> UnitOutcome<SingleSessionSummary> {
        self.summarize_inner(session_id).await.into()
    }

    async fn summarize_inner(&self, session_id: &str) -> Result<SingleSessionSummary, UnitError> {
        let summary_key = self.session_summary_key(session_id);
        if let Some(cached) =
            get_json::<SingleSessionSummary>(self.intermediate.as_ref(), &summary_key).await?
        {
            debug!(session_id, "summary cache hit");
            return Ok(cached);
        }

        let data_key = self.session_data_key(session_id);
        let prepared: PreparedSession = get_json(self.intermediate.as_ref(), &data_key)
            .await?
            .ok_or(UnitError::MissingArtifact(data_key))?;

        let summary = self
            .completion
            .summarize_session(&self.call, &prepared)
            .await?;
        put_json(
            self.intermediate.as_ref(),
            &summary_key,
            &summary,
            self.config.intermediate_ttl(),
        )
        .await?;
        Ok(summary)
    }

    pub async fn extract_chunk(
        &self,
        index: usize,
        chunk: &[SingleSessionSummary],
    ) -> UnitOutcome<Vec<RawPattern>> {
        let key = self.extract_key(chunk);
        debug!(chunk = index, key = %key, sessions = chunk.len(), "extracting patterns");
        self.cached_phase_unit(&key, || self.completion.extract_patterns(&self.call, chunk))
            .await
            .into()
    }

    pub async fn combine(&self, lists: &[Vec<RawPattern>]) -> UnitOutcome<Vec<RawPattern>> {
        let key = self.combine_key(lists);
        self.cached_phase_unit(&key, || self.completion.combine_patterns(&self.call, lists))
            .await
            .into()
    }

    pub async fn assign_chunk(
        &self,
        index: usize,
        patterns: &[RawPattern],
        chunk: &[SingleSessionSummary],
    ) -> UnitOutcome<Vec<PatternAssignment>> {
        let key = self.assign_key(patterns, chunk);
        debug!(chunk = index, key = %key, patterns = patterns.len(), "assigning events");
        self.cached_phase_unit(&key, || {
            self.completion.assign_events(&self.call, patterns, chunk)
        })
        .await
        .into()
    }

    /// Returns the artifact under `key` if an earlier run of this execution
    /// stored one, otherwise computes and stores it.
    async fn cached_phase_unit<T, F, Fut, E>(&self, key: &StoreKey, compute: F) -> Result<T, UnitError>
    where
        T: Serialize + serde::de::DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        UnitError: From<E>,
    {
        if let Some(stored) = get_json::<T>(self.intermediate.as_ref(), key).await? {
            debug!(key = %key, "reusing stored artifact");
            return Ok(stored);
        }
        let value = compute().await?;
        put_json(
            self.intermediate.as_ref(),
            key,
            &value,
            self.config.intermediate_ttl(),
        )
        .await?;
        Ok(value)
    }
}

fn json_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

fn fingerprint<I>(parts: I) -> String
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part.as_ref());
        hasher.update(b"\n");
    }
    hasher.finalize().to_hex()[..16].to_string()
}

fn chunk_fingerprint(chunk: &[SingleSessionSummary], patterns: Option<&[RawPattern]>) -> String {
    let sessions = chunk.iter().map(|s| s.session_id.as_bytes().to_vec());
    match patterns {
        Some(patterns) => fingerprint(sessions.chain(std::iter::once(json_bytes(&patterns)))),
        None => fingerprint(sessions),
    }
}
