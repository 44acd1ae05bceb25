//! Workflow state machine, status log and progress accounting.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::FatalWorkflowError;
use crate::session::SessionSummaryEntry;
use crate::store::StoreKey;

// =============================================================================
// Phase
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Fetching,
    Summarizing,
    Chunking,
    ExtractingPatterns,
    CombiningChunks,
    AssigningEvents,
    Completed,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Fetching => "fetching",
            Phase::Summarizing => "summarizing",
            Phase::Chunking => "chunking",
            Phase::ExtractingPatterns => "extracting_patterns",
            Phase::CombiningChunks => "combining_chunks",
            Phase::AssigningEvents => "assigning_events",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }

    /// Transitions only move forward; phases may be skipped, and `Failed`
    /// is reachable from every non-terminal phase.
    pub fn can_advance_to(&self, next: Phase) -> bool {
        !self.is_terminal() && (next == Phase::Failed || next > *self)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: Phase,
    pub to: Phase,
}

// =============================================================================
// Counts and progress
// =============================================================================

/// Fan-in tally of one phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseCounts {
    pub attempted: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl PhaseCounts {
    /// `succeeded / (attempted - skipped)`; expected skips are not failures.
    pub fn success_ratio(&self) -> f64 {
        let eligible = self.attempted.saturating_sub(self.skipped);
        if eligible == 0 {
            return 0.0;
        }
        self.succeeded as f64 / eligible as f64
    }

    /// At least one success and a ratio at or above `min_ratio`.
    pub fn passes(&self, min_ratio: f64) -> bool {
        self.succeeded > 0 && self.success_ratio() + 1e-9 >= min_ratio
    }
}

impl fmt::Display for PhaseCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attempted={} succeeded={} skipped={} failed={}",
            self.attempted, self.succeeded, self.skipped, self.failed
        )
    }
}

/// Externally signalled or unit-reported progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressDelta {
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub skipped: u64,
    /// Appended to the status log when present.
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub planned: u64,
    pub completed: u64,
    pub failed: u64,
    pub skipped: u64,
}

/// Progress of the phase in flight. Sub-units share it through an `Arc` and
/// only ever add to it; the engine resets it between phases.
#[derive(Debug, Default)]
pub struct ProgressCounter {
    planned: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&self, planned: u64) {
        self.planned.store(planned, Ordering::SeqCst);
        self.completed.store(0, Ordering::SeqCst);
        self.failed.store(0, Ordering::SeqCst);
        self.skipped.store(0, Ordering::SeqCst);
    }

    pub fn apply(&self, delta: &ProgressDelta) {
        self.completed.fetch_add(delta.completed, Ordering::SeqCst);
        self.failed.fetch_add(delta.failed, Ordering::SeqCst);
        self.skipped.fetch_add(delta.skipped, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            planned: self.planned.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
        }
    }
}

// =============================================================================
// Output
// =============================================================================

/// Terminal value of a successful execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GroupSummaryOutput {
    /// Small groups: per-session summaries in request order, no pattern report.
    Individual { summaries: Vec<SessionSummaryEntry> },
    /// The report lives in the result store under `result_id`.
    Patterns {
        result_id: String,
        pattern_count: usize,
    },
}

impl GroupSummaryOutput {
    pub fn result_id(&self) -> Option<&str> {
        match self {
            GroupSummaryOutput::Individual { .. } => None,
            GroupSummaryOutput::Patterns { result_id, .. } => Some(result_id),
        }
    }
}

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEntry {
    pub at: DateTime<Utc>,
    pub phase: Phase,
    pub message: String,
    #[serde(default)]
    pub counts: Option<PhaseCounts>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub execution_id: String,
    pub phase: Phase,
    /// Append-only.
    pub status_log: Vec<StatusEntry>,
    /// Intermediate-store keys of artifacts produced so far.
    pub artifacts: Vec<StoreKey>,
    pub output: Option<GroupSummaryOutput>,
    pub error: Option<FatalWorkflowError>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(execution_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            execution_id: execution_id.into(),
            phase: Phase::Fetching,
            status_log: Vec::new(),
            artifacts: Vec::new(),
            output: None,
            error: None,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn log(&mut self, message: impl Into<String>, counts: Option<PhaseCounts>) {
        let now = Utc::now();
        self.status_log.push(StatusEntry {
            at: now,
            phase: self.phase,
            message: message.into(),
            counts,
        });
        self.updated_at = now;
    }

    pub fn advance(&mut self, next: Phase, message: impl Into<String>) -> Result<(), InvalidTransition> {
        if !self.phase.can_advance_to(next) {
            return Err(InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        self.phase = next;
        self.log(message, None);
        Ok(())
    }

    pub fn record_artifact(&mut self, key: StoreKey) {
        if !self.artifacts.contains(&key) {
            self.artifacts.push(key);
        }
    }

    pub fn complete(&mut self, output: GroupSummaryOutput) -> Result<(), InvalidTransition> {
        let message = match &output {
            GroupSummaryOutput::Individual { summaries } => {
                format!("completed with {} individual summaries", summaries.len())
            }
            GroupSummaryOutput::Patterns {
                result_id,
                pattern_count,
            } => format!("completed with {pattern_count} patterns (result {result_id})"),
        };
        self.advance(Phase::Completed, message)?;
        self.output = Some(output);
        Ok(())
    }

    pub fn fail(&mut self, error: FatalWorkflowError) -> Result<(), InvalidTransition> {
        self.advance(Phase::Failed, error.to_string())?;
        self.error = Some(error);
        Ok(())
    }

    pub fn projection(&self, progress: ProgressSnapshot) -> StatusProjection {
        StatusProjection {
            execution_id: self.execution_id.clone(),
            phase: self.phase,
            is_terminal: self.phase.is_terminal(),
            status_log: self.status_log.clone(),
            artifacts: self.artifacts.clone(),
            progress,
            result_id: self
                .output
                .as_ref()
                .and_then(|o| o.result_id())
                .map(str::to_string),
            error: self.error.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// Read-only view handed to status pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusProjection {
    pub execution_id: String,
    pub phase: Phase,
    pub is_terminal: bool,
    pub status_log: Vec<StatusEntry>,
    pub artifacts: Vec<StoreKey>,
    pub progress: ProgressSnapshot,
    pub result_id: Option<String>,
    pub error: Option<FatalWorkflowError>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_only_move_forward() {
        let mut state = WorkflowState::new("ex");
        state.advance(Phase::Summarizing, "fetched").unwrap();
        state.advance(Phase::AssigningEvents, "skip ahead").unwrap();
        assert!(state.advance(Phase::Chunking, "back").is_err());
        state.advance(Phase::Failed, "boom").unwrap();
        assert!(state.advance(Phase::Completed, "late").is_err());
        assert_eq!(state.status_log.len(), 3);
    }

    #[test]
    fn ratio_ignores_skips() {
        let counts = PhaseCounts {
            attempted: 10,
            succeeded: 4,
            skipped: 2,
            failed: 4,
        };
        assert_eq!(counts.success_ratio(), 0.5);
        assert!(counts.passes(0.5));
        assert!(!counts.passes(0.51));

        let all_skipped = PhaseCounts {
            attempted: 3,
            skipped: 3,
            ..Default::default()
        };
        assert!(!all_skipped.passes(0.0));
    }

    #[test]
    fn progress_counter_accumulates_and_resets() {
        let counter = ProgressCounter::new();
        counter.reset(3);
        counter.apply(&ProgressDelta {
            completed: 2,
            failed: 1,
            ..Default::default()
        });
        assert_eq!(counter.snapshot().completed, 2);
        counter.reset(5);
        assert_eq!(
            counter.snapshot(),
            ProgressSnapshot {
                planned: 5,
                ..Default::default()
            }
        );
    }
}
