use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::state::{Phase, PhaseCounts};
use crate::completion::CompletionError;
use crate::enrichment::QualityGateError;
use crate::source::UpstreamDataError;
use crate::store::{StoreError, StoreKey};

/// Why an execution ended in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A phase's success ratio fell below its minimum.
    BelowThreshold,
    QualityGate,
    /// Extraction succeeded but produced no patterns.
    NoPatterns,
    Cancelled,
    /// Store or runtime failure outside any sub-unit.
    Infrastructure,
    UnknownExecution,
}

/// The single structured error a caller sees for a failed execution. Raw
/// provider errors never reach it; only counts and a reason do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{phase} failed ({kind:?}): {reason} [{counts}]")]
pub struct FatalWorkflowError {
    pub phase: Phase,
    pub kind: FailureKind,
    pub counts: PhaseCounts,
    pub reason: String,
}

impl FatalWorkflowError {
    pub fn new(phase: Phase, kind: FailureKind, counts: PhaseCounts, reason: impl Into<String>) -> Self {
        Self {
            phase,
            kind,
            counts,
            reason: reason.into(),
        }
    }

    pub fn below_threshold(phase: Phase, counts: PhaseCounts, min_ratio: f64) -> Self {
        let reason = if counts.attempted > 0 && counts.attempted == counts.skipped {
            "every unit was skipped".to_string()
        } else {
            format!(
                "success ratio {:.2} below minimum {:.2}",
                counts.success_ratio(),
                min_ratio
            )
        };
        Self::new(phase, FailureKind::BelowThreshold, counts, reason)
    }

    pub fn quality_gate(err: &QualityGateError) -> Self {
        Self::new(
            Phase::AssigningEvents,
            FailureKind::QualityGate,
            PhaseCounts {
                attempted: err.input,
                succeeded: err.successful,
                skipped: 0,
                failed: err.failed,
            },
            err.to_string(),
        )
    }

    pub fn cancelled(phase: Phase, counts: PhaseCounts) -> Self {
        Self::new(phase, FailureKind::Cancelled, counts, "execution cancelled")
    }

    pub fn infrastructure(phase: Phase, reason: impl Into<String>) -> Self {
        Self::new(phase, FailureKind::Infrastructure, PhaseCounts::default(), reason)
    }

    pub fn unknown_execution(execution_id: &str) -> Self {
        Self::new(
            Phase::Failed,
            FailureKind::UnknownExecution,
            PhaseCounts::default(),
            format!("no execution {execution_id}"),
        )
    }
}

/// Failure of one sub-unit. Captured as a value at fan-in, never propagated.
#[derive(Debug, thiserror::Error)]
pub enum UnitError {
    #[error("upstream: {0}")]
    Upstream(#[from] UpstreamDataError),
    #[error("completion: {0}")]
    Completion(#[from] CompletionError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
    #[error("missing artifact {0}")]
    MissingArtifact(StoreKey),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl UnitError {
    /// Transient faults: a later retry of the unit may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            UnitError::Upstream(e) => e.is_transient(),
            UnitError::Completion(e) => e.is_transient(),
            UnitError::Store(_) | UnitError::Timeout(_) => true,
            UnitError::MissingArtifact(_) | UnitError::Cancelled => false,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            UnitError::Upstream(UpstreamDataError::NotFound(_)) => "not_found",
            UnitError::Upstream(_) => "upstream",
            UnitError::Completion(CompletionError::Provider(_)) => "provider",
            UnitError::Completion(CompletionError::Schema(_)) => "schema",
            UnitError::Store(_) => "store",
            UnitError::MissingArtifact(_) => "missing_artifact",
            UnitError::Timeout(_) => "timeout",
            UnitError::Cancelled => "cancelled",
        }
    }
}

/// Errors of the engine API itself, as opposed to an execution's outcome.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unknown execution {0}")]
    UnknownExecution(String),
    #[error("execution {0} is still running")]
    StillRunning(String),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
