//! Group summary orchestration: configuration, the execution state machine,
//! phase sub-units and the engine that drives them.

pub mod config;
pub mod engine;
pub mod errors;
pub mod phases;
pub mod state;

pub use config::{ConfigError, WorkflowConfig};
pub use engine::{ExecutionHandle, WorkflowDeps, WorkflowEngine};
pub use errors::{EngineError, FailureKind, FatalWorkflowError, UnitError};
pub use phases::{prepare_session, run_units, FanOut, SkipReason, UnitEnv, UnitOutcome};
pub use state::{
    GroupSummaryOutput, InvalidTransition, Phase, PhaseCounts, ProgressCounter, ProgressDelta,
    ProgressSnapshot, StatusEntry, StatusProjection, WorkflowState,
};
