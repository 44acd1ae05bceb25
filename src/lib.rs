#![forbid(unsafe_code)]

//! # recap-harness
//!
//! Summarizes a group of recorded user sessions with an LLM and turns the
//! summaries into ranked, evidence-backed behavioral patterns.
//!
//! An execution fetches each session, summarizes it into segments and key
//! actions, packs the summaries into token-bounded chunks, extracts patterns
//! per chunk, merges them across chunks and asks the model which key actions
//! instantiate which pattern. The enrichment step then attaches segment
//! context and statistics to every pattern and enforces a quality gate
//! before the report is persisted.
//!
//! Each phase fans out over independent sub-units with a concurrency cap.
//! Unit failures are values; a phase fails only when its success ratio falls
//! below the configured minimum.

pub mod chunking;
pub mod completion;
pub mod enrichment;
pub mod gateway;
pub mod prompts;
pub mod schema;
pub mod session;
pub mod source;
pub mod store;
pub mod workflow;

pub use completion::{CallContext, CompletionError, CompletionService};
pub use enrichment::{EnrichedPattern, PatternReport, PatternStats, QualityGateError};
pub use gateway::{Attribution, ChatGateway, ProviderGateway, UsageSink};
pub use schema::{PatternAssignment, RawPattern, SchemaValidationError, Severity};
pub use session::{GroupSummaryRequest, SingleSessionSummary, TimeWindow};
pub use source::{JsonDirSessionSource, MemorySessionSource, SessionSource, UpstreamDataError};
pub use store::{IntermediateStore, ResultStore, StoreError, StoreKey};
pub use workflow::{
    ExecutionHandle, FatalWorkflowError, GroupSummaryOutput, Phase, StatusProjection,
    WorkflowConfig, WorkflowDeps, WorkflowEngine,
};
