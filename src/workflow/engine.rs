//! The orchestrator: one spawned task per execution, driving the phases and
//! publishing state for `query`/`await_result`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::config::WorkflowConfig;
use super::errors::{EngineError, FailureKind, FatalWorkflowError};
use super::phases::{run_units, tally, FanOut, UnitEnv, UnitOutcome};
use super::state::{
    GroupSummaryOutput, Phase, PhaseCounts, ProgressCounter, ProgressDelta, StatusProjection,
    WorkflowState,
};
use crate::chunking::chunk_summaries;
use crate::completion::CompletionService;
use crate::enrichment::{enrich_patterns, merge_assignments, EnrichmentInput};
use crate::gateway::ChatGateway;
use crate::schema::RawPattern;
use crate::session::{GroupSummaryRequest, SessionSummaryEntry, SingleSessionSummary};
use crate::source::SessionSource;
use crate::store::results::ReportMeta;
use crate::store::{get_json, put_json, ExecutionJournal, IntermediateStore, ResultStore, StoreKey};

/// Collaborators and tunables shared by every execution of an engine.
pub struct WorkflowDeps {
    pub gateway: Arc<dyn ChatGateway>,
    pub sessions: Arc<dyn SessionSource>,
    pub intermediate: Arc<dyn IntermediateStore>,
    pub results: Arc<dyn ResultStore>,
    pub journal: Option<ExecutionJournal>,
    pub config: WorkflowConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutionHandle {
    execution_id: String,
}

impl ExecutionHandle {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }
}

type Outcome = Result<GroupSummaryOutput, FatalWorkflowError>;

struct ExecutionRecord {
    state: Arc<Mutex<WorkflowState>>,
    progress: Arc<ProgressCounter>,
    cancel: CancellationToken,
    done: watch::Receiver<Option<Outcome>>,
}

struct EngineInner {
    sessions: Arc<dyn SessionSource>,
    intermediate: Arc<dyn IntermediateStore>,
    results: Arc<dyn ResultStore>,
    journal: Option<ExecutionJournal>,
    config: Arc<WorkflowConfig>,
    completion: Arc<CompletionService>,
    executions: Mutex<HashMap<String, ExecutionRecord>>,
}

/// Starts executions and answers queries about them. Clones share state.
#[derive(Clone)]
pub struct WorkflowEngine {
    inner: Arc<EngineInner>,
}

impl WorkflowEngine {
    pub fn new(deps: WorkflowDeps) -> Self {
        let completion = CompletionService::new(deps.gateway)
            .with_schema_attempts(deps.config.schema_attempts);
        Self {
            inner: Arc::new(EngineInner {
                sessions: deps.sessions,
                intermediate: deps.intermediate,
                results: deps.results,
                journal: deps.journal,
                config: Arc::new(deps.config),
                completion: Arc::new(completion),
                executions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.inner.config
    }

    pub async fn start(&self, request: GroupSummaryRequest) -> Result<ExecutionHandle, EngineError> {
        let execution_id = uuid::Uuid::new_v4().simple().to_string();
        self.launch(execution_id, request).await
    }

    /// Re-runs an execution under its old id. Stored artifacts of that id are
    /// reused, so only units that never finished call out again.
    pub async fn resume(
        &self,
        execution_id: &str,
        request: GroupSummaryRequest,
    ) -> Result<ExecutionHandle, EngineError> {
        {
            let executions = self.lock_executions()?;
            if let Some(record) = executions.get(execution_id) {
                if !is_done(&record.done) {
                    return Err(EngineError::StillRunning(execution_id.to_string()));
                }
            }
        }
        self.launch(execution_id.to_string(), request).await
    }

    async fn launch(
        &self,
        execution_id: String,
        request: GroupSummaryRequest,
    ) -> Result<ExecutionHandle, EngineError> {
        let request = validate_request(request)?;
        let request = Arc::new(request);

        let state = Arc::new(Mutex::new(WorkflowState::new(&execution_id)));
        let progress = Arc::new(ProgressCounter::new());
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(None);

        {
            let mut executions = self.lock_executions()?;
            executions.insert(
                execution_id.clone(),
                ExecutionRecord {
                    state: state.clone(),
                    progress: progress.clone(),
                    cancel: cancel.clone(),
                    done: done_rx,
                },
            );
        }

        let run = ExecutionRun {
            env: UnitEnv::new(
                execution_id.clone(),
                request.clone(),
                self.inner.config.clone(),
                self.inner.sessions.clone(),
                self.inner.intermediate.clone(),
                self.inner.completion.clone(),
            ),
            results: self.inner.results.clone(),
            journal: self.inner.journal.clone(),
            state,
            progress,
            cancel,
        };
        run.checkpoint().await;

        info!(
            execution_id = %execution_id,
            sessions = request.session_ids.len(),
            model = %request.model_name,
            "execution started"
        );
        tokio::spawn(async move {
            let outcome = run.execute().await;
            run.finish(&outcome).await;
            let _ = done_tx.send(Some(outcome));
        });

        Ok(ExecutionHandle::new(execution_id))
    }

    /// Live projection for executions this engine holds, the journal's last
    /// recorded state otherwise.
    pub async fn query(&self, execution_id: &str) -> Result<Option<StatusProjection>, EngineError> {
        {
            let executions = self.lock_executions()?;
            if let Some(record) = executions.get(execution_id) {
                let state = record.state.lock().map_err(|_| poisoned())?;
                return Ok(Some(state.projection(record.progress.snapshot())));
            }
        }
        match &self.inner.journal {
            Some(journal) => Ok(journal
                .load(execution_id)
                .await?
                .map(|entry| entry.state.projection(Default::default()))),
            None => Ok(None),
        }
    }

    /// Adds external progress to the phase in flight.
    pub fn signal(&self, handle: &ExecutionHandle, delta: ProgressDelta) -> Result<(), EngineError> {
        let executions = self.lock_executions()?;
        let record = executions
            .get(handle.execution_id())
            .ok_or_else(|| EngineError::UnknownExecution(handle.execution_id().to_string()))?;
        record.progress.apply(&delta);
        if let Some(message) = &delta.message {
            let mut state = record.state.lock().map_err(|_| poisoned())?;
            if !state.phase.is_terminal() {
                state.log(message.clone(), None);
            }
        }
        Ok(())
    }

    /// Requests cancellation. The execution fails with kind `cancelled` at
    /// its next unit or phase boundary.
    pub fn cancel(&self, handle: &ExecutionHandle) -> Result<(), EngineError> {
        let executions = self.lock_executions()?;
        let record = executions
            .get(handle.execution_id())
            .ok_or_else(|| EngineError::UnknownExecution(handle.execution_id().to_string()))?;
        info!(execution_id = handle.execution_id(), "cancellation requested");
        record.cancel.cancel();
        Ok(())
    }

    /// Waits for the execution's terminal value.
    pub async fn await_result(&self, handle: &ExecutionHandle) -> Outcome {
        let receiver = match self.lock_executions() {
            Ok(executions) => executions.get(handle.execution_id()).map(|r| r.done.clone()),
            Err(_) => {
                return Err(FatalWorkflowError::infrastructure(
                    Phase::Failed,
                    "engine state poisoned",
                ))
            }
        };

        if let Some(mut receiver) = receiver {
            return match receiver.wait_for(Option::is_some).await {
                Ok(outcome) => outcome.clone().unwrap_or_else(|| {
                    Err(FatalWorkflowError::infrastructure(
                        Phase::Failed,
                        "execution finished without a result",
                    ))
                }),
                Err(_) => Err(FatalWorkflowError::infrastructure(
                    Phase::Failed,
                    "execution task ended without a result",
                )),
            };
        }

        self.journal_outcome(handle.execution_id()).await
    }

    async fn journal_outcome(&self, execution_id: &str) -> Outcome {
        let Some(journal) = &self.inner.journal else {
            return Err(FatalWorkflowError::unknown_execution(execution_id));
        };
        let entry = journal
            .load(execution_id)
            .await
            .map_err(|e| FatalWorkflowError::infrastructure(Phase::Failed, e.to_string()))?;
        let Some(entry) = entry else {
            return Err(FatalWorkflowError::unknown_execution(execution_id));
        };
        match (entry.state.output, entry.state.error) {
            (Some(output), _) => Ok(output),
            (None, Some(error)) => Err(error),
            (None, None) => Err(FatalWorkflowError::new(
                entry.state.phase,
                FailureKind::Infrastructure,
                PhaseCounts::default(),
                "execution was interrupted; resume it to continue",
            )),
        }
    }

    /// Forgets a finished execution and deletes its execution-scoped
    /// artifacts. Per-session data and summaries stay cached until their TTL.
    pub async fn retire(&self, handle: &ExecutionHandle) -> Result<usize, EngineError> {
        let artifacts = {
            let mut executions = self.lock_executions()?;
            let record = executions
                .get(handle.execution_id())
                .ok_or_else(|| EngineError::UnknownExecution(handle.execution_id().to_string()))?;
            let artifacts = {
                let state = record.state.lock().map_err(|_| poisoned())?;
                if !state.phase.is_terminal() {
                    return Err(EngineError::StillRunning(handle.execution_id().to_string()));
                }
                state.artifacts.clone()
            };
            executions.remove(handle.execution_id());
            artifacts
        };

        let mut deleted = 0;
        for key in artifacts.iter().filter(|k| k.is_execution_scoped()) {
            if self.inner.intermediate.delete(key).await? {
                deleted += 1;
            }
        }
        info!(execution_id = handle.execution_id(), deleted, "execution retired");
        Ok(deleted)
    }

    fn lock_executions(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, ExecutionRecord>>, EngineError> {
        self.inner.executions.lock().map_err(|_| poisoned())
    }
}

fn poisoned() -> EngineError {
    EngineError::Store(crate::store::StoreError::Poisoned)
}

fn is_done(done: &watch::Receiver<Option<Outcome>>) -> bool {
    done.borrow().is_some()
}

fn validate_request(request: GroupSummaryRequest) -> Result<GroupSummaryRequest, EngineError> {
    let request = request.normalized();
    if request.session_ids.is_empty() {
        return Err(EngineError::InvalidRequest("no session ids".into()));
    }
    if request.session_ids.iter().any(|id| id.trim().is_empty()) {
        return Err(EngineError::InvalidRequest("blank session id".into()));
    }
    if request.model_name.trim().is_empty() {
        return Err(EngineError::InvalidRequest("model_name is empty".into()));
    }
    if request.time_window.min > request.time_window.max {
        return Err(EngineError::InvalidRequest(
            "time window ends before it starts".into(),
        ));
    }
    Ok(request)
}

// =============================================================================
// One execution
// =============================================================================

struct ExecutionRun {
    env: UnitEnv,
    results: Arc<dyn ResultStore>,
    journal: Option<ExecutionJournal>,
    state: Arc<Mutex<WorkflowState>>,
    progress: Arc<ProgressCounter>,
    cancel: CancellationToken,
}

impl ExecutionRun {
    fn execution_id(&self) -> &str {
        &self.env.execution_id
    }

    fn update<R>(&self, f: impl FnOnce(&mut WorkflowState) -> R) -> Result<R, FatalWorkflowError> {
        let mut state = self.state.lock().map_err(|_| {
            FatalWorkflowError::infrastructure(Phase::Failed, "workflow state poisoned")
        })?;
        Ok(f(&mut state))
    }

    fn current_phase(&self) -> Phase {
        self.state
            .lock()
            .map(|s| s.phase)
            .unwrap_or(Phase::Failed)
    }

    /// Writes the current state to the journal. Journal failures are logged,
    /// never fatal.
    async fn checkpoint(&self) {
        let Some(journal) = &self.journal else {
            return;
        };
        let snapshot = match self.state.lock() {
            Ok(state) => state.clone(),
            Err(_) => return,
        };
        if let Err(e) = journal.record(&self.env.request, &snapshot).await {
            warn!(execution_id = self.execution_id(), error = %e, "journal write failed");
        }
    }

    async fn advance(&self, next: Phase, message: String) -> Result<(), FatalWorkflowError> {
        self.update(|state| state.advance(next, message))?
            .map_err(|e| FatalWorkflowError::infrastructure(next, e.to_string()))?;
        info!(execution_id = self.execution_id(), phase = %next, "phase started");
        self.checkpoint().await;
        Ok(())
    }

    fn begin_units(&self, planned: usize) {
        self.progress.reset(planned as u64);
    }

    fn ensure_not_cancelled(&self, phase: Phase, counts: PhaseCounts) -> Result<(), FatalWorkflowError> {
        if self.cancel.is_cancelled() {
            return Err(FatalWorkflowError::cancelled(phase, counts));
        }
        Ok(())
    }

    /// Cancellation, then the ratio gate; logs the counts either way.
    async fn gate(&self, phase: Phase, counts: PhaseCounts, min_ratio: f64) -> Result<(), FatalWorkflowError> {
        self.ensure_not_cancelled(phase, counts)?;
        let passed = counts.passes(min_ratio);
        info!(
            execution_id = self.execution_id(),
            phase = %phase,
            attempted = counts.attempted,
            succeeded = counts.succeeded,
            skipped = counts.skipped,
            failed = counts.failed,
            passed,
            "phase fan-in"
        );
        self.update(|state| state.log(format!("{phase} fan-in"), Some(counts)))?;
        self.checkpoint().await;
        if !passed {
            return Err(FatalWorkflowError::below_threshold(phase, counts, min_ratio));
        }
        Ok(())
    }

    fn log_failures<'a, T>(&self, phase: Phase, units: impl Iterator<Item = (&'a str, &'a UnitOutcome<T>)>)
    where
        T: 'a,
    {
        for (unit, outcome) in units {
            if let UnitOutcome::Failed(err) = outcome {
                warn!(
                    execution_id = self.execution_id(),
                    phase = %phase,
                    unit,
                    code = err.code(),
                    transient = err.is_transient(),
                    error = %err,
                    "unit failed"
                );
            }
        }
    }

    fn record_artifacts(&self, keys: impl IntoIterator<Item = StoreKey>) -> Result<(), FatalWorkflowError> {
        self.update(|state| {
            for key in keys {
                state.record_artifact(key);
            }
        })
    }

    async fn execute(&self) -> Outcome {
        let config = self.env.config.clone();
        let limits = FanOut::from_config(&config);
        let request = self.env.request.clone();
        self.ensure_not_cancelled(Phase::Fetching, PhaseCounts::default())?;

        // Fetching
        self.begin_units(request.session_ids.len());
        let fetched = run_units(
            request.session_ids.iter().map(|id| self.env.fetch_session(id)),
            limits,
            &self.cancel,
            &self.progress,
        )
        .await;
        let counts = tally(&fetched);
        self.log_failures(
            Phase::Fetching,
            request.session_ids.iter().map(String::as_str).zip(fetched.iter()),
        );
        self.gate(Phase::Fetching, counts, config.min_fetch_success_ratio)
            .await?;

        let mut fetched_ids = Vec::new();
        let mut fetched_keys = Vec::new();
        for (id, outcome) in request.session_ids.iter().zip(fetched) {
            if let Some(key) = outcome.into_succeeded() {
                fetched_ids.push(id.clone());
                fetched_keys.push(key);
            }
        }
        self.record_artifacts(fetched_keys)?;
        self.advance(
            Phase::Summarizing,
            format!("fetched {} of {} sessions", counts.succeeded, counts.attempted),
        )
        .await?;

        // Summarizing
        self.begin_units(fetched_ids.len());
        let summarized = run_units(
            fetched_ids.iter().map(|id| self.env.summarize_session(id)),
            limits,
            &self.cancel,
            &self.progress,
        )
        .await;
        let counts = tally(&summarized);
        self.log_failures(
            Phase::Summarizing,
            fetched_ids.iter().map(String::as_str).zip(summarized.iter()),
        );
        self.gate(Phase::Summarizing, counts, config.min_summarize_success_ratio)
            .await?;

        let summaries: Vec<SingleSessionSummary> = summarized
            .into_iter()
            .filter_map(UnitOutcome::into_succeeded)
            .collect();
        self.record_artifacts(
            summaries
                .iter()
                .map(|s| self.env.session_summary_key(&s.session_id)),
        )?;

        if request.session_ids.len() <= config.small_group_threshold {
            info!(
                execution_id = self.execution_id(),
                summaries = summaries.len(),
                "small group; skipping pattern phases"
            );
            return Ok(GroupSummaryOutput::Individual {
                summaries: summaries
                    .into_iter()
                    .map(|summary| SessionSummaryEntry {
                        session_id: summary.session_id.clone(),
                        summary,
                    })
                    .collect(),
            });
        }

        // Chunking
        self.advance(
            Phase::Chunking,
            format!("summarized {} sessions", summaries.len()),
        )
        .await?;
        let chunks = self.plan_chunks(&summaries).await?;
        self.ensure_not_cancelled(Phase::Chunking, PhaseCounts::default())?;

        // Extracting
        self.advance(
            Phase::ExtractingPatterns,
            format!("{} chunks planned", chunks.len()),
        )
        .await?;
        self.begin_units(chunks.len());
        let extracted = run_units(
            chunks
                .iter()
                .enumerate()
                .map(|(i, chunk)| self.env.extract_chunk(i, chunk)),
            limits,
            &self.cancel,
            &self.progress,
        )
        .await;
        let counts = tally(&extracted);
        let chunk_names: Vec<String> = (0..chunks.len()).map(|i| format!("chunk-{i}")).collect();
        self.log_failures(
            Phase::ExtractingPatterns,
            chunk_names.iter().map(String::as_str).zip(extracted.iter()),
        );
        self.record_artifacts(
            chunks
                .iter()
                .zip(extracted.iter())
                .filter(|(_, o)| o.succeeded().is_some())
                .map(|(chunk, _)| self.env.extract_key(chunk)),
        )?;
        self.gate(Phase::ExtractingPatterns, counts, config.min_extract_success_ratio)
            .await?;

        let lists: Vec<Vec<RawPattern>> = extracted
            .into_iter()
            .filter_map(UnitOutcome::into_succeeded)
            .filter(|list| !list.is_empty())
            .collect();
        if lists.is_empty() {
            return Err(FatalWorkflowError::new(
                Phase::ExtractingPatterns,
                FailureKind::NoPatterns,
                counts,
                "no patterns were extracted",
            ));
        }

        // Combining
        let patterns = if lists.len() > 1 {
            self.advance(
                Phase::CombiningChunks,
                format!("combining {} pattern lists", lists.len()),
            )
            .await?;
            self.combine(&lists, limits).await?
        } else {
            lists.into_iter().next().unwrap_or_default()
        };

        // Assigning
        self.advance(
            Phase::AssigningEvents,
            format!("{} patterns to assign", patterns.len()),
        )
        .await?;
        self.begin_units(chunks.len());
        let assigned = run_units(
            chunks
                .iter()
                .enumerate()
                .map(|(i, chunk)| self.env.assign_chunk(i, &patterns, chunk)),
            limits,
            &self.cancel,
            &self.progress,
        )
        .await;
        let counts = tally(&assigned);
        self.log_failures(
            Phase::AssigningEvents,
            chunk_names.iter().map(String::as_str).zip(assigned.iter()),
        );
        self.record_artifacts(
            chunks
                .iter()
                .zip(assigned.iter())
                .filter(|(_, o)| o.succeeded().is_some())
                .map(|(chunk, _)| self.env.assign_key(&patterns, chunk)),
        )?;
        self.gate(Phase::AssigningEvents, counts, config.min_assign_success_ratio)
            .await?;

        let assignments = merge_assignments(
            assigned
                .into_iter()
                .filter_map(UnitOutcome::into_succeeded)
                .flatten(),
        );
        let report = enrich_patterns(EnrichmentInput {
            patterns: &patterns,
            assignments,
            summaries: &summaries,
            total_sessions: summaries.len(),
            min_success_ratio: config.min_enrichment_success_ratio,
        })
        .map_err(|e| FatalWorkflowError::quality_gate(&e))?;
        info!(
            execution_id = self.execution_id(),
            raw = report.raw_pattern_count,
            enriched = report.patterns.len(),
            benign_empty = report.benign_empty.len(),
            failed = report.failed.len(),
            dropped_event_ids = report.dropped_event_ids,
            "enrichment finished"
        );
        self.ensure_not_cancelled(Phase::AssigningEvents, counts)?;

        let meta = ReportMeta {
            execution_id: self.execution_id().to_string(),
            team_id: request.team_id,
            requester_id: request.requester_id,
            title: request.summary_title.clone(),
        };
        let result_id = self
            .results
            .save(meta, &report)
            .await
            .map_err(|e| FatalWorkflowError::infrastructure(Phase::AssigningEvents, e.to_string()))?;

        Ok(GroupSummaryOutput::Patterns {
            result_id,
            pattern_count: report.patterns.len(),
        })
    }

    /// Chunk assignment by session id, persisted so a resumed run sees the
    /// same chunks even if summaries changed underneath.
    async fn plan_chunks(
        &self,
        summaries: &[SingleSessionSummary],
    ) -> Result<Vec<Vec<SingleSessionSummary>>, FatalWorkflowError> {
        let key = self.env.chunk_plan_key();
        let store = self.env.intermediate.as_ref();
        let infra = |e: &dyn std::fmt::Display| {
            FatalWorkflowError::infrastructure(Phase::Chunking, e.to_string())
        };

        let by_id: HashMap<&str, &SingleSessionSummary> = summaries
            .iter()
            .map(|s| (s.session_id.as_str(), s))
            .collect();

        let stored: Option<Vec<Vec<String>>> = get_json(store, &key).await.map_err(|e| infra(&e))?;
        if let Some(plan) = stored {
            let covers_all = plan.iter().flatten().count() == summaries.len()
                && plan.iter().flatten().all(|id| by_id.contains_key(id.as_str()));
            if covers_all {
                let chunks = plan
                    .iter()
                    .map(|ids| {
                        ids.iter()
                            .filter_map(|id| by_id.get(id.as_str()).map(|s| (*s).clone()))
                            .collect()
                    })
                    .collect();
                self.record_artifacts([key])?;
                return Ok(chunks);
            }
            warn!(execution_id = self.execution_id(), "stored chunk plan is stale; replanning");
        }

        let chunks = chunk_summaries(summaries.to_vec(), self.env.config.token_budget)
            .map_err(|e| infra(&e))?;
        let plan: Vec<Vec<&str>> = chunks
            .iter()
            .map(|c| c.iter().map(|s| s.session_id.as_str()).collect())
            .collect();
        put_json(store, &key, &plan, self.env.config.intermediate_ttl())
            .await
            .map_err(|e| infra(&e))?;
        self.record_artifacts([key])?;
        info!(
            execution_id = self.execution_id(),
            chunks = chunks.len(),
            budget = self.env.config.token_budget,
            "chunk plan stored"
        );
        Ok(chunks)
    }

    async fn combine(
        &self,
        lists: &[Vec<RawPattern>],
        limits: FanOut,
    ) -> Result<Vec<RawPattern>, FatalWorkflowError> {
        self.begin_units(1);
        let mut outcomes = run_units(
            std::iter::once(self.env.combine(lists)),
            limits,
            &self.cancel,
            &self.progress,
        )
        .await;
        let counts = tally(&outcomes);
        self.log_failures(Phase::CombiningChunks, std::iter::once("all").zip(outcomes.iter()));
        if outcomes.iter().any(|o| o.succeeded().is_some()) {
            self.record_artifacts([self.env.combine_key(lists)])?;
        }
        self.gate(Phase::CombiningChunks, counts, 1.0).await?;

        let combined = outcomes
            .pop()
            .and_then(UnitOutcome::into_succeeded)
            .unwrap_or_default();
        if combined.is_empty() {
            return Err(FatalWorkflowError::new(
                Phase::CombiningChunks,
                FailureKind::NoPatterns,
                counts,
                "combination returned no patterns",
            ));
        }
        Ok(combined)
    }

    async fn finish(&self, outcome: &Outcome) {
        let transition = self.update(|state| match outcome {
            Ok(output) => state.complete(output.clone()),
            Err(error) => state.fail(error.clone()),
        });
        match transition {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(execution_id = self.execution_id(), error = %e, "terminal transition rejected"),
            Err(e) => warn!(execution_id = self.execution_id(), error = %e, "terminal transition failed"),
        }
        match outcome {
            Ok(output) => info!(
                execution_id = self.execution_id(),
                result_id = output.result_id().unwrap_or("-"),
                "execution completed"
            ),
            Err(error) => warn!(
                execution_id = self.execution_id(),
                phase = %self.current_phase(),
                kind = ?error.kind,
                reason = %error.reason,
                "execution failed"
            ),
        }
        self.checkpoint().await;
    }
}
