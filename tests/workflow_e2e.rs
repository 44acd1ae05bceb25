use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use recap_harness::gateway::{
    ChatGateway, ChatRequest, ChatResponse, FinishReason, ProviderError,
};
use recap_harness::session::{
    GroupSummaryRequest, RawEvent, SessionData, SessionMetadata, TimeWindow,
};
use recap_harness::source::MemorySessionSource;
use recap_harness::store::{
    ExecutionJournal, MemoryIntermediateStore, MemoryResultStore, ResultStore,
};
use recap_harness::workflow::{
    FailureKind, GroupSummaryOutput, Phase, ProgressDelta, WorkflowConfig, WorkflowDeps,
    WorkflowEngine,
};

const TEAM: i64 = 7;

/// Answers every task prompt with a well-formed reply derived from the
/// prompt itself, counting calls per task.
#[derive(Default)]
struct ScriptedModel {
    calls: Mutex<HashMap<&'static str, usize>>,
    summarize_delay: Option<Duration>,
    /// `(task, marker)`: calls for `task` whose prompt contains `marker` fail.
    failing: Vec<(&'static str, String)>,
    empty_extraction: bool,
    unknown_assignments: bool,
}

impl ScriptedModel {
    fn slow(delay: Duration) -> Self {
        Self {
            summarize_delay: Some(delay),
            ..Self::default()
        }
    }

    fn failing(task: &'static str, markers: &[&str]) -> Self {
        Self {
            failing: markers.iter().map(|m| (task, m.to_string())).collect(),
            ..Self::default()
        }
    }

    fn calls(&self, task: &str) -> usize {
        self.calls.lock().unwrap().get(task).copied().unwrap_or(0)
    }

    fn bump(&self, task: &'static str) {
        *self.calls.lock().unwrap().entry(task).or_default() += 1;
    }

    fn should_fail(&self, task: &str, user: &str) -> bool {
        self.failing
            .iter()
            .any(|(t, marker)| *t == task && user.contains(marker.as_str()))
    }
}

/// First `|`-separated field of every line between `header` and `closing`.
fn ids_after(user: &str, header: &str, closing: &str) -> Vec<String> {
    user.lines()
        .skip_while(|line| !line.starts_with(header))
        .skip(1)
        .take_while(|line| !line.starts_with(closing))
        .filter_map(|line| line.split('|').next())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

fn summary_reply(user: &str) -> String {
    let ids = ids_after(user, "event_id|timestamp", "</events>");
    let events: Vec<_> = ids
        .iter()
        .map(|id| {
            serde_json::json!({
                "event_id": id,
                "description": format!("clicked {id}"),
                "abandonment": false,
                "confusion": false,
                "exception": null,
            })
        })
        .collect();
    serde_json::json!({
        "segments": [{
            "index": 0,
            "name": "checkout",
            "start_event_id": ids.first(),
            "end_event_id": ids.last(),
        }],
        "key_actions": [{ "segment_index": 0, "events": events }],
        "segment_outcomes": [{ "segment_index": 0, "success": true, "summary": "paid" }],
        "session_outcome": { "success": true, "description": "completed checkout" },
    })
    .to_string()
}

fn patterns_reply() -> String {
    serde_json::json!({
        "patterns": [
            {
                "pattern_id": 1,
                "pattern_name": "Coupon field retries",
                "description": "Users re-enter coupon codes several times",
                "severity": "medium",
                "indicators": ["repeated submit on coupon form"],
            },
            {
                "pattern_id": 2,
                "pattern_name": "Card declined loop",
                "description": "Payment fails and users retry the same card",
                "severity": "critical",
                "indicators": ["payment error followed by resubmit"],
            },
        ]
    })
    .to_string()
}

fn assign_reply(user: &str, unknown_events: bool) -> String {
    let ids = if unknown_events {
        vec!["ffffffff".to_string()]
    } else {
        ids_after(user, "event_id|session_id", "</key_actions>")
    };
    let first: Vec<_> = ids.iter().take(1).cloned().collect();
    serde_json::json!({
        "patterns": [
            { "pattern_id": 1, "event_ids": ids },
            { "pattern_id": 2, "event_ids": first },
        ]
    })
    .to_string()
}

#[async_trait]
impl ChatGateway for ScriptedModel {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let system = req.messages.first().map(|m| m.content.as_str()).unwrap_or("");
        let user = req.messages.last().map(|m| m.content.as_str()).unwrap_or("");

        let task = if system.starts_with("You analyze one recorded product session") {
            "summarize"
        } else if system.starts_with("You read summaries") {
            "extract"
        } else if system.starts_with("You receive pattern lists") {
            "combine"
        } else if system.starts_with("You match key actions") {
            "assign"
        } else {
            return Err(ProviderError::config("unexpected prompt"));
        };
        self.bump(task);
        if self.should_fail(task, user) {
            return Err(ProviderError::config(format!("{task} refused by script")));
        }

        let content = match task {
            "summarize" => {
                if let Some(delay) = self.summarize_delay {
                    tokio::time::sleep(delay).await;
                }
                summary_reply(user)
            }
            "extract" if self.empty_extraction => r#"{"patterns": []}"#.to_string(),
            "extract" | "combine" => patterns_reply(),
            _ => assign_reply(user, self.unknown_assignments),
        };

        Ok(ChatResponse {
            content,
            input_tokens: 100,
            output_tokens: 50,
            latency: Duration::from_millis(1),
            finish_reason: FinishReason::Stop,
        })
    }
}

fn window() -> TimeWindow {
    TimeWindow {
        min: Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap(),
        max: Utc.with_ymd_and_hms(2026, 5, 2, 0, 0, 0).unwrap(),
    }
}

fn session(session_id: &str) -> SessionData {
    let start = Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap();
    let events = ["$pageview", "$autocapture", "$feature_flag_called", "$autocapture"]
        .iter()
        .enumerate()
        .map(|(n, event)| RawEvent {
            uuid: format!("{session_id}-evt-{n}"),
            event: event.to_string(),
            timestamp: start + ChronoDuration::seconds(n as i64 * 10),
            current_url: Some("https://shop.example/checkout".into()),
            window_id: None,
        })
        .collect();
    SessionData {
        metadata: SessionMetadata {
            start_time: start,
            end_time: start + ChronoDuration::minutes(2),
            duration_ms: 120_000,
            distinct_id: Some(format!("user-{session_id}")),
        },
        events,
    }
}

fn request(ids: &[&str]) -> GroupSummaryRequest {
    GroupSummaryRequest {
        session_ids: ids.iter().map(|s| s.to_string()).collect(),
        requester_id: 3,
        team_id: TEAM,
        time_window: window(),
        summary_title: Some("Checkout friction".into()),
        model_name: "openai/gpt-4.1-mini".into(),
        extra_context: None,
    }
}

struct Harness {
    engine: WorkflowEngine,
    sessions: Arc<MemorySessionSource>,
    model: Arc<ScriptedModel>,
    intermediate: Arc<MemoryIntermediateStore>,
    results: Arc<MemoryResultStore>,
}

fn harness(model: ScriptedModel, config: WorkflowConfig, stored: &[&str]) -> Harness {
    journaled_harness(model, config, stored, None)
}

fn journaled_harness(
    model: ScriptedModel,
    config: WorkflowConfig,
    stored: &[&str],
    journal: Option<ExecutionJournal>,
) -> Harness {
    let sessions = Arc::new(MemorySessionSource::new());
    for id in stored {
        sessions.insert(TEAM, *id, session(id));
    }
    let model = Arc::new(model);
    let intermediate = Arc::new(MemoryIntermediateStore::new());
    let results = Arc::new(MemoryResultStore::new());
    let engine = WorkflowEngine::new(WorkflowDeps {
        gateway: model.clone(),
        sessions: sessions.clone(),
        intermediate: intermediate.clone(),
        results: results.clone(),
        journal,
        config,
    });
    Harness {
        engine,
        sessions,
        model,
        intermediate,
        results,
    }
}

fn pattern_config() -> WorkflowConfig {
    WorkflowConfig {
        small_group_threshold: 2,
        // Every summary lands in its own chunk.
        token_budget: 1,
        ..WorkflowConfig::default()
    }
}

#[tokio::test]
async fn large_group_produces_ranked_pattern_report() {
    let h = harness(ScriptedModel::default(), pattern_config(), &["a", "b", "c"]);

    let handle = h.engine.start(request(&["a", "b", "c", "a"])).await.unwrap();
    let output = h.engine.await_result(&handle).await.unwrap();

    let GroupSummaryOutput::Patterns {
        result_id,
        pattern_count,
    } = output
    else {
        panic!("expected a pattern report");
    };
    assert_eq!(pattern_count, 2);

    assert_eq!(h.model.calls("summarize"), 3);
    assert_eq!(h.model.calls("extract"), 3);
    assert_eq!(h.model.calls("combine"), 1);
    assert_eq!(h.model.calls("assign"), 3);

    let stored = h.results.load(&result_id).await.unwrap().unwrap();
    assert_eq!(stored.meta.execution_id, handle.execution_id());
    assert_eq!(stored.meta.title.as_deref(), Some("Checkout friction"));
    assert_eq!(stored.report.total_sessions, 3);

    let names: Vec<&str> = stored
        .report
        .patterns
        .iter()
        .map(|p| p.pattern.pattern_name.as_str())
        .collect();
    assert_eq!(names, vec!["Card declined loop", "Coupon field retries"]);

    // Pattern 1 owns every key action of every session.
    let coupon = &stored.report.patterns[1];
    assert_eq!(coupon.stats.sessions_affected, 3);
    assert_eq!(coupon.stats.sessions_affected_ratio, 1.0);
    // Ignored events never reach the prompt, so three key actions per session.
    assert_eq!(coupon.stats.occurrences, 9);

    let status = h.engine.query(handle.execution_id()).await.unwrap().unwrap();
    assert_eq!(status.phase, Phase::Completed);
    assert!(status.is_terminal);
    assert_eq!(status.result_id.as_deref(), Some(result_id.as_str()));
}

#[tokio::test]
async fn small_group_returns_individual_summaries_in_request_order() {
    let h = harness(ScriptedModel::default(), pattern_config(), &["a", "b"]);

    let handle = h.engine.start(request(&["b", "a"])).await.unwrap();
    let output = h.engine.await_result(&handle).await.unwrap();

    assert!(output.result_id().is_none());
    let GroupSummaryOutput::Individual { summaries } = output else {
        panic!("expected individual summaries");
    };
    let order: Vec<&str> = summaries.iter().map(|s| s.session_id.as_str()).collect();
    assert_eq!(order, vec!["b", "a"]);
    assert_eq!(summaries[0].summary.key_actions[0].events.len(), 3);

    assert_eq!(h.model.calls("extract"), 0);
    assert!(h.results.is_empty());
}

#[tokio::test]
async fn missing_sessions_fail_the_fetch_phase() {
    let h = harness(ScriptedModel::default(), pattern_config(), &["a"]);

    let handle = h.engine.start(request(&["a", "b", "c"])).await.unwrap();
    let err = h.engine.await_result(&handle).await.unwrap_err();

    assert_eq!(err.kind, FailureKind::BelowThreshold);
    assert_eq!(err.phase, Phase::Fetching);
    assert_eq!(err.counts.attempted, 3);
    assert_eq!(err.counts.succeeded, 1);
    assert_eq!(err.counts.failed, 2);
    assert_eq!(h.model.calls("summarize"), 0);

    let status = h.engine.query(handle.execution_id()).await.unwrap().unwrap();
    assert_eq!(status.phase, Phase::Failed);
    assert_eq!(status.error.map(|e| e.kind), Some(FailureKind::BelowThreshold));
}

#[tokio::test]
async fn cancellation_fails_the_execution_as_cancelled() {
    let h = harness(
        ScriptedModel::slow(Duration::from_secs(30)),
        pattern_config(),
        &["a", "b", "c"],
    );

    let handle = h.engine.start(request(&["a", "b", "c"])).await.unwrap();
    h.engine
        .signal(
            &handle,
            ProgressDelta {
                message: Some("operator is watching".into()),
                ..ProgressDelta::default()
            },
        )
        .unwrap();
    h.engine.cancel(&handle).unwrap();

    let err = tokio::time::timeout(Duration::from_secs(5), h.engine.await_result(&handle))
        .await
        .expect("cancelled execution should settle promptly")
        .unwrap_err();
    assert_eq!(err.kind, FailureKind::Cancelled);
    assert!(h.results.is_empty());
}

#[tokio::test]
async fn resume_reuses_stored_summaries_and_retire_drops_phase_artifacts() {
    let h = harness(ScriptedModel::default(), pattern_config(), &["a", "b", "c"]);

    let handle = h.engine.start(request(&["a", "b", "c"])).await.unwrap();
    let first = h.engine.await_result(&handle).await.unwrap();
    assert_eq!(h.model.calls("summarize"), 3);

    let resumed = h
        .engine
        .resume(handle.execution_id(), request(&["a", "b", "c"]))
        .await
        .unwrap();
    let second = h.engine.await_result(&resumed).await.unwrap();
    assert_eq!(first.result_id(), second.result_id());
    // Summaries and every phase artifact come from the store.
    assert_eq!(h.model.calls("summarize"), 3);
    assert_eq!(h.model.calls("extract"), 3);
    assert_eq!(h.model.calls("assign"), 3);
    assert_eq!(h.results.len(), 1);

    let phase_keys = |store: &MemoryIntermediateStore| {
        store
            .keys()
            .into_iter()
            .filter(|k| k.is_execution_scoped())
            .count()
    };
    assert!(phase_keys(&h.intermediate) > 0);

    let deleted = h.engine.retire(&resumed).await.unwrap();
    assert!(deleted > 0);
    assert_eq!(phase_keys(&h.intermediate), 0);
    assert!(!h.intermediate.keys().is_empty());
    assert!(h.engine.query(handle.execution_id()).await.unwrap().is_none());
}

#[tokio::test]
async fn invalid_requests_are_rejected_before_starting() {
    let h = harness(ScriptedModel::default(), pattern_config(), &[]);
    assert!(h.engine.start(request(&[])).await.is_err());

    let mut bad_window = request(&["a"]);
    bad_window.time_window.min = bad_window.time_window.max + ChronoDuration::days(1);
    assert!(h.engine.start(bad_window).await.is_err());
}

#[tokio::test]
async fn single_chunk_skips_combination() {
    let config = WorkflowConfig {
        small_group_threshold: 2,
        ..WorkflowConfig::default()
    };
    let h = harness(ScriptedModel::default(), config, &["a", "b", "c"]);

    let handle = h.engine.start(request(&["a", "b", "c"])).await.unwrap();
    let output = h.engine.await_result(&handle).await.unwrap();
    let result_id = output.result_id().expect("pattern report id").to_string();

    assert_eq!(h.model.calls("extract"), 1);
    assert_eq!(h.model.calls("combine"), 0);
    assert_eq!(h.model.calls("assign"), 1);

    let stored = h.results.load(&result_id).await.unwrap().unwrap();
    assert_eq!(stored.report.raw_pattern_count, 2);
    assert!(stored.report.benign_empty.is_empty());
    let severities: Vec<String> = stored
        .report
        .patterns
        .iter()
        .map(|p| p.pattern.severity.to_string())
        .collect();
    assert_eq!(severities, vec!["critical", "medium"]);

    let declined = &stored.report.patterns[0].stats;
    // Pattern 2 takes only the first key action of the single chunk.
    assert_eq!(declined.occurrences, 1);
    assert_eq!(declined.sessions_affected, 1);
    assert_eq!(declined.sessions_affected_ratio, 0.33);
    assert_eq!(declined.segments_success_ratio, 1.0);

    let status = h.engine.query(handle.execution_id()).await.unwrap().unwrap();
    assert!(status
        .status_log
        .iter()
        .all(|entry| entry.phase != Phase::CombiningChunks));
    assert!(status
        .status_log
        .iter()
        .any(|entry| entry.phase == Phase::AssigningEvents));
}

#[tokio::test]
async fn resume_after_replan_assigns_every_session() {
    let h = harness(ScriptedModel::default(), pattern_config(), &["b", "c"]);

    let handle = h.engine.start(request(&["a", "b", "c"])).await.unwrap();
    h.engine.await_result(&handle).await.unwrap();
    assert_eq!(h.model.calls("extract"), 2);

    // "a" shows up upstream; the resumed run plans [a], [b], [c].
    h.sessions.insert(TEAM, "a", session("a"));
    let resumed = h
        .engine
        .resume(handle.execution_id(), request(&["a", "b", "c"]))
        .await
        .unwrap();
    let output = h.engine.await_result(&resumed).await.unwrap();

    // Only the new chunk and the changed combination call out again.
    assert_eq!(h.model.calls("extract"), 3);
    assert_eq!(h.model.calls("combine"), 2);
    assert_eq!(h.model.calls("assign"), 3);

    let stored = h
        .results
        .load(output.result_id().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.report.total_sessions, 3);
    let coupon = stored
        .report
        .patterns
        .iter()
        .find(|p| p.pattern.pattern_id == 1)
        .unwrap();
    assert_eq!(coupon.stats.sessions_affected, 3);
    assert_eq!(coupon.stats.occurrences, 9);
    let sessions: std::collections::BTreeSet<&str> = coupon
        .events
        .iter()
        .map(|e| e.target_event.session_id.as_str())
        .collect();
    assert_eq!(sessions.into_iter().collect::<Vec<_>>(), vec!["a", "b", "c"]);
}

async fn failed_run(model: ScriptedModel, ids: &[&str]) -> (recap_harness::FatalWorkflowError, Arc<ScriptedModel>) {
    let h = harness(model, pattern_config(), ids);
    let handle = h.engine.start(request(ids)).await.unwrap();
    let err = h.engine.await_result(&handle).await.unwrap_err();
    assert!(h.results.is_empty());
    (err, h.model)
}

#[tokio::test]
async fn extraction_failures_below_ratio_fail_the_phase() {
    let (err, model) = failed_run(
        ScriptedModel::failing("extract", &["id=\"b\"", "id=\"c\""]),
        &["a", "b", "c", "d"],
    )
    .await;
    assert_eq!(err.kind, FailureKind::BelowThreshold);
    assert_eq!(err.phase, Phase::ExtractingPatterns);
    assert_eq!(err.counts.attempted, 4);
    assert_eq!(err.counts.succeeded, 2);
    assert_eq!(err.counts.failed, 2);
    assert_eq!(model.calls("assign"), 0);
}

#[tokio::test]
async fn extraction_failures_within_ratio_continue_with_the_rest() {
    let h = harness(
        ScriptedModel::failing("extract", &["id=\"b\""]),
        pattern_config(),
        &["a", "b", "c", "d"],
    );
    let handle = h.engine.start(request(&["a", "b", "c", "d"])).await.unwrap();
    let output = h.engine.await_result(&handle).await.unwrap();
    assert!(matches!(output, GroupSummaryOutput::Patterns { pattern_count: 2, .. }));
    // Assignment still covers every chunk, including the one that failed extraction.
    assert_eq!(h.model.calls("assign"), 4);
}

#[tokio::test]
async fn assignment_failures_below_ratio_fail_the_phase() {
    let (err, _) = failed_run(
        ScriptedModel::failing("assign", &["|b|", "|c|"]),
        &["a", "b", "c", "d"],
    )
    .await;
    assert_eq!(err.kind, FailureKind::BelowThreshold);
    assert_eq!(err.phase, Phase::AssigningEvents);
    assert_eq!(err.counts.failed, 2);
}

#[tokio::test]
async fn failed_combination_fails_the_run() {
    let (err, model) = failed_run(ScriptedModel::failing("combine", &[""]), &["a", "b", "c"]).await;
    assert_eq!(err.kind, FailureKind::BelowThreshold);
    assert_eq!(err.phase, Phase::CombiningChunks);
    assert_eq!(err.counts.attempted, 1);
    assert_eq!(err.counts.failed, 1);
    assert_eq!(model.calls("assign"), 0);
}

#[tokio::test]
async fn empty_extraction_fails_with_no_patterns() {
    let model = ScriptedModel {
        empty_extraction: true,
        ..ScriptedModel::default()
    };
    let (err, model) = failed_run(model, &["a", "b", "c"]).await;
    assert_eq!(err.kind, FailureKind::NoPatterns);
    assert_eq!(err.phase, Phase::ExtractingPatterns);
    assert_eq!(model.calls("combine"), 0);
}

#[tokio::test]
async fn unresolvable_assignments_trip_the_quality_gate() {
    let model = ScriptedModel {
        unknown_assignments: true,
        ..ScriptedModel::default()
    };
    let (err, _) = failed_run(model, &["a", "b", "c"]).await;
    assert_eq!(err.kind, FailureKind::QualityGate);
    assert_eq!(err.counts.attempted, 2);
    assert_eq!(err.counts.succeeded, 0);
    assert_eq!(err.counts.failed, 2);
}

#[tokio::test]
async fn fan_in_counts_reach_the_journal_while_running() {
    let dir = tempfile::tempdir().unwrap();
    let journal = ExecutionJournal::open(dir.path().join("journal.sqlite")).unwrap();
    let h = journaled_harness(
        ScriptedModel::slow(Duration::from_secs(30)),
        pattern_config(),
        &["a", "b", "c"],
        Some(journal.clone()),
    );

    let handle = h.engine.start(request(&["a", "b", "c"])).await.unwrap();
    let mut entry = None;
    for _ in 0..200 {
        let loaded = journal.load(handle.execution_id()).await.unwrap();
        if loaded
            .as_ref()
            .is_some_and(|e| e.state.phase == Phase::Summarizing)
        {
            entry = loaded;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let entry = entry.expect("journal should reach the summarizing phase");

    let fetch_fan_in = entry
        .state
        .status_log
        .iter()
        .find(|e| e.phase == Phase::Fetching && e.counts.is_some())
        .and_then(|e| e.counts)
        .expect("fetch fan-in recorded");
    assert_eq!(fetch_fan_in.attempted, 3);
    assert_eq!(fetch_fan_in.succeeded, 3);

    h.engine.cancel(&handle).unwrap();
    let err = h.engine.await_result(&handle).await.unwrap_err();
    assert_eq!(err.kind, FailureKind::Cancelled);
    let last = journal.load(handle.execution_id()).await.unwrap().unwrap();
    assert_eq!(last.state.error.map(|e| e.kind), Some(FailureKind::Cancelled));
}
