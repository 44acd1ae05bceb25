use std::path::Path;
use std::process::{Command, Output};

use chrono::{Duration, TimeZone, Utc};
use recap_harness::session::{event_id_for, RawEvent, SessionData, SessionMetadata};
use serde_json::{json, Value};
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn recap(args: &[&str]) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_recap"));
    cmd.args(args).env("RECAP_LOG", "warn");
    cmd
}

fn path_arg(p: &Path) -> &str {
    p.to_str().unwrap()
}

#[test]
fn status_of_unknown_execution_fails() {
    let dir = tempdir().unwrap();
    let journal = dir.path().join("journal.sqlite");
    let output = recap(&["status", "missing", "--journal", path_arg(&journal)])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("no execution missing"));
}

#[test]
fn report_of_unknown_result_fails() {
    let dir = tempdir().unwrap();
    let results = dir.path().join("results.sqlite");
    let output = recap(&["report", "nope", "--results", path_arg(&results)])
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn store_prune_on_fresh_stores_reports_zero() {
    let dir = tempdir().unwrap();
    let store = dir.path().join("store.sqlite");
    let journal = dir.path().join("journal.sqlite");
    let output = recap(&[
        "store-prune",
        "--store",
        path_arg(&store),
        "--journal",
        path_arg(&journal),
        "--max-age-days",
        "30",
    ])
    .output()
    .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("pruned 0 expired artifacts; 0 remain"));
    assert!(stdout.contains("pruned 0 finished executions; 0 remain"));
}

fn write_session(dir: &Path, session_id: &str) {
    let start = Utc.with_ymd_and_hms(2025, 9, 3, 8, 0, 0).unwrap();
    let data = SessionData {
        metadata: SessionMetadata {
            start_time: start,
            end_time: start + Duration::minutes(1),
            duration_ms: 60_000,
            distinct_id: None,
        },
        events: (0..3)
            .map(|n| RawEvent {
                uuid: format!("{session_id}-{n}"),
                event: "$autocapture".into(),
                timestamp: start + Duration::seconds(n * 5),
                current_url: Some("https://app.example/settings".into()),
                window_id: None,
            })
            .collect(),
    };
    std::fs::write(
        dir.join(format!("{session_id}.json")),
        serde_json::to_string(&data).unwrap(),
    )
    .unwrap();
}

/// Summarizes whichever session the prompt names, using its first event.
struct SummaryResponder;

impl Respond for SummaryResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: Value = serde_json::from_slice(&request.body).unwrap();
        let user = body["messages"][1]["content"].as_str().unwrap_or("");
        let session_id = user
            .split("<session_id>")
            .nth(1)
            .and_then(|rest| rest.split("</session_id>").next())
            .unwrap_or("");
        let event_id = event_id_for(&format!("{session_id}-0"));
        let summary = json!({
            "segments": [{ "index": 0, "name": "settings", "start_event_id": event_id, "end_event_id": event_id }],
            "key_actions": [{ "segment_index": 0, "events": [
                { "event_id": event_id, "description": "opened settings", "exception": null }
            ]}],
            "segment_outcomes": [{ "segment_index": 0, "success": true, "summary": "done" }],
            "session_outcome": { "success": true, "description": format!("{session_id} finished") },
        });
        ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": summary.to_string() }, "finish_reason": "stop" }],
            "usage": { "prompt_tokens": 40, "completion_tokens": 30 }
        }))
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn summarize_small_group_against_mock_provider() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(SummaryResponder)
        .expect(2)
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let sessions = dir.path().join("sessions");
    std::fs::create_dir(&sessions).unwrap();
    write_session(&sessions, "s-1");
    write_session(&sessions, "s-2");
    let out = dir.path().join("out.json");

    let mut cmd = recap(&[
        "summarize",
        "--sessions-dir",
        path_arg(&sessions),
        "--session",
        "s-1,s-2",
        "--team-id",
        "9",
        "--store",
        path_arg(&dir.path().join("store.sqlite")),
        "--results",
        path_arg(&dir.path().join("results.sqlite")),
        "--journal",
        path_arg(&dir.path().join("journal.sqlite")),
        "--out",
        path_arg(&out),
    ]);
    cmd.env("OPENROUTER_API_KEY", "sk-test")
        .env("OPENROUTER_BASE_URL", server.uri());

    let output: Output = tokio::task::spawn_blocking(move || cmd.output().unwrap())
        .await
        .unwrap();
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let rendered: Value = serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(rendered["output"]["kind"], "individual");
    let summaries = rendered["output"]["summaries"].as_array().unwrap();
    assert_eq!(summaries.len(), 2);
    assert_eq!(summaries[0]["session_id"], "s-1");
    assert_eq!(
        summaries[1]["summary"]["session_outcome"]["description"],
        "s-2 finished"
    );
    assert!(rendered["report"].is_null());

    let execution_id = rendered["execution_id"].as_str().unwrap().to_string();
    let journal = dir.path().join("journal.sqlite");
    let status = recap(&["status", &execution_id, "--journal", path_arg(&journal)])
        .output()
        .unwrap();
    assert!(status.status.success());
    let projection: Value = serde_json::from_slice(&status.stdout).unwrap();
    assert_eq!(projection["phase"], "completed");
    assert_eq!(projection["is_terminal"], true);
}
