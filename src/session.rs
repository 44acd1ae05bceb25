//! Session-level data model: the group request, raw events as fetched, the
//! prepared per-session payload and the validated single-session summary.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// =============================================================================
// Request
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub min: DateTime<Utc>,
    pub max: DateTime<Utc>,
}

impl TimeWindow {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.min && ts <= self.max
    }
}

/// One invocation of the group summarizer. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSummaryRequest {
    /// Ordered, duplicate-free session ids.
    pub session_ids: Vec<String>,
    pub requester_id: i64,
    pub team_id: i64,
    pub time_window: TimeWindow,
    #[serde(default)]
    pub summary_title: Option<String>,
    pub model_name: String,
    /// Free-form focus for the LLM ("look at checkout failures").
    #[serde(default)]
    pub extra_context: Option<String>,
}

impl GroupSummaryRequest {
    /// Drops repeated session ids, keeping the first occurrence.
    pub fn normalized(mut self) -> Self {
        let mut seen = BTreeSet::new();
        self.session_ids.retain(|id| seen.insert(id.clone()));
        self
    }

    /// Hash of everything besides the session that changes a summary.
    pub fn context_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.model_name.as_bytes());
        hasher.update(b"|");
        hasher.update(self.extra_context.as_deref().unwrap_or("").as_bytes());
        hasher.finalize().to_hex()[..16].to_string()
    }
}

// =============================================================================
// Fetched data
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: i64,
    #[serde(default)]
    pub distinct_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub uuid: String,
    pub event: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub current_url: Option<String>,
    #[serde(default)]
    pub window_id: Option<String>,
}

/// What the session data store returns for one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    pub metadata: SessionMetadata,
    pub events: Vec<RawEvent>,
}

/// Short stable id used in prompts instead of the full uuid.
pub fn event_id_for(uuid: &str) -> String {
    blake3::hash(uuid.as_bytes()).to_hex()[..8].to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedEvent {
    pub event_id: String,
    pub event_uuid: String,
    pub event: String,
    pub timestamp: DateTime<Utc>,
    pub milliseconds_since_start: i64,
    pub current_url: Option<String>,
}

/// Output of the fetch phase, stored in the intermediate store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparedSession {
    pub session_id: String,
    pub metadata: SessionMetadata,
    pub events: Vec<PreparedEvent>,
}

impl PreparedSession {
    pub fn find_event(&self, event_id: &str) -> Option<(usize, &PreparedEvent)> {
        self.events
            .iter()
            .enumerate()
            .find(|(_, e)| e.event_id == event_id)
    }
}

// =============================================================================
// Summary
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExceptionKind {
    Blocking,
    NonBlocking,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub duration_ms: i64,
    pub events_count: usize,
    pub key_action_count: usize,
    pub failure_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub index: u32,
    pub name: String,
    pub start_event_id: String,
    pub end_event_id: String,
    #[serde(default)]
    pub meta: SegmentMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyActionEvent {
    pub event_id: String,
    pub event_uuid: String,
    pub session_id: String,
    pub description: String,
    pub abandonment: bool,
    pub confusion: bool,
    pub exception: Option<ExceptionKind>,
    pub event: String,
    pub timestamp: DateTime<Utc>,
    pub milliseconds_since_start: i64,
    pub current_url: Option<String>,
}

impl KeyActionEvent {
    pub fn is_failure(&self) -> bool {
        self.abandonment || self.confusion || self.exception.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentKeyActions {
    pub segment_index: u32,
    pub events: Vec<KeyActionEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentOutcome {
    pub segment_index: u32,
    pub success: bool,
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub success: bool,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleSessionSummary {
    pub session_id: String,
    pub segments: Vec<Segment>,
    pub key_actions: Vec<SegmentKeyActions>,
    pub segment_outcomes: Vec<SegmentOutcome>,
    pub session_outcome: SessionOutcome,
}

impl SingleSessionSummary {
    pub fn segment(&self, index: u32) -> Option<&Segment> {
        self.segments.iter().find(|s| s.index == index)
    }

    pub fn outcome(&self, index: u32) -> Option<&SegmentOutcome> {
        self.segment_outcomes.iter().find(|o| o.segment_index == index)
    }

    pub fn key_action_events(&self) -> impl Iterator<Item = &KeyActionEvent> {
        self.key_actions.iter().flat_map(|ka| ka.events.iter())
    }
}

/// One entry of the small-group output: a summary tagged with its session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummaryEntry {
    pub session_id: String,
    pub summary: SingleSessionSummary,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn request(ids: &[&str], extra: Option<&str>) -> GroupSummaryRequest {
        GroupSummaryRequest {
            session_ids: ids.iter().map(|s| s.to_string()).collect(),
            requester_id: 1,
            team_id: 2,
            time_window: TimeWindow {
                min: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
                max: Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap(),
            },
            summary_title: None,
            model_name: "openai/gpt-4.1-mini".into(),
            extra_context: extra.map(str::to_string),
        }
    }

    #[test]
    fn normalized_drops_repeats_and_keeps_order() {
        let req = request(&["b", "a", "b", "c", "a"], None).normalized();
        assert_eq!(req.session_ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn context_hash_tracks_model_and_focus() {
        let plain = request(&["a"], None);
        let focused = request(&["a"], Some("checkout"));
        assert_eq!(plain.context_hash(), request(&["z"], None).context_hash());
        assert_ne!(plain.context_hash(), focused.context_hash());
    }

    #[test]
    fn event_ids_are_short_and_stable() {
        let id = event_id_for("0190-aaaa");
        assert_eq!(id.len(), 8);
        assert_eq!(id, event_id_for("0190-aaaa"));
        assert_ne!(id, event_id_for("0190-aaab"));
    }
}
