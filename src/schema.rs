//! Schemas for completion-service output.
//!
//! Every task has an explicit wire shape (all fields optional, so a missing
//! field becomes a named error instead of a serde message) and a validation
//! step that turns it into a typed value. Nothing the model says is trusted
//! until it passes here.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::session::{
    ExceptionKind, KeyActionEvent, PreparedSession, Segment, SegmentKeyActions, SegmentMeta,
    SegmentOutcome, SessionOutcome, SingleSessionSummary,
};

#[derive(Debug, thiserror::Error)]
pub enum SchemaValidationError {
    #[error("no JSON object in completion output")]
    NoJson,
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing field '{0}'")]
    MissingField(&'static str),
    #[error("pattern id must be >= 1, got {0}")]
    NonPositiveId(i64),
    #[error("pattern {0} appears more than once")]
    DuplicatePatternId(u32),
    #[error("pattern {0} has no name")]
    EmptyName(u32),
    #[error("pattern {0} has no indicators")]
    EmptyIndicators(u32),
    #[error("pattern {pattern_id} has unknown severity '{severity}'")]
    UnknownSeverity { pattern_id: u32, severity: String },
    #[error("summary has no segments")]
    EmptySegments,
    #[error("segment {0} appears more than once")]
    DuplicateSegment(u32),
    #[error("reference to unknown segment {0}")]
    UnknownSegment(u32),
    #[error("segment {0} has no outcome")]
    MissingSegmentOutcome(u32),
    #[error("unknown exception kind '{0}'")]
    UnknownException(String),
}

// =============================================================================
// Severity
// =============================================================================

/// Pattern severity. Values outside the vocabulary are kept so they can be
/// reported and ranked last rather than lost.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Unrecognized(String),
}

impl Severity {
    /// Position in the report; lower sorts first.
    pub fn rank(&self) -> u8 {
        match self {
            Severity::Critical => 0,
            Severity::High => 1,
            Severity::Medium => 2,
            Severity::Low => 3,
            Severity::Unrecognized(_) => 4,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Unrecognized(s) => s,
        }
    }
}

impl From<String> for Severity {
    fn from(s: String) -> Self {
        match s.trim().to_lowercase().as_str() {
            "critical" => Severity::Critical,
            "high" => Severity::High,
            "medium" => Severity::Medium,
            "low" => Severity::Low,
            _ => Severity::Unrecognized(s),
        }
    }
}

impl From<Severity> for String {
    fn from(s: Severity) -> Self {
        s.as_str().to_string()
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Typed outputs
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPattern {
    pub pattern_id: u32,
    #[serde(alias = "name")]
    pub pattern_name: String,
    pub description: String,
    pub severity: Severity,
    pub indicators: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternAssignment {
    pub pattern_id: u32,
    pub event_ids: Vec<String>,
}

/// Event ids come back as strings or, when the short id happens to be all
/// digits, as bare integers.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum EventIdValue {
    Text(String),
    Integer(i64),
}

impl From<EventIdValue> for String {
    fn from(v: EventIdValue) -> Self {
        match v {
            EventIdValue::Text(s) => s.trim().to_string(),
            EventIdValue::Integer(i) => i.to_string(),
        }
    }
}

// =============================================================================
// JSON extraction
// =============================================================================

static CODE_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```[a-zA-Z]*\s*(.*?)\s*```$").expect("Invalid code fence regex")
});

/// Extract the first balanced JSON object from a completion, tolerating code
/// fences and surrounding prose.
pub fn extract_json(raw: &str) -> Option<&str> {
    let trimmed = raw.trim();
    let body = CODE_FENCE
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(trimmed);

    let start = body.find('{')?;
    let remainder = &body[start..];
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in remainder.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&remainder[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_json<T: for<'de> Deserialize<'de>>(raw: &str) -> Result<T, SchemaValidationError> {
    let json = extract_json(raw).ok_or(SchemaValidationError::NoJson)?;
    Ok(serde_json::from_str(json)?)
}

// =============================================================================
// Patterns
// =============================================================================

#[derive(Debug, Deserialize)]
struct PatternsJson {
    #[serde(default)]
    patterns: Option<Vec<PatternJson>>,
}

#[derive(Debug, Deserialize)]
struct PatternJson {
    #[serde(default)]
    pattern_id: Option<i64>,
    #[serde(default, alias = "name")]
    pattern_name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    indicators: Option<Vec<String>>,
}

fn positive_id(id: i64) -> Result<u32, SchemaValidationError> {
    if id < 1 {
        return Err(SchemaValidationError::NonPositiveId(id));
    }
    u32::try_from(id).map_err(|_| SchemaValidationError::NonPositiveId(id))
}

/// Parse the output of pattern extraction or combination.
pub fn parse_patterns(raw: &str) -> Result<Vec<RawPattern>, SchemaValidationError> {
    let parsed: PatternsJson = parse_json(raw)?;
    let items = parsed
        .patterns
        .ok_or(SchemaValidationError::MissingField("patterns"))?;

    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let pattern_id = positive_id(
            item.pattern_id
                .ok_or(SchemaValidationError::MissingField("pattern_id"))?,
        )?;
        if !seen.insert(pattern_id) {
            return Err(SchemaValidationError::DuplicatePatternId(pattern_id));
        }

        let pattern_name = item.pattern_name.unwrap_or_default().trim().to_string();
        if pattern_name.is_empty() {
            return Err(SchemaValidationError::EmptyName(pattern_id));
        }

        let indicators: Vec<String> = item
            .indicators
            .unwrap_or_default()
            .into_iter()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if indicators.is_empty() {
            return Err(SchemaValidationError::EmptyIndicators(pattern_id));
        }

        let severity = Severity::from(
            item.severity
                .ok_or(SchemaValidationError::MissingField("severity"))?,
        );
        if let Severity::Unrecognized(s) = severity {
            return Err(SchemaValidationError::UnknownSeverity {
                pattern_id,
                severity: s,
            });
        }

        out.push(RawPattern {
            pattern_id,
            pattern_name,
            description: item.description.unwrap_or_default().trim().to_string(),
            severity,
            indicators,
        });
    }
    Ok(out)
}

// =============================================================================
// Assignments
// =============================================================================

#[derive(Debug, Deserialize)]
struct AssignmentsJson {
    #[serde(default)]
    patterns: Option<Vec<AssignmentJson>>,
}

#[derive(Debug, Deserialize)]
struct AssignmentJson {
    #[serde(default)]
    pattern_id: Option<i64>,
    #[serde(default)]
    event_ids: Option<Vec<EventIdValue>>,
}

/// Parse the output of event assignment. Event ids are coerced to strings;
/// whether they exist is decided later against the event index.
pub fn parse_assignments(raw: &str) -> Result<Vec<PatternAssignment>, SchemaValidationError> {
    let parsed: AssignmentsJson = parse_json(raw)?;
    let items = parsed
        .patterns
        .ok_or(SchemaValidationError::MissingField("patterns"))?;

    items
        .into_iter()
        .map(|item| {
            let pattern_id = positive_id(
                item.pattern_id
                    .ok_or(SchemaValidationError::MissingField("pattern_id"))?,
            )?;
            let event_ids = item
                .event_ids
                .unwrap_or_default()
                .into_iter()
                .map(String::from)
                .filter(|s| !s.is_empty())
                .collect();
            Ok(PatternAssignment {
                pattern_id,
                event_ids,
            })
        })
        .collect()
}

// =============================================================================
// Session summary
// =============================================================================

#[derive(Debug, Deserialize)]
struct SummaryJson {
    #[serde(default)]
    segments: Option<Vec<SegmentJson>>,
    #[serde(default)]
    key_actions: Option<Vec<KeyActionsJson>>,
    #[serde(default)]
    segment_outcomes: Option<Vec<SegmentOutcomeJson>>,
    #[serde(default)]
    session_outcome: Option<SessionOutcomeJson>,
}

#[derive(Debug, Deserialize)]
struct SegmentJson {
    index: u32,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    start_event_id: Option<EventIdValue>,
    #[serde(default)]
    end_event_id: Option<EventIdValue>,
}

#[derive(Debug, Deserialize)]
struct KeyActionsJson {
    segment_index: u32,
    #[serde(default)]
    events: Vec<KeyActionJson>,
}

#[derive(Debug, Deserialize)]
struct KeyActionJson {
    event_id: EventIdValue,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    abandonment: Option<bool>,
    #[serde(default)]
    confusion: Option<bool>,
    #[serde(default)]
    exception: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SegmentOutcomeJson {
    segment_index: u32,
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    summary: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionOutcomeJson {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    description: Option<String>,
}

fn parse_exception(raw: Option<String>) -> Result<Option<ExceptionKind>, SchemaValidationError> {
    let Some(raw) = raw else { return Ok(None) };
    match raw.trim().to_lowercase().replace('_', "-").as_str() {
        "" | "null" | "none" => Ok(None),
        "blocking" => Ok(Some(ExceptionKind::Blocking)),
        "non-blocking" => Ok(Some(ExceptionKind::NonBlocking)),
        _ => Err(SchemaValidationError::UnknownException(raw)),
    }
}

/// Parse and validate a single-session summary against the events that were
/// actually sent. Key actions naming events the session does not contain are
/// dropped; structural problems are errors.
pub fn parse_session_summary(
    raw: &str,
    session: &PreparedSession,
) -> Result<SingleSessionSummary, SchemaValidationError> {
    let parsed: SummaryJson = parse_json(raw)?;

    let mut segments_json = parsed.segments.unwrap_or_default();
    if segments_json.is_empty() {
        return Err(SchemaValidationError::EmptySegments);
    }
    segments_json.sort_by_key(|s| s.index);
    let mut indices = BTreeSet::new();
    for s in &segments_json {
        if !indices.insert(s.index) {
            return Err(SchemaValidationError::DuplicateSegment(s.index));
        }
    }

    let mut outcomes: BTreeMap<u32, SegmentOutcome> = BTreeMap::new();
    for o in parsed.segment_outcomes.unwrap_or_default() {
        if !indices.contains(&o.segment_index) {
            return Err(SchemaValidationError::UnknownSegment(o.segment_index));
        }
        outcomes.insert(
            o.segment_index,
            SegmentOutcome {
                segment_index: o.segment_index,
                success: o.success.unwrap_or(false),
                summary: o.summary.unwrap_or_default().trim().to_string(),
            },
        );
    }
    if let Some(missing) = indices.iter().find(|i| !outcomes.contains_key(i)) {
        return Err(SchemaValidationError::MissingSegmentOutcome(*missing));
    }

    let session_outcome = parsed
        .session_outcome
        .ok_or(SchemaValidationError::MissingField("session_outcome"))?;

    // (position in session, event) per segment
    let mut grouped: BTreeMap<u32, Vec<(usize, KeyActionEvent)>> =
        indices.iter().map(|i| (*i, Vec::new())).collect();
    let mut used = HashSet::new();
    for group in parsed.key_actions.unwrap_or_default() {
        let Some(bucket) = grouped.get_mut(&group.segment_index) else {
            return Err(SchemaValidationError::UnknownSegment(group.segment_index));
        };
        for ka in group.events {
            let event_id = String::from(ka.event_id);
            let Some((pos, event)) = session.find_event(&event_id) else {
                warn!(
                    session_id = %session.session_id,
                    event_id = %event_id,
                    "dropping key action for unknown event"
                );
                continue;
            };
            if !used.insert(event_id.clone()) {
                continue;
            }
            bucket.push((
                pos,
                KeyActionEvent {
                    event_id,
                    event_uuid: event.event_uuid.clone(),
                    session_id: session.session_id.clone(),
                    description: ka.description.unwrap_or_default().trim().to_string(),
                    abandonment: ka.abandonment.unwrap_or(false),
                    confusion: ka.confusion.unwrap_or(false),
                    exception: parse_exception(ka.exception)?,
                    event: event.event.clone(),
                    timestamp: event.timestamp,
                    milliseconds_since_start: event.milliseconds_since_start,
                    current_url: event.current_url.clone(),
                },
            ));
        }
    }

    let mut segments = Vec::with_capacity(segments_json.len());
    let mut key_actions = Vec::with_capacity(segments_json.len());
    for s in segments_json {
        let mut events = grouped.remove(&s.index).unwrap_or_default();
        events.sort_by_key(|(pos, _)| *pos);

        let start_event_id = s.start_event_id.map(String::from).unwrap_or_default();
        let end_event_id = s.end_event_id.map(String::from).unwrap_or_default();
        let meta = segment_meta(session, &start_event_id, &end_event_id, &events);

        segments.push(Segment {
            index: s.index,
            name: s.name.unwrap_or_default().trim().to_string(),
            start_event_id,
            end_event_id,
            meta,
        });
        key_actions.push(SegmentKeyActions {
            segment_index: s.index,
            events: events.into_iter().map(|(_, e)| e).collect(),
        });
    }

    Ok(SingleSessionSummary {
        session_id: session.session_id.clone(),
        segments,
        key_actions,
        segment_outcomes: outcomes.into_values().collect(),
        session_outcome: SessionOutcome {
            success: session_outcome.success.unwrap_or(false),
            description: session_outcome.description.unwrap_or_default().trim().to_string(),
        },
    })
}

/// Segment bounds come from the boundary event ids when they resolve, and
/// from the segment's own key actions otherwise.
fn segment_meta(
    session: &PreparedSession,
    start_event_id: &str,
    end_event_id: &str,
    events: &[(usize, KeyActionEvent)],
) -> SegmentMeta {
    let start = session
        .find_event(start_event_id)
        .map(|(pos, _)| pos)
        .or_else(|| events.first().map(|(pos, _)| *pos));
    let end = session
        .find_event(end_event_id)
        .map(|(pos, _)| pos)
        .or_else(|| events.last().map(|(pos, _)| *pos));

    let (duration_ms, events_count) = match (start, end) {
        (Some(s), Some(e)) if e >= s => {
            let duration = session.events[e].milliseconds_since_start
                - session.events[s].milliseconds_since_start;
            (duration.max(0), e - s + 1)
        }
        _ => (0, 0),
    };

    SegmentMeta {
        duration_ms,
        events_count,
        key_action_count: events.len(),
        failure_count: events.iter().filter(|(_, e)| e.is_failure()).count(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{PreparedEvent, SessionMetadata};
    use chrono::{Duration, TimeZone, Utc};

    fn session() -> PreparedSession {
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let events = ["e1", "e2", "e3", "e4"]
            .iter()
            .enumerate()
            .map(|(i, id)| PreparedEvent {
                event_id: id.to_string(),
                event_uuid: format!("uuid-{id}"),
                event: if i == 2 { "$exception".into() } else { "$pageview".into() },
                timestamp: start + Duration::seconds(i as i64 * 10),
                milliseconds_since_start: i as i64 * 10_000,
                current_url: None,
            })
            .collect();
        PreparedSession {
            session_id: "s1".into(),
            metadata: SessionMetadata {
                start_time: start,
                end_time: start + Duration::seconds(30),
                duration_ms: 30_000,
                distinct_id: None,
            },
            events,
        }
    }

    #[test]
    fn extract_json_handles_fences_prose_and_braces_in_strings() {
        assert_eq!(extract_json("```json\n{\"a\":1}\n```"), Some("{\"a\":1}"));
        assert_eq!(extract_json("Sure! {\"a\":{\"b\":2}} done"), Some("{\"a\":{\"b\":2}}"));
        assert_eq!(extract_json("{\"a\":\"}{\"}"), Some("{\"a\":\"}{\"}"));
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json("{\"unterminated\": 1"), None);
    }

    #[test]
    fn patterns_parse_and_validate() {
        let raw = r#"{"patterns":[{"pattern_id":1,"name":"Checkout errors","description":"d","severity":"HIGH","indicators":["payment failed"," "]}]}"#;
        let patterns = parse_patterns(raw).unwrap();
        assert_eq!(patterns[0].pattern_name, "Checkout errors");
        assert_eq!(patterns[0].severity, Severity::High);
        assert_eq!(patterns[0].indicators, vec!["payment failed"]);
    }

    #[test]
    fn patterns_reject_bad_fields() {
        let empty = r#"{"patterns":[{"pattern_id":1,"pattern_name":"x","severity":"low","indicators":[]}]}"#;
        assert!(matches!(
            parse_patterns(empty),
            Err(SchemaValidationError::EmptyIndicators(1))
        ));

        let severity = r#"{"patterns":[{"pattern_id":2,"pattern_name":"x","severity":"urgent","indicators":["i"]}]}"#;
        assert!(matches!(
            parse_patterns(severity),
            Err(SchemaValidationError::UnknownSeverity { pattern_id: 2, .. })
        ));

        let zero = r#"{"patterns":[{"pattern_id":0,"pattern_name":"x","severity":"low","indicators":["i"]}]}"#;
        assert!(matches!(
            parse_patterns(zero),
            Err(SchemaValidationError::NonPositiveId(0))
        ));

        let dup = r#"{"patterns":[
            {"pattern_id":1,"pattern_name":"x","severity":"low","indicators":["i"]},
            {"pattern_id":1,"pattern_name":"y","severity":"low","indicators":["i"]}]}"#;
        assert!(matches!(
            parse_patterns(dup),
            Err(SchemaValidationError::DuplicatePatternId(1))
        ));

        assert!(matches!(
            parse_patterns("{}"),
            Err(SchemaValidationError::MissingField("patterns"))
        ));
    }

    #[test]
    fn assignments_coerce_integer_event_ids() {
        let raw = r#"{"patterns":[{"pattern_id":3,"event_ids":["abc", 1234, ""]}]}"#;
        let a = parse_assignments(raw).unwrap();
        assert_eq!(a[0].pattern_id, 3);
        assert_eq!(a[0].event_ids, vec!["abc", "1234"]);
    }

    #[test]
    fn severity_ranks_unknown_last() {
        assert!(Severity::Critical.rank() < Severity::High.rank());
        assert!(Severity::Low.rank() < Severity::Unrecognized("x".into()).rank());
        let json = serde_json::to_string(&Severity::Medium).unwrap();
        assert_eq!(json, "\"medium\"");
    }

    #[test]
    fn summary_validates_and_computes_meta() {
        let raw = r#"{
            "segments":[
                {"index":1,"name":"Pay","start_event_id":"e3","end_event_id":"e4"},
                {"index":0,"name":"Browse","start_event_id":"e1","end_event_id":"e2"}],
            "key_actions":[
                {"segment_index":1,"events":[
                    {"event_id":"e4","description":"gave up","abandonment":true},
                    {"event_id":"e3","description":"card error","exception":"non_blocking"},
                    {"event_id":"zz","description":"invented"}]},
                {"segment_index":0,"events":[{"event_id":"e1","description":"landed"}]}],
            "segment_outcomes":[
                {"segment_index":0,"success":true,"summary":"ok"},
                {"segment_index":1,"success":false,"summary":"failed"}],
            "session_outcome":{"success":false,"description":"did not pay"}
        }"#;
        let summary = parse_session_summary(raw, &session()).unwrap();

        assert_eq!(summary.segments[0].name, "Browse");
        let pay = summary.segment(1).unwrap();
        assert_eq!(pay.meta.duration_ms, 10_000);
        assert_eq!(pay.meta.events_count, 2);
        assert_eq!(pay.meta.key_action_count, 2);
        assert_eq!(pay.meta.failure_count, 2);

        let pay_events = &summary.key_actions[1].events;
        assert_eq!(pay_events[0].event_id, "e3");
        assert_eq!(pay_events[0].exception, Some(ExceptionKind::NonBlocking));
        assert_eq!(pay_events[0].event_uuid, "uuid-e3");
        assert_eq!(summary.key_action_events().count(), 3);
    }

    #[test]
    fn summary_structural_errors() {
        let missing_outcome = r#"{"segments":[{"index":0,"name":"a"}],
            "segment_outcomes":[],"session_outcome":{"success":true}}"#;
        assert!(matches!(
            parse_session_summary(missing_outcome, &session()),
            Err(SchemaValidationError::MissingSegmentOutcome(0))
        ));

        let unknown = r#"{"segments":[{"index":0,"name":"a"}],
            "key_actions":[{"segment_index":5,"events":[]}],
            "segment_outcomes":[{"segment_index":0,"success":true}],
            "session_outcome":{"success":true}}"#;
        assert!(matches!(
            parse_session_summary(unknown, &session()),
            Err(SchemaValidationError::UnknownSegment(5))
        ));

        let dup = r#"{"segments":[{"index":0},{"index":0}],"session_outcome":{}}"#;
        assert!(matches!(
            parse_session_summary(dup, &session()),
            Err(SchemaValidationError::DuplicateSegment(0))
        ));

        assert!(matches!(
            parse_session_summary(r#"{"segments":[]}"#, &session()),
            Err(SchemaValidationError::EmptySegments)
        ));
    }
}
