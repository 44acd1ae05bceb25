//! Pattern enrichment: turns raw patterns plus raw event assignments into a
//! vetted, ranked report.
//!
//! Pure and in-process. Everything needed is already inside the session
//! summaries; no completion or store calls happen here.
//!
//! # Steps
//!
//! 1. Index every key action as `event_id -> (event_uuid, session_id)`.
//! 2. Resolve each assigned event to its segment context: segment name and
//!    outcome plus up to three neighbours on each side, never crossing a
//!    segment boundary.
//! 3. Drop events classified as non-blocking exceptions. A pattern left with
//!    nothing but such events is benign-empty: excluded from the report but
//!    counted as a success by the quality gate.
//! 4. Compute per-pattern stats.
//! 5. Quality gate: fail the run when too few patterns survived.
//! 6. Stable sort by severity.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::schema::{PatternAssignment, RawPattern};
use crate::session::{ExceptionKind, KeyActionEvent, SingleSessionSummary};

/// Number of neighbouring key actions kept on each side of an event.
pub const CONTEXT_EVENTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error(
    "quality gate failed: {successful} of {input} patterns usable ({failed} failed), \
     at least {minimum_expected} required"
)]
pub struct QualityGateError {
    pub input: usize,
    pub successful: usize,
    pub failed: usize,
    pub minimum_expected: usize,
}

// =============================================================================
// Output types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSegmentContext {
    pub target_event: KeyActionEvent,
    pub previous_events: Vec<KeyActionEvent>,
    pub next_events: Vec<KeyActionEvent>,
    pub segment_index: u32,
    pub segment_name: String,
    pub segment_outcome: String,
    pub segment_success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternStats {
    pub occurrences: usize,
    pub sessions_affected: usize,
    pub sessions_affected_ratio: f64,
    pub segments_success_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedPattern {
    #[serde(flatten)]
    pub pattern: RawPattern,
    pub events: Vec<EventSegmentContext>,
    pub stats: PatternStats,
}

/// What the result store persists for a completed group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternReport {
    pub patterns: Vec<EnrichedPattern>,
    pub total_sessions: usize,
    pub raw_pattern_count: usize,
    /// Patterns whose events were all non-blocking exceptions.
    pub benign_empty: Vec<u32>,
    /// Patterns left without any resolvable event.
    pub failed: Vec<u32>,
    /// Assigned event ids that matched no key action.
    pub dropped_event_ids: usize,
}

// =============================================================================
// Index and context
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedEvent {
    pub event_uuid: String,
    pub session_id: String,
}

/// `event_id -> (event_uuid, session_id)` over every key action in the group.
#[derive(Debug, Default)]
pub struct EventIndex {
    events: HashMap<String, IndexedEvent>,
}

impl EventIndex {
    pub fn build(summaries: &[SingleSessionSummary]) -> Self {
        let mut events: HashMap<String, IndexedEvent> = HashMap::new();
        for summary in summaries {
            for event in summary.key_action_events() {
                if let Some(existing) = events.get(&event.event_id) {
                    warn!(
                        event_id = %event.event_id,
                        first_session = %existing.session_id,
                        session_id = %summary.session_id,
                        "event id collides across sessions; keeping first"
                    );
                    continue;
                }
                events.insert(
                    event.event_id.clone(),
                    IndexedEvent {
                        event_uuid: event.event_uuid.clone(),
                        session_id: summary.session_id.clone(),
                    },
                );
            }
        }
        Self { events }
    }

    pub fn get(&self, event_id: &str) -> Option<&IndexedEvent> {
        self.events.get(event_id)
    }
}

/// Context of `event_id` inside its own segment of `summary`.
pub fn event_context(summary: &SingleSessionSummary, event_id: &str) -> Option<EventSegmentContext> {
    let (group, pos) = summary.key_actions.iter().find_map(|group| {
        group
            .events
            .iter()
            .position(|e| e.event_id == event_id)
            .map(|pos| (group, pos))
    })?;

    let events = &group.events;
    let before = pos.saturating_sub(CONTEXT_EVENTS);
    let after = (pos + 1 + CONTEXT_EVENTS).min(events.len());
    let segment = summary.segment(group.segment_index);
    let outcome = summary.outcome(group.segment_index);

    Some(EventSegmentContext {
        target_event: events[pos].clone(),
        previous_events: events[before..pos].to_vec(),
        next_events: events[pos + 1..after].to_vec(),
        segment_index: group.segment_index,
        segment_name: segment.map(|s| s.name.clone()).unwrap_or_default(),
        segment_outcome: outcome.map(|o| o.summary.clone()).unwrap_or_default(),
        segment_success: outcome.map(|o| o.success).unwrap_or(false),
    })
}

// =============================================================================
// Stats, gate, ranking
// =============================================================================

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

pub fn compute_stats(events: &[EventSegmentContext], total_sessions: usize) -> PatternStats {
    let sessions: BTreeSet<&str> = events
        .iter()
        .map(|e| e.target_event.session_id.as_str())
        .collect();

    let mut segments: BTreeMap<(&str, u32), bool> = BTreeMap::new();
    for e in events {
        segments.insert(
            (e.target_event.session_id.as_str(), e.segment_index),
            e.segment_success,
        );
    }

    let sessions_affected_ratio = if total_sessions == 0 {
        0.0
    } else {
        (sessions.len() as f64 / total_sessions as f64).min(1.0)
    };
    let segments_success_ratio = if segments.is_empty() {
        0.0
    } else {
        segments.values().filter(|s| **s).count() as f64 / segments.len() as f64
    };

    PatternStats {
        occurrences: events.len(),
        sessions_affected: sessions.len(),
        sessions_affected_ratio: round2(sessions_affected_ratio),
        segments_success_ratio: round2(segments_success_ratio),
    }
}

/// `max(1, floor(input * ratio))`.
pub fn minimum_expected(input: usize, min_success_ratio: f64) -> usize {
    let raw = (input as f64 * min_success_ratio.clamp(0.0, 1.0) + 1e-9).floor() as usize;
    raw.max(1)
}

pub fn check_quality_gate(
    input: usize,
    successful: usize,
    failed: usize,
    min_success_ratio: f64,
) -> Result<(), QualityGateError> {
    let minimum_expected = minimum_expected(input, min_success_ratio);
    if successful < minimum_expected {
        return Err(QualityGateError {
            input,
            successful,
            failed,
            minimum_expected,
        });
    }
    Ok(())
}

/// Stable sort, critical first, unrecognized severities last.
pub fn rank_by_severity(patterns: &mut [EnrichedPattern]) {
    patterns.sort_by_key(|p| p.pattern.severity.rank());
}

/// Concatenate assignments from all units, keyed by pattern id.
pub fn merge_assignments<I>(units: I) -> BTreeMap<u32, Vec<String>>
where
    I: IntoIterator<Item = PatternAssignment>,
{
    let mut merged: BTreeMap<u32, Vec<String>> = BTreeMap::new();
    for assignment in units {
        merged
            .entry(assignment.pattern_id)
            .or_default()
            .extend(assignment.event_ids);
    }
    merged
}

// =============================================================================
// Pipeline
// =============================================================================

pub struct EnrichmentInput<'a> {
    pub patterns: &'a [RawPattern],
    pub assignments: BTreeMap<u32, Vec<String>>,
    pub summaries: &'a [SingleSessionSummary],
    /// Denominator of `sessions_affected_ratio`.
    pub total_sessions: usize,
    pub min_success_ratio: f64,
}

pub fn enrich_patterns(input: EnrichmentInput<'_>) -> Result<PatternReport, QualityGateError> {
    let EnrichmentInput {
        patterns,
        mut assignments,
        summaries,
        total_sessions,
        min_success_ratio,
    } = input;

    let index = EventIndex::build(summaries);
    let by_session: HashMap<&str, &SingleSessionSummary> = summaries
        .iter()
        .map(|s| (s.session_id.as_str(), s))
        .collect();

    let known: HashSet<u32> = patterns.iter().map(|p| p.pattern_id).collect();
    for unknown in assignments.keys().filter(|id| !known.contains(id)) {
        warn!(pattern_id = unknown, "assignment names unknown pattern; dropping");
    }

    let mut enriched = Vec::new();
    let mut benign_empty = Vec::new();
    let mut failed = Vec::new();
    let mut dropped_event_ids = 0usize;

    for pattern in patterns {
        let event_ids = assignments.remove(&pattern.pattern_id).unwrap_or_default();
        let mut seen = HashSet::new();
        let mut contexts = Vec::new();

        for event_id in event_ids {
            if !seen.insert(event_id.clone()) {
                continue;
            }
            let context = index
                .get(&event_id)
                .and_then(|indexed| by_session.get(indexed.session_id.as_str()))
                .and_then(|summary| event_context(summary, &event_id));
            match context {
                Some(ctx) => contexts.push(ctx),
                None => {
                    warn!(
                        pattern_id = pattern.pattern_id,
                        event_id = %event_id,
                        "assigned event not found in any session; dropping"
                    );
                    dropped_event_ids += 1;
                }
            }
        }

        if contexts.is_empty() {
            debug!(pattern_id = pattern.pattern_id, "pattern has no events");
            failed.push(pattern.pattern_id);
            continue;
        }

        contexts.retain(|c| c.target_event.exception != Some(ExceptionKind::NonBlocking));
        if contexts.is_empty() {
            debug!(pattern_id = pattern.pattern_id, "pattern only had non-blocking events");
            benign_empty.push(pattern.pattern_id);
            continue;
        }

        let stats = compute_stats(&contexts, total_sessions);
        enriched.push(EnrichedPattern {
            pattern: pattern.clone(),
            events: contexts,
            stats,
        });
    }

    check_quality_gate(
        patterns.len(),
        enriched.len() + benign_empty.len(),
        failed.len(),
        min_success_ratio,
    )?;

    rank_by_severity(&mut enriched);

    Ok(PatternReport {
        patterns: enriched,
        total_sessions,
        raw_pattern_count: patterns.len(),
        benign_empty,
        failed,
        dropped_event_ids,
    })
}
