//! Prompt templates for the four completion tasks.
//!
//! Rendering is provider-agnostic. Every value that originates from recorded
//! sessions or LLM output is XML-escaped before it lands inside a tag.

use crate::gateway::Message;
use crate::schema::RawPattern;
use crate::session::{PreparedSession, SingleSessionSummary};

/// Rendered prompt ready for the gateway.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub template_slug: String,
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

/// Escape XML special characters to prevent prompt injection via tag breaking.
pub(crate) fn escape_xml_chars(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Field values inside `|`-separated lines must not contain the separator or newlines.
fn line_field(s: &str) -> String {
    escape_xml_chars(s).replace(['|', '\n', '\r'], " ")
}

/// A prompt template with `{placeholder}` slots.
#[derive(Debug, Clone, Copy)]
pub struct PromptTemplate {
    pub slug: &'static str,
    pub system: &'static str,
    pub user: &'static str,
}

impl PromptTemplate {
    /// Substitutes already-escaped values into the user template.
    fn fill(&self, vars: &[(&str, String)]) -> PromptInstance {
        let mut user = self.user.to_string();
        for (name, value) in vars {
            user = user.replace(&format!("{{{name}}}"), value);
        }
        PromptInstance {
            template_slug: self.slug.to_string(),
            system: self.system.trim().to_string(),
            user: user.trim().to_string(),
        }
    }
}

fn focus_block(extra_context: Option<&str>) -> String {
    match extra_context.map(str::trim).filter(|s| !s.is_empty()) {
        Some(focus) => format!("<focus>\n{}\n</focus>\n", escape_xml_chars(focus)),
        None => String::new(),
    }
}

// =============================================================================
// Task templates
// =============================================================================

pub const SUMMARIZE_SESSION: PromptTemplate = PromptTemplate {
    slug: "summarize_session_v1",
    system: r#"You analyze one recorded product session. Split it into contiguous segments, pick the key actions of each segment, judge whether each segment reached its goal, and judge the session overall.

Flag a key action with abandonment when the user gives up on a flow, confusion when they hesitate or loop, and exception "blocking" or "non-blocking" when an error occurs (null otherwise).
Only reference event_id values that appear in the events list.

Output only JSON:
{"segments":[{"index":0,"name":"...","start_event_id":"...","end_event_id":"..."}],
 "key_actions":[{"segment_index":0,"events":[{"event_id":"...","description":"...","abandonment":false,"confusion":false,"exception":null}]}],
 "segment_outcomes":[{"segment_index":0,"success":true,"summary":"..."}],
 "session_outcome":{"success":true,"description":"..."}}"#,
    user: r#"<session_id>{session_id}</session_id>
<duration_ms>{duration_ms}</duration_ms>
{focus}<events>
event_id|timestamp|event|url
{events}
</events>

json:"#,
};

pub const EXTRACT_PATTERNS: PromptTemplate = PromptTemplate {
    slug: "extract_patterns_v1",
    system: r#"You read summaries of several product sessions and find behavioral patterns that recur across sessions: shared failures, friction points, workarounds.

Each pattern needs a positive integer pattern_id, a short pattern_name, a description, a severity (one of "low", "medium", "high", "critical") and a non-empty list of indicators describing how to recognize it.

Output only JSON:
{"patterns":[{"pattern_id":1,"pattern_name":"...","description":"...","severity":"high","indicators":["..."]}]}"#,
    user: r#"{focus}<sessions>
{sessions}
</sessions>

json:"#,
};

pub const COMBINE_PATTERNS: PromptTemplate = PromptTemplate {
    slug: "combine_patterns_v1",
    system: r#"You receive pattern lists extracted independently from different groups of sessions. Merge patterns that describe the same behavior, keep distinct ones, and renumber pattern_id from 1.

Keep the same fields and severity vocabulary ("low", "medium", "high", "critical"); indicators must stay non-empty.

Output only JSON:
{"patterns":[{"pattern_id":1,"pattern_name":"...","description":"...","severity":"high","indicators":["..."]}]}"#,
    user: r#"{focus}<pattern_lists>
{pattern_lists}
</pattern_lists>

json:"#,
};

pub const ASSIGN_EVENTS: PromptTemplate = PromptTemplate {
    slug: "assign_events_v1",
    system: r#"You match key actions from recorded sessions to known behavioral patterns. For each pattern, list the event_id of every key action that is an instance of it. A key action may belong to several patterns or to none.

Only use pattern_id values from the patterns list and event_id values from the key actions list.

Output only JSON:
{"patterns":[{"pattern_id":1,"event_ids":["..."]}]}"#,
    user: r#"<patterns>
{patterns}
</patterns>
<key_actions>
event_id|session_id|segment_index|description|flags
{key_actions}
</key_actions>

json:"#,
};

pub const TEMPLATES: &[PromptTemplate] =
    &[SUMMARIZE_SESSION, EXTRACT_PATTERNS, COMBINE_PATTERNS, ASSIGN_EVENTS];

pub fn template_by_slug(slug: &str) -> Option<PromptTemplate> {
    TEMPLATES.iter().find(|t| t.slug == slug).copied()
}

// =============================================================================
// Rendering
// =============================================================================

pub fn render_summarize_session(
    session: &PreparedSession,
    extra_context: Option<&str>,
) -> PromptInstance {
    let events = session
        .events
        .iter()
        .map(|e| {
            format!(
                "{}|{}|{}|{}",
                e.event_id,
                e.timestamp.to_rfc3339(),
                line_field(&e.event),
                line_field(e.current_url.as_deref().unwrap_or("")),
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    SUMMARIZE_SESSION.fill(&[
        ("session_id", escape_xml_chars(&session.session_id)),
        ("duration_ms", session.metadata.duration_ms.to_string()),
        ("focus", focus_block(extra_context)),
        ("events", events),
    ])
}

/// Compact text form of one summary as sent for extraction. Chunking
/// estimates tokens over exactly this text.
pub fn summary_block(summary: &SingleSessionSummary) -> String {
    let mut out = format!(
        "<session id=\"{}\" success=\"{}\">\n{}\n",
        escape_xml_chars(&summary.session_id),
        summary.session_outcome.success,
        escape_xml_chars(&summary.session_outcome.description),
    );
    for segment in &summary.segments {
        let outcome = summary.outcome(segment.index);
        out.push_str(&format!(
            "<segment index=\"{}\" name=\"{}\" success=\"{}\">{}\n",
            segment.index,
            escape_xml_chars(&segment.name),
            outcome.map(|o| o.success).unwrap_or(false),
            outcome.map(|o| escape_xml_chars(&o.summary)).unwrap_or_default(),
        ));
        for ka in summary
            .key_actions
            .iter()
            .filter(|ka| ka.segment_index == segment.index)
            .flat_map(|ka| ka.events.iter())
        {
            out.push_str(&format!(
                "- {}{}\n",
                escape_xml_chars(&ka.description),
                flags(ka.abandonment, ka.confusion, ka.exception.is_some()),
            ));
        }
        out.push_str("</segment>\n");
    }
    out.push_str("</session>");
    out
}

fn flags(abandonment: bool, confusion: bool, exception: bool) -> String {
    let mut f = Vec::new();
    if abandonment {
        f.push("abandonment");
    }
    if confusion {
        f.push("confusion");
    }
    if exception {
        f.push("exception");
    }
    if f.is_empty() {
        String::new()
    } else {
        format!(" [{}]", f.join(","))
    }
}

pub fn render_extract_patterns(
    summaries: &[SingleSessionSummary],
    extra_context: Option<&str>,
) -> PromptInstance {
    let sessions = summaries
        .iter()
        .map(summary_block)
        .collect::<Vec<_>>()
        .join("\n");
    EXTRACT_PATTERNS.fill(&[("focus", focus_block(extra_context)), ("sessions", sessions)])
}

/// JSON keeps its quotes; only tag delimiters are escaped.
fn patterns_json(patterns: &[RawPattern]) -> String {
    let value = serde_json::json!({ "patterns": patterns });
    value
        .to_string()
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

pub fn render_combine_patterns(
    lists: &[Vec<RawPattern>],
    extra_context: Option<&str>,
) -> PromptInstance {
    let pattern_lists = lists
        .iter()
        .enumerate()
        .map(|(i, list)| format!("<list index=\"{i}\">{}</list>", patterns_json(list)))
        .collect::<Vec<_>>()
        .join("\n");
    COMBINE_PATTERNS.fill(&[
        ("focus", focus_block(extra_context)),
        ("pattern_lists", pattern_lists),
    ])
}

pub fn render_assign_events(
    patterns: &[RawPattern],
    summaries: &[SingleSessionSummary],
) -> PromptInstance {
    let key_actions = summaries
        .iter()
        .flat_map(|s| {
            s.key_actions.iter().flat_map(move |ka| {
                ka.events.iter().map(move |e| {
                    format!(
                        "{}|{}|{}|{}|{}",
                        e.event_id,
                        line_field(&s.session_id),
                        ka.segment_index,
                        line_field(&e.description),
                        flags(e.abandonment, e.confusion, e.exception.is_some()).trim(),
                    )
                })
            })
        })
        .collect::<Vec<_>>()
        .join("\n");
    ASSIGN_EVENTS.fill(&[("patterns", patterns_json(patterns)), ("key_actions", key_actions)])
}
