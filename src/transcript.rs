use std::path::Path;

use serde_json::Value;

use crate::error::{PipelineError, Result};

/// Rough token estimate used for all budget math. Assistant transcripts
/// are mostly prose and code, where four bytes per token is a workable
/// planning constant.
pub const BYTES_PER_TOKEN: usize = 4;

pub fn estimate_tokens(text: &str) -> usize {
    text.len() / BYTES_PER_TOKEN
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
    Tool,
    System,
    Unknown,
}

impl Role {
    fn from_record_type(record_type: &str) -> Role {
        match record_type {
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "system" => Role::System,
            "tool" | "tool_use" | "tool_result" => Role::Tool,
            _ => Role::Unknown,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
            Role::System => "System",
            Role::Unknown => "Unknown",
        }
    }
}

/// One turn of the conversation after normalization. Ordinals are
/// assigned in source order and are gap-free across the whole transcript,
/// so truncation decisions can be expressed as "drop the oldest N".
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationEvent {
    pub role: Role,
    pub ordinal: usize,
    pub text: String,
    pub malformed: bool,
}

impl ConversationEvent {
    /// Markdown block for this event. Malformed placeholders keep their
    /// position in the event list but contribute no prompt text.
    pub fn render(&self) -> String {
        if self.malformed {
            return String::new();
        }
        format!("## {}\n\n{}\n\n", self.role.label(), self.text)
    }
}

#[derive(Debug, Clone)]
pub struct Transcript {
    pub session_id: String,
    pub events: Vec<ConversationEvent>,
}

impl Transcript {
    pub fn malformed_count(&self) -> usize {
        self.events.iter().filter(|e| e.malformed).count()
    }

    pub fn estimated_tokens(&self) -> usize {
        self.events
            .iter()
            .map(|e| estimate_tokens(&e.render()))
            .sum()
    }

    /// Human-readable rendering, served by the transcript endpoint.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        out.push_str("# Transcript\n\n");
        out.push_str(&format!("Session: {}\n\n---\n\n", self.session_id));
        for event in &self.events {
            out.push_str(&event.render());
        }
        out
    }
}

/// Reads and normalizes one session log. An unreadable file is a fatal
/// per-job error; individual bad lines inside a readable file are not.
pub fn load(session_id: &str, path: &Path) -> Result<Transcript> {
    let raw = std::fs::read_to_string(path).map_err(|source| PipelineError::SessionUnreadable {
        id: session_id.to_string(),
        source,
    })?;
    Ok(normalize(session_id, &raw))
}

/// Turns raw JSONL into an ordered event list.
///
/// Lines that fail to parse, or parse to something other than an object,
/// become malformed placeholder events so that downstream consumers can
/// see how much of the log was unusable. Records that parse cleanly but
/// carry no text are dropped entirely.
pub fn normalize(session_id: &str, raw: &str) -> Transcript {
    let mut events = Vec::new();
    let mut ordinal = 0;

    for (line_no, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record = match serde_json::from_str::<Value>(line) {
            Ok(value) if value.is_object() => value,
            Ok(_) | Err(_) => {
                tracing::warn!(
                    session = session_id,
                    line = line_no + 1,
                    "skipping malformed transcript record"
                );
                events.push(ConversationEvent {
                    role: Role::Unknown,
                    ordinal,
                    text: String::new(),
                    malformed: true,
                });
                ordinal += 1;
                continue;
            }
        };

        let role = record
            .get("type")
            .and_then(Value::as_str)
            .map(Role::from_record_type)
            .unwrap_or(Role::Unknown);

        let text = extract_text(&record);
        if text.is_empty() {
            continue;
        }

        events.push(ConversationEvent {
            role,
            ordinal,
            text,
            malformed: false,
        });
        ordinal += 1;
    }

    Transcript {
        session_id: session_id.to_string(),
        events,
    }
}

/// Pulls the human-visible text out of a record. Content is either a
/// plain string or a list of blocks; only string entries and `text`
/// blocks carry prose, everything else (tool invocations, images) is
/// structural and skipped.
fn extract_text(record: &Value) -> String {
    let Some(content) = record.get("message").and_then(|m| m.get("content")) else {
        return String::new();
    };

    match content {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => {
            let parts: Vec<&str> = blocks
                .iter()
                .filter_map(|block| match block {
                    Value::String(text) => Some(text.as_str()),
                    other => {
                        if let Some(kind) = other.get("type").and_then(Value::as_str)
                            && kind == "text"
                        {
                            other
                                .get("text")
                                .and_then(Value::as_str)
                                .filter(|text| !text.is_empty())
                        } else {
                            None
                        }
                    }
                })
                .collect();
            parts.join("\n")
        }
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_line(text: &str) -> String {
        format!(r#"{{"type":"user","message":{{"content":"{text}"}}}}"#)
    }

    fn assistant_line(text: &str) -> String {
        format!(
            r#"{{"type":"assistant","message":{{"content":[{{"type":"text","text":"{text}"}}]}}}}"#
        )
    }

    #[test]
    fn normalizes_roles_and_assigns_gap_free_ordinals() {
        let raw = [
            user_line("fix the flaky test"),
            assistant_line("reading the test first"),
            r#"{"type":"tool_result","message":{"content":"test output"}}"#.to_string(),
            r#"{"type":"shrug","message":{"content":"??"}}"#.to_string(),
        ]
        .join("\n");

        let transcript = normalize("abc123", &raw);

        assert_eq!(transcript.events.len(), 4);
        let roles: Vec<Role> = transcript.events.iter().map(|e| e.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool, Role::Unknown]);
        let ordinals: Vec<usize> = transcript.events.iter().map(|e| e.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2, 3]);
    }

    #[test]
    fn malformed_lines_become_placeholders_and_keep_their_position() {
        let raw = format!(
            "{}\nnot json at all\n{}",
            user_line("start"),
            user_line("end")
        );

        let transcript = normalize("abc123", &raw);

        assert_eq!(transcript.events.len(), 3);
        assert!(transcript.events[1].malformed);
        assert_eq!(transcript.events[1].text, "");
        assert_eq!(transcript.events[1].render(), "");
        assert_eq!(transcript.malformed_count(), 1);

        let ordinals: Vec<usize> = transcript.events.iter().map(|e| e.ordinal).collect();
        assert_eq!(ordinals, vec![0, 1, 2]);
    }

    #[test]
    fn valid_json_that_is_not_an_object_counts_as_malformed() {
        let transcript = normalize("abc123", "42\n[1,2,3]");

        assert_eq!(transcript.events.len(), 2);
        assert!(transcript.events.iter().all(|e| e.malformed));
    }

    #[test]
    fn records_without_text_are_dropped_without_consuming_ordinals() {
        let raw = [
            user_line("hello"),
            r#"{"type":"summary","summary":"compacted"}"#.to_string(),
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"bash"}]}}"#
                .to_string(),
            user_line("still here"),
        ]
        .join("\n");

        let transcript = normalize("abc123", &raw);

        assert_eq!(transcript.events.len(), 2);
        assert_eq!(transcript.events[0].text, "hello");
        assert_eq!(transcript.events[1].text, "still here");
        assert_eq!(transcript.events[1].ordinal, 1);
    }

    #[test]
    fn blank_lines_are_ignored() {
        let raw = format!("\n\n{}\n   \n{}\n", user_line("a"), user_line("b"));

        let transcript = normalize("abc123", &raw);

        assert_eq!(transcript.events.len(), 2);
    }

    #[test]
    fn text_blocks_are_joined_and_structural_blocks_skipped() {
        let raw = concat!(
            r#"{"type":"assistant","message":{"content":["#,
            r#"{"type":"text","text":"first"},"#,
            r#"{"type":"tool_use","name":"bash","input":{}},"#,
            r#"{"type":"text","text":""},"#,
            r#"{"type":"text","text":"second"}"#,
            r#"]}}"#
        );

        let transcript = normalize("abc123", raw);

        assert_eq!(transcript.events.len(), 1);
        assert_eq!(transcript.events[0].text, "first\nsecond");
    }

    #[test]
    fn events_render_as_role_headed_blocks() {
        let event = ConversationEvent {
            role: Role::User,
            ordinal: 0,
            text: "do the thing".into(),
            malformed: false,
        };

        assert_eq!(event.render(), "## User\n\ndo the thing\n\n");
    }

    #[test]
    fn markdown_rendering_carries_the_session_header() {
        let transcript = normalize("abc123", &user_line("hello"));
        let rendered = transcript.to_markdown();

        assert!(rendered.starts_with("# Transcript\n\nSession: abc123\n\n---\n\n"));
        assert!(rendered.contains("## User\n\nhello\n\n"));
    }

    #[test]
    fn unreadable_file_maps_to_session_unreadable() {
        let err = load("abc123", Path::new("/nonexistent/abc123.jsonl")).unwrap_err();

        match err {
            PipelineError::SessionUnreadable { id, .. } => assert_eq!(id, "abc123"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn token_estimate_uses_four_bytes_per_token() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens(&"x".repeat(4000)), 1000);
    }
}
