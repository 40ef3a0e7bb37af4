//! Wire format for the protocol events a runner's stdout emits (§4.6,
//! §6). A line is a protocol event only if, after trimming, it begins
//! with the literal prefix `NIBBLER_EVENT `; the payload is the first
//! balanced brace-delimited JSON object on the line.

use serde::{Deserialize, Serialize};
use serde_json::Value;

const EVENT_PREFIX: &str = "NIBBLER_EVENT ";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum NibblerEvent {
    #[serde(rename = "PHASE_COMPLETE")]
    PhaseComplete { summary: Option<String> },
    #[serde(rename = "NEEDS_ESCALATION")]
    NeedsEscalation {
        reason: Option<String>,
        context: Option<Value>,
    },
    #[serde(rename = "EXCEPTION")]
    Exception {
        reason: Option<String>,
        impact: Option<String>,
    },
    #[serde(rename = "QUESTION")]
    Question { text: String },
    #[serde(rename = "QUESTIONS")]
    Questions { questions: Vec<String> },
}

impl NibblerEvent {
    /// Terminal events end `waitForCompletion`'s wait loop; QUESTION(S)
    /// are informational and keep the session alive.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NibblerEvent::PhaseComplete { .. }
                | NibblerEvent::NeedsEscalation { .. }
                | NibblerEvent::Exception { .. }
        )
    }
}

/// Finds the first balanced `{...}` substring starting at `start`.
fn first_balanced_object(s: &str, start: usize) -> Option<&str> {
    let bytes = s.as_bytes();
    if bytes.get(start) != Some(&b'{') {
        return None;
    }
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

fn unescape_pass(s: &str) -> String {
    s.replace("\\\"", "\"")
        .replace("\\n", "\n")
        .replace("\\r", "\r")
        .replace("\\t", "\t")
        .replace("\\\\", "\\")
}

/// Parses a single output line as a protocol event, per the §4.6/§6
/// wire format. Returns `None` for any line that doesn't start with the
/// event prefix or doesn't contain a parseable event object — including
/// a reference to "NIBBLER_EVENT" embedded inside a user prompt string,
/// since that never appears at the start of a trimmed line.
pub fn parse_event_line(line: &str) -> Option<NibblerEvent> {
    let trimmed = line.trim();
    let rest = trimmed.strip_prefix(EVENT_PREFIX)?;
    let object = first_balanced_object(rest, 0)?;

    if let Ok(ev) = serde_json::from_str::<NibblerEvent>(object) {
        return Some(ev);
    }
    let unescaped = unescape_pass(object);
    serde_json::from_str::<NibblerEvent>(&unescaped).ok()
}

/// A runner may wrap its own output in a higher-level streaming-JSON
/// envelope (e.g. `{"type":"assistant","message":{"content":[...]}}`).
/// Extracts any embedded text fields and re-scans each of their lines
/// for protocol events.
pub fn scan_envelope_for_events(line: &str) -> Vec<NibblerEvent> {
    let trimmed = line.trim();
    let Ok(envelope) = serde_json::from_str::<Value>(trimmed) else {
        return Vec::new();
    };

    let mut texts = Vec::new();
    collect_text_fields(&envelope, &mut texts);

    texts
        .iter()
        .flat_map(|t| t.lines())
        .filter_map(parse_event_line)
        .collect()
}

fn collect_text_fields(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(text)) = map.get("text") {
                out.push(text.clone());
            }
            for v in map.values() {
                collect_text_fields(v, out);
            }
        }
        Value::Array(items) => {
            for v in items {
                collect_text_fields(v, out);
            }
        }
        _ => {}
    }
}

/// Scans a raw output line for a protocol event, trying the direct
/// `NIBBLER_EVENT ` prefix first and falling back to envelope
/// extraction.
pub fn scan_line(line: &str) -> Vec<NibblerEvent> {
    if let Some(ev) = parse_event_line(line) {
        return vec![ev];
    }
    scan_envelope_for_events(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_phase_complete() {
        let line = r#"NIBBLER_EVENT {"type":"PHASE_COMPLETE","summary":"done"}"#;
        let ev = parse_event_line(line).unwrap();
        assert_eq!(ev, NibblerEvent::PhaseComplete { summary: Some("done".into()) });
        assert!(ev.is_terminal());
    }

    #[test]
    fn ignores_non_prefixed_lines() {
        assert!(parse_event_line("some random log line").is_none());
        assert!(parse_event_line("talking about NIBBLER_EVENT in prose").is_none());
    }

    #[test]
    fn parses_with_trailing_text_after_object() {
        let line = r#"NIBBLER_EVENT {"type":"QUESTION","text":"ok?"} trailing noise"#;
        let ev = parse_event_line(line).unwrap();
        assert_eq!(ev, NibblerEvent::Question { text: "ok?".into() });
        assert!(!ev.is_terminal());
    }

    #[test]
    fn unescape_pass_recovers_from_double_encoding() {
        let line = "NIBBLER_EVENT {\\\"type\\\":\\\"PHASE_COMPLETE\\\",\\\"summary\\\":null}";
        let ev = parse_event_line(line).unwrap();
        assert_eq!(ev, NibblerEvent::PhaseComplete { summary: None });
    }

    #[test]
    fn envelope_extraction_finds_nested_event() {
        let envelope = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"doing work\nNIBBLER_EVENT {\"type\":\"NEEDS_ESCALATION\",\"reason\":\"blocked\"}"}]}}"#;
        let events = scan_envelope_for_events(envelope);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            NibblerEvent::NeedsEscalation { reason: Some("blocked".into()), context: None }
        );
    }

    #[test]
    fn scan_line_prefers_direct_prefix() {
        let line = r#"NIBBLER_EVENT {"type":"EXCEPTION","reason":"oops","impact":"high"}"#;
        let events = scan_line(line);
        assert_eq!(events.len(), 1);
    }
}
