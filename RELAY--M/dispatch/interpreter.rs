use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::decision::{Action, ActionKind, DecisionOutput};

/// Pure rewrite of raw completion text into a decode candidate.
pub type Repair = fn(&str) -> Option<String>;

/// Repairs tried in order, one per attempt.
pub const DEFAULT_REPAIRS: [Repair; 3] = [as_extracted, trim_noise, normalize_quoting];

const FALLBACK_QUESTION: &str =
    "Sorry, I didn't quite catch that. Could you tell me a little more about what you need?";
const FALLBACK_CONFIDENCE: f64 = 0.2;
/// Rounding slack accepted around the `[0, 1]` confidence range before clamping.
const CONFIDENCE_SLACK: f64 = 0.001;

static FENCE_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```[A-Za-z0-9_+-]*").expect("fence pattern compiles"));

static BARE_KEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([{,]\s*)([A-Za-z_][A-Za-z0-9_]*)(\s*:)").expect("bare key pattern compiles")
});

static TRAILING_COMMA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r",(\s*[}\]])").expect("trailing comma pattern compiles"));

static PY_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(True|False|None)\b").expect("literal pattern compiles"));

/// Decoded output plus how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct Interpretation {
    /// Always structurally valid.
    pub output: DecisionOutput,
    /// Repairs tried, including the successful one.
    pub attempts: usize,
    /// Whether every repair failed and the fallback was returned.
    pub used_fallback: bool,
}

/// Turns raw completion text into a valid [`DecisionOutput`], never failing.
#[derive(Debug, Clone)]
pub struct OutputInterpreter {
    repairs: Vec<Repair>,
}

impl Default for OutputInterpreter {
    fn default() -> Self {
        Self {
            repairs: DEFAULT_REPAIRS.to_vec(),
        }
    }
}

impl OutputInterpreter {
    /// Interpreter with the standard repair list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Interpreter with a custom repair list. An empty list always yields the fallback.
    #[must_use]
    pub fn with_repairs(repairs: Vec<Repair>) -> Self {
        Self { repairs }
    }

    /// Interprets raw text.
    #[must_use]
    pub fn interpret(&self, raw: &str) -> DecisionOutput {
        self.interpret_detailed(raw).output
    }

    /// Interprets raw text and reports the attempts spent.
    #[must_use]
    pub fn interpret_detailed(&self, raw: &str) -> Interpretation {
        let text = strip_fences(raw);
        for (idx, repair) in self.repairs.iter().enumerate() {
            let Some(candidate) = repair(&text) else {
                continue;
            };
            if let Some(output) = decode(&candidate) {
                if idx > 0 {
                    debug!(attempt = idx + 1, "decision output recovered by repair");
                }
                return Interpretation {
                    output,
                    attempts: idx + 1,
                    used_fallback: false,
                };
            }
        }
        warn!(attempts = self.repairs.len(), "decision output could not be interpreted");
        Interpretation {
            output: fallback(),
            attempts: self.repairs.len(),
            used_fallback: true,
        }
    }
}

/// Deterministic output returned when nothing decodes.
#[must_use]
pub fn fallback() -> DecisionOutput {
    DecisionOutput::clarification(
        FALLBACK_QUESTION,
        FALLBACK_CONFIDENCE,
        "model output could not be interpreted; asked the customer to clarify",
    )
}

/// Removes Markdown code fence markers, keeping whatever shares their line.
fn strip_fences(raw: &str) -> String {
    if !raw.contains("```") {
        return raw.trim().to_string();
    }
    FENCE_MARKER.replace_all(raw, "").trim().to_string()
}

/// First balanced `{...}` span. Braces inside double-quoted strings are ignored.
fn extract_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0_usize;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, ch) in text[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + idx]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Attempt 1: the first balanced object as-is.
fn as_extracted(text: &str) -> Option<String> {
    extract_object(text).map(str::to_string)
}

/// Attempt 2: everything between the outermost braces, with raw control characters flattened.
fn trim_noise(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(
        text[start..=end]
            .chars()
            .map(|ch| if ch.is_control() { ' ' } else { ch })
            .collect(),
    )
}

/// Attempt 3: smart quotes, single quotes, bare keys, Python literals and trailing commas.
fn normalize_quoting(text: &str) -> Option<String> {
    let trimmed = trim_noise(text)?;
    let straightened = trimmed.replace(['\u{201c}', '\u{201d}'], "\"").replace(['\u{2018}', '\u{2019}'], "'");
    let quoted = single_to_double_quotes(&straightened);
    let repaired = map_outside_strings(&quoted, |segment| {
        let segment = BARE_KEY.replace_all(segment, "$1\"$2\"$3");
        let segment = TRAILING_COMMA.replace_all(&segment, "$1");
        PY_LITERAL
            .replace_all(&segment, |caps: &regex::Captures<'_>| match &caps[1] {
                "True" => "true",
                "False" => "false",
                _ => "null",
            })
            .into_owned()
    });
    Some(extract_object(&repaired).unwrap_or(&repaired).to_string())
}

fn single_to_double_quotes(text: &str) -> String {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum State {
        Code,
        Double,
        Single,
    }
    let mut out = String::with_capacity(text.len());
    let mut state = State::Code;
    let mut chars = text.chars();
    while let Some(ch) = chars.next() {
        match (state, ch) {
            (State::Code, '"') => {
                state = State::Double;
                out.push(ch);
            }
            (State::Code, '\'') => {
                state = State::Single;
                out.push('"');
            }
            (State::Double, '\\') => {
                out.push(ch);
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            }
            (State::Double, '"') => {
                state = State::Code;
                out.push(ch);
            }
            (State::Single, '\\') => match chars.next() {
                Some('\'') => out.push('\''),
                Some(next) => {
                    out.push('\\');
                    out.push(next);
                }
                None => out.push('\\'),
            },
            (State::Single, '\'') => {
                state = State::Code;
                out.push('"');
            }
            (State::Single, '"') => out.push_str("\\\""),
            _ => out.push(ch),
        }
    }
    out
}

/// Applies `rewrite` to the parts of `text` outside double-quoted strings.
fn map_outside_strings(text: &str, rewrite: impl Fn(&str) -> String) -> String {
    let mut out = String::with_capacity(text.len());
    let mut segment_start = 0;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, ch) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
                out.push_str(&text[segment_start..=idx]);
                segment_start = idx + 1;
            }
        } else if ch == '"' {
            out.push_str(&rewrite(&text[segment_start..idx]));
            in_string = true;
            segment_start = idx;
        }
    }
    if in_string {
        out.push_str(&text[segment_start..]);
    } else {
        out.push_str(&rewrite(&text[segment_start..]));
    }
    out
}

#[derive(Debug, Deserialize)]
struct WireAction {
    #[serde(rename = "type", alias = "action", alias = "kind")]
    kind: String,
    #[serde(default)]
    payload: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(flatten)]
    inline: serde_json::Map<String, serde_json::Value>,
}

impl From<WireAction> for Action {
    fn from(wire: WireAction) -> Self {
        let mut payload = wire.payload.unwrap_or_default();
        for (key, value) in wire.inline {
            payload.entry(key).or_insert(value);
        }
        Self {
            kind: ActionKind::from(wire.kind),
            payload,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireOutput {
    #[serde(default)]
    actions: Vec<WireAction>,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    confidence: Option<serde_json::Value>,
    #[serde(default, alias = "requires_follow_up", alias = "followUpNeeded")]
    follow_up_needed: Option<bool>,
}

fn confidence_of(value: &serde_json::Value) -> Option<f64> {
    let parsed = match value {
        serde_json::Value::Number(number) => number.as_f64(),
        serde_json::Value::String(raw) => raw.trim().parse().ok(),
        _ => None,
    }?;
    let in_range = (-CONFIDENCE_SLACK..=1.0 + CONFIDENCE_SLACK).contains(&parsed);
    in_range.then(|| parsed.clamp(0.0, 1.0))
}

/// Lenient structural decode. `None` sends the text on to the next repair.
fn decode(candidate: &str) -> Option<DecisionOutput> {
    let wire: WireOutput = serde_json::from_str(candidate).ok()?;
    if wire.actions.is_empty() {
        return None;
    }
    let confidence = confidence_of(wire.confidence.as_ref()?)?;
    let output = DecisionOutput {
        actions: wire.actions.into_iter().map(Action::from).collect(),
        summary: wire.summary.unwrap_or_default(),
        confidence,
        follow_up_needed: wire.follow_up_needed.unwrap_or(false),
    };
    output.validate().ok()?;
    Some(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn interpreter() -> OutputInterpreter {
        OutputInterpreter::new()
    }

    fn assert_fallback(result: &Interpretation) {
        assert!(result.used_fallback);
        assert_eq!(result.attempts, 3);
        assert_eq!(result.output, fallback());
        assert!(result.output.is_clarification_only());
        assert!(result.output.follow_up_needed);
        assert!((result.output.confidence - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn clean_json_decodes_first_try() {
        let raw = r#"{"actions":[{"type":"send_message","payload":{"message":"Hi!"}}],"summary":"greet","confidence":0.9}"#;
        let result = interpreter().interpret_detailed(raw);
        assert_eq!(result.attempts, 1);
        assert!(!result.used_fallback);
        assert_eq!(result.output.actions[0].kind, ActionKind::SendMessage);
        assert!(!result.output.follow_up_needed);
    }

    #[test]
    fn fences_and_prose_are_ignored() {
        let raw = "Sure! Here is the decision:\n```json\n{\"actions\":[{\"type\":\"no_op\"}],\"confidence\":0.7}\n```\nLet me know {if} you need more.";
        let result = interpreter().interpret_detailed(raw);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.output.actions[0].kind, ActionKind::NoOp);
        assert_eq!(result.output.summary, "");
    }

    #[test]
    fn single_line_fences_keep_their_payload() {
        let inline = "```json {\"actions\":[{\"type\":\"no_op\"}],\"confidence\":0.9}```";
        let result = interpreter().interpret_detailed(inline);
        assert!(!result.used_fallback);
        assert_eq!(result.attempts, 1);
        assert!((result.output.confidence - 0.9).abs() < f64::EPSILON);

        let glued = "```json\n{\"actions\":[{\"type\":\"send_message\",\"payload\":{\"message\":\"See you at 3\"}}],\"confidence\":0.8}```";
        let output = interpreter().interpret(glued);
        assert_eq!(output.actions[0].message_text(), Some("See you at 3"));
        assert!((output.confidence - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn braces_inside_strings_do_not_end_the_object() {
        let raw = r#"note {"actions":[{"type":"send_message","payload":{"message":"use } and { freely"}}],"confidence":0.8} trailing }"#;
        let output = interpreter().interpret(raw);
        assert_eq!(output.actions[0].message_text(), Some("use } and { freely"));
    }

    #[test]
    fn raw_newlines_are_recovered_on_second_attempt() {
        let raw = "{\"actions\":[{\"type\":\"send_message\",\"payload\":{\"message\":\"line one\nline two\"}}],\"confidence\":0.6}";
        let result = interpreter().interpret_detailed(raw);
        assert_eq!(result.attempts, 2);
        assert_eq!(result.output.actions[0].message_text(), Some("line one line two"));
    }

    #[test]
    fn quoting_is_normalized_on_third_attempt() {
        let raw = "{actions: [{'type': 'create_lead', 'payload': {'name': 'Ana', 'notes': 'said \"hi\"',},},], \u{201c}confidence\u{201d}: 0.75, requires_follow_up: True,}";
        let result = interpreter().interpret_detailed(raw);
        assert_eq!(result.attempts, 3);
        assert!(!result.used_fallback);
        let output = result.output;
        assert_eq!(output.actions[0].kind, ActionKind::CreateLead);
        assert_eq!(output.actions[0].text("notes"), Some("said \"hi\""));
        assert!(output.follow_up_needed);
    }

    #[test]
    fn lenient_fields() {
        let raw = r#"{"actions":[{"type":"send_message","message":"inline"}],"confidence":1.0004,"followUpNeeded":true}"#;
        let output = interpreter().interpret(raw);
        assert_eq!(output.actions[0].message_text(), Some("inline"));
        assert!((output.confidence - 1.0).abs() < f64::EPSILON);
        assert!(output.follow_up_needed);

        let textual = interpreter().interpret(r#"{"actions":[{"type":"no_op"}],"confidence":"0.5"}"#);
        assert!((textual.confidence - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn out_of_range_confidence_is_rejected() {
        for confidence in ["1.7", "85", "-3", "-0.01"] {
            let raw = format!(r#"{{"actions":[{{"type":"send_message","message":"hi"}}],"confidence":{confidence}}}"#);
            assert_fallback(&interpreter().interpret_detailed(&raw));
        }
    }

    #[test]
    fn missing_confidence_or_actions_fall_back() {
        assert_fallback(&interpreter().interpret_detailed(r#"{"actions":[{"type":"no_op"}]}"#));
        assert_fallback(&interpreter().interpret_detailed(r#"{"actions":[],"confidence":0.9}"#));
        assert_fallback(&interpreter().interpret_detailed("I think you should book them in."));
        assert_fallback(&interpreter().interpret_detailed(""));
    }

    #[test]
    fn serialized_output_round_trips() {
        let output = DecisionOutput {
            actions: vec![
                Action::new(ActionKind::CreateBooking, json!({"slot": "2024-05-03T10:00", "service": "cut"})),
                Action::new(ActionKind::SendMessage, json!({"message": "Booked you in {Friday}"})),
                Action::new(ActionKind::Unknown("launch_rocket".into()), json!({})),
            ],
            summary: "booked".into(),
            confidence: 0.85,
            follow_up_needed: true,
        };
        let raw = serde_json::to_string_pretty(&output).unwrap();
        assert_eq!(interpreter().interpret(&raw), output);
    }

    #[test]
    fn every_output_is_valid() {
        let samples = [
            "{",
            "}{",
            r#"{"actions":[{"type":""}],"confidence":0.5}"#,
            r#"{"actions":[{"type":"no_op"}],"confidence":"high"}"#,
            "```\n```",
        ];
        for raw in samples {
            let output = interpreter().interpret(raw);
            assert!(output.validate().is_ok(), "invalid output for {raw:?}");
        }
    }

    #[test]
    fn empty_repair_list_always_falls_back() {
        let result = OutputInterpreter::with_repairs(Vec::new())
            .interpret_detailed(r#"{"actions":[{"type":"no_op"}],"confidence":0.5}"#);
        assert!(result.used_fallback);
        assert_eq!(result.attempts, 0);
    }
}
