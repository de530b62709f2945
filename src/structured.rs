//! Best-effort parsing of structured model output.
//!
//! Models are asked for bare JSON but routinely wrap it in Markdown fences,
//! surround it with prose, or emit almost-JSON (single quotes, trailing
//! commas, typographic quotes). Every stage goes through [`parse_structured`]:
//!
//! 1. strict parse of the trimmed text, then of the first fenced block
//! 2. scan the fenced block and the full text for balanced containers of the
//!    expected kind, strict parse each
//! 3. retry each container after [`repair`]
//!
//! Callers decide what a [`ParseError`] means for their stage.

use serde_json::{Map, Value};
use thiserror::Error;

/// Characters of model output kept on a parse error.
const PREVIEW_CHARS: usize = 200;

/// Opening brackets tried per scanned text before giving up.
const MAX_OPENINGS: usize = 16;

/// Top-level JSON container a stage expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonShape {
    Array,
    Object,
}

impl JsonShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            JsonShape::Array => "array",
            JsonShape::Object => "object",
        }
    }

    fn open(&self) -> char {
        match self {
            JsonShape::Array => '[',
            JsonShape::Object => '{',
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            JsonShape::Array => value.is_array(),
            JsonShape::Object => value.is_object(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("empty model output")]
    Empty,

    #[error("no JSON {expected} found in model output: {preview:?}")]
    NotFound {
        expected: &'static str,
        preview: String,
    },

    #[error("invalid JSON {expected}: {reason} (output: {preview:?})")]
    Invalid {
        expected: &'static str,
        reason: String,
        preview: String,
    },
}

impl ParseError {
    /// One-line reason without the output preview.
    pub fn reason(&self) -> String {
        match self {
            Self::Empty => "empty model output".to_string(),
            Self::NotFound { expected, .. } => format!("no JSON {expected} in model output"),
            Self::Invalid {
                expected, reason, ..
            } => format!("invalid JSON {expected}: {reason}"),
        }
    }

    fn not_found(shape: JsonShape, raw: &str) -> Self {
        Self::NotFound {
            expected: shape.as_str(),
            preview: preview(raw),
        }
    }

    fn invalid(shape: JsonShape, reason: impl Into<String>, raw: &str) -> Self {
        Self::Invalid {
            expected: shape.as_str(),
            reason: reason.into(),
            preview: preview(raw),
        }
    }
}

/// Bounded, single-line preview of model output for logs and errors.
pub fn preview(raw: &str) -> String {
    let flat: String = raw
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .take(PREVIEW_CHARS)
        .collect();
    if raw.chars().count() > PREVIEW_CHARS {
        format!("{flat}...")
    } else {
        flat
    }
}

// =============================================================================
// Parse ladder
// =============================================================================

/// Parse model output into a JSON value of the expected shape.
pub fn parse_structured(raw: &str, shape: JsonShape) -> Result<Value, ParseError> {
    let text = raw.trim();
    if text.is_empty() {
        return Err(ParseError::Empty);
    }
    if let Some(value) = strict(text, shape) {
        return Ok(value);
    }

    let fenced = strip_code_fences(text);
    let mut scanned: Vec<&str> = Vec::with_capacity(2);
    if !fenced.is_empty() && fenced != text {
        if let Some(value) = strict(fenced, shape) {
            return Ok(value);
        }
        scanned.push(fenced);
    }
    scanned.push(text);

    let mut last_reason: Option<String> = None;
    for candidate in scanned
        .into_iter()
        .flat_map(|t| balanced_candidates(t, shape))
    {
        match serde_json::from_str::<Value>(candidate) {
            Ok(value) if shape.matches(&value) => return Ok(value),
            Ok(_) => continue,
            Err(strict_err) => match serde_json::from_str::<Value>(&repair(candidate)) {
                Ok(value) if shape.matches(&value) => return Ok(value),
                Ok(_) => continue,
                Err(_) => last_reason = Some(strict_err.to_string()),
            },
        }
    }

    match last_reason {
        Some(reason) => Err(ParseError::invalid(shape, reason, raw)),
        None if fenced.is_empty() => Err(ParseError::Empty),
        None => Err(ParseError::not_found(shape, raw)),
    }
}

fn strict(text: &str, shape: JsonShape) -> Option<Value> {
    serde_json::from_str::<Value>(text)
        .ok()
        .filter(|value| shape.matches(value))
}

pub fn parse_array(raw: &str) -> Result<Vec<Value>, ParseError> {
    match parse_structured(raw, JsonShape::Array)? {
        Value::Array(items) => Ok(items),
        _ => Err(ParseError::not_found(JsonShape::Array, raw)),
    }
}

pub fn parse_object(raw: &str) -> Result<Map<String, Value>, ParseError> {
    match parse_structured(raw, JsonShape::Object)? {
        Value::Object(map) => Ok(map),
        _ => Err(ParseError::not_found(JsonShape::Object, raw)),
    }
}

/// Return the body of the first Markdown code fence, or the trimmed input.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed;
    };

    let mut body = &trimmed[start + 3..];
    // Language tag, e.g. ```json
    if let Some(newline) = body.find('\n') {
        let tag = &body[..newline];
        if tag.trim().chars().all(|c| c.is_ascii_alphanumeric()) {
            body = &body[newline + 1..];
        }
    }

    match body.find("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

/// Balanced containers of `shape`, in order of their opening char.
///
/// At most [`MAX_OPENINGS`] opening brackets are tried, matched or not.
fn balanced_candidates(text: &str, shape: JsonShape) -> impl Iterator<Item = &str> {
    let open = shape.open();
    text.char_indices()
        .filter(move |&(_, c)| c == open)
        .take(MAX_OPENINGS)
        .filter_map(move |(start, _)| {
            let rest = &text[start..];
            find_matching_close(rest).map(|end| &rest[..end])
        })
}

/// Byte offset one past the bracket closing the container `s` starts with.
///
/// Tracks string state so brackets inside `"..."` are not counted.
fn find_matching_close(s: &str) -> Option<usize> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escape = false;

    for (i, c) in s.char_indices() {
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' | '{' => stack.push(c),
            ']' | '}' => {
                let open = stack.pop()?;
                if (open == '[') != (c == ']') {
                    return None;
                }
                if stack.is_empty() {
                    return Some(i + c.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

// =============================================================================
// Repair
// =============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
enum Quote {
    Double,
    Smart,
    Single,
}

/// Light repair of almost-JSON.
///
/// Outside double-quoted strings: typographic and single-quoted strings are
/// rewritten as double-quoted strings, and trailing commas before `]`/`}` are
/// removed. Well-formed JSON comes back unchanged.
pub fn repair(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut quote: Option<Quote> = None;
    let mut escape = false;

    for (i, &c) in chars.iter().enumerate() {
        match quote {
            Some(Quote::Double) => {
                out.push(c);
                if escape {
                    escape = false;
                } else if c == '\\' {
                    escape = true;
                } else if c == '"' {
                    quote = None;
                }
            }
            Some(q @ (Quote::Smart | Quote::Single)) => {
                if escape {
                    out.push(c);
                    escape = false;
                    continue;
                }
                let closes = match q {
                    Quote::Smart => matches!(c, '\u{201C}' | '\u{201D}'),
                    _ => matches!(c, '\'' | '\u{2018}' | '\u{2019}'),
                };
                if closes {
                    out.push('"');
                    quote = None;
                } else if c == '\\' {
                    out.push(c);
                    escape = true;
                } else if c == '"' {
                    out.push_str("\\\"");
                } else {
                    out.push(c);
                }
            }
            None => match c {
                '"' => {
                    out.push(c);
                    quote = Some(Quote::Double);
                }
                '\u{201C}' | '\u{201D}' => {
                    out.push('"');
                    quote = Some(Quote::Smart);
                }
                '\'' | '\u{2018}' | '\u{2019}' => {
                    out.push('"');
                    quote = Some(Quote::Single);
                }
                ',' => {
                    let next = chars[i + 1..].iter().find(|ch| !ch.is_whitespace());
                    if !matches!(next, Some(']') | Some('}')) {
                        out.push(c);
                    }
                }
                _ => out.push(c),
            },
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strict_array_parses() {
        let v = parse_array(r#"["pricing", "support"]"#).unwrap();
        assert_eq!(v, vec![json!("pricing"), json!("support")]);
    }

    #[test]
    fn fenced_output_parses() {
        let raw = "Here you go:\n```json\n{\"Billing\": [\"billing\", \"invoices\"]}\n```\nThanks";
        let map = parse_object(raw).unwrap();
        assert_eq!(map["Billing"], json!(["billing", "invoices"]));
    }

    #[test]
    fn array_embedded_in_prose_is_extracted() {
        let raw = r#"Sure! The tags are ["slow app", "crashes [often]"] as requested."#;
        let v = parse_array(raw).unwrap();
        assert_eq!(v[1], json!("crashes [often]"));
    }

    #[test]
    fn array_wrapped_in_object_is_found() {
        let raw = r#"{"tags": ["a", "b"]}"#;
        let v = parse_array(raw).unwrap();
        assert_eq!(v, vec![json!("a"), json!("b")]);
    }

    #[test]
    fn single_quotes_and_trailing_commas_are_repaired() {
        let raw = "[{'response_id': 1, 'tags': ['price', 'support',],},]";
        let v = parse_array(raw).unwrap();
        assert_eq!(v[0]["tags"], json!(["price", "support"]));
        assert_eq!(v[0]["response_id"], json!(1));
    }

    #[test]
    fn smart_quotes_are_repaired() {
        let raw = "[\u{201C}late delivery\u{201D}, \u{201C}refund\u{201D}]";
        let v = parse_array(raw).unwrap();
        assert_eq!(v, vec![json!("late delivery"), json!("refund")]);
    }

    #[test]
    fn repair_is_noop_on_valid_json() {
        let samples = [
            r#"{"a": [1, 2, {"b": "it's \"quoted\", ok"}], "c": null}"#,
            r#"["x, ]", "y'}", "“z”"]"#,
            r#"[]"#,
        ];
        for s in samples {
            assert_eq!(repair(s), s);
            let strict: Value = serde_json::from_str(s).unwrap();
            let repaired: Value = serde_json::from_str(&repair(s)).unwrap();
            assert_eq!(strict, repaired);
        }
    }

    #[test]
    fn missing_container_reports_not_found() {
        let err = parse_array("I could not find any tags.").unwrap_err();
        assert!(matches!(err, ParseError::NotFound { expected: "array", .. }));
    }

    #[test]
    fn broken_container_reports_invalid() {
        let err = parse_object("{\"a\": [1, 2}").unwrap_err();
        assert!(matches!(
            err,
            ParseError::NotFound { .. } | ParseError::Invalid { .. }
        ));
        let err = parse_object("{\"a\": tru}").unwrap_err();
        assert!(matches!(err, ParseError::Invalid { expected: "object", .. }));
    }

    #[test]
    fn empty_output_is_reported() {
        assert!(matches!(parse_array("   "), Err(ParseError::Empty)));
        assert!(matches!(parse_array("```json\n```"), Err(ParseError::Empty)));
    }

    #[test]
    fn fence_markers_inside_valid_json_are_left_alone() {
        let raw = r#"["use ``` fences", "x"]"#;
        let strict: Value = serde_json::from_str(raw).unwrap();
        assert_eq!(parse_structured(raw, JsonShape::Array).unwrap(), strict);
    }

    #[test]
    fn fence_after_json_does_not_hide_it() {
        let raw = "[\"slow\", \"ui\"]\n\nNote: ```tags are lowercase```";
        assert_eq!(parse_array(raw).unwrap(), vec![json!("slow"), json!("ui")]);
    }

    #[test]
    fn scan_gives_up_after_bounded_openings() {
        let mut raw = "[".repeat(MAX_OPENINGS);
        raw.push_str(r#" ["late"]"#);
        assert!(balanced_candidates(&raw, JsonShape::Array).next().is_none());

        let raw = format!("{} [\"late\"]", "[ ".repeat(MAX_OPENINGS - 1));
        assert_eq!(parse_array(&raw).unwrap(), vec![json!("late")]);
    }

    #[test]
    fn preview_is_bounded() {
        let long = "x".repeat(1_000);
        assert_eq!(preview(&long).chars().count(), PREVIEW_CHARS + 3);
    }
}
