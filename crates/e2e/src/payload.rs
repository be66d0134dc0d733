//! Structured payload extraction from mixed CLI output
//!
//! The CLI interleaves spinners and log lines with its JSON document, so the
//! payload is located in three passes: the whole text, then the first
//! balanced array literal that parses, then the first balanced object literal
//! that parses. Anything else is an absent payload, never an error.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

static TASK_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)Task ID:\s*([a-f0-9-]+)").expect("task id pattern"));

/// Extract the first JSON document from `text`.
pub fn extract_json(text: &str) -> Option<Value> {
    if text.trim().is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return Some(value);
    }

    first_balanced(text, b'[').or_else(|| first_balanced(text, b'{'))
}

/// Scan every occurrence of `open` and return the first balanced literal
/// starting there that parses as JSON.
fn first_balanced(text: &str, open: u8) -> Option<Value> {
    let bytes = text.as_bytes();
    let mut from = 0;

    while let Some(offset) = bytes[from..].iter().position(|&b| b == open) {
        let start = from + offset;
        if let Some(end) = balanced_end(bytes, start) {
            if let Ok(value) = serde_json::from_str::<Value>(&text[start..=end]) {
                return Some(value);
            }
        }
        from = start + 1;
    }

    None
}

/// Index of the bracket closing the one at `start`, honouring string
/// literals and escapes. `None` when the brackets never balance.
fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut stack: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match b {
            b'"' => in_string = true,
            b'[' => stack.push(b']'),
            b'{' => stack.push(b'}'),
            b']' | b'}' => {
                if stack.pop() != Some(b) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(i);
                }
            }
            _ => {}
        }
    }

    None
}

/// Find a queued-task acknowledgment (`Task ID: <uuid>`) in free text
pub fn extract_task_id(text: &str) -> Option<String> {
    TASK_ID
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// First `max` characters of `text`, for diagnostics
pub fn preview(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Structured error object emitted by the CLI on failure
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub details: Vec<String>,
}

impl ErrorBody {
    /// Read whatever fields are usable from an `error` object. Numeric codes
    /// and non-string details are rendered as JSON text.
    pub fn from_object(error: &Map<String, Value>) -> Self {
        let code = match error.get("code") {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        let message = error.get("message").and_then(Value::as_str).map(str::to_string);
        let details = error
            .get("details")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(text_of).collect())
            .unwrap_or_default();

        Self {
            code,
            message,
            details,
        }
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl std::fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(code) = &self.code {
            write!(f, "[{}] ", code)?;
        }
        f.write_str(self.message.as_deref().unwrap_or("Unknown error"))?;
        if !self.details.is_empty() {
            write!(f, " - Details: {}", self.details.join(", "))?;
        }
        Ok(())
    }
}

/// Shape of a parsed payload
#[derive(Debug, Clone, PartialEq)]
pub enum Payload<'a> {
    /// Nothing JSON-shaped in the output
    Absent,
    Array(&'a [Value]),
    /// A success object
    Object(&'a Map<String, Value>),
    /// `{"success": false, "error": {...}}`
    Error(ErrorBody),
    /// A bare string, number, boolean or null
    Scalar(&'a Value),
}

impl<'a> Payload<'a> {
    pub fn classify(value: Option<&'a Value>) -> Self {
        match value {
            None => Payload::Absent,
            Some(Value::Array(items)) => Payload::Array(items),
            Some(Value::Object(map)) => match error_body(map) {
                Some(body) => Payload::Error(body),
                None => Payload::Object(map),
            },
            Some(other) => Payload::Scalar(other),
        }
    }

    /// Human label used in assertion messages
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Absent => "absent",
            Payload::Array(_) => "array",
            Payload::Object(_) => "object",
            Payload::Error(_) => "error object",
            Payload::Scalar(_) => "scalar",
        }
    }
}

fn error_body(map: &Map<String, Value>) -> Option<ErrorBody> {
    if map.get("success") != Some(&Value::Bool(false)) {
        return None;
    }
    map.get("error")
        .and_then(Value::as_object)
        .map(ErrorBody::from_object)
}
