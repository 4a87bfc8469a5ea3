//! The opaque LLM invocation capability and response classification.
//!
//! Invocation errors travel in-band: a response starting with the timeout
//! marker means the process hit its deadline, any other `ERROR:` prefix
//! means it failed. Everything else is a completed response whose body may
//! carry a JSON result.

use std::time::Duration;

use serde_json::Value;

/// Response prefix written when an invocation hits its deadline
pub const TIMEOUT_MARKER: &str = "ERROR: Timeout";
/// Response prefix for any other invocation failure
pub const ERROR_MARKER: &str = "ERROR:";

#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub latency_ms: u64,
}

/// External LLM process spawner. Implementations block the calling worker
/// for up to `timeout` and always return a response envelope; failures are
/// reported through the marker prefixes, never by panicking.
pub trait LlmInvoker: Send + Sync {
    fn invoke(&self, prompt: &str, model: &str, timeout: Duration) -> LlmResponse;
}

/// Terminal classification of a worker response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Completed,
    Failed,
    Timeout,
}

pub fn classify_response(text: &str) -> ResponseKind {
    if text.starts_with(TIMEOUT_MARKER) {
        ResponseKind::Timeout
    } else if text.starts_with(ERROR_MARKER) {
        ResponseKind::Failed
    } else {
        ResponseKind::Completed
    }
}

/// Best-effort extraction of a JSON object from a worker response.
///
/// Tries, in order: a fenced ```json block, the whole body, and the first
/// balanced top-level object. Non-object JSON values are rejected.
pub fn parse_response(text: &str) -> Option<Value> {
    if let Some(block) = fenced_json_block(text) {
        if let Ok(value) = serde_json::from_str::<Value>(&block) {
            if value.is_object() {
                return Some(value);
            }
        }
    }

    if let Ok(value) = serde_json::from_str::<Value>(text.trim()) {
        if value.is_object() {
            return Some(value);
        }
    }

    if let Some(candidate) = first_balanced_object(text) {
        if let Ok(value) = serde_json::from_str::<Value>(candidate) {
            if value.is_object() {
                return Some(value);
            }
        }
    }

    None
}

fn fenced_json_block(text: &str) -> Option<String> {
    let start = text.find("```json")? + "```json".len();
    let rest = &text[start..];
    let end = rest.find("```")?;
    Some(rest[..end].trim().to_string())
}

/// Scan for the first `{` and return the slice up to its balancing `}`,
/// tracking string literals and escapes so braces inside strings don't
/// break the balance.
fn first_balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
