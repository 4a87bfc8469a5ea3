use serde::{Deserialize, Serialize};

/// Token counts for one LLM response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_write_tokens
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// One ingested token event.
///
/// Uniqueness key is `(mission_id, request_id)` when `request_id` is
/// non-empty; the analytics store enforces it with a partial index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenEvent {
    pub mission_id: String,
    pub stage: String,
    pub timestamp: String,
    pub model: String,
    #[serde(flatten)]
    pub usage: TokenUsage,
    #[serde(default)]
    pub request_id: Option<String>,
}

/// One line of an LLM transcript file, as written by the external process.
///
/// Only the `assistant` subset is consumed; everything else is skipped.
#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptRecord {
    #[serde(rename = "type")]
    pub record_type: String,
    #[serde(default)]
    pub message: Option<TranscriptMessage>,
    #[serde(rename = "requestId", default)]
    pub request_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptMessage {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub usage: Option<TranscriptUsage>,
}

/// Usage block in the transcript wire format (provider field names)
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TranscriptUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
}

impl From<TranscriptUsage> for TokenUsage {
    fn from(wire: TranscriptUsage) -> Self {
        TokenUsage {
            input_tokens: wire.input_tokens,
            output_tokens: wire.output_tokens,
            cache_read_tokens: wire.cache_read_input_tokens,
            cache_write_tokens: wire.cache_creation_input_tokens,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcript_record_subset() {
        let line = r#"{"type":"assistant","message":{"model":"sonnet-4","usage":{"input_tokens":100,"output_tokens":50,"cache_read_input_tokens":10,"cache_creation_input_tokens":5}},"requestId":"req-1","extra_field":true}"#;
        let record: TranscriptRecord = serde_json::from_str(line).unwrap();
        assert_eq!(record.record_type, "assistant");
        assert_eq!(record.request_id.as_deref(), Some("req-1"));

        let usage: TokenUsage = record.message.unwrap().usage.unwrap().into();
        assert_eq!(usage.input_tokens, 100);
        assert_eq!(usage.cache_read_tokens, 10);
        assert_eq!(usage.cache_write_tokens, 5);
        assert_eq!(usage.total(), 165);
    }

    #[test]
    fn test_non_assistant_record_still_parses() {
        let record: TranscriptRecord = serde_json::from_str(r#"{"type":"user"}"#).unwrap();
        assert_eq!(record.record_type, "user");
        assert!(record.message.is_none());
    }
}
