use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::request::RequestKind;

/// Provider/kind/model bookkeeping attached to every stream chunk (spec §3
/// "Stream chunk"), independent of whatever per-kind body the chunk carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtraFields {
    pub provider: String,
    pub request_kind: RequestKind,
    pub model_requested: String,
}

/// A discriminated union over the per-kind stream response types, kept
/// opaque as JSON (this crate does not specify concrete wire bodies — spec
/// §1 Non-goal). The relay (§4.I) only needs `chunk_type` to detect
/// terminality; conversion of `body` to the external shape is the
/// integration router's job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub chunk_type: Option<String>,
    #[serde(flatten)]
    pub body: Value,
    #[serde(flatten)]
    pub extra: ExtraFields,
}

const TERMINAL_TYPES: [&str; 4] = ["completed", "failed", "incomplete", "error"];

impl StreamChunk {
    pub fn new(body: Value, extra: ExtraFields) -> Self {
        Self { chunk_type: None, body, extra }
    }

    pub fn with_type(mut self, chunk_type: impl Into<String>) -> Self {
        self.chunk_type = Some(chunk_type.into());
        self
    }

    /// A terminal chunk guarantees no further chunks for that response
    /// (spec GLOSSARY "Terminal chunk").
    pub fn is_terminal(&self) -> bool {
        self.chunk_type
            .as_deref()
            .is_some_and(|t| TERMINAL_TYPES.contains(&t))
    }

    /// Best-effort `response.id` extraction, used by the WS session manager
    /// to chain `previous_response_id` (spec §4.I step 6).
    pub fn response_id(&self) -> Option<&str> {
        self.body.get("id").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extra() -> ExtraFields {
        ExtraFields {
            provider: "openai".to_string(),
            request_kind: RequestKind::Responses,
            model_requested: "gpt-4".to_string(),
        }
    }

    #[test]
    fn terminal_types_are_recognised() {
        for t in TERMINAL_TYPES {
            let chunk = StreamChunk::new(Value::Null, extra()).with_type(t);
            assert!(chunk.is_terminal(), "{t} should be terminal");
        }
        let chunk = StreamChunk::new(Value::Null, extra()).with_type("in_progress");
        assert!(!chunk.is_terminal());
        let chunk = StreamChunk::new(Value::Null, extra());
        assert!(!chunk.is_terminal());
    }

    #[test]
    fn extracts_response_id() {
        let chunk = StreamChunk::new(serde_json::json!({"id": "resp_123"}), extra());
        assert_eq!(chunk.response_id(), Some("resp_123"));
    }
}
