//! Decoded stdout events emitted by a supervised session.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single decoded line from a session's child process stdout.
///
/// Tagged on the JSON `type` field. Types not recognized by this server fall
/// into [`StreamEvent::Opaque`], carrying the raw object through unchanged
/// rather than failing the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEventKind {
    SessionStart {
        session_id: String,
    },
    #[serde(alias = "session_complete")]
    SessionEnd {
        #[serde(default)]
        tokens_used: Option<u64>,
    },
    ToolUse {
        #[serde(default)]
        tool_name: Option<String>,
        #[serde(default)]
        data: Value,
    },
    AgentExecution {
        #[serde(default)]
        data: Value,
    },
    CheckpointCreated {
        #[serde(default)]
        checkpoint_id: Option<String>,
    },
    HookTriggered {
        #[serde(default)]
        data: Value,
    },
    CommandExecuted {
        #[serde(default)]
        data: Value,
    },
    ErrorOccurred {
        #[serde(default)]
        message: Option<String>,
    },
    TokenUsage {
        #[serde(default)]
        data: Value,
    },
    Performance {
        #[serde(default)]
        data: Value,
    },
    Partial {
        #[serde(default)]
        content: Option<String>,
    },
    Response {
        #[serde(default)]
        content: Option<String>,
    },
    Notification {
        #[serde(default)]
        data: Value,
    },
    Status {
        #[serde(default)]
        status: Option<String>,
    },
    /// Catch-all for any `type` this server does not recognize. The entire
    /// decoded object is preserved so nothing is silently dropped.
    #[serde(other)]
    Opaque,
}

/// A [`StreamEventKind`] with its per-session sequence number and the raw
/// decoded JSON value it was built from (needed to reconstruct `Opaque`
/// payloads, since `#[serde(other)]` discards the original object).
#[derive(Debug, Clone)]
pub struct StreamEvent {
    /// Monotonically increasing, assigned on decode, unique per session.
    pub sequence: u64,
    /// The parsed variant.
    pub kind: StreamEventKind,
    /// The raw JSON object this event was decoded from.
    pub raw: Value,
}

impl StreamEvent {
    /// Decode `value` into a [`StreamEventKind`] and attach `sequence`.
    pub fn from_value(sequence: u64, value: Value) -> Self {
        let kind = serde_json::from_value(value.clone()).unwrap_or(StreamEventKind::Opaque);
        Self {
            sequence,
            kind,
            raw: value,
        }
    }

    /// The `type` string this event was tagged with, if present in `raw`.
    pub fn type_name(&self) -> Option<&str> {
        self.raw.get("type").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_known_type() {
        let v = json!({"type": "session_start", "session_id": "S"});
        let ev = StreamEvent::from_value(1, v);
        assert!(matches!(ev.kind, StreamEventKind::SessionStart { .. }));
        assert_eq!(ev.sequence, 1);
    }

    #[test]
    fn unknown_type_becomes_opaque() {
        let v = json!({"type": "some_future_type", "payload": 42});
        let ev = StreamEvent::from_value(2, v.clone());
        assert!(matches!(ev.kind, StreamEventKind::Opaque));
        assert_eq!(ev.raw, v);
        assert_eq!(ev.type_name(), Some("some_future_type"));
    }
}
