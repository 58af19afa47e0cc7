//! Schema-checked JSONL line decoding.

use crate::error::CoreError;
use serde_json::Value;
use std::collections::HashMap;

const EXCERPT_LEN: usize = 100;

/// Field-presence and type expectations for one recognized message type.
#[derive(Debug, Clone)]
struct MessageSchema {
    required_fields: &'static [&'static str],
    optional_fields: &'static [&'static str],
    /// Fields whose value must be a JSON string (beyond the always-required `type`).
    string_fields: &'static [&'static str],
}

fn schema_for(msg_type: &str) -> Option<MessageSchema> {
    match msg_type {
        "partial" => Some(MessageSchema {
            required_fields: &["content"],
            optional_fields: &["id", "timestamp"],
            string_fields: &["content"],
        }),
        "response" => Some(MessageSchema {
            required_fields: &["content"],
            optional_fields: &["id", "timestamp", "token_count", "metadata"],
            string_fields: &["content"],
        }),
        "error" => Some(MessageSchema {
            required_fields: &["error_type", "message"],
            optional_fields: &["id", "timestamp", "details", "stack_trace"],
            string_fields: &["error_type", "message"],
        }),
        "notification" => Some(MessageSchema {
            required_fields: &["notification_type", "content"],
            optional_fields: &["id", "timestamp", "priority"],
            string_fields: &["notification_type", "content"],
        }),
        "metric" | "debug" => Some(MessageSchema {
            required_fields: &["data"],
            optional_fields: &["id", "timestamp", "level"],
            string_fields: &[],
        }),
        "status" => Some(MessageSchema {
            required_fields: &["status"],
            optional_fields: &["id", "timestamp", "details", "progress"],
            string_fields: &["status"],
        }),
        "checkpoint" => Some(MessageSchema {
            required_fields: &["checkpoint_id"],
            optional_fields: &["id", "timestamp", "data"],
            string_fields: &["checkpoint_id"],
        }),
        _ => None,
    }
}

/// One record of a failed line from [`JsonlParser::parse_batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseErrorRecord {
    /// 1-based position of the failing line within the batch.
    pub line_number: usize,
    /// First 100 characters of the offending line.
    pub excerpt: String,
    /// Description of the failure.
    pub error: String,
}

/// Running counters for a [`JsonlParser`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ParserStats {
    pub lines_parsed: u64,
    pub errors_encountered: u64,
    pub error_rate: f64,
}

/// Decodes one JSONL line into a [`serde_json::Value`], with optional schema
/// validation.
///
/// In strict mode, unknown `type` values are accepted (schema checking is
/// advisory for types this parser doesn't know about) but fields present on
/// known types are checked for required-ness and JSON type. In lenient mode,
/// any valid JSON object is accepted outright.
pub struct JsonlParser {
    strict: bool,
    line_count: u64,
    error_count: u64,
}

impl JsonlParser {
    /// Create a parser. `strict` enables schema validation in [`parse_line`](Self::parse_line).
    pub fn new(strict: bool) -> Self {
        Self {
            strict,
            line_count: 0,
            error_count: 0,
        }
    }

    /// Parse one line into a JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Parse`] if the line is empty, is not valid JSON,
    /// does not decode to a JSON object, or (in strict mode) fails schema
    /// validation.
    pub fn parse_line(&mut self, line: &str) -> Result<Value, CoreError> {
        self.line_count += 1;
        let trimmed = line.trim();

        if trimmed.is_empty() {
            self.error_count += 1;
            return Err(self.err(1, "empty line", trimmed));
        }

        let value: Value = serde_json::from_str(trimmed).map_err(|e| {
            self.error_count += 1;
            self.err(1, &format!("invalid JSON: {e}"), trimmed)
        })?;

        let Value::Object(ref map) = value else {
            self.error_count += 1;
            return Err(self.err(
                1,
                &format!("expected object, got {}", json_kind(&value)),
                trimmed,
            ));
        };

        if self.strict {
            if let Err(message) = validate_schema(map) {
                self.error_count += 1;
                return Err(self.err(1, &message, trimmed));
            }
        }

        Ok(value)
    }

    fn err(&self, _line: usize, message: &str, excerpt: &str) -> CoreError {
        CoreError::Parse {
            line: self.line_count as usize,
            message: message.to_string(),
            excerpt: excerpt.chars().take(EXCERPT_LEN).collect(),
        }
    }

    /// Parse every line, continuing past failures. Returns the successfully
    /// parsed values and a record for every line that failed.
    pub fn parse_batch(&mut self, lines: &[String]) -> (Vec<Value>, Vec<ParseErrorRecord>) {
        let mut values = Vec::with_capacity(lines.len());
        let mut errors = Vec::new();

        for (i, line) in lines.iter().enumerate() {
            match self.parse_line(line) {
                Ok(v) => values.push(v),
                Err(e) => errors.push(ParseErrorRecord {
                    line_number: i + 1,
                    excerpt: line.chars().take(EXCERPT_LEN).collect(),
                    error: e.to_string(),
                }),
            }
        }

        (values, errors)
    }

    /// Snapshot and reset the running counters.
    pub fn reset_stats(&mut self) -> ParserStats {
        let error_rate = if self.line_count > 0 {
            self.error_count as f64 / self.line_count as f64
        } else {
            0.0
        };
        let stats = ParserStats {
            lines_parsed: self.line_count,
            errors_encountered: self.error_count,
            error_rate,
        };
        self.line_count = 0;
        self.error_count = 0;
        stats
    }

    /// Build a compact (no extraneous whitespace) JSONL line for `msg_type`,
    /// with an optional `content` field and arbitrary extra fields.
    pub fn format_message(
        msg_type: &str,
        content: Option<&str>,
        extra: HashMap<String, Value>,
    ) -> String {
        let mut obj = serde_json::Map::new();
        obj.insert("type".to_string(), Value::String(msg_type.to_string()));
        if let Some(c) = content {
            obj.insert("content".to_string(), Value::String(c.to_string()));
        }
        for (k, v) in extra {
            obj.insert(k, v);
        }
        serde_json::to_string(&Value::Object(obj)).expect("map of Values always serializes")
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn validate_schema(map: &serde_json::Map<String, Value>) -> Result<(), String> {
    let msg_type = map
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| "message missing 'type' field".to_string())?;

    let Some(schema) = schema_for(msg_type) else {
        // Unknown type: allowed, nothing further to check.
        return Ok(());
    };

    for field in schema.required_fields {
        if !map.contains_key(*field) {
            return Err(format!(
                "required field '{field}' missing for message type '{msg_type}'"
            ));
        }
    }

    for field in schema.string_fields {
        if let Some(value) = map.get(*field) {
            if !value.is_string() {
                return Err(format!(
                    "field '{field}' must be string, got {}",
                    json_kind(value)
                ));
            }
        }
    }

    let _ = schema.optional_fields; // documented for callers; no enforcement needed
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lenient_accepts_any_object() {
        let mut p = JsonlParser::new(false);
        let v = p.parse_line(r#"{"type":"widget","foo":1}"#).unwrap();
        assert_eq!(v["foo"], 1);
    }

    #[test]
    fn strict_rejects_missing_required_field() {
        let mut p = JsonlParser::new(true);
        let err = p.parse_line(r#"{"type":"response"}"#).unwrap_err();
        match err {
            CoreError::Parse { message, .. } => assert!(message.contains("content")),
            _ => panic!("expected Parse error"),
        }
    }

    #[test]
    fn strict_allows_unknown_type() {
        let mut p = JsonlParser::new(true);
        let v = p.parse_line(r#"{"type":"from_the_future","x":1}"#).unwrap();
        assert_eq!(v["x"], 1);
    }

    #[test]
    fn strict_rejects_wrong_field_type() {
        let mut p = JsonlParser::new(true);
        let err = p
            .parse_line(r#"{"type":"status","status":123}"#)
            .unwrap_err();
        match err {
            CoreError::Parse { message, .. } => assert!(message.contains("must be string")),
            _ => panic!("expected Parse error"),
        }
    }

    #[test]
    fn empty_line_is_an_error() {
        let mut p = JsonlParser::new(false);
        assert!(p.parse_line("   ").is_err());
    }

    #[test]
    fn batch_continues_past_failures_and_records_line_numbers() {
        let mut p = JsonlParser::new(false);
        let lines = vec![
            r#"{"type":"a"}"#.to_string(),
            "not json".to_string(),
            r#"{"type":"b"}"#.to_string(),
        ];
        let (values, errors) = p.parse_batch(&lines);
        assert_eq!(values.len(), 2);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line_number, 2);
    }

    #[test]
    fn stats_round_trip() {
        let mut p = JsonlParser::new(false);
        let _ = p.parse_line(r#"{"type":"a"}"#);
        let _ = p.parse_line("bad");
        let stats = p.reset_stats();
        assert_eq!(stats.lines_parsed, 2);
        assert_eq!(stats.errors_encountered, 1);
        assert_eq!(stats.error_rate, 0.5);
        let reset = p.reset_stats();
        assert_eq!(reset.lines_parsed, 0);
    }

    #[test]
    fn format_message_round_trips_through_parse_line() {
        let mut extra = HashMap::new();
        extra.insert("id".to_string(), Value::from(7));
        let line = JsonlParser::format_message("response", Some("hi"), extra);
        let mut p = JsonlParser::new(false);
        let v = p.parse_line(&line).unwrap();
        assert_eq!(v["type"], "response");
        assert_eq!(v["content"], "hi");
        assert_eq!(v["id"], 7);
    }
}
