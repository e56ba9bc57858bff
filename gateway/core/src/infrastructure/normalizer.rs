// Copyright (c) 2026 Courier Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Message Normalizer
//!
//! Converts every wire shape the shared topics carry into a
//! [`CanonicalMessage`]:
//!
//! - raw bytes (decoded as UTF-8, then treated as text)
//! - JSON text (`{...}` or `[...]`)
//! - base64-encoded envelopes
//! - quoted / escaped strings wrapping any of the above (one level)
//! - already-structured maps, with string or non-string keys
//! - any `Serialize` value, via generic conversion
//!
//! Null and empty input normalize to an empty message. Everything else that
//! cannot be normalized returns a [`NormalizeError`]; the normalizer never
//! panics, so a malformed message can only ever be dropped, not crash the
//! consumer.
//!
//! A top-level JSON array is kept under the `items` key, since canonical
//! messages are always maps.

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::trace;

use crate::domain::message::CanonicalMessage;
use crate::infrastructure::codec::EnvelopeCodec;

/// Key under which a top-level JSON array is stored.
pub const ARRAY_ITEMS_KEY: &str = "items";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("Input bytes are not valid UTF-8")]
    InvalidUtf8,

    #[error("Text has no recognizable structure")]
    Unrecognized,

    #[error("Quoted text nested deeper than one level")]
    TooDeep,

    #[error("Unsupported value shape: {0}")]
    UnsupportedShape(&'static str),

    #[error("Generic conversion failed: {0}")]
    Conversion(String),
}

/// Raw inbound shapes accepted by [`MessageNormalizer::normalize`].
#[derive(Debug, Clone, PartialEq)]
pub enum RawInput {
    Null,
    Bytes(Vec<u8>),
    Text(String),
    Map(Map<String, Value>),
    /// A mapping whose keys are not all strings.
    Entries(Vec<(Value, Value)>),
    Value(Value),
}

impl From<&str> for RawInput {
    fn from(s: &str) -> Self {
        RawInput::Text(s.to_string())
    }
}

impl From<String> for RawInput {
    fn from(s: String) -> Self {
        RawInput::Text(s)
    }
}

impl From<Vec<u8>> for RawInput {
    fn from(bytes: Vec<u8>) -> Self {
        RawInput::Bytes(bytes)
    }
}

impl From<&[u8]> for RawInput {
    fn from(bytes: &[u8]) -> Self {
        RawInput::Bytes(bytes.to_vec())
    }
}

impl From<Map<String, Value>> for RawInput {
    fn from(map: Map<String, Value>) -> Self {
        RawInput::Map(map)
    }
}

impl From<Value> for RawInput {
    fn from(value: Value) -> Self {
        RawInput::Value(value)
    }
}

impl<T: Into<RawInput>> From<Option<T>> for RawInput {
    fn from(input: Option<T>) -> Self {
        input.map_or(RawInput::Null, Into::into)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessageNormalizer {
    codec: EnvelopeCodec,
}

impl MessageNormalizer {
    pub fn new() -> Self {
        Self {
            codec: EnvelopeCodec::new(),
        }
    }

    pub fn normalize(&self, input: impl Into<RawInput>) -> Result<CanonicalMessage, NormalizeError> {
        match input.into() {
            RawInput::Null => Ok(CanonicalMessage::new()),
            RawInput::Bytes(bytes) => {
                let text = String::from_utf8(bytes).map_err(|_| NormalizeError::InvalidUtf8)?;
                self.normalize_text(&text, 0)
            }
            RawInput::Text(text) => self.normalize_text(&text, 0),
            RawInput::Map(map) => Ok(CanonicalMessage::from(map)),
            RawInput::Entries(entries) => Ok(Self::from_entries(entries)),
            RawInput::Value(value) => self.normalize_value(value, 0),
        }
    }

    /// Generic conversion for any serializable object.
    pub fn normalize_object<T: Serialize + ?Sized>(&self, object: &T) -> Result<CanonicalMessage, NormalizeError> {
        let value = serde_json::to_value(object).map_err(|e| NormalizeError::Conversion(e.to_string()))?;
        self.normalize_value(value, 0)
    }

    fn normalize_value(&self, value: Value, depth: u8) -> Result<CanonicalMessage, NormalizeError> {
        match value {
            Value::Null => Ok(CanonicalMessage::new()),
            Value::Object(map) => Ok(CanonicalMessage::from(map)),
            Value::Array(items) => {
                let mut message = CanonicalMessage::new();
                message.insert(ARRAY_ITEMS_KEY, Value::Array(items));
                Ok(message)
            }
            Value::String(text) => self.normalize_text(&text, depth),
            Value::Bool(_) => Err(NormalizeError::UnsupportedShape("boolean")),
            Value::Number(_) => Err(NormalizeError::UnsupportedShape("number")),
        }
    }

    fn normalize_text(&self, text: &str, depth: u8) -> Result<CanonicalMessage, NormalizeError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(CanonicalMessage::new());
        }

        if looks_like_json(trimmed) {
            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) => return self.normalize_value(value, depth),
                Err(e) => trace!(error = %e, "JSON-like text failed to parse"),
            }
        }

        if EnvelopeCodec::looks_encoded(trimmed) {
            match self.codec.decode_json(trimmed) {
                Ok(value @ Value::Object(_)) => return self.normalize_value(value, depth),
                Ok(_) => trace!("base64 text decoded to a non-object"),
                Err(e) => trace!(error = %e, "base64-like text failed to decode"),
            }
        }

        if let Some(inner) = strip_matching_quotes(trimmed) {
            if depth >= 1 {
                return Err(NormalizeError::TooDeep);
            }
            return self.normalize_text(&unescape(inner), depth + 1);
        }

        Err(NormalizeError::Unrecognized)
    }

    fn from_entries(entries: Vec<(Value, Value)>) -> CanonicalMessage {
        let mut message = CanonicalMessage::new();
        for (key, value) in entries {
            let key = match key {
                Value::String(s) => s,
                other => other.to_string(),
            };
            message.insert(key, value);
        }
        message
    }
}

fn looks_like_json(s: &str) -> bool {
    (s.starts_with('{') && s.ends_with('}')) || (s.starts_with('[') && s.ends_with(']'))
}

fn strip_matching_quotes(s: &str) -> Option<&str> {
    if s.len() < 2 {
        return None;
    }
    let first = s.chars().next()?;
    if (first == '"' || first == '\'') && s.ends_with(first) {
        Some(&s[1..s.len() - 1])
    } else {
        None
    }
}

/// Undo the common escape sequences left behind by double encoding.
fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('"') => out.push('"'),
            Some('\'') => out.push('\''),
            Some('\\') => out.push('\\'),
            Some('/') => out.push('/'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn normalizer() -> MessageNormalizer {
        MessageNormalizer::new()
    }

    fn sample() -> Value {
        json!({"session_id": "chat-42", "prompt": "hi", "options": {"temperature": 50}})
    }

    #[test]
    fn test_null_and_empty_are_empty_messages() {
        let n = normalizer();
        assert!(n.normalize(RawInput::Null).unwrap().is_empty());
        assert!(n.normalize("").unwrap().is_empty());
        assert!(n.normalize("   ").unwrap().is_empty());
        assert!(n.normalize(Vec::<u8>::new()).unwrap().is_empty());
        assert!(n.normalize(None::<String>).unwrap().is_empty());
    }

    #[test]
    fn test_all_shapes_recover_content() {
        let n = normalizer();
        let text = sample().to_string();
        let expected = sample();

        let from_bytes = n.normalize(text.clone().into_bytes()).unwrap();
        assert_eq!(from_bytes.to_value(), expected);

        let from_text = n.normalize(text.as_str()).unwrap();
        assert_eq!(from_text.to_value(), expected);

        let quoted = serde_json::to_string(&text).unwrap();
        let from_quoted = n.normalize(quoted).unwrap();
        assert_eq!(from_quoted.to_value(), expected);

        let single_quoted = format!("'{}'", text);
        assert_eq!(n.normalize(single_quoted).unwrap().to_value(), expected);

        let from_map = n.normalize(expected.as_object().unwrap().clone()).unwrap();
        assert_eq!(from_map.to_value(), expected);
    }

    #[test]
    fn test_base64_envelope() {
        let n = normalizer();
        let encoded = EnvelopeCodec::new().wrap(&sample(), "llm_request").unwrap();
        let msg = n.normalize(encoded).unwrap();
        assert_eq!(msg.type_tag(), Some("llm_request"));
        assert_eq!(msg.get("payload"), Some(&sample()));
        assert_eq!(msg.session_id(), Some("chat-42"));
    }

    #[test]
    fn test_json_array_kept_under_items() {
        let msg = normalizer().normalize("[1, 2]").unwrap();
        assert_eq!(msg.get(ARRAY_ITEMS_KEY), Some(&json!([1, 2])));
    }

    #[test]
    fn test_non_string_keys_converted() {
        let msg = normalizer()
            .normalize(RawInput::Entries(vec![
                (json!(1), json!("one")),
                (json!("two"), json!(2)),
                (json!(true), json!(null)),
            ]))
            .unwrap();
        assert_eq!(msg.get("1"), Some(&json!("one")));
        assert_eq!(msg.get("two"), Some(&json!(2)));
        assert!(msg.contains_key("true"));
    }

    #[test]
    fn test_generic_object_conversion() {
        #[derive(Serialize)]
        struct Probe {
            source: &'static str,
            attempt: u32,
        }
        let msg = normalizer()
            .normalize_object(&Probe { source: "startup", attempt: 1 })
            .unwrap();
        assert_eq!(msg.get("source"), Some(&json!("startup")));
    }

    #[test]
    fn test_failures_are_errors_not_panics() {
        let n = normalizer();
        assert_eq!(n.normalize(vec![0xffu8, 0xfe, 0x00]), Err(NormalizeError::InvalidUtf8));
        assert_eq!(n.normalize("just words"), Err(NormalizeError::Unrecognized));
        assert_eq!(n.normalize("{not json}"), Err(NormalizeError::Unrecognized));
        assert_eq!(n.normalize(json!(12)), Err(NormalizeError::UnsupportedShape("number")));
        assert_eq!(n.normalize("\"'{}'\""), Err(NormalizeError::TooDeep));
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape(r#"a\"b\\c\nd\q"#), "a\"b\\c\nd\\q");
    }
}
