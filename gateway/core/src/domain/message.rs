// Copyright (c) 2026 Courier Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Canonical Message & Intent
//!
//! The normalizer turns every supported wire shape into a [`CanonicalMessage`];
//! the classifier then assigns it a [`MessageIntent`]. Neither type has
//! identity beyond its content and neither outlives one request/response cycle.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Implementation-neutral key/value message form

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Well-known field names read by the classifier and the router.
pub mod fields {
    pub const TYPE: &str = "type";
    pub const PAYLOAD: &str = "payload";
    pub const SOURCE: &str = "source";
    pub const MODULE: &str = "module";

    /// Accepted spellings of the session (correlation) identifier.
    pub const SESSION_ID: [&str; 4] = ["session_id", "sessionId", "chat_id", "chatId"];
    pub const PROMPT: [&str; 2] = ["prompt", "message"];
    pub const OPTIONS: [&str; 2] = ["options", "parameters"];
}

/// Ordered, key-unique mapping from field name to JSON value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CanonicalMessage(Map<String, Value>);

impl CanonicalMessage {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(key.into(), value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Explicit envelope tag, if the message carries one as a string.
    pub fn type_tag(&self) -> Option<&str> {
        self.0.get(fields::TYPE).and_then(Value::as_str)
    }

    /// Nested payload object, if present.
    pub fn payload(&self) -> Option<&Map<String, Value>> {
        self.0.get(fields::PAYLOAD).and_then(Value::as_object)
    }

    /// The body a handler should act on: the nested payload when this is an
    /// envelope carrying one, otherwise the message itself.
    pub fn body(&self) -> &Map<String, Value> {
        match (self.type_tag(), self.payload()) {
            (Some(_), Some(payload)) => payload,
            _ => &self.0,
        }
    }

    /// Session identifier from the body, trimmed. Blank values count as absent.
    pub fn session_id(&self) -> Option<&str> {
        first_non_blank(self.body(), &fields::SESSION_ID)
    }
}

impl From<Map<String, Value>> for CanonicalMessage {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// First non-blank string value among `keys`, in order.
pub fn first_non_blank<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| map.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
}

/// What the gateway should do with a canonical message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageIntent {
    /// A fresh request that should reach the backend.
    NewRequest,
    /// A reply to an earlier request; completes a pending caller.
    ResponseEnvelope,
    /// Startup / connection liveness check.
    TestProbe,
    /// Loop-prevention marker. Must be dropped silently.
    AlreadyProcessed,
    Unrecognized,
}

impl std::fmt::Display for MessageIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageIntent::NewRequest => "new_request",
            MessageIntent::ResponseEnvelope => "response_envelope",
            MessageIntent::TestProbe => "test_probe",
            MessageIntent::AlreadyProcessed => "already_processed",
            MessageIntent::Unrecognized => "unrecognized",
        };
        f.write_str(s)
    }
}
