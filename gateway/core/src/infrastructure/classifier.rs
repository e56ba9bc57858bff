// Copyright (c) 2026 Courier Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Message Classifier
//!
//! Assigns a [`MessageIntent`] to a canonical message. Requests and
//! responses share topics with other consumer modules, and intermediate hops
//! may strip envelope tags, so classification falls back to the *shape* of
//! the payload when no tag is present.
//!
//! Priority order on the request path (first match wins):
//!
//! 1. A self-produced envelope tag (response, processing status, module
//!    reply) → `AlreadyProcessed`. This is the primary anti-loop guard.
//! 2. The request tag → classify the nested payload (or `NewRequest` when
//!    there is none); the probe tag → `TestProbe` unless its payload carries
//!    a response signature; any other tag → `AlreadyProcessed`.
//! 3. No tag → classify the top-level message by shape.
//!
//! Shape rules: two or more response-signature fields → `AlreadyProcessed`;
//! a startup `source` → `TestProbe`; a non-blank, non-synthetic session id
//! with a prompt and an options block → `NewRequest`; otherwise
//! `Unrecognized`.
//!
//! [`MessageClassifier::classify`] is pure. [`MessageClassifier::admit`]
//! adds the duplicate check used by the router.

use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;

use crate::domain::envelope::EnvelopeType;
use crate::domain::message::{fields, first_non_blank, CanonicalMessage, MessageIntent};
use crate::infrastructure::dedup::DuplicateGuard;

/// Fields that only ever appear on a reply.
pub const RESPONSE_SIGNATURE_FIELDS: [&str; 10] = [
    "result",
    "response_text",
    "cost",
    "input_tokens",
    "output_tokens",
    "total_tokens",
    "success",
    "error",
    "error_code",
    "duration_ms",
];

/// Minimum signature hits for the structural anti-loop guard.
pub const RESPONSE_SIGNATURE_THRESHOLD: usize = 2;

/// `source` values sent by startup and connection checks.
pub const PROBE_SOURCES: [&str; 3] = ["startup", "startup_probe", "connection_test"];

/// Session-id prefixes used by synthetic traffic that must never reach the backend.
pub const SYNTHETIC_SESSION_PREFIXES: [&str; 2] = ["test-", "probe-"];

/// Outcome of [`MessageClassifier::admit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Accepted(MessageIntent),
    Duplicate { fingerprint: String },
}

#[derive(Clone)]
pub struct MessageClassifier {
    guard: Arc<DuplicateGuard>,
}

impl MessageClassifier {
    pub fn new(guard: Arc<DuplicateGuard>) -> Self {
        Self { guard }
    }

    /// Request-path classification. Pure and idempotent.
    pub fn classify(&self, message: &CanonicalMessage) -> MessageIntent {
        let Some(tag) = message.type_tag() else {
            return classify_payload(message.as_map());
        };

        match EnvelopeType::from_tag(tag) {
            Some(t) if t.is_self_produced() => MessageIntent::AlreadyProcessed,
            Some(EnvelopeType::Request) => match message.payload() {
                Some(payload) => classify_payload(payload),
                None => MessageIntent::NewRequest,
            },
            Some(EnvelopeType::TestProbe) => match message.payload() {
                Some(payload) if signature_hits(payload) >= RESPONSE_SIGNATURE_THRESHOLD => {
                    MessageIntent::AlreadyProcessed
                }
                _ => MessageIntent::TestProbe,
            },
            _ => MessageIntent::AlreadyProcessed,
        }
    }

    /// Classify, then drop redeliveries of new requests.
    pub fn admit(&self, message: &CanonicalMessage) -> Admission {
        let intent = self.classify(message);
        if intent != MessageIntent::NewRequest {
            return Admission::Accepted(intent);
        }

        let fingerprint = DuplicateGuard::fingerprint_message(message);
        if self.guard.check_and_mark(&fingerprint) {
            debug!(fingerprint = %fingerprint, "Duplicate request suppressed");
            return Admission::Duplicate { fingerprint };
        }
        Admission::Accepted(intent)
    }

    /// Response-path classification, used by the caller side to find
    /// replies that can complete a pending request.
    pub fn classify_reply(&self, message: &CanonicalMessage) -> MessageIntent {
        let tag = message.type_tag().map(EnvelopeType::from_tag);
        let body = message.body();

        match tag {
            Some(Some(EnvelopeType::Response)) | Some(Some(EnvelopeType::ModuleReply)) => {
                if first_non_blank(body, &fields::SESSION_ID).is_some() {
                    MessageIntent::ResponseEnvelope
                } else {
                    MessageIntent::Unrecognized
                }
            }
            Some(Some(EnvelopeType::ProcessingStatus)) => MessageIntent::AlreadyProcessed,
            Some(Some(EnvelopeType::TestProbe)) => MessageIntent::TestProbe,
            Some(_) => MessageIntent::Unrecognized,
            None => {
                if signature_hits(body) >= RESPONSE_SIGNATURE_THRESHOLD
                    && first_non_blank(body, &fields::SESSION_ID).is_some()
                {
                    MessageIntent::ResponseEnvelope
                } else {
                    MessageIntent::Unrecognized
                }
            }
        }
    }
}

fn signature_hits(payload: &Map<String, Value>) -> usize {
    RESPONSE_SIGNATURE_FIELDS
        .iter()
        .filter(|f| payload.contains_key(**f))
        .count()
}

fn classify_payload(payload: &Map<String, Value>) -> MessageIntent {
    if signature_hits(payload) >= RESPONSE_SIGNATURE_THRESHOLD {
        return MessageIntent::AlreadyProcessed;
    }

    let is_probe = payload
        .get(fields::SOURCE)
        .and_then(Value::as_str)
        .is_some_and(|s| PROBE_SOURCES.contains(&s.trim()));
    if is_probe {
        return MessageIntent::TestProbe;
    }

    let session = first_non_blank(payload, &fields::SESSION_ID);
    let has_prompt = first_non_blank(payload, &fields::PROMPT).is_some();
    let has_options = fields::OPTIONS
        .iter()
        .any(|k| payload.get(*k).is_some_and(Value::is_object));

    match session {
        Some(session) if has_prompt && has_options && !is_synthetic(session) => MessageIntent::NewRequest,
        _ => MessageIntent::Unrecognized,
    }
}

fn is_synthetic(session_id: &str) -> bool {
    SYNTHETIC_SESSION_PREFIXES
        .iter()
        .any(|p| session_id.starts_with(p))
}
