// Copyright (c) 2026 Courier Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Wire Envelope
//!
//! Every message crossing the transport is wrapped as
//! `{type, timestamp, payload}`. The `type` tag is what the anti-loop guard
//! keys on first, so the set of self-produced types lives here next to the
//! envelope itself.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Known envelope type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeType {
    /// Canonical request for a backend call.
    Request,
    /// Reply produced by the gateway for a request.
    Response,
    /// Progress marker published before the backend call starts.
    ProcessingStatus,
    /// Reply produced by an application module consuming the same topics.
    ModuleReply,
    /// Startup / connection liveness check.
    TestProbe,
}

impl EnvelopeType {
    pub const ALL: [EnvelopeType; 5] = [
        EnvelopeType::Request,
        EnvelopeType::Response,
        EnvelopeType::ProcessingStatus,
        EnvelopeType::ModuleReply,
        EnvelopeType::TestProbe,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeType::Request => "llm_request",
            EnvelopeType::Response => "llm_response",
            EnvelopeType::ProcessingStatus => "processing_status",
            EnvelopeType::ModuleReply => "module_reply",
            EnvelopeType::TestProbe => "test_probe",
        }
    }

    /// Parse a wire tag. Matching is exact; unknown tags yield `None`.
    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == tag)
    }

    /// Types this gateway (or a sibling module) publishes as output.
    /// Seeing one of these on an inbound request path means a loop.
    pub fn is_self_produced(&self) -> bool {
        matches!(
            self,
            EnvelopeType::Response | EnvelopeType::ProcessingStatus | EnvelopeType::ModuleReply
        )
    }
}

impl std::fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire-level wrapper. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    message_type: String,

    /// Milliseconds since the Unix epoch, stamped at publish time.
    timestamp: i64,

    payload: Value,
}

impl Envelope {
    /// Build an envelope stamped with the current time.
    pub fn new(message_type: impl Into<String>, payload: Value) -> Self {
        Self::with_timestamp(message_type, Utc::now().timestamp_millis(), payload)
    }

    pub fn with_timestamp(message_type: impl Into<String>, timestamp: i64, payload: Value) -> Self {
        Self {
            message_type: message_type.into(),
            timestamp,
            payload,
        }
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }
}
