// Copyright (c) 2026 Courier Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Envelope Codec
//!
//! Wraps payloads as `{type, timestamp, payload}` JSON and applies standard
//! base64 so the result survives text-only transports. Decoding is fail-soft:
//! every failure comes back as an [`EnvelopeError`] for the caller to drop,
//! never as a panic.
//!
//! # Architecture
//!
//! - **Layer:** Infrastructure
//! - **Purpose:** Wire encoding for envelopes

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::domain::envelope::Envelope;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Payload could not be serialized: {0}")]
    Serialize(String),

    #[error("Input does not look like base64")]
    NotEncoded,

    #[error("Invalid base64: {0}")]
    Base64(String),

    #[error("Decoded bytes are not UTF-8")]
    Utf8,

    #[error("Decoded text is not valid JSON: {0}")]
    Json(String),

    #[error("Decoded JSON is not an envelope: {0}")]
    Structure(String),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self
    }

    /// Wrap `payload` in an envelope stamped now and encode it for transport.
    pub fn wrap<T: Serialize + ?Sized>(&self, payload: &T, message_type: &str) -> Result<String, EnvelopeError> {
        let payload = serde_json::to_value(payload).map_err(|e| EnvelopeError::Serialize(e.to_string()))?;
        self.encode(&Envelope::new(message_type, payload))
    }

    pub fn encode(&self, envelope: &Envelope) -> Result<String, EnvelopeError> {
        let json = serde_json::to_vec(envelope).map_err(|e| EnvelopeError::Serialize(e.to_string()))?;
        Ok(STANDARD.encode(json))
    }

    /// Reverse of [`EnvelopeCodec::wrap`].
    pub fn unwrap(&self, encoded: &str) -> Result<Envelope, EnvelopeError> {
        let value = self.decode_json(encoded)?;
        serde_json::from_value(value).map_err(|e| EnvelopeError::Structure(e.to_string()))
    }

    /// Base64-decode and JSON-parse without requiring envelope structure.
    pub fn decode_json(&self, encoded: &str) -> Result<Value, EnvelopeError> {
        let trimmed = encoded.trim();
        if !Self::looks_encoded(trimmed) {
            return Err(EnvelopeError::NotEncoded);
        }
        let bytes = STANDARD
            .decode(trimmed)
            .map_err(|e| EnvelopeError::Base64(e.to_string()))?;
        let text = String::from_utf8(bytes).map_err(|_| EnvelopeError::Utf8)?;
        serde_json::from_str(&text).map_err(|e| EnvelopeError::Json(e.to_string()))
    }

    /// Cheap structural pre-check: standard alphabet, padding only at the
    /// end (at most two), and a length divisible by four.
    pub fn looks_encoded(s: &str) -> bool {
        if s.is_empty() || s.len() % 4 != 0 {
            return false;
        }
        let body = s.trim_end_matches('=');
        if s.len() - body.len() > 2 {
            return false;
        }
        body.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/')
    }
}
