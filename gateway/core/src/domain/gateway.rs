// Copyright (c) 2026 Courier Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Gateway Request / Response
//!
//! The application-level payloads carried inside `llm_request` and
//! `llm_response` envelopes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::domain::llm::OutputBlock;
use crate::domain::shard::{ContextShard, ShardError};

/// Namespace used when a request names no module.
pub const GENERIC_MODULE: &str = "generic";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("Request is missing a session identifier")]
    MissingSession,

    #[error("Request is missing a prompt")]
    MissingPrompt,

    #[error("Invalid context shard: {0}")]
    Shard(#[from] ShardError),
}

/// A caller's request for one backend call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayRequest {
    /// Correlation key; replies are matched to callers by this value.
    #[serde(alias = "sessionId", alias = "chat_id", alias = "chatId")]
    pub session_id: String,

    #[serde(alias = "message")]
    pub prompt: String,

    #[serde(default, alias = "parameters")]
    pub options: RequestOptions,

    /// Application module that issued the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,

    /// Audit-log row for this request, when the caller keeps one.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "requestId")]
    pub request_id: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shards: Vec<ContextShard>,
}

impl GatewayRequest {
    pub fn new(session_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            prompt: prompt.into(),
            options: RequestOptions::default(),
            module: None,
            request_id: None,
            instructions: None,
            shards: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<(), RequestError> {
        if self.session_id.trim().is_empty() {
            return Err(RequestError::MissingSession);
        }
        if self.prompt.trim().is_empty() {
            return Err(RequestError::MissingPrompt);
        }
        for shard in &self.shards {
            shard.validate()?;
        }
        Ok(())
    }

    /// Module namespace, falling back to [`GENERIC_MODULE`].
    pub fn module_key(&self) -> &str {
        self.module
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(GENERIC_MODULE)
    }
}

/// Per-request tuning knobs. Numeric inputs are kept as raw JSON so that
/// strings and out-of-range values can be clamped instead of rejected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Temperature on the external 0-100 scale.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none", alias = "maxTokens")]
    pub max_tokens: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none", alias = "rulesVersion")]
    pub rules_version: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none", alias = "schemaVersion")]
    pub schema_version: Option<u32>,

    /// Free-text facet folded into the cache key.
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "cacheFacet")]
    pub cache_facet: Option<String>,
}

/// Reply published for every request, successful or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayResponse {
    #[serde(alias = "sessionId", alias = "chat_id", alias = "chatId")]
    pub session_id: String,

    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_id: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<OutputBlock>,

    #[serde(default)]
    pub input_tokens: u32,

    #[serde(default)]
    pub output_tokens: u32,

    #[serde(default)]
    pub total_tokens: u32,

    #[serde(default)]
    pub cached_input_tokens: u32,

    /// Cost of the call in USD.
    #[serde(default)]
    pub cost: f64,

    #[serde(default)]
    pub duration_ms: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<i64>,
}

impl GatewayResponse {
    pub fn success(session_id: impl Into<String>, result: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            success: true,
            result: Some(result.into()),
            error: None,
            error_code: None,
            model: None,
            response_id: None,
            tool_calls: Vec::new(),
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            cached_input_tokens: 0,
            cost: 0.0,
            duration_ms: 0,
            request_id: None,
        }
    }

    /// Error-shaped reply: what a caller sees for a permanent failure.
    pub fn failure(
        session_id: impl Into<String>,
        message: impl Into<String>,
        code: Option<&str>,
    ) -> Self {
        Self {
            success: false,
            result: None,
            error: Some(message.into()),
            error_code: code.map(str::to_string),
            ..Self::success(session_id, "")
        }
    }

    pub fn with_request_id(mut self, request_id: Option<i64>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_aliases() {
        let request: GatewayRequest = serde_json::from_value(json!({
            "chatId": "chat-42",
            "message": "hi",
            "parameters": {"maxTokens": "512", "temperature": 70}
        }))
        .unwrap();
        assert_eq!(request.session_id, "chat-42");
        assert_eq!(request.prompt, "hi");
        assert_eq!(request.options.max_tokens, Some(json!("512")));
        assert_eq!(request.module_key(), GENERIC_MODULE);
    }

    #[test]
    fn test_validate() {
        assert_eq!(GatewayRequest::new(" ", "p").validate(), Err(RequestError::MissingSession));
        assert_eq!(GatewayRequest::new("s", "").validate(), Err(RequestError::MissingPrompt));
        assert!(GatewayRequest::new("s", "p").validate().is_ok());
    }

    #[test]
    fn test_failure_shape() {
        let response = GatewayResponse::failure("chat-1", "bad request", Some("http_400"));
        assert!(!response.success);
        assert_eq!(response.result, None);
        assert_eq!(response.error_code.as_deref(), Some("http_400"));

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["error"], json!("bad request"));
        assert!(value.get("result").is_none());
    }
}
