// Copyright (c) 2026 Courier Contributors
// SPDX-License-Identifier: AGPL-3.0
//! Llm
//!
//! Backend port for the language-model service the gateway fronts.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Anti-corruption layer between gateway logic and vendor APIs

// Implementations live in infrastructure/llm/.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Domain interface for the responses-style LLM backend
#[async_trait]
pub trait ResponsesBackend: Send + Sync {
    /// Create a single response for `request`, authenticating with `api_key`
    async fn create_response(
        &self,
        api_key: &str,
        request: &BackendRequest,
    ) -> Result<BackendResponse, LLMError>;
}

/// Input handed to the backend for one call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendRequest {
    /// Model identifier (e.g., "gpt-4.1-mini")
    pub model: String,

    /// Ordered input blocks: context shards first, user prompt last
    pub input: Vec<InputBlock>,

    /// System-level instructions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    /// Sampling temperature on the backend's 0-2 scale
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    pub max_output_tokens: u32,

    /// Hint the backend uses to route calls sharing a prompt prefix
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_cache_key: Option<String>,

    /// Stable, non-reversible identifier of the end user
    #[serde(skip_serializing_if = "Option::is_none")]
    pub safety_identifier: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputBlock {
    pub role: String,
    pub text: String,
}

impl InputBlock {
    pub fn developer(text: impl Into<String>) -> Self {
        Self {
            role: "developer".to_string(),
            text: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BackendResponse {
    pub id: String,

    /// Model that actually served the call
    pub model: String,

    pub output: Vec<OutputBlock>,

    pub usage: TokenUsage,
}

impl BackendResponse {
    /// Concatenated text of all text blocks, in order
    pub fn output_text(&self) -> String {
        self.output
            .iter()
            .filter_map(|block| match block {
                OutputBlock::Text { text } => Some(text.as_str()),
                OutputBlock::ToolCall { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &OutputBlock> {
        self.output
            .iter()
            .filter(|block| matches!(block, OutputBlock::ToolCall { .. }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutputBlock {
    Text {
        text: String,
    },
    ToolCall {
        call_id: String,
        name: String,
        arguments: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Portion of `input_tokens` served from the backend's prefix cache
    pub cached_input_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Errors that can occur during LLM operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum LLMError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Rate limit exceeded")]
    RateLimit,

    #[error("HTTP {code}: {message}")]
    Status { code: u16, message: String },

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
