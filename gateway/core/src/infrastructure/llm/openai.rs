// Copyright (c) 2026 Courier Contributors
// SPDX-License-Identifier: AGPL-3.0

// OpenAI Responses Adapter
//
// Anti-Corruption Layer for the OpenAI `/responses` API.
// Also works with compatible gateways that expose the same route.

use crate::domain::llm::{
    BackendRequest, BackendResponse, InputBlock, LLMError, OutputBlock, ResponsesBackend,
    TokenUsage,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub struct OpenAIResponsesAdapter {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Serialize)]
struct ResponsesRequest<'a> {
    model: &'a str,
    input: Vec<ResponsesInput<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instructions: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    max_output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt_cache_key: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    safety_identifier: Option<&'a str>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    metadata: Map<String, Value>,
}

#[derive(Serialize)]
struct ResponsesInput<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ResponsesResponse {
    id: String,
    model: String,
    #[serde(default)]
    output: Vec<ResponsesOutput>,
    #[serde(default)]
    usage: Option<ResponsesUsage>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponsesOutput {
    Message {
        #[serde(default)]
        content: Vec<ResponsesContent>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponsesContent {
    OutputText { text: String },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct ResponsesUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
    #[serde(default)]
    input_tokens_details: Option<InputTokenDetails>,
}

#[derive(Deserialize)]
struct InputTokenDetails {
    #[serde(default)]
    cached_tokens: u32,
}

impl OpenAIResponsesAdapter {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), endpoint)
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    fn to_wire<'a>(request: &'a BackendRequest) -> ResponsesRequest<'a> {
        let mut metadata = Map::new();
        if let Some(session_id) = &request.session_id {
            metadata.insert("session_id".into(), Value::String(session_id.clone()));
        }
        ResponsesRequest {
            model: &request.model,
            input: request
                .input
                .iter()
                .map(|block: &InputBlock| ResponsesInput {
                    role: block.role.as_str(),
                    content: block.text.as_str(),
                })
                .collect(),
            instructions: request.instructions.as_deref(),
            temperature: request.temperature,
            max_output_tokens: request.max_output_tokens,
            prompt_cache_key: request.prompt_cache_key.as_deref(),
            safety_identifier: request.safety_identifier.as_deref(),
            metadata,
        }
    }

    fn from_wire(response: ResponsesResponse) -> BackendResponse {
        let mut output = Vec::new();
        for item in response.output {
            match item {
                ResponsesOutput::Message { content } => {
                    output.extend(content.into_iter().filter_map(|c| match c {
                        ResponsesContent::OutputText { text } => Some(OutputBlock::Text { text }),
                        ResponsesContent::Other => None,
                    }));
                }
                ResponsesOutput::FunctionCall { call_id, name, arguments } => {
                    output.push(OutputBlock::ToolCall { call_id, name, arguments });
                }
                ResponsesOutput::Other => {}
            }
        }

        let usage = response
            .usage
            .map(|u| TokenUsage {
                input_tokens: u.input_tokens,
                output_tokens: u.output_tokens,
                cached_input_tokens: u.input_tokens_details.map(|d| d.cached_tokens).unwrap_or(0),
            })
            .unwrap_or_default();

        BackendResponse {
            id: response.id,
            model: response.model,
            output,
            usage,
        }
    }
}

fn transport_error(e: reqwest::Error) -> LLMError {
    if e.is_timeout() {
        LLMError::Timeout(e.to_string())
    } else {
        LLMError::Network(e.to_string())
    }
}

#[async_trait]
impl ResponsesBackend for OpenAIResponsesAdapter {
    async fn create_response(
        &self,
        api_key: &str,
        request: &BackendRequest,
    ) -> Result<BackendResponse, LLMError> {
        let url = format!("{}/responses", self.endpoint.trim_end_matches('/'));

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&Self::to_wire(request))
            .send()
            .await
            .map_err(transport_error)?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();

            return Err(if status == 401 || status == 403 {
                LLMError::Authentication(error_text)
            } else if status == 429 {
                LLMError::RateLimit
            } else {
                LLMError::Status {
                    code: status.as_u16(),
                    message: error_text,
                }
            });
        }

        let body: ResponsesResponse = response
            .json()
            .await
            .map_err(|e| LLMError::Provider(format!("Failed to parse response: {}", e)))?;

        Ok(Self::from_wire(body))
    }
}
