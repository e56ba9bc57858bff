// Copyright (c) 2026 Courier Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Request Execution Service
//!
//! Calls the backend for one [`GatewayRequest`] and turns the outcome into
//! a [`GatewayResponse`]. Failures are split in two:
//!
//! - **Transient** (I/O, timeouts, 429, 5xx): surfaced as
//!   [`ExecutionError::Transient`] by [`RequestExecutor::execute`] and retried
//!   with exponential backoff by [`RequestExecutor::execute_with_retry`].
//! - **Permanent** (everything else): returned as an error-shaped response so
//!   the caller can publish it like any other reply.
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Orchestrates backend, cache-key composer and audit log

use regex::Regex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::domain::audit::{AuditLog, AuditStatus, CompletionRecord};
use crate::domain::config::BackendConfig;
use crate::domain::gateway::{GatewayRequest, GatewayResponse};
use crate::domain::llm::{BackendRequest, InputBlock, LLMError, ResponsesBackend};
use crate::infrastructure::shard_key::{CacheKeyComposer, CacheScope};

/// Error code on replies for requests that ran out of retries.
pub const BACKEND_UNAVAILABLE: &str = "backend_unavailable";

const TEMPERATURE_SCALE_MAX: f64 = 100.0;
const BACKEND_TEMPERATURE_MAX: f64 = 2.0;

/// Fallback for adapters that only hand back an error string.
static TRANSIENT_MESSAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:http|status|code)[ :=]*(?:429|5\d\d)\b|timed? ?out|connection (?:reset|refused|closed|aborted)|broken pipe|i/o error|temporarily unavailable|service unavailable|bad gateway|gateway timeout|internal server error|too many requests|rate limit",
    )
    .expect("valid transient error regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Permanent,
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Transient backend failure: {0}")]
    Transient(LLMError),
}

pub fn classify_failure(error: &LLMError) -> FailureClass {
    match error {
        LLMError::Network(_) | LLMError::Timeout(_) | LLMError::RateLimit => FailureClass::Transient,
        LLMError::Status { code, .. } if *code == 429 || (500..600).contains(code) => {
            FailureClass::Transient
        }
        LLMError::Provider(message) => classify_message(message),
        LLMError::Status { .. } | LLMError::Authentication(_) | LLMError::InvalidInput(_) => {
            FailureClass::Permanent
        }
    }
}

pub fn classify_message(message: &str) -> FailureClass {
    if TRANSIENT_MESSAGE.is_match(message) {
        FailureClass::Transient
    } else {
        FailureClass::Permanent
    }
}

fn error_code(error: &LLMError) -> String {
    match error {
        LLMError::Authentication(_) => "authentication_failed".into(),
        LLMError::InvalidInput(_) => "invalid_request".into(),
        LLMError::Status { code, .. } => format!("http_{}", code),
        LLMError::Provider(_) => "provider_error".into(),
        LLMError::Network(_) | LLMError::Timeout(_) | LLMError::RateLimit => BACKEND_UNAVAILABLE.into(),
    }
}

/// Map a 0-100 temperature onto the backend's 0-2 range, 3 decimals.
/// Absent or unparsable input leaves the backend default in place.
pub fn clamp_temperature(raw: Option<&Value>) -> Option<f64> {
    let value = parse_number(raw?)?;
    let scaled = value.clamp(0.0, TEMPERATURE_SCALE_MAX) / TEMPERATURE_SCALE_MAX * BACKEND_TEMPERATURE_MAX;
    Some((scaled * 1000.0).round() / 1000.0)
}

/// Clamp a token limit into `[min, max]`; `default` when absent or unparsable.
pub fn clamp_max_tokens(raw: Option<&Value>, min: u32, max: u32, default: u32) -> u32 {
    let requested = raw.and_then(parse_number).filter(|n| *n > 0.0);
    match requested {
        Some(n) => (n.floor().min(f64::from(max)) as u32).clamp(min, max),
        None => default.clamp(min, max),
    }
}

fn parse_number(raw: &Value) -> Option<f64> {
    let n = match raw {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// Stable per-session identifier that does not reveal the session id.
fn safety_identifier(session_id: &str) -> String {
    let digest = Sha256::digest(format!("courier:{}", session_id).as_bytes());
    let mut id = hex::encode(digest);
    id.truncate(32);
    id
}

pub struct RequestExecutor {
    backend: Arc<dyn ResponsesBackend>,
    composer: CacheKeyComposer,
    config: BackendConfig,
    api_key: String,
    audit: Option<Arc<dyn AuditLog>>,
}

impl RequestExecutor {
    pub fn new(backend: Arc<dyn ResponsesBackend>, config: BackendConfig, api_key: impl Into<String>) -> Self {
        Self {
            backend,
            composer: CacheKeyComposer::new(config.max_shard_bytes),
            config,
            api_key: api_key.into(),
            audit: None,
        }
    }

    /// Build from configuration, resolving `env:` API keys.
    pub fn from_config(backend: Arc<dyn ResponsesBackend>, config: BackendConfig) -> anyhow::Result<Self> {
        let api_key = config.resolve_api_key()?;
        Ok(Self::new(backend, config, api_key))
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    /// Backend input: shard blocks as developer messages in prefix-cache
    /// order, then the user prompt.
    pub fn build_backend_request(&self, request: &GatewayRequest) -> BackendRequest {
        let options = &request.options;
        let scope = CacheScope::new(&request.session_id)
            .module(request.module_key())
            .versions(options.rules_version, options.schema_version)
            .facet(options.cache_facet.as_deref());
        let cache_key = self.composer.compose(&scope, &request.shards);

        let mut input: Vec<InputBlock> = self
            .composer
            .to_ordered_blocks(&request.shards)
            .into_iter()
            .map(|block| InputBlock::developer(block.text))
            .collect();
        input.push(InputBlock::user(request.prompt.clone()));

        BackendRequest {
            model: self.model_for(request).to_string(),
            input,
            instructions: request.instructions.clone(),
            temperature: clamp_temperature(options.temperature.as_ref()),
            max_output_tokens: clamp_max_tokens(
                options.max_tokens.as_ref(),
                self.config.min_output_tokens,
                self.config.max_output_tokens,
                self.config.default_output_tokens,
            ),
            prompt_cache_key: Some(cache_key.into_string()),
            safety_identifier: Some(safety_identifier(&request.session_id)),
            session_id: Some(request.session_id.clone()),
        }
    }

    /// One backend call. Transient failures come back as `Err`; permanent
    /// failures as an error-shaped `Ok` response.
    pub async fn execute(&self, request: &GatewayRequest) -> Result<GatewayResponse, ExecutionError> {
        let backend_request = self.build_backend_request(request);
        let started = Instant::now();

        match self.backend.create_response(&self.api_key, &backend_request).await {
            Ok(response) => {
                let usage = response.usage;
                let cost = self
                    .config
                    .pricing_for(&response.model)
                    .or_else(|| self.config.pricing_for(&backend_request.model))
                    .map(|p| p.cost(usage.input_tokens, usage.output_tokens))
                    .unwrap_or(0.0);

                let mut reply = GatewayResponse::success(&request.session_id, response.output_text());
                reply.model = Some(response.model.clone());
                reply.response_id = Some(response.id.clone());
                reply.tool_calls = response.tool_calls().cloned().collect();
                reply.input_tokens = usage.input_tokens;
                reply.output_tokens = usage.output_tokens;
                reply.total_tokens = usage.total();
                reply.cached_input_tokens = usage.cached_input_tokens;
                reply.cost = cost;

                debug!(
                    session_id = %request.session_id,
                    response_id = %response.id,
                    input_tokens = usage.input_tokens,
                    output_tokens = usage.output_tokens,
                    "Backend call succeeded"
                );
                Ok(reply
                    .with_request_id(request.request_id)
                    .with_duration_ms(elapsed_ms(started)))
            }
            Err(e) => match classify_failure(&e) {
                FailureClass::Transient => Err(ExecutionError::Transient(e)),
                FailureClass::Permanent => {
                    error!(session_id = %request.session_id, error = %e, "Backend call failed permanently");
                    Ok(GatewayResponse::failure(&request.session_id, e.to_string(), Some(error_code(&e).as_str()))
                        .with_request_id(request.request_id)
                        .with_duration_ms(elapsed_ms(started)))
                }
            },
        }
    }

    /// Execute with retries and audit bookkeeping. Always yields a reply.
    pub async fn execute_with_retry(&self, request: &GatewayRequest) -> GatewayResponse {
        let started = Instant::now();
        if let Some(id) = request.request_id {
            self.audit_sent(id).await;
        }

        let max_attempts = self.config.retry.max_attempts.max(1);
        let mut attempt = 0;
        let response = loop {
            match self.execute(request).await {
                Ok(response) => {
                    if attempt > 0 {
                        info!(session_id = %request.session_id, "Backend call succeeded on attempt {}", attempt + 1);
                    }
                    break response;
                }
                Err(ExecutionError::Transient(e)) => {
                    warn!(
                        session_id = %request.session_id,
                        "Backend call failed (attempt {}/{}): {}",
                        attempt + 1,
                        max_attempts,
                        e
                    );
                    if attempt + 1 >= max_attempts {
                        break GatewayResponse::failure(
                            &request.session_id,
                            format!("Backend unavailable after {} attempts: {}", max_attempts, e),
                            Some(BACKEND_UNAVAILABLE),
                        )
                        .with_request_id(request.request_id);
                    }
                    tokio::time::sleep(backoff(self.config.retry.base_delay, attempt)).await;
                    attempt += 1;
                }
            }
        };

        let response = response.with_duration_ms(elapsed_ms(started));
        if let Some(id) = request.request_id {
            self.audit_completed(id, &response).await;
        }
        response
    }

    fn model_for<'a>(&'a self, request: &'a GatewayRequest) -> &'a str {
        request
            .options
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.config.default_model)
    }

    async fn audit_sent(&self, request_id: i64) {
        let Some(audit) = &self.audit else { return };
        if let Err(e) = audit.mark_sent(request_id).await {
            warn!(request_id, error = %e, "Failed to mark audit row as sent");
        }
    }

    async fn audit_completed(&self, request_id: i64, response: &GatewayResponse) {
        let Some(audit) = &self.audit else { return };
        let record = CompletionRecord {
            status: if response.success {
                AuditStatus::Completed
            } else {
                AuditStatus::Failed
            },
            duration_ms: response.duration_ms,
            cost: response.cost,
            response_text: response.result.clone(),
            error: response.error.clone(),
        };
        if let Err(e) = audit.mark_completed(request_id, record).await {
            warn!(request_id, error = %e, "Failed to mark audit row as completed");
        }
    }
}

fn backoff(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2_u32.saturating_pow(attempt))
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::config::{ModelPricing, RetryConfig};
    use crate::domain::llm::{BackendResponse, OutputBlock, TokenUsage};
    use crate::domain::shard::ContextShard;
    use crate::infrastructure::audit::InMemoryAuditLog;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;

    /// Replays scripted results and records every request it sees.
    struct ScriptedBackend {
        script: Mutex<VecDeque<Result<BackendResponse, LLMError>>>,
        seen: Mutex<Vec<BackendRequest>>,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Result<BackendResponse, LLMError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                seen: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().len()
        }
    }

    #[async_trait]
    impl ResponsesBackend for ScriptedBackend {
        async fn create_response(&self, _api_key: &str, request: &BackendRequest) -> Result<BackendResponse, LLMError> {
            self.seen.lock().push(request.clone());
            self.script
                .lock()
                .pop_front()
                .unwrap_or_else(|| Err(LLMError::Provider("script exhausted".into())))
        }
    }

    fn ok(text: &str) -> Result<BackendResponse, LLMError> {
        Ok(BackendResponse {
            id: "resp_1".into(),
            model: "gpt-4.1-mini".into(),
            output: vec![OutputBlock::Text { text: text.into() }],
            usage: TokenUsage {
                input_tokens: 1_000,
                output_tokens: 500,
                cached_input_tokens: 200,
            },
        })
    }

    fn config() -> BackendConfig {
        BackendConfig {
            retry: RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
            },
            pricing: vec![ModelPricing {
                model: "gpt-4.1-mini".into(),
                input_per_million: 2.0,
                output_per_million: 8.0,
            }],
            ..BackendConfig::default()
        }
    }

    fn executor(backend: Arc<ScriptedBackend>) -> RequestExecutor {
        RequestExecutor::new(backend, config(), "sk-test")
    }

    #[test]
    fn test_classify_failure() {
        assert_eq!(classify_failure(&LLMError::Network("reset".into())), FailureClass::Transient);
        assert_eq!(classify_failure(&LLMError::Timeout("30s".into())), FailureClass::Transient);
        assert_eq!(classify_failure(&LLMError::RateLimit), FailureClass::Transient);
        for code in [429, 500, 502, 503, 599] {
            let e = LLMError::Status { code, message: String::new() };
            assert_eq!(classify_failure(&e), FailureClass::Transient, "{}", code);
        }
        for code in [400, 404, 422] {
            let e = LLMError::Status { code, message: String::new() };
            assert_eq!(classify_failure(&e), FailureClass::Permanent, "{}", code);
        }
        assert_eq!(classify_failure(&LLMError::Authentication("no".into())), FailureClass::Permanent);
    }

    #[test]
    fn test_classify_message_fallback() {
        assert_eq!(classify_message("upstream returned 503 Service Unavailable"), FailureClass::Transient);
        assert_eq!(classify_message("Connection reset by peer"), FailureClass::Transient);
        assert_eq!(classify_message("request timed out"), FailureClass::Transient);
        assert_eq!(classify_message("HTTP 429 Too Many Requests"), FailureClass::Transient);
        assert_eq!(classify_message("invalid model name"), FailureClass::Permanent);
        assert_eq!(classify_message("HTTP 400 bad request"), FailureClass::Permanent);
        assert_eq!(classify_message("upstream status: 502"), FailureClass::Transient);
        assert_eq!(
            classify_message("Failed to parse response: expected value at line 1 column 523"),
            FailureClass::Permanent
        );
        assert_eq!(classify_message("prompt exceeds max 512 tokens"), FailureClass::Permanent);
        assert_eq!(
            classify_failure(&LLMError::Provider(
                "Failed to parse response: expected value at line 1 column 523".into()
            )),
            FailureClass::Permanent
        );
    }

    #[test]
    fn test_clamp_temperature() {
        assert_eq!(clamp_temperature(Some(&json!(50))), Some(1.0));
        assert_eq!(clamp_temperature(Some(&json!("35"))), Some(0.7));
        assert_eq!(clamp_temperature(Some(&json!(33.3333))), Some(0.667));
        assert_eq!(clamp_temperature(Some(&json!(250))), Some(2.0));
        assert_eq!(clamp_temperature(Some(&json!(-5))), Some(0.0));
        assert_eq!(clamp_temperature(Some(&json!("warm"))), None);
        assert_eq!(clamp_temperature(None), None);
    }

    #[test]
    fn test_clamp_max_tokens() {
        assert_eq!(clamp_max_tokens(Some(&json!(512)), 16, 8192, 1024), 512);
        assert_eq!(clamp_max_tokens(Some(&json!("2048")), 16, 8192, 1024), 2048);
        assert_eq!(clamp_max_tokens(Some(&json!(1_000_000)), 16, 8192, 1024), 8192);
        assert_eq!(clamp_max_tokens(Some(&json!(3)), 16, 8192, 1024), 16);
        assert_eq!(clamp_max_tokens(Some(&json!("lots")), 16, 8192, 1024), 1024);
        assert_eq!(clamp_max_tokens(Some(&json!(0)), 16, 8192, 1024), 1024);
        assert_eq!(clamp_max_tokens(None, 16, 8192, 1024), 1024);
    }

    #[test]
    fn test_build_backend_request_orders_blocks() {
        let backend = ScriptedBackend::new(vec![]);
        let executor = executor(backend);
        let mut request = GatewayRequest::new("chat-42", "What next?");
        request.module = Some("billing".into());
        request.options.temperature = Some(json!(70));
        request.shards = vec![
            ContextShard::new("history", 2, false, Default::default()).unwrap(),
            ContextShard::new("persona", 1, true, Default::default()).unwrap(),
        ];

        let built = executor.build_backend_request(&request);
        assert_eq!(built.model, "gpt-4.1-mini");
        assert_eq!(built.temperature, Some(1.4));
        assert_eq!(built.max_output_tokens, 1024);
        assert_eq!(built.input.len(), 3);
        assert!(built.input[0].text.starts_with("[shard:persona v1 stable]"));
        assert!(built.input[1].text.starts_with("[shard:history v2 volatile]"));
        assert_eq!(built.input[2], InputBlock::user("What next?"));
        assert_eq!(
            built.prompt_cache_key.as_deref(),
            Some("scope:chat-42|mod:billing|rules:1|schema:1|sh:persona-v1|sh:history-v2")
        );
        let safety = built.safety_identifier.unwrap();
        assert_eq!(safety.len(), 32);
        assert!(!safety.contains("chat-42"));
    }

    #[tokio::test]
    async fn test_execute_success_computes_cost() {
        let backend = ScriptedBackend::new(vec![ok("hello")]);
        let executor = executor(backend);
        let mut request = GatewayRequest::new("chat-42", "hi");
        request.request_id = Some(9);

        let reply = executor.execute(&request).await.unwrap();
        assert!(reply.success);
        assert_eq!(reply.result.as_deref(), Some("hello"));
        assert_eq!(reply.total_tokens, 1_500);
        assert_eq!(reply.cached_input_tokens, 200);
        assert!((reply.cost - 0.006).abs() < 1e-12);
        assert_eq!(reply.request_id, Some(9));
    }

    #[tokio::test]
    async fn test_execute_permanent_failure_is_error_shaped() {
        let backend = ScriptedBackend::new(vec![Err(LLMError::Status {
            code: 400,
            message: "bad input".into(),
        })]);
        let executor = executor(backend);
        let reply = executor.execute(&GatewayRequest::new("s", "p")).await.unwrap();
        assert!(!reply.success);
        assert_eq!(reply.error_code.as_deref(), Some("http_400"));
        assert!(reply.error.unwrap().contains("bad input"));
    }

    #[tokio::test]
    async fn test_execute_transient_failure_is_raised() {
        let backend = ScriptedBackend::new(vec![Err(LLMError::Status {
            code: 503,
            message: "overloaded".into(),
        })]);
        let executor = executor(backend);
        let result = executor.execute(&GatewayRequest::new("s", "p")).await;
        assert!(matches!(result, Err(ExecutionError::Transient(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_after_transient() {
        let backend = ScriptedBackend::new(vec![Err(LLMError::RateLimit), ok("second time")]);
        let executor = executor(backend.clone());
        let reply = executor.execute_with_retry(&GatewayRequest::new("s", "p")).await;
        assert!(reply.success);
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion() {
        let backend = ScriptedBackend::new(vec![
            Err(LLMError::Network("reset".into())),
            Err(LLMError::Network("reset".into())),
            Err(LLMError::Network("reset".into())),
        ]);
        let executor = executor(backend.clone());
        let reply = executor.execute_with_retry(&GatewayRequest::new("s", "p")).await;
        assert!(!reply.success);
        assert_eq!(reply.error_code.as_deref(), Some(BACKEND_UNAVAILABLE));
        assert_eq!(backend.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_not_retried() {
        let backend = ScriptedBackend::new(vec![Err(LLMError::Authentication("bad key".into()))]);
        let executor = executor(backend.clone());
        let reply = executor.execute_with_retry(&GatewayRequest::new("s", "p")).await;
        assert_eq!(reply.error_code.as_deref(), Some("authentication_failed"));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_audit_rows_are_updated() {
        let audit = Arc::new(InMemoryAuditLog::new());
        audit.register(41);
        let backend = ScriptedBackend::new(vec![ok("done")]);
        let executor = executor(backend).with_audit(audit.clone());

        let mut request = GatewayRequest::new("s", "p");
        request.request_id = Some(41);
        executor.execute_with_retry(&request).await;

        let row = audit.get(41).unwrap();
        assert_eq!(row.status, AuditStatus::Completed);
        assert_eq!(row.completion.unwrap().response_text.as_deref(), Some("done"));

        // unknown audit rows never fail the request
        request.request_id = Some(999);
        let backend = ScriptedBackend::new(vec![ok("still fine")]);
        let executor = RequestExecutor::new(backend, config(), "k").with_audit(audit);
        assert!(executor.execute_with_retry(&request).await.success);
    }

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff(base, 0), Duration::from_millis(500));
        assert_eq!(backoff(base, 1), Duration::from_millis(1000));
        assert_eq!(backoff(base, 3), Duration::from_millis(4000));
    }
}
