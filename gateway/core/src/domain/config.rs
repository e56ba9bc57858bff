// Copyright (c) 2026 Courier Contributors
// SPDX-License-Identifier: AGPL-3.0

// Gateway Configuration Types
//
// Defines the configuration schema for a Courier gateway node:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - Transport topics and consumer group
// - Per-module enablement flags
// - Correlation timeouts and deduplication bounds
// - Backend endpoint, clamps, retry policy and model pricing
// - Observability settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_VERSION: &str = "courier.dev/v1";
pub const KIND: &str = "GatewayConfig";

/// Top-level Kubernetes-style gateway configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfigManifest {
    /// API version (must be "courier.dev/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "GatewayConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: GatewayConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable gateway name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

/// Gateway configuration specification (content under spec:)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfigSpec {
    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub modules: ModuleConfig,

    #[serde(default)]
    pub correlation: CorrelationConfig,

    #[serde(default)]
    pub dedup: DedupConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Broker bootstrap address (unused by the in-memory transport)
    #[serde(default = "default_bootstrap")]
    pub bootstrap_servers: String,

    /// Channel carrying canonical requests and test probes
    #[serde(default = "default_request_topic")]
    pub request_topic: String,

    /// Channel carrying response and processing-status envelopes
    #[serde(default = "default_response_topic")]
    pub response_topic: String,

    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap(),
            request_topic: default_request_topic(),
            response_topic: default_response_topic(),
            consumer_group: default_consumer_group(),
        }
    }
}

/// Per-module enablement. Modules not listed fall back to `default_enabled`;
/// the generic namespace is always enabled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    #[serde(default = "default_true")]
    pub default_enabled: bool,

    #[serde(default)]
    pub enabled: HashMap<String, bool>,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            default_enabled: true,
            enabled: HashMap::new(),
        }
    }
}

impl ModuleConfig {
    pub fn is_enabled(&self, module: &str) -> bool {
        if module == crate::domain::gateway::GENERIC_MODULE {
            return true;
        }
        self.enabled.get(module).copied().unwrap_or(self.default_enabled)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationConfig {
    /// How long a caller waits for its reply
    #[serde(default = "default_reply_timeout", with = "humantime_serde")]
    pub reply_timeout: Duration,

    /// How often the sweeper scans for abandoned pending entries
    #[serde(default = "default_cleanup_interval", with = "humantime_serde")]
    pub cleanup_interval: Duration,

    /// Entries older than this are failed by the sweeper
    #[serde(default = "default_max_pending_age", with = "humantime_serde")]
    pub max_pending_age: Duration,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            reply_timeout: default_reply_timeout(),
            cleanup_interval: default_cleanup_interval(),
            max_pending_age: default_max_pending_age(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DedupPolicy {
    /// Clear the whole window when it overflows (approximate, cheap)
    #[default]
    ClearOnOverflow,
    /// Evict the least recently seen fingerprint
    Lru,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    #[serde(default = "default_dedup_max_entries")]
    pub max_entries: usize,

    #[serde(default)]
    pub policy: DedupPolicy,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            max_entries: default_dedup_max_entries(),
            policy: DedupPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the responses API
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// API key (supports "env:VAR_NAME" for environment variables)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(default = "default_model")]
    pub default_model: String,

    #[serde(default = "default_min_tokens")]
    pub min_output_tokens: u32,

    #[serde(default = "default_max_tokens")]
    pub max_output_tokens: u32,

    #[serde(default = "default_output_tokens")]
    pub default_output_tokens: u32,

    /// Rendered shard payloads above this size are replaced by a placeholder
    #[serde(default = "default_max_shard_bytes")]
    pub max_shard_bytes: usize,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub pricing: Vec<ModelPricing>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: None,
            default_model: default_model(),
            min_output_tokens: default_min_tokens(),
            max_output_tokens: default_max_tokens(),
            default_output_tokens: default_output_tokens(),
            max_shard_bytes: default_max_shard_bytes(),
            retry: RetryConfig::default(),
            pricing: Vec::new(),
        }
    }
}

impl BackendConfig {
    /// Resolve API key from config (supports "env:VAR_NAME" syntax)
    pub fn resolve_api_key(&self) -> anyhow::Result<String> {
        match &self.api_key {
            Some(k) => match k.strip_prefix("env:") {
                Some(var_name) => std::env::var(var_name)
                    .map_err(|_| anyhow::anyhow!("Environment variable not set: {}", var_name)),
                None => Ok(k.clone()),
            },
            None => Ok(String::new()),
        }
    }

    pub fn pricing_for(&self, model: &str) -> Option<&ModelPricing> {
        self.pricing.iter().find(|p| p.model == model)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts, including the first call
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub base_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay: default_retry_delay(),
        }
    }
}

/// USD per million tokens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub model: String,
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    pub fn cost(&self, input_tokens: u32, output_tokens: u32) -> f64 {
        (f64::from(input_tokens) * self.input_per_million
            + f64::from(output_tokens) * self.output_per_million)
            / 1_000_000.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Inbound messages handled concurrently
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_bootstrap() -> String {
    "localhost:9092".to_string()
}

fn default_request_topic() -> String {
    "llm.requests".to_string()
}

fn default_response_topic() -> String {
    "llm.responses".to_string()
}

fn default_consumer_group() -> String {
    "courier-gateway".to_string()
}

fn default_reply_timeout() -> Duration {
    Duration::from_secs(120)
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_max_pending_age() -> Duration {
    Duration::from_secs(300)
}

fn default_dedup_max_entries() -> usize {
    1000
}

fn default_endpoint() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4.1-mini".to_string()
}

fn default_min_tokens() -> u32 {
    16
}

fn default_max_tokens() -> u32 {
    8192
}

fn default_output_tokens() -> u32 {
    1024
}

fn default_max_shard_bytes() -> usize {
    64 * 1024
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_max_concurrent() -> usize {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for GatewayConfigManifest {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: "courier-gateway".to_string(),
                labels: None,
            },
            spec: GatewayConfigSpec::default(),
        }
    }
}

impl GatewayConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. COURIER_CONFIG_PATH environment variable
    /// 2. ./courier-config.yaml (working directory)
    /// 3. ~/.courier/config.yaml (user home)
    /// 4. /etc/courier/config.yaml (Unix)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("COURIER_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./courier-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".courier").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/courier/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(explicit_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let mut config = if let Some(path) = explicit_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?
        } else if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            Self::from_yaml_file(config_path)?
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("COURIER_REQUEST_TOPIC") {
            tracing::info!("Environment override: COURIER_REQUEST_TOPIC={}", val);
            self.spec.transport.request_topic = val;
        }

        if let Some(val) = lookup("COURIER_RESPONSE_TOPIC") {
            tracing::info!("Environment override: COURIER_RESPONSE_TOPIC={}", val);
            self.spec.transport.response_topic = val;
        }

        if let Some(val) = lookup("COURIER_REPLY_TIMEOUT_MS") {
            match val.parse::<u64>() {
                Ok(ms) => {
                    tracing::info!("Environment override: COURIER_REPLY_TIMEOUT_MS={}", ms);
                    self.spec.correlation.reply_timeout = Duration::from_millis(ms);
                }
                Err(_) => tracing::warn!(
                    "Invalid value for COURIER_REPLY_TIMEOUT_MS: '{}'. Expected milliseconds. Ignoring.",
                    val
                ),
            }
        }

        if let Some(val) = lookup("COURIER_DEDUP_MAX_ENTRIES") {
            match val.parse::<usize>() {
                Ok(n) => {
                    tracing::info!("Environment override: COURIER_DEDUP_MAX_ENTRIES={}", n);
                    self.spec.dedup.max_entries = n;
                }
                Err(_) => tracing::warn!(
                    "Invalid value for COURIER_DEDUP_MAX_ENTRIES: '{}'. Expected an integer. Ignoring.",
                    val
                ),
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!("Invalid apiVersion: '{}'. Must be '{}'", self.api_version, API_VERSION);
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        let transport = &self.spec.transport;
        if transport.request_topic.is_empty() || transport.response_topic.is_empty() {
            anyhow::bail!("transport topics cannot be empty");
        }
        if transport.request_topic == transport.response_topic {
            anyhow::bail!(
                "request and response topics must differ (both '{}')",
                transport.request_topic
            );
        }

        if self.spec.dedup.max_entries == 0 {
            anyhow::bail!("dedup.max_entries must be greater than zero");
        }

        if self.spec.correlation.reply_timeout.is_zero() {
            anyhow::bail!("correlation.reply_timeout must be greater than zero");
        }
        if self.spec.correlation.cleanup_interval.is_zero() {
            anyhow::bail!("correlation.cleanup_interval must be greater than zero");
        }
        let correlation = &self.spec.correlation;
        if correlation.max_pending_age < correlation.reply_timeout {
            anyhow::bail!(
                "correlation.max_pending_age ({:?}) must not be shorter than reply_timeout ({:?})",
                correlation.max_pending_age,
                correlation.reply_timeout
            );
        }

        let backend = &self.spec.backend;
        if backend.min_output_tokens > backend.max_output_tokens {
            anyhow::bail!(
                "backend.min_output_tokens ({}) exceeds max_output_tokens ({})",
                backend.min_output_tokens,
                backend.max_output_tokens
            );
        }
        if backend.retry.max_attempts == 0 {
            anyhow::bail!("backend.retry.max_attempts must be at least 1");
        }

        if self.spec.worker.max_concurrent == 0 {
            anyhow::bail!("worker.max_concurrent must be greater than zero");
        }

        Ok(())
    }
}
