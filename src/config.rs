use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::time::Duration;

use crate::models::ModelInfo;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub models: ModelsConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

/// Gateway-facing credentials: the key clients must present and the
/// protocol version advertised when a client omits one.
#[derive(Clone, Debug, Deserialize)]
pub struct AuthConfig {
    pub api_key: String,
    #[serde(default = "default_anthropic_version")]
    pub anthropic_version: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub api_key: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_stream_idle_timeout_ms")]
    pub stream_idle_timeout_ms: u64,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ModelsConfig {
    #[serde(default)]
    pub model_map: HashMap<String, String>,
    #[serde(default)]
    pub allowlist: HashSet<String>,
    #[serde(default)]
    pub blocklist: HashSet<String>,
    /// Static catalog served from `GET /v1/models`.
    #[serde(default)]
    pub catalog: Vec<ModelInfo>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    #[serde(default = "default_context_window_tokens")]
    pub context_window_tokens: u64,
    #[serde(default = "default_stream_max_tokens_cap")]
    pub stream_max_tokens_cap: u32,
    #[serde(default = "default_max_calls_per_batch")]
    pub max_calls_per_batch: u32,
    #[serde(default = "default_batch_window_secs")]
    pub batch_window_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_inflight: default_max_inflight(),
            max_body_bytes: default_max_body_bytes(),
            context_window_tokens: default_context_window_tokens(),
            stream_max_tokens_cap: default_stream_max_tokens_cap(),
            max_calls_per_batch: default_max_calls_per_batch(),
            batch_window_secs: default_batch_window_secs(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub otlp: OtlpConfig,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            logging: LoggingConfig::default(),
            otlp: OtlpConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct OtlpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otlp_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_otlp_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for OtlpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otlp_endpoint(),
            timeout_ms: default_otlp_timeout_ms(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_stdout")]
    pub stdout: bool,
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            stdout: default_log_stdout(),
            file: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let path = std::env::var("CONFIG_PATH")
            .map_err(|_| "CONFIG_PATH is required (strict YAML)".to_string())?;
        let content =
            fs::read_to_string(&path).map_err(|e| format!("CONFIG_PATH read error: {}", e))?;
        let mut config: Config = serde_yaml::from_str(&content)
            .map_err(|e| format!("CONFIG_PATH invalid yaml: {}", e))?;
        config.normalize()?;
        Ok(config)
    }

    pub fn chat_completions_url(&self) -> String {
        let base = self.upstream.base_url.trim_end_matches('/');
        if base.ends_with("/v1") {
            format!("{}/chat/completions", base)
        } else {
            format!("{}/v1/chat/completions", base)
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream.read_timeout_ms)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream.stream_idle_timeout_ms)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_secs(self.limits.batch_window_secs)
    }

    fn normalize(&mut self) -> Result<(), String> {
        if self.auth.api_key.trim().is_empty() {
            return Err("auth.api_key is required".to_string());
        }
        if self.upstream.api_key.trim().is_empty() {
            return Err("upstream.api_key is required".to_string());
        }
        if self.limits.max_calls_per_batch == 0 {
            return Err("limits.max_calls_per_batch must be positive".to_string());
        }
        if self.limits.context_window_tokens == 0 {
            return Err("limits.context_window_tokens must be positive".to_string());
        }
        self.observability.logging.level = self.observability.logging.level.to_lowercase();
        match self.observability.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => return Err(format!("logging.level invalid: {}", other)),
        }
        Ok(())
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_anthropic_version() -> String {
    "2023-06-01".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_read_timeout_ms() -> u64 {
    60000
}

fn default_stream_idle_timeout_ms() -> u64 {
    30000
}

fn default_pool_max_idle_per_host() -> usize {
    64
}

fn default_max_inflight() -> usize {
    512
}

// Long tool-using conversations routinely exceed the 2 MiB transport
// default.
fn default_max_body_bytes() -> usize {
    32 * 1024 * 1024
}

fn default_context_window_tokens() -> u64 {
    200_000
}

fn default_stream_max_tokens_cap() -> u32 {
    64_000
}

fn default_max_calls_per_batch() -> u32 {
    1000
}

fn default_batch_window_secs() -> u64 {
    3600
}

fn default_service_name() -> String {
    "messages-gateway".to_string()
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otlp_timeout_ms() -> u64 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_stdout() -> bool {
    true
}
