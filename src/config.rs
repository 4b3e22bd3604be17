//! Configuration for the evaluation harness.
//!
//! Supports both environment variables and YAML config file.
//! Environment variables take precedence over config file values.

use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Backend API configuration shared by model and embedding clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL for the OpenAI-compatible API (e.g., "https://api.openai.com")
    pub api_base: String,

    /// API key for authentication
    pub api_key: String,

    /// Maximum tokens for completion responses
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Temperature for generation
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_temperature() -> f32 {
    0.0
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            api_base: String::new(),
            api_key: String::new(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Retry policy for transient backend failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first (so 3 = 1 call + 2 retries).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential backoff, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

/// Execution settings for the harness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Maximum in-flight requests per backend. Excess requests queue.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Maximum characters of rendered prompt context.
    #[serde(default = "default_context_budget")]
    pub context_budget_chars: usize,

    /// Root directory for persisted run records.
    #[serde(default = "default_records_dir")]
    pub records_dir: PathBuf,

    /// Optional path for the persisted embedding cache.
    #[serde(default)]
    pub embedding_cache_path: Option<PathBuf>,
}

fn default_max_in_flight() -> usize {
    4
}

fn default_context_budget() -> usize {
    48_000
}

fn default_records_dir() -> PathBuf {
    PathBuf::from("runs")
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            context_budget_chars: default_context_budget(),
            records_dir: default_records_dir(),
            embedding_cache_path: None,
        }
    }
}

/// Full application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Backend API settings
    pub backend: BackendConfig,
    /// Retry policy
    #[serde(default)]
    pub retry: RetryConfig,
    /// Execution settings
    #[serde(default)]
    pub execution: ExecutionConfig,
}

/// Configuration file structure (YAML format).
#[derive(Debug, Deserialize)]
struct ConfigFile {
    backend: Option<BackendFileSection>,
    retry: Option<RetryConfig>,
    execution: Option<ExecutionConfig>,
}

#[derive(Debug, Deserialize)]
struct BackendFileSection {
    api_base: Option<String>,
    api_key: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
    timeout_secs: Option<u64>,
}

impl Config {
    /// Load configuration from environment variables and optional config file.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables (HARNESS_API_BASE, HARNESS_API_KEY, ...)
    /// 2. Config file (~/.config/docqa-harness/config.yaml)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        let mut config = Config::default();

        // Try to load from config file first
        if let Some(config_path) = Self::config_file_path() {
            if config_path.exists() {
                config = Self::load_from_file(&config_path)?;
            }
        }

        // Override with environment variables
        if let Ok(api_base) = env::var("HARNESS_API_BASE") {
            config.backend.api_base = api_base;
        }

        if let Ok(api_key) = env::var("HARNESS_API_KEY") {
            config.backend.api_key = api_key;
        }

        if let Ok(max_tokens) = env::var("HARNESS_MAX_TOKENS") {
            if let Ok(tokens) = max_tokens.parse() {
                config.backend.max_tokens = tokens;
            }
        }

        if let Ok(max_in_flight) = env::var("HARNESS_MAX_IN_FLIGHT") {
            if let Ok(n) = max_in_flight.parse() {
                config.execution.max_in_flight = n;
            }
        }

        if let Ok(records_dir) = env::var("HARNESS_RECORDS_DIR") {
            config.execution.records_dir = PathBuf::from(records_dir);
        }

        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from_file(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| HarnessError::io(path, e))?;

        let file_config: ConfigFile = serde_yaml::from_str(&content)
            .map_err(|e| HarnessError::Config(format!("Failed to parse config file: {}", e)))?;

        let mut config = Config::default();

        if let Some(backend) = file_config.backend {
            if let Some(api_base) = backend.api_base {
                config.backend.api_base = api_base;
            }
            if let Some(api_key) = backend.api_key {
                config.backend.api_key = api_key;
            }
            if let Some(max_tokens) = backend.max_tokens {
                config.backend.max_tokens = max_tokens;
            }
            if let Some(temperature) = backend.temperature {
                config.backend.temperature = temperature;
            }
            if let Some(timeout_secs) = backend.timeout_secs {
                config.backend.timeout_secs = timeout_secs;
            }
        }

        if let Some(retry) = file_config.retry {
            config.retry = retry;
        }

        if let Some(execution) = file_config.execution {
            config.execution = execution;
        }

        Ok(config)
    }

    /// Get the default config file path.
    pub fn config_file_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "docqa-harness")
            .map(|dirs| dirs.config_dir().join("config.yaml"))
    }

    /// Validate that required configuration is present.
    pub fn validate(&self) -> Result<()> {
        if self.backend.api_base.is_empty() {
            return Err(HarnessError::Config(
                "API base URL is required. Set HARNESS_API_BASE environment variable or add to config file.".to_string()
            ));
        }

        if self.backend.api_key.is_empty() {
            return Err(HarnessError::Config(
                "API key is required. Set HARNESS_API_KEY environment variable or add to config file.".to_string()
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(HarnessError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.execution.max_in_flight == 0 {
            return Err(HarnessError::Config(
                "execution.max_in_flight must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Create a config from explicit values (useful for testing).
    pub fn with_backend(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            backend: BackendConfig {
                api_base: api_base.into(),
                api_key: api_key.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}
