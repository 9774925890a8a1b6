//! Configuration loading, validation, and management for Tandem.
//!
//! Loads configuration from `~/.tandem/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tandem_core::ModelSelection;

/// Env var overriding the per-run timeout, in milliseconds.
pub const RUN_TIMEOUT_ENV: &str = "TANDEM_RUN_TIMEOUT_MS";

/// The root configuration structure.
///
/// Maps directly to `~/.tandem/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Default LLM provider
    #[serde(default = "default_provider")]
    pub default_provider: String,

    /// Default model
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Default temperature
    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    /// Default max tokens per LLM response
    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// System prompt for every session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Run orchestration: retries, fallback order, timeouts
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Context compaction budget
    #[serde(default)]
    pub compaction: CompactionConfig,

    /// Worker pool layout
    #[serde(default)]
    pub pool: PoolConfig,
}

fn default_provider() -> String {
    "anthropic".into()
}
fn default_model() -> String {
    "claude-sonnet-4".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    4096
}

/// One entry in the fixed provider preference order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackTarget {
    pub provider: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Attempts per send, including fallback retries
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Per-run timeout; unset means practically unbounded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_ms: Option<u64>,

    /// Ask the agent to explain file edits as it makes them
    #[serde(default)]
    pub explain_edits: bool,

    /// Providers to fall back to, in order of preference
    #[serde(default = "default_provider_preference")]
    pub provider_preference: Vec<FallbackTarget>,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_provider_preference() -> Vec<FallbackTarget> {
    vec![
        FallbackTarget { provider: "anthropic".into(), model: "claude-sonnet-4".into() },
        FallbackTarget { provider: "openai".into(), model: "gpt-4o".into() },
        FallbackTarget { provider: "openrouter".into(), model: "anthropic/claude-sonnet-4".into() },
    ]
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            run_timeout_ms: None,
            explain_edits: false,
            provider_preference: default_provider_preference(),
        }
    }
}

impl OrchestratorConfig {
    /// The effective per-run timeout: env override, then config, then a
    /// practically unbounded default (24h).
    pub fn run_timeout(&self) -> Duration {
        let from_env = std::env::var(RUN_TIMEOUT_ENV)
            .ok()
            .and_then(|v| v.trim().parse::<u64>().ok());
        resolve_run_timeout(from_env, self.run_timeout_ms)
    }
}

fn resolve_run_timeout(from_env: Option<u64>, configured: Option<u64>) -> Duration {
    from_env
        .or(configured)
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(24 * 60 * 60))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// History token budget before overflow is summarized
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,

    /// Character budget per summarization chunk
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,

    /// Requested summary length
    #[serde(default = "default_summary_words")]
    pub summary_words: usize,

    /// Model used for summaries (defaults to the session model)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

fn default_max_context_tokens() -> usize {
    32_000
}
fn default_chunk_chars() -> usize {
    12_000
}
fn default_summary_words() -> usize {
    200
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: default_max_context_tokens(),
            chunk_chars: default_chunk_chars(),
            summary_words: default_summary_words(),
            model: None,
        }
    }
}

/// How the pool picks a worker for the next task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancingStrategy {
    RoundRobin,
    Random,
    /// Highest worker priority first, then ascending load
    Priority,
    /// Ascending load
    #[default]
    LeastBusy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub id: String,

    /// Concurrency ceiling
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default)]
    pub priority: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

fn default_concurrency() -> usize {
    1
}

impl WorkerConfig {
    pub fn new(id: impl Into<String>, concurrency: usize) -> Self {
        Self {
            id: id.into(),
            concurrency,
            priority: 0,
            tags: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub strategy: BalancingStrategy,

    /// Timeout applied to tasks that don't carry their own
    #[serde(default = "default_task_timeout_ms")]
    pub default_task_timeout_ms: u64,

    /// How long the scheduler waits when every worker is saturated
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_workers")]
    pub workers: Vec<WorkerConfig>,
}

fn default_task_timeout_ms() -> u64 {
    300_000
}
fn default_poll_interval_ms() -> u64 {
    10
}
fn default_workers() -> Vec<WorkerConfig> {
    vec![WorkerConfig::new("worker-1", 1)]
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            strategy: BalancingStrategy::default(),
            default_task_timeout_ms: default_task_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            workers: default_workers(),
        }
    }
}

impl PoolConfig {
    pub fn default_task_timeout(&self) -> Duration {
        Duration::from_millis(self.default_task_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

impl AppConfig {
    /// Load configuration from the default location.
    ///
    /// Falls back to defaults if the config file doesn't exist.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;

        // Allow env var to override default provider
        if let Ok(provider) = std::env::var("TANDEM_PROVIDER") {
            config.default_provider = provider;
        }

        // Allow env var to override default model
        if let Ok(model) = std::env::var("TANDEM_MODEL") {
            config.default_model = model;
        }

        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".tandem")
    }

    /// The model selection every new session starts from.
    pub fn default_selection(&self) -> ModelSelection {
        let mut selection = ModelSelection::new(&self.default_provider, &self.default_model)
            .with_temperature(self.default_temperature)
            .with_max_tokens(self.default_max_tokens);
        selection.system_prompt = self.system_prompt.clone();
        selection
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_temperature < 0.0 || self.default_temperature > 2.0 {
            return Err(ConfigError::ValidationError(
                "default_temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.orchestrator.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "orchestrator.max_attempts must be at least 1".into(),
            ));
        }

        if self.compaction.chunk_chars == 0 {
            return Err(ConfigError::ValidationError(
                "compaction.chunk_chars must be > 0".into(),
            ));
        }

        let mut seen = HashSet::new();
        for worker in &self.pool.workers {
            if worker.concurrency == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "worker '{}' must have concurrency >= 1",
                    worker.id
                )));
            }
            if !seen.insert(worker.id.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate worker id '{}'",
                    worker.id
                )));
            }
        }

        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_provider: default_provider(),
            default_model: default_model(),
            default_temperature: default_temperature(),
            default_max_tokens: default_max_tokens(),
            system_prompt: None,
            orchestrator: OrchestratorConfig::default(),
            compaction: CompactionConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for tandem_core::Error {
    fn from(err: ConfigError) -> Self {
        tandem_core::Error::Config {
            message: err.to_string(),
        }
    }
}
