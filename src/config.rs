//! Orchestrator configuration.
//!
//! Loaded from TOML. Every section and field has a default, so an empty file
//! is a valid configuration.
//!
//! # Search Order
//!
//! [`OrchestratorConfig::load`] checks, in order:
//!
//! 1. `EDGEQUAKE_PIPELINE_CONFIG` environment variable (path)
//! 2. `./pipeline.toml`
//! 3. `~/.edgequake/pipeline.toml`
//! 4. Built-in defaults
//!
//! # Example
//!
//! ```toml
//! [circuit_breaker]
//! failure_threshold = 3
//! recovery_timeout_secs = 30
//!
//! [rate_limit]
//! requests_per_minute = 120
//! algorithm = "token_bucket"
//! mode = "wait"
//! max_wait_secs = 10
//!
//! [semantic_cache]
//! enabled = true
//! threshold = 0.92
//!
//! [fallback]
//! backends = ["openai", "ollama"]
//! policy = "ordered"
//!
//! [mcp_servers.filesystem]
//! command = "npx"
//! args = ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::agent::AgentConfig;
use crate::batch::DEFAULT_CONCURRENCY;
use crate::cache::SemanticCacheConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::PipelineError;
use crate::fallback::RoutingPolicy;
use crate::mcp::McpServerDescriptor;
use crate::rate_limiter::{RateLimitAlgorithm, RateLimitMode, RateLimiterConfig};

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "EDGEQUAKE_PIPELINE_CONFIG";

/// Configuration file name.
pub const CONFIG_FILE_NAME: &str = "pipeline.toml";

// ============================================================================
// Error Types
// ============================================================================

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl From<ConfigError> for PipelineError {
    fn from(err: ConfigError) -> Self {
        PipelineError::Config(err.to_string())
    }
}

fn validation(err: PipelineError) -> ConfigError {
    match err {
        PipelineError::Config(message) => ConfigError::Validation(message),
        other => ConfigError::Validation(other.to_string()),
    }
}

// ============================================================================
// Sections
// ============================================================================

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_secs() -> u64 {
    60
}

/// `[circuit_breaker]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSection {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_secs: default_recovery_timeout_secs(),
        }
    }
}

/// Denial behavior as written in TOML.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitModeKind {
    #[default]
    Reject,
    Wait,
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_max_wait_secs() -> u64 {
    30
}

/// `[rate_limit]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSection {
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    #[serde(default)]
    pub algorithm: RateLimitAlgorithm,
    #[serde(default)]
    pub mode: LimitModeKind,
    /// Only used in `wait` mode.
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            requests_per_minute: default_requests_per_minute(),
            algorithm: RateLimitAlgorithm::default(),
            mode: LimitModeKind::default(),
            max_wait_secs: default_max_wait_secs(),
        }
    }
}

fn default_threshold() -> f32 {
    0.9
}

fn default_max_entries() -> usize {
    1000
}

/// `[semantic_cache]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticCacheSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
}

impl Default for SemanticCacheSection {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: default_threshold(),
            max_entries: default_max_entries(),
            ttl_secs: None,
        }
    }
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

/// `[batch]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSection {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
        }
    }
}

/// `[fallback]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FallbackSection {
    /// Backend ids in attempt order.
    #[serde(default)]
    pub backends: Vec<String>,
    #[serde(default)]
    pub policy: RoutingPolicy,
}

// ============================================================================
// Root
// ============================================================================

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSection,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub semantic_cache: SemanticCacheSection,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub batch: BatchSection,
    #[serde(default)]
    pub fallback: FallbackSection,
    /// MCP servers for the agent, keyed by name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mcp_servers: BTreeMap<String, McpServerDescriptor>,
}

impl OrchestratorConfig {
    /// Load configuration from the standard locations.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if Path::new(&path).exists() {
                return Self::from_file(&path);
            }
        }

        let local_path = Path::new(CONFIG_FILE_NAME);
        if local_path.exists() {
            return Self::from_file(local_path);
        }

        if let Some(home) = dirs::home_dir() {
            let user_path = home.join(".edgequake").join(CONFIG_FILE_NAME);
            if user_path.exists() {
                return Self::from_file(&user_path);
            }
        }

        Ok(Self::default())
    }

    /// Load and validate a specific file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Check every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.circuit_breaker_config().validate().map_err(validation)?;
        self.rate_limiter_config().validate().map_err(validation)?;
        self.semantic_cache_config().validate().map_err(validation)?;
        self.agent.validate().map_err(validation)?;

        if self.batch.concurrency == 0 {
            return Err(ConfigError::Validation(
                "batch.concurrency must be at least 1".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for backend in &self.fallback.backends {
            if !seen.insert(backend.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Backend '{}' appears twice in fallback.backends",
                    backend
                )));
            }
        }

        for (name, server) in &self.mcp_servers {
            if server.command.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "mcp_servers.{}.command must not be empty",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(
            self.circuit_breaker.failure_threshold,
            Duration::from_secs(self.circuit_breaker.recovery_timeout_secs),
        )
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        let mode = match self.rate_limit.mode {
            LimitModeKind::Reject => RateLimitMode::Reject,
            LimitModeKind::Wait => RateLimitMode::Wait {
                max_wait: Duration::from_secs(self.rate_limit.max_wait_secs),
            },
        };
        RateLimiterConfig {
            requests_per_minute: self.rate_limit.requests_per_minute,
            algorithm: self.rate_limit.algorithm,
            mode,
        }
    }

    /// Cache settings. `semantic_cache.enabled` is checked by the caller.
    pub fn semantic_cache_config(&self) -> SemanticCacheConfig {
        let mut config = SemanticCacheConfig::default()
            .with_threshold(self.semantic_cache.threshold)
            .with_max_entries(self.semantic_cache.max_entries);
        if let Some(ttl) = self.semantic_cache.ttl_secs {
            config = config.with_ttl(Duration::from_secs(ttl));
        }
        config
    }
}
