//! Typed configuration document for the ouro substrate.
//!
//! Mirrors the recognized options of `config.toml`: provider credential sets,
//! the failover chain, circuit breaker and rate limit tuning, memory engine
//! paths, watcher debounce, dev/prod environment isolation, and the tool
//! security allow-lists. All sections have defaults so a partial document (or
//! none at all) still produces a usable config.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::LoadError;

/// Root configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OuroConfig {
    /// Provider name -> credentials and endpoint.
    pub providers: BTreeMap<String, ProviderConfig>,
    /// Ordered (provider, model) pairs tried on failover.
    pub failover_chain: Vec<ChainEntryConfig>,
    pub circuit_breaker: BreakerConfig,
    /// Tool name -> token-bucket size (tokens per minute).
    pub rate_limit: BTreeMap<String, u32>,
    pub memory: MemoryConfig,
    pub watcher: WatcherConfig,
    pub envs: EnvsConfig,
    pub security: SecurityConfig,
}

/// One provider's credential rotation set and endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// API keys rotated round-robin by the dispatcher.
    pub keys: Vec<String>,
    /// Base URL for OpenAI-compatible providers (e.g. "https://api.openai.com/v1").
    pub base_url: Option<String>,
    /// Per-key auth-failure cooldown before a failed key is retried.
    pub key_cooldown_ms: Option<u64>,
}

/// One entry in the failover chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEntryConfig {
    pub provider: String,
    pub model: String,
}

/// Circuit breaker tuning; `overrides` keys by tool name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub success_threshold: u32,
    pub overrides: BTreeMap<String, BreakerOverride>,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_ms: 60_000,
            success_threshold: 2,
            overrides: BTreeMap::new(),
        }
    }
}

/// Per-tool breaker override; unset fields fall back to the global values.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerOverride {
    pub failure_threshold: Option<u32>,
    pub cooldown_ms: Option<u64>,
    pub success_threshold: Option<u32>,
}

/// Memory engine lifecycle paths and cache bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub db_path: PathBuf,
    pub log_dir: PathBuf,
    pub cache_max_size: usize,
    pub cache_max_age_ms: Option<u64>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("ouro.db"),
            log_dir: PathBuf::from("conversations"),
            cache_max_size: 10_000,
            cache_max_age_ms: None,
        }
    }
}

/// File watcher coalescence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub debounce_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self { debounce_ms: 1_000 }
    }
}

/// The dev/prod environment pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvsConfig {
    pub dev: EnvConfig,
    pub prod: EnvConfig,
}

/// One isolated environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvConfig {
    pub db_path: PathBuf,
    pub storage_path: PathBuf,
    pub ports: BTreeSet<u16>,
    pub env_vars: BTreeMap<String, String>,
    pub resource_limits: ResourceLimits,
    /// Shell command used to run the test suite inside this environment.
    pub test_command: Option<String>,
    /// Test wall-clock timeout; timeout counts as failure.
    pub test_timeout_ms: Option<u64>,
}

/// Resource ceilings applied to child processes of an environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub max_memory_mb: Option<u64>,
    pub max_cpu_percent: Option<u8>,
}

/// Security validation allow-lists for tool arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Origins (scheme://host[:port]) URL arguments may target.
    pub allowed_endpoints: Vec<String>,
    /// Base directory file-path arguments must resolve inside.
    pub base_directory: PathBuf,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_endpoints: Vec::new(),
            base_directory: PathBuf::from("."),
        }
    }
}

impl OuroConfig {
    /// Parses a TOML document. Unknown keys are ignored; missing sections get
    /// defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, LoadError> {
        Ok(toml::from_str(content)?)
    }

    /// Loads the document from a file path. A missing file yields the default
    /// config (every section defaulted), matching the env-overlay behavior of
    /// treating absent sources as empty.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(LoadError::XdgRead)?;
        Self::from_toml_str(&content)
    }
}
