//! Configuration management for Quotaguard.
//!
//! Configuration is read from an optional YAML or TOML file and layered with
//! `QUOTAGUARD__*` environment variables (`QUOTAGUARD__STORE__REDIS_URL`
//! overrides `store.redis_url`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::ratelimit::WarningLevel;

/// Name of the profile used by policies that do not name one.
pub const DEFAULT_PROFILE: &str = "default";

const ENV_PREFIX: &str = "QUOTAGUARD";

/// Main configuration for the decision engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Policy cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// What to do when a decision cannot be made normally. Required.
    pub failure: FailurePolicy,

    /// Remaining-quota ratios for the response warning level
    #[serde(default)]
    pub warning: WarningThresholds,

    /// Named algorithm profiles referenced by policies
    #[serde(default)]
    pub profiles: HashMap<String, AlgorithmProfile>,

    /// Policy document loaded by the binary
    #[serde(default)]
    pub policies_path: Option<PathBuf>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Whether a decision that cannot be evaluated lets the request through.
///
/// Has no default; every deployment must state its choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    FailOpen,
    FailClosed,
}

impl FailureMode {
    pub fn allows(&self) -> bool {
        matches!(self, FailureMode::FailOpen)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailurePolicy {
    /// Applied when no policy matches the request
    pub on_no_policy: FailureMode,

    /// Applied when the counter store errors or times out
    pub on_store_unavailable: FailureMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Maximum number of pooled Redis connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Namespace for every counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Budget for one store round trip in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            max_connections: default_max_connections(),
            key_prefix: default_key_prefix(),
            timeout_ms: default_store_timeout_ms(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_max_connections() -> usize {
    16
}

fn default_key_prefix() -> String {
    "quotaguard".to_string()
}

fn default_store_timeout_ms() -> u64 {
    25
}

/// Policy cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Seconds a resolution stays fresh (1..=300)
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    10
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Remaining-quota ratios below which a response is flagged.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WarningThresholds {
    #[serde(default = "default_critical")]
    pub critical: f64,
    #[serde(default = "default_high")]
    pub high: f64,
    #[serde(default = "default_medium")]
    pub medium: f64,
}

impl Default for WarningThresholds {
    fn default() -> Self {
        Self {
            critical: default_critical(),
            high: default_high(),
            medium: default_medium(),
        }
    }
}

fn default_critical() -> f64 {
    0.05
}

fn default_high() -> f64 {
    0.20
}

fn default_medium() -> f64 {
    0.50
}

impl WarningThresholds {
    /// Classify the share of quota still available.
    pub fn level(&self, remaining: u64, limit: u64) -> WarningLevel {
        if limit == 0 {
            return WarningLevel::Critical;
        }
        let ratio = remaining as f64 / limit as f64;
        if ratio < self.critical {
            WarningLevel::Critical
        } else if ratio < self.high {
            WarningLevel::High
        } else if ratio < self.medium {
            WarningLevel::Medium
        } else {
            WarningLevel::Low
        }
    }
}

/// Per-policy evaluation settings, selected by `RateLimitPolicy::profile`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlgorithmProfile {
    /// Overrides `store.timeout_ms`
    #[serde(default)]
    pub store_timeout_ms: Option<u64>,

    /// Overrides `failure.on_store_unavailable`
    #[serde(default)]
    pub on_store_unavailable: Option<FailureMode>,
}

/// A profile with every override applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedProfile {
    pub store_timeout: Duration,
    pub on_store_unavailable: FailureMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl EngineConfig {
    /// A configuration with defaults everywhere except the failure policy.
    pub fn new(failure: FailurePolicy) -> Self {
        Self {
            store: StoreConfig::default(),
            cache: CacheConfig::default(),
            failure,
            warning: WarningThresholds::default(),
            profiles: HashMap::new(),
            policies_path: None,
            logging: LoggingConfig::default(),
        }
    }

    pub fn with_profile(mut self, name: impl Into<String>, profile: AlgorithmProfile) -> Self {
        self.profiles.insert(name.into(), profile);
        self
    }

    /// Load from an optional file, layered with environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: EngineConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| EngineError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse and validate an inline YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_yaml::from_str(yaml).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=300).contains(&self.cache.ttl_secs) {
            return Err(EngineError::Config(format!(
                "cache.ttl_secs must be between 1 and 300, got {}",
                self.cache.ttl_secs
            )));
        }
        if self.store.timeout_ms == 0 {
            return Err(EngineError::Config(
                "store.timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.store.max_connections == 0 {
            return Err(EngineError::Config(
                "store.max_connections must be greater than 0".to_string(),
            ));
        }

        let w = &self.warning;
        if !(0.0 <= w.critical && w.critical <= w.high && w.high <= w.medium && w.medium <= 1.0) {
            return Err(EngineError::Config(
                "warning thresholds must satisfy 0 <= critical <= high <= medium <= 1".to_string(),
            ));
        }

        for (name, profile) in &self.profiles {
            if profile.store_timeout_ms == Some(0) {
                return Err(EngineError::Config(format!(
                    "profile '{}': store_timeout_ms must be greater than 0",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Resolve the settings for a policy's profile.
    ///
    /// An unset or unknown name resolves to the `default` profile, which in
    /// turn falls back to the top-level store and failure settings.
    pub fn profile(&self, name: Option<&str>) -> ResolvedProfile {
        let base = ResolvedProfile {
            store_timeout: Duration::from_millis(self.store.timeout_ms),
            on_store_unavailable: self.failure.on_store_unavailable,
        };
        let apply = |resolved: ResolvedProfile, profile: Option<&AlgorithmProfile>| match profile {
            Some(p) => ResolvedProfile {
                store_timeout: p
                    .store_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(resolved.store_timeout),
                on_store_unavailable: p
                    .on_store_unavailable
                    .unwrap_or(resolved.on_store_unavailable),
            },
            None => resolved,
        };

        let default = apply(base, self.profiles.get(DEFAULT_PROFILE));
        match name.and_then(|n| self.profiles.get(n)) {
            Some(profile) => apply(default, Some(profile)),
            None => default,
        }
    }
}
