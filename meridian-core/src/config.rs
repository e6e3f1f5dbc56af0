//! Shared configuration enums consumed by the catalog and the fan-out
//! executor (§6 "Configuration options").

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Whether a [`Catalog`](../../meridian_catalog/struct.Catalog.html) preloads
/// every map and mapping at construction (`Eager`) or populates its cache on
/// demand (`Lazy`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadPolicy {
    Eager,
    Lazy,
}

/// How catalog/store initialization behaves when the backing store already
/// has data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreateMode {
    /// Fail if the store already exists.
    KeepExisting,
    /// Discard any existing store and start clean.
    ReplaceExisting,
}

/// What the fan-out executor does when a per-shard task fails terminally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionPolicy {
    /// Record the fault and keep reading from the shards that succeeded.
    PartialResults,
    /// Cancel every sibling task and fail the whole command.
    CompleteResults,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        ExecutionPolicy::PartialResults
    }
}

/// Per-command options controlling the merged row reader's output shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionOptions {
    None,
    IncludeShardNameColumn,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        ExecutionOptions::None
    }
}

/// Exponential backoff parameters for the retry engine (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    pub max_attempts: u32,
    pub min_backoff: Duration,
    pub max_backoff: Duration,
    pub base: f64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            min_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            base: 2.0,
        }
    }
}

/// Which transient-error detector a caller wants the retry engine to use.
/// `Custom` carries no payload here; callers supply a detector object
/// directly to the retry engine constructor and use this enum only to
/// record which mode is in effect for logging/inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryBehavior {
    Default,
    Custom,
}

impl Default for RetryBehavior {
    fn default() -> Self {
        RetryBehavior::Default
    }
}

/// Root configuration aggregating every subsystem default a caller might
/// want to set once at startup rather than thread through every call site:
/// the catalog's [`LoadPolicy`], the retry engine's [`RetryPolicyConfig`],
/// and the defaults a [`crate::CatalogResult`]-returning fan-out command
/// falls back to when not overridden per-command. Loaded from a JSON file
/// with [`EngineConfig::from_file`]; a caller combines that with CLI flags
/// and environment overrides at its own precedence (CLI > env > file >
/// defaults, mirroring the teacher crate's configuration layering).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub load_policy: LoadPolicy,
    pub retry_policy: RetryPolicyConfig,
    pub default_execution_policy: ExecutionPolicy,
    pub default_execution_options: ExecutionOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            load_policy: LoadPolicy::Lazy,
            retry_policy: RetryPolicyConfig::default(),
            default_execution_policy: ExecutionPolicy::default(),
            default_execution_options: ExecutionOptions::default(),
        }
    }
}

impl EngineConfig {
    /// Parses an [`EngineConfig`] from a JSON document. Fields absent from
    /// `json` fall back to [`EngineConfig::default`] (`#[serde(default)]`),
    /// so a file overriding only `load_policy` is valid.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Reads and parses an [`EngineConfig`] from a file on disk.
    pub fn from_file(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        let p = RetryPolicyConfig::default();
        assert!(p.max_attempts >= 1);
        assert!(p.min_backoff <= p.max_backoff);
        assert_eq!(ExecutionPolicy::default(), ExecutionPolicy::PartialResults);
    }

    #[test]
    fn engine_config_partial_json_falls_back_to_defaults() {
        let config = EngineConfig::from_json_str(r#"{"load_policy": "Eager"}"#).unwrap();
        assert_eq!(config.load_policy, LoadPolicy::Eager);
        assert_eq!(config.retry_policy, RetryPolicyConfig::default());
    }

    #[test]
    fn engine_config_round_trips_through_json() {
        let config = EngineConfig { load_policy: LoadPolicy::Eager, ..EngineConfig::default() };
        let json = serde_json::to_string(&config).unwrap();
        let back: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
