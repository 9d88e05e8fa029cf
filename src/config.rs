// SPDX-License-Identifier: Apache-2.0

//! Engine configuration
//!
//! Read once at construction. Every field has a serde default, so a config
//! file only needs to list what it overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Budget added on top of the slowest fetch for joining and aggregating.
pub const JOIN_OVERHEAD_BUDGET: Duration = Duration::from_secs(5);

/// Configuration for the federation engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FederationConfig {
    /// Concurrent fetches per query (`None` = number of distinct sources)
    #[serde(default)]
    pub max_in_flight_sources: Option<usize>,
    /// TTL for cached results (milliseconds)
    #[serde(default = "default_cache_ttl_ms")]
    pub default_cache_ttl_ms: u64,
    /// Per-attempt fetch timeout (milliseconds)
    #[serde(default = "default_source_timeout_ms")]
    pub default_source_timeout_ms: u64,
    /// Distinct groups an in-engine aggregation may hold
    #[serde(default = "default_aggregation_spill_threshold")]
    pub aggregation_spill_threshold: usize,
    /// Rows a join output or final result may hold
    #[serde(default = "default_max_result_rows")]
    pub max_result_rows: usize,
    /// First retry delay after a timeout (milliseconds), doubled per retry
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Retries after a timeout
    #[serde(default = "default_max_timeout_retries")]
    pub max_timeout_retries: u32,
    /// Rows buffered between a fetch worker and its consumer
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Cardinality assumed for sources without hint or statistic
    #[serde(default = "default_unknown_cardinality_penalty")]
    pub unknown_cardinality_penalty: u64,
    /// Whether results are cached at all
    #[serde(default = "default_true")]
    pub cache_enabled: bool,
}

fn default_cache_ttl_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_source_timeout_ms() -> u64 {
    30_000
}

fn default_aggregation_spill_threshold() -> usize {
    1_000_000
}

fn default_max_result_rows() -> usize {
    5_000_000
}

fn default_retry_base_delay_ms() -> u64 {
    200
}

fn default_max_timeout_retries() -> u32 {
    2
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_unknown_cardinality_penalty() -> u64 {
    1_000_000
}

fn default_true() -> bool {
    true
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            max_in_flight_sources: None,
            default_cache_ttl_ms: default_cache_ttl_ms(),
            default_source_timeout_ms: default_source_timeout_ms(),
            aggregation_spill_threshold: default_aggregation_spill_threshold(),
            max_result_rows: default_max_result_rows(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            max_timeout_retries: default_max_timeout_retries(),
            channel_capacity: default_channel_capacity(),
            unknown_cardinality_penalty: default_unknown_cardinality_penalty(),
            cache_enabled: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to write config {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FederationConfig {
    /// Loads a JSON config file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("No federation config file found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: FederationConfig =
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;

        info!("Loaded federation configuration from {:?}", path);
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Saved federation configuration to {:?}", path);
        Ok(())
    }

    pub fn source_timeout(&self) -> Duration {
        Duration::from_millis(self.default_source_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.default_cache_ttl_ms)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempdir().unwrap();
        let config = FederationConfig::load(dir.path().join("absent.json")).unwrap();
        assert_eq!(config, FederationConfig::default());
        assert_eq!(config.cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.max_timeout_retries, 2);
    }

    #[test]
    fn partial_file_overrides_only_listed_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("federation.json");
        std::fs::write(&path, r#"{ "max_in_flight_sources": 2, "cache_enabled": false }"#).unwrap();

        let config = FederationConfig::load(&path).unwrap();
        assert_eq!(config.max_in_flight_sources, Some(2));
        assert!(!config.cache_enabled);
        assert_eq!(config.default_source_timeout_ms, 30_000);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("federation.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            FederationConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn save_then_load_preserves_overrides() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("federation.json");
        let config = FederationConfig {
            aggregation_spill_threshold: 10,
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(FederationConfig::load(&path).unwrap(), config);
    }
}
