//! Configuration for the query tier and the storage-node server.
//!
//! Loaded from a TOML file with per-field defaults; every setting can be
//! omitted. The query evaluator and CLI surface live outside this crate and
//! pass a ready [`Config`] in.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Default port appended to storage node addresses given without one.
pub const DEFAULT_NODE_PORT: u16 = 9401;

/// Errors that can occur while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

/// Settings for the storage node client side
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Storage node addresses; a missing port gets the default appended
    #[serde(default)]
    pub storage_nodes: Vec<String>,

    #[serde(default = "default_dial_timeout_secs")]
    pub dial_timeout_secs: u64,

    /// Per-node cap on in-flight requests; exceeding it fails fast
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests_per_node: usize,

    /// Ask storage nodes for compressed block frames
    #[serde(default = "default_compress_responses")]
    pub compress_responses: bool,

    /// Request per-rpc traces from storage nodes
    #[serde(default)]
    pub trace_rpc: bool,
}

fn default_dial_timeout_secs() -> u64 {
    3
}

fn default_max_concurrent_requests() -> usize {
    100
}

fn default_compress_responses() -> bool {
    true
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            storage_nodes: Vec::new(),
            dial_timeout_secs: default_dial_timeout_secs(),
            max_concurrent_requests_per_node: default_max_concurrent_requests(),
            compress_responses: default_compress_responses(),
            trace_rpc: false,
        }
    }
}

/// Search execution limits and merge behavior
#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    /// Bucket width for sample deduplication; 0 disables dedup
    #[serde(default)]
    pub dedup_interval_ms: i64,

    /// Cap on raw samples one query may process across all series; 0 = no cap
    #[serde(default = "default_max_samples_per_query")]
    pub max_samples_per_query: u64,

    /// Cap on raw samples one query may scan per series; 0 = no cap
    #[serde(default = "default_max_samples_per_series")]
    pub max_samples_per_series: u64,

    /// Total memory the query tier may use; drives the in-memory threshold
    /// of the temporary block store
    #[serde(default = "default_memory_limit_bytes")]
    pub memory_limit_bytes: usize,

    /// Directory for spill files; defaults to the system temp dir
    #[serde(default)]
    pub spill_dir: Option<String>,
}

fn default_max_samples_per_query() -> u64 {
    1_000_000_000
}

fn default_max_samples_per_series() -> u64 {
    30_000_000
}

fn default_memory_limit_bytes() -> usize {
    1 << 30
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            dedup_interval_ms: 0,
            max_samples_per_query: default_max_samples_per_query(),
            max_samples_per_series: default_max_samples_per_series(),
            memory_limit_bytes: default_memory_limit_bytes(),
            spill_dir: None,
        }
    }
}

/// Settings for the storage-node RPC server
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Cap on label names returned from one labelNames request
    #[serde(default = "default_max_label_names")]
    pub max_label_names: usize,

    /// Cap on label values returned from one labelValues request
    #[serde(default = "default_max_label_values")]
    pub max_label_values: usize,

    /// Cap on entries returned from one tagValueSuffixes request
    #[serde(default = "default_max_tag_value_suffixes")]
    pub max_tag_value_suffixes: usize,

    /// Never compress responses, even when clients ask for it
    #[serde(default)]
    pub disable_response_compression: bool,
}

fn default_listen_addr() -> String {
    format!("0.0.0.0:{DEFAULT_NODE_PORT}")
}

fn default_max_label_names() -> usize {
    100_000
}

fn default_max_label_values() -> usize {
    100_000
}

fn default_max_tag_value_suffixes() -> usize {
    100_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_label_names: default_max_label_names(),
            max_label_values: default_max_label_values(),
            max_tag_value_suffixes: default_max_tag_value_suffixes(),
            disable_response_compression: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert!(cfg.cluster.storage_nodes.is_empty());
        assert_eq!(cfg.cluster.dial_timeout_secs, 3);
        assert_eq!(cfg.cluster.max_concurrent_requests_per_node, 100);
        assert!(cfg.cluster.compress_responses);
        assert_eq!(cfg.search.dedup_interval_ms, 0);
        assert_eq!(cfg.search.max_samples_per_query, 1_000_000_000);
        assert_eq!(cfg.server.max_label_names, 100_000);
    }

    #[test]
    fn test_parse_partial_toml() {
        let cfg: Config = toml::from_str(
            r#"
            [cluster]
            storage_nodes = ["10.0.0.1", "10.0.0.2:9500"]
            trace_rpc = true

            [search]
            dedup_interval_ms = 30000
            "#,
        )
        .unwrap();
        assert_eq!(cfg.cluster.storage_nodes.len(), 2);
        assert!(cfg.cluster.trace_rpc);
        assert_eq!(cfg.search.dedup_interval_ms, 30_000);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.server.max_label_values, 100_000);
    }

    #[test]
    fn test_from_file_missing() {
        assert!(matches!(
            Config::from_file("/nonexistent/meridian.toml"),
            Err(ConfigError::Io(_))
        ));
    }
}
