//! Configuration options.
//!
//! All tunables are read once at start (`Config::load`/`Config::from_toml_str`) and
//! re-read only on an explicit [`Config::reload`]. The config is held by the engine as a
//! single `Arc<Config>` snapshot, replaced wholesale on reload.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Loads configuration from a TOML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path_str = path.as_ref().display().to_string();
    let config_str = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path_str,
        source,
    })?;
    Config::from_toml_str(&config_str)
}

/// A default configuration, for tests and library consumers that do not load a file.
pub fn default_config() -> Config {
    Config::default()
}

/// Top-level configuration, matching the host agent's configuration store contract.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub observer: ObserverConfig,
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Re-reads `path` and replaces `self` wholesale with the freshly parsed config.
    pub fn reload<P: AsRef<Path>>(&mut self, path: P) -> Result<(), ConfigError> {
        *self = load_config(path)?;
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            observer: ObserverConfig::default(),
        }
    }
}

/// Connection observer and table tuning.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct ObserverConfig {
    /// Idle-eviction timeout, in seconds.
    #[serde(default = "default_connection_timeout_s")]
    pub connection_timeout_s: u64,

    /// Grace period after logical close before an observer is destroyed, in seconds.
    #[serde(default = "default_connection_closed_timeout_s")]
    pub connection_closed_timeout_s: u64,

    /// Per-parser reassembly cache cap, in bytes.
    #[serde(default = "default_protocol_cache_limit_bytes")]
    pub protocol_cache_limit_bytes: usize,

    /// Maximum number of connections tracked *per shard*. Since the table is sharded by
    /// flow key, the effective global capacity is `max_connections * num_shards`.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Periodic GC sweep interval, in milliseconds.
    #[serde(default = "default_gc_interval_ms")]
    pub gc_interval_ms: u64,

    /// Which protocols are enabled for parsing.
    #[serde(default = "default_protocol_enable")]
    pub protocol_enable: ProtocolEnable,

    /// Default fraction of completed exchanges delivered to the detail stream.
    #[serde(default = "default_detail_sample_rate")]
    pub detail_sample_rate: f64,

    /// Per-protocol overrides of `detail_sample_rate`, keyed by lowercase protocol name.
    #[serde(default)]
    pub detail_sample_rate_overrides: HashMap<String, f64>,

    /// Whether the debug (windowed) counter set is populated.
    #[serde(default = "default_protocol_stat_enabled")]
    pub protocol_stat_enabled: bool,

    /// Number of shards (and worker threads). Defaults to the number of available cores.
    #[serde(default = "default_num_shards")]
    pub num_shards: usize,

    /// Bounded channel depth for ingress dispatch and the detail stream.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Unmatched DNS request expiry, in milliseconds.
    #[serde(default = "default_dns_request_timeout_ms")]
    pub dns_request_timeout_ms: u64,
}

impl ObserverConfig {
    pub fn sample_rate_for(&self, protocol: &str) -> f64 {
        self.detail_sample_rate_overrides
            .get(protocol)
            .copied()
            .unwrap_or(self.detail_sample_rate)
    }
}

fn default_connection_timeout_s() -> u64 {
    300
}

fn default_connection_closed_timeout_s() -> u64 {
    30
}

fn default_protocol_cache_limit_bytes() -> usize {
    1_048_576
}

fn default_max_connections() -> usize {
    100_000
}

fn default_gc_interval_ms() -> u64 {
    1000
}

fn default_detail_sample_rate() -> f64 {
    1.0
}

fn default_protocol_stat_enabled() -> bool {
    true
}

fn default_num_shards() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_channel_capacity() -> usize {
    4096
}

fn default_dns_request_timeout_ms() -> u64 {
    5000
}

/// Per-protocol enable mask.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolEnable {
    #[serde(default = "default_true")]
    pub http: bool,
    #[serde(default = "default_true")]
    pub dns: bool,
    #[serde(default = "default_true")]
    pub mysql: bool,
    #[serde(default = "default_true")]
    pub redis: bool,
    #[serde(default = "default_true")]
    pub pgsql: bool,
    #[serde(default = "default_true")]
    pub dubbo: bool,
    #[serde(default = "default_true")]
    pub kafka: bool,
}

fn default_true() -> bool {
    true
}

fn default_protocol_enable() -> ProtocolEnable {
    ProtocolEnable {
        http: true,
        dns: true,
        mysql: true,
        redis: true,
        pgsql: true,
        dubbo: true,
        kafka: true,
    }
}

impl Default for ProtocolEnable {
    fn default() -> Self {
        default_protocol_enable()
    }
}

impl Default for ObserverConfig {
    fn default() -> Self {
        ObserverConfig {
            connection_timeout_s: default_connection_timeout_s(),
            connection_closed_timeout_s: default_connection_closed_timeout_s(),
            protocol_cache_limit_bytes: default_protocol_cache_limit_bytes(),
            max_connections: default_max_connections(),
            gc_interval_ms: default_gc_interval_ms(),
            protocol_enable: default_protocol_enable(),
            detail_sample_rate: default_detail_sample_rate(),
            detail_sample_rate_overrides: HashMap::new(),
            protocol_stat_enabled: default_protocol_stat_enabled(),
            num_shards: default_num_shards(),
            channel_capacity: default_channel_capacity(),
            dns_request_timeout_ms: default_dns_request_timeout_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_all_protocols_enabled() {
        let cfg = default_config();
        assert!(cfg.observer.protocol_enable.http);
        assert!(cfg.observer.protocol_enable.kafka);
    }

    #[test]
    fn parses_minimal_toml() {
        let cfg = Config::from_toml_str(
            r#"
            [observer]
            max_connections = 42
            "#,
        )
        .unwrap();
        assert_eq!(cfg.observer.max_connections, 42);
        assert_eq!(cfg.observer.connection_timeout_s, 300);
    }

    #[test]
    fn reload_replaces_config_from_disk() {
        let mut cfg = default_config();
        cfg.observer.max_connections = 1;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[observer]\nmax_connections = 99\n").unwrap();

        cfg.reload(&path).unwrap();
        assert_eq!(cfg.observer.max_connections, 99);
    }

    #[test]
    fn per_protocol_sample_rate_override() {
        let mut cfg = default_config();
        cfg.observer.detail_sample_rate = 0.1;
        cfg.observer
            .detail_sample_rate_overrides
            .insert("dns".to_string(), 1.0);
        assert_eq!(cfg.observer.sample_rate_for("dns"), 1.0);
        assert_eq!(cfg.observer.sample_rate_for("http"), 0.1);
    }
}
