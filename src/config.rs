//! Configuration module for nodemux
//!
//! The options record is a JSON document. Every field has a default so an
//! empty object is a valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Local proxy port
    #[serde(default = "default_local_port")]
    pub local_port: u16,

    /// Local proxy bind address
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Control API listen address (e.g. "127.0.0.1:8123"), disabled when absent
    #[serde(default)]
    pub api_listen: Option<String>,

    /// Subscription URL, no subscription when absent or empty
    #[serde(default)]
    pub subscription_url: Option<String>,

    /// Subscription refresh interval in hours
    #[serde(default = "default_update_interval")]
    pub subscription_update_interval: u64,

    /// Node selector applied at startup and after refreshes: "auto", an index or a name
    #[serde(default = "default_node_selector")]
    pub default_node: String,

    /// Enable the single `custom_node` record
    #[serde(default)]
    pub use_custom_node: bool,

    /// Always prefer online custom nodes; defaults to `use_custom_node`
    #[serde(default)]
    pub prefer_custom_node: Option<bool>,

    /// Single custom node record
    #[serde(default)]
    pub custom_node: Option<NodeRecord>,

    /// Additional custom node records
    #[serde(default)]
    pub custom_nodes: Vec<NodeRecord>,

    /// Network timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Whether custom nodes win selection whenever one is online
    pub fn prefers_custom_nodes(&self) -> bool {
        self.prefer_custom_node.unwrap_or(self.use_custom_node)
    }

    /// Subscription URL, if one is configured
    pub fn subscription(&self) -> Option<&str> {
        self.subscription_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    /// Subscription refresh period
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.subscription_update_interval.max(1) * 3600)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            local_port: default_local_port(),
            listen_address: default_listen_address(),
            api_listen: None,
            subscription_url: None,
            subscription_update_interval: default_update_interval(),
            default_node: default_node_selector(),
            use_custom_node: false,
            prefer_custom_node: None,
            custom_node: None,
            custom_nodes: Vec::new(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

fn default_local_port() -> u16 {
    7088
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_update_interval() -> u64 {
    12
}

fn default_node_selector() -> String {
    "auto".to_string()
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// A node as written in the options file.
///
/// Both the `server`/`server_port` and `address`/`port` spellings are accepted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeRecord {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default, alias = "address")]
    pub server: Option<String>,

    #[serde(default, alias = "port")]
    pub server_port: Option<u16>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub method: Option<String>,

    #[serde(default)]
    pub protocol: Option<String>,

    #[serde(default)]
    pub protocol_param: Option<String>,

    #[serde(default)]
    pub obfs: Option<String>,

    #[serde(default)]
    pub obfs_param: Option<String>,
}

/// Network timeouts, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Health probe connect timeout
    #[serde(default = "default_probe_secs")]
    pub probe: u64,

    /// Upstream connect timeout
    #[serde(default = "default_connect_secs")]
    pub connect: u64,

    /// Time allowed for a client to send a CONNECT request
    #[serde(default = "default_sniff_secs")]
    pub sniff: u64,

    /// Relay idle timeout
    #[serde(default = "default_idle_secs")]
    pub idle: u64,

    /// Subscription fetch timeout
    #[serde(default = "default_subscription_secs")]
    pub subscription: u64,
}

fn default_probe_secs() -> u64 {
    2
}

fn default_connect_secs() -> u64 {
    15
}

fn default_sniff_secs() -> u64 {
    5
}

fn default_idle_secs() -> u64 {
    300
}

fn default_subscription_secs() -> u64 {
    10
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            probe: default_probe_secs(),
            connect: default_connect_secs(),
            sniff: default_sniff_secs(),
            idle: default_idle_secs(),
            subscription: default_subscription_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe)
    }

    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect)
    }

    pub fn sniff(&self) -> Duration {
        Duration::from_secs(self.sniff)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle)
    }

    pub fn subscription(&self) -> Duration {
        Duration::from_secs(self.subscription)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_json("{}").unwrap();
        assert_eq!(config.local_port, 7088);
        assert_eq!(config.default_node, "auto");
        assert_eq!(config.subscription_update_interval, 12);
        assert_eq!(config.timeouts.probe, 2);
        assert!(config.subscription().is_none());
        assert!(!config.prefers_custom_nodes());
    }

    #[test]
    fn test_node_record_aliases() {
        let config = Config::from_json(
            r#"{
                "use_custom_node": true,
                "custom_node": {"server": "a.example", "server_port": 7001, "password": "pw"},
                "custom_nodes": [{"name": "b", "address": "b.example", "port": 8000}]
            }"#,
        )
        .unwrap();
        let single = config.custom_node.as_ref().unwrap();
        assert_eq!(single.server.as_deref(), Some("a.example"));
        assert_eq!(single.server_port, Some(7001));
        assert_eq!(config.custom_nodes[0].server.as_deref(), Some("b.example"));
        assert_eq!(config.custom_nodes[0].server_port, Some(8000));
        assert!(config.prefers_custom_nodes());
    }

    #[test]
    fn test_blank_subscription_is_none() {
        let config = Config::from_json(r#"{"subscription_url": "  "}"#).unwrap();
        assert!(config.subscription().is_none());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed = Config::from_json(&json).unwrap();
        assert_eq!(parsed.local_port, config.local_port);
    }
}
