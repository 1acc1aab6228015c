//! Node model
//!
//! A `Node` is an upstream endpoint: a plain TCP relay, a chained HTTP
//! proxy, or an obfuscated tunnel when it carries `TunnelConfig`.
//!
//! Nodes are shared as `Arc<Node>`. Identity and credentials never change
//! after construction; the health state sits behind its own lock and is
//! only written by the health checker.

pub mod custom;
pub mod health;
pub mod registry;
pub mod selector;

pub use health::HealthChecker;
pub use registry::Registry;
pub use selector::Selector;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;

use crate::common::Address;

/// Names with this prefix are custom nodes and survive subscription refreshes
pub const CUSTOM_NODE_PREFIX: &str = "custom-node-";

/// Reachability as seen by the last probe
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Unknown,
    Online,
    Offline,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Unknown => write!(f, "unknown"),
            NodeStatus::Online => write!(f, "online"),
            NodeStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Tunnel credentials; a node without them is relayed as plain TCP
#[derive(Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub password: String,
    pub method: String,
    pub protocol: String,
    pub protocol_param: String,
    pub obfs: String,
    pub obfs_param: String,
}

impl TunnelConfig {
    /// Credentials with `origin` protocol and `plain` obfuscation
    pub fn new(method: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
            method: method.into(),
            protocol: "origin".to_string(),
            protocol_param: String::new(),
            obfs: "plain".to_string(),
            obfs_param: String::new(),
        }
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>, param: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self.protocol_param = param.into();
        self
    }

    pub fn with_obfs(mut self, obfs: impl Into<String>, param: impl Into<String>) -> Self {
        self.obfs = obfs.into();
        self.obfs_param = param.into();
        self
    }
}

// Secrets stay out of logs
impl std::fmt::Debug for TunnelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelConfig")
            .field("method", &self.method)
            .field("protocol", &self.protocol)
            .field("obfs", &self.obfs)
            .finish_non_exhaustive()
    }
}

/// Health state written by the health checker
#[derive(Debug, Clone, Default)]
pub struct Health {
    pub latency_ms: Option<u64>,
    pub last_checked_at: Option<DateTime<Local>>,
    pub status: NodeStatus,
}

/// A selectable upstream endpoint
pub struct Node {
    name: String,
    address: String,
    port: u16,
    tunnel: Option<TunnelConfig>,
    health: Mutex<Health>,
}

impl Node {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        tunnel: Option<TunnelConfig>,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
            tunnel,
            health: Mutex::new(Health::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn tunnel(&self) -> Option<&TunnelConfig> {
        self.tunnel.as_ref()
    }

    /// Network endpoint of the node itself
    pub fn endpoint(&self) -> Address {
        Address::new(&self.address, self.port)
    }

    pub fn is_custom(&self) -> bool {
        self.name.starts_with(CUSTOM_NODE_PREFIX)
    }

    pub fn health(&self) -> Health {
        self.health.lock().clone()
    }

    pub fn status(&self) -> NodeStatus {
        self.health.lock().status
    }

    pub fn is_online(&self) -> bool {
        self.status() == NodeStatus::Online
    }

    pub fn latency_ms(&self) -> Option<u64> {
        self.health.lock().latency_ms
    }

    pub(crate) fn mark_online(&self, latency_ms: u64) {
        let mut health = self.health.lock();
        health.status = NodeStatus::Online;
        health.latency_ms = Some(latency_ms);
        health.last_checked_at = Some(Local::now());
    }

    /// Latency is kept from the last successful probe
    pub(crate) fn mark_offline(&self) {
        let mut health = self.health.lock();
        health.status = NodeStatus::Offline;
        health.last_checked_at = Some(Local::now());
    }

    /// Serializable snapshot for the accessor surface
    pub fn view(&self) -> NodeView {
        let health = self.health();
        let tunnel = self.tunnel.as_ref();
        NodeView {
            name: self.name.clone(),
            address: self.address.clone(),
            port: self.port,
            latency: health.latency_ms,
            last_check: health.last_checked_at,
            status: health.status,
            method: tunnel.map(|t| t.method.clone()),
            protocol: tunnel.map(|t| t.protocol.clone()),
            protocol_param: tunnel.map(|t| t.protocol_param.clone()),
            obfs: tunnel.map(|t| t.obfs.clone()),
            obfs_param: tunnel.map(|t| t.obfs_param.clone()),
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("address", &self.address)
            .field("port", &self.port)
            .field("tunnel", &self.tunnel)
            .field("health", &*self.health.lock())
            .finish()
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.address, self.port)
    }
}

/// Node as serialized for the control surface. The password is never included.
#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub latency: Option<u64>,
    pub last_check: Option<DateTime<Local>>,
    pub status: NodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_param: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obfs: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obfs_param: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_custom_prefix() {
        assert!(Node::new("custom-node-1", "a", 1, None).is_custom());
        assert!(!Node::new("node-1", "a", 1, None).is_custom());
    }

    #[test]
    fn test_health_transitions() {
        let node = Node::new("n", "127.0.0.1", 80, None);
        assert_eq!(node.status(), NodeStatus::Unknown);

        node.mark_online(42);
        assert!(node.is_online());
        assert_eq!(node.latency_ms(), Some(42));

        node.mark_offline();
        assert_eq!(node.status(), NodeStatus::Offline);
        assert_eq!(node.latency_ms(), Some(42));
        assert!(node.health().last_checked_at.is_some());
    }

    #[test]
    fn test_view_hides_password() {
        let tunnel = TunnelConfig::new("aes-256-cfb", "secret")
            .with_obfs("tls1.2_ticket_auth", "host.example");
        let node = Node::new("n", "h", 443, Some(tunnel));

        let json = serde_json::to_string(&node.view()).unwrap();
        assert!(json.contains("\"method\":\"aes-256-cfb\""));
        assert!(json.contains("\"status\":\"unknown\""));
        assert!(!json.contains("secret"));
        assert!(!format!("{:?}", node).contains("secret"));

        let plain = serde_json::to_string(&Node::new("p", "h", 80, None).view()).unwrap();
        assert!(!plain.contains("method"));
    }
}
