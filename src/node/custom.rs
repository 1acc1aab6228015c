//! Custom nodes from the options file
//!
//! Two shapes are read: the single `custom_node` record (only when
//! `use_custom_node` is set) followed by the `custom_nodes` list. Every
//! resulting name carries the custom prefix so the nodes survive
//! subscription refreshes.

use tracing::{info, warn};

use crate::config::{Config, NodeRecord};

use super::{Node, TunnelConfig, CUSTOM_NODE_PREFIX};

pub const DEFAULT_METHOD: &str = "chacha20-ietf";
pub const DEFAULT_PROTOCOL: &str = "origin";
pub const DEFAULT_OBFS: &str = "tls1.2_ticket_auth";
const FALLBACK_PASSWORD: &str = "password";

/// Build custom nodes from the options record, skipping unusable entries
pub fn load_custom_nodes(config: &Config) -> Vec<Node> {
    let single = config.custom_node.iter().filter(|_| config.use_custom_node);
    let mut nodes: Vec<Node> = Vec::new();

    for record in single.chain(config.custom_nodes.iter()) {
        let name = custom_name(record.name.as_deref(), nodes.len() + 1);

        let (server, port) = match (non_empty(&record.server), record.server_port) {
            (Some(server), Some(port)) if port != 0 => (server, port),
            _ => {
                warn!("[custom] Node {} has no server/port, skipped", name);
                continue;
            }
        };

        if nodes.iter().any(|n| n.name() == name) {
            warn!("[custom] Duplicate node name {}, skipped", name);
            continue;
        }

        let node = Node::new(name, server, port, tunnel_config(record));
        info!("[custom] Added node {}", node);
        nodes.push(node);
    }

    nodes
}

fn custom_name(name: Option<&str>, ordinal: usize) -> String {
    match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) if name.starts_with(CUSTOM_NODE_PREFIX) => name.to_string(),
        Some(name) => format!("{}{}", CUSTOM_NODE_PREFIX, name),
        None => format!("{}{}", CUSTOM_NODE_PREFIX, ordinal),
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn tunnel_config(record: &NodeRecord) -> Option<TunnelConfig> {
    let password = match (non_empty(&record.password), non_empty(&record.method)) {
        (None, None) => return None,
        (Some(password), _) => password,
        (None, Some(_)) => {
            warn!("[custom] Node has a method but no password, using the default password");
            FALLBACK_PASSWORD
        }
    };

    let method = non_empty(&record.method).unwrap_or(DEFAULT_METHOD);
    let protocol = non_empty(&record.protocol).unwrap_or(DEFAULT_PROTOCOL);
    let obfs = non_empty(&record.obfs).unwrap_or(DEFAULT_OBFS);

    Some(
        TunnelConfig::new(method, password)
            .with_protocol(protocol, record.protocol_param.clone().unwrap_or_default())
            .with_obfs(obfs, record.obfs_param.clone().unwrap_or_default()),
    )
}
