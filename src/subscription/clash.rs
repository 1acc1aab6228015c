//! Clash-style proxy lists (YAML or JSON with a `proxies` array)

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::node::{Node, TunnelConfig};

#[derive(Debug, Deserialize)]
struct ProxyEntry {
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    server: Option<String>,
    #[serde(default)]
    port: Option<Value>,
    #[serde(default)]
    password: Option<Value>,
    #[serde(default)]
    cipher: Option<String>,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default, rename = "protocol-param")]
    protocol_param: Option<Value>,
    #[serde(default)]
    obfs: Option<String>,
    #[serde(default, rename = "obfs-param")]
    obfs_param: Option<Value>,
    #[serde(default)]
    plugin: Option<String>,
    #[serde(default, rename = "plugin-opts")]
    plugin_opts: Option<PluginOpts>,
}

#[derive(Debug, Default, Deserialize)]
struct PluginOpts {
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    host: Option<String>,
}

/// Parse a YAML or JSON document into a generic value
pub fn parse_document(text: &str) -> Option<Value> {
    let text = text.trim();
    if text.starts_with('{') {
        if let Ok(value) = serde_json::from_str(text) {
            return Some(value);
        }
    }
    serde_yaml::from_str(text).ok()
}

/// The `proxies` array of a document, if it has one
pub fn proxies(document: &Value) -> Option<&Vec<Value>> {
    document.get("proxies").and_then(Value::as_array)
}

/// Decode a Clash document, skipping unusable entries
pub fn parse(text: &str) -> Result<Vec<Node>> {
    let document = parse_document(text).ok_or_else(|| Error::Parse("not a YAML/JSON document".into()))?;
    let entries = proxies(&document).ok_or_else(|| Error::Parse("document has no proxies array".into()))?;
    Ok(from_entries(entries))
}

pub fn from_entries(entries: &[Value]) -> Vec<Node> {
    let mut nodes = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        let entry: ProxyEntry = match serde_json::from_value(entry.clone()) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("[subscription] Skipping proxy #{}: {}", index, e);
                continue;
            }
        };
        match convert(entry, nodes.len() + 1) {
            Ok(Some(node)) => nodes.push(node),
            Ok(None) => {}
            Err(e) => warn!("[subscription] Skipping proxy #{}: {}", index, e),
        }
    }
    nodes
}

fn convert(entry: ProxyEntry, ordinal: usize) -> Result<Option<Node>> {
    let is_ssr = match entry.kind.to_ascii_lowercase().as_str() {
        "ss" | "shadowsocks" => false,
        "ssr" | "shadowsocksr" => true,
        other => {
            debug!("[subscription] Ignoring proxy type {}", other);
            return Ok(None);
        }
    };

    let server = entry
        .server
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| Error::Parse("missing server".into()))?;
    let port = entry
        .port
        .as_ref()
        .and_then(scalar)
        .and_then(|p| p.parse::<u16>().ok())
        .filter(|p| *p != 0)
        .ok_or_else(|| Error::Parse("missing or invalid port".into()))?;
    let password = entry
        .password
        .as_ref()
        .and_then(scalar)
        .ok_or_else(|| Error::Parse("missing password".into()))?;
    let cipher = entry
        .cipher
        .filter(|c| !c.is_empty())
        .ok_or_else(|| Error::Parse("missing cipher".into()))?;

    let mut tunnel = TunnelConfig::new(cipher, password);
    if is_ssr {
        if let Some(protocol) = entry.protocol.filter(|p| !p.is_empty()) {
            let param = entry.protocol_param.as_ref().and_then(scalar).unwrap_or_default();
            tunnel = tunnel.with_protocol(protocol, param);
        }
        if let Some(obfs) = entry.obfs.filter(|o| !o.is_empty()) {
            let param = entry.obfs_param.as_ref().and_then(scalar).unwrap_or_default();
            tunnel = tunnel.with_obfs(obfs, param);
        }
    } else if entry.plugin.as_deref() == Some("obfs") {
        let opts = entry.plugin_opts.unwrap_or_default();
        if let Some(mode) = opts.mode.filter(|m| !m.is_empty()) {
            tunnel = tunnel.with_obfs(mode, opts.host.unwrap_or_default());
        }
    }

    let prefix = if is_ssr { "SSR" } else { "SS" };
    let name = entry
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| format!("{} node-{}", prefix, ordinal));

    Ok(Some(Node::new(name, server, port, Some(tunnel))))
}

/// Strings and numbers both appear where text is expected
fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
