//! `ss://` links
//!
//! Two layouts are in the wild:
//! - SIP002: `ss://userinfo@host:port[/][?plugin=...][#name]` where userinfo
//!   is base64 or percent-encoded `method:password`
//! - legacy: `ss://base64(method:password@host:port)[#name]`

use tracing::warn;

use crate::error::{Error, Result};
use crate::node::{Node, TunnelConfig};

use super::base64::decode_str;

pub const SCHEME: &str = "ss://";

/// Decode every `ss://` link in `text`, skipping malformed ones
pub fn parse_links(text: &str) -> Vec<Node> {
    let mut nodes = Vec::new();
    for link in text.split_whitespace().filter(|t| t.starts_with(SCHEME)) {
        match parse_link(link, nodes.len() + 1) {
            Ok(node) => nodes.push(node),
            Err(e) => warn!("[subscription] Skipping SS link: {}", e),
        }
    }
    nodes
}

pub fn parse_link(link: &str, ordinal: usize) -> Result<Node> {
    let body = link.trim().strip_prefix(SCHEME).unwrap_or(link.trim());

    let (body, name) = match body.split_once('#') {
        Some((body, fragment)) => (body, percent_decode(fragment)),
        None => (body, String::new()),
    };
    let (body, query) = match body.split_once('?') {
        Some((body, query)) => (body, Some(query)),
        None => (body, None),
    };
    let body = body.trim_end_matches('/');

    let (credentials, endpoint) = match body.rsplit_once('@') {
        Some((userinfo, endpoint)) => (userinfo_credentials(userinfo)?, endpoint.to_string()),
        None => {
            let decoded = decode_str(body).ok_or_else(|| Error::Parse("SS link is not base64".into()))?;
            let (credentials, endpoint) = decoded
                .rsplit_once('@')
                .ok_or_else(|| Error::Parse("SS link has no endpoint".into()))?;
            (credentials.to_string(), endpoint.to_string())
        }
    };

    let (method, password) = credentials
        .split_once(':')
        .filter(|(method, _)| !method.is_empty())
        .ok_or_else(|| Error::Parse("SS link has no method".into()))?;

    let (server, port) = split_endpoint(&endpoint)?;

    let mut tunnel = TunnelConfig::new(method, password);
    if let Some(plugin) = query.and_then(plugin_param) {
        if let Some((obfs, host)) = obfs_plugin(&plugin) {
            tunnel = tunnel.with_obfs(obfs, host);
        }
    }

    let name = if name.trim().is_empty() {
        format!("SS node-{}", ordinal)
    } else {
        name.trim().to_string()
    };

    Ok(Node::new(name, server, port, Some(tunnel)))
}

/// `method:password`, percent-encoded or base64
fn userinfo_credentials(userinfo: &str) -> Result<String> {
    let decoded = percent_decode(userinfo);
    if decoded.contains(':') {
        return Ok(decoded);
    }
    decode_str(userinfo).ok_or_else(|| Error::Parse("SS userinfo is not base64".into()))
}

fn percent_decode(s: &str) -> String {
    urlencoding::decode(s)
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| s.to_string())
}

/// `host:port` or `[v6]:port`
pub(super) fn split_endpoint(endpoint: &str) -> Result<(String, u16)> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| Error::Parse(format!("no port in {}", endpoint)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let port: u16 = port
        .trim()
        .parse()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| Error::Parse(format!("invalid port in {}", endpoint)))?;
    if host.is_empty() {
        return Err(Error::Parse(format!("no host in {}", endpoint)));
    }
    Ok((host.to_string(), port))
}

fn plugin_param(query: &str) -> Option<String> {
    query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "plugin")
        .map(|(_, value)| percent_decode(value))
}

/// `obfs-local;obfs=tls;obfs-host=example.com` to `(tls, example.com)`
fn obfs_plugin(plugin: &str) -> Option<(String, String)> {
    let mut parts = plugin.split(';');
    let name = parts.next()?;
    if !matches!(name, "obfs-local" | "simple-obfs" | "obfs") {
        warn!("[subscription] Unsupported SS plugin {}", name);
        return None;
    }

    let mut mode = None;
    let mut host = String::new();
    for option in parts {
        match option.split_once('=') {
            Some(("obfs", value)) | Some(("mode", value)) => mode = Some(value.to_string()),
            Some(("obfs-host", value)) | Some(("host", value)) => host = value.to_string(),
            _ => {}
        }
    }
    mode.map(|mode| (mode, host))
}
