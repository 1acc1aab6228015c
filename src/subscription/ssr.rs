//! `ssr://` links
//!
//! `ssr://` + base64(`server:port:protocol:method:obfs:base64(password)/?params`)
//! where every parameter value is base64 as well. The main part is split from
//! the right so IPv6 servers keep their colons.

use tracing::warn;

use crate::error::{Error, Result};
use crate::node::{Node, TunnelConfig};

use super::base64::{decode_str, encode_url_safe};

pub const SCHEME: &str = "ssr://";

/// Decode every `ssr://` link in `text`, skipping malformed ones
pub fn parse_links(text: &str) -> Vec<Node> {
    let mut nodes = Vec::new();
    for link in text.split_whitespace().filter(|t| t.starts_with(SCHEME)) {
        match parse_link(link, nodes.len() + 1) {
            Ok(node) => nodes.push(node),
            Err(e) => warn!("[subscription] Skipping SSR link: {}", e),
        }
    }
    nodes
}

/// Decode one link; `ordinal` numbers nodes without remarks
pub fn parse_link(link: &str, ordinal: usize) -> Result<Node> {
    let body = link.trim().strip_prefix(SCHEME).unwrap_or(link.trim());
    let decoded = decode_str(body).ok_or_else(|| Error::Parse("SSR link is not base64".into()))?;

    let (main, query) = match decoded.split_once("/?") {
        Some((main, query)) => (main, Some(query)),
        None => (decoded.trim_end_matches('/'), None),
    };

    let mut fields = main.rsplitn(6, ':');
    let mut field = |what: &str| {
        fields
            .next()
            .filter(|f| !f.is_empty())
            .ok_or_else(|| Error::Parse(format!("SSR link has no {}", what)))
    };
    let password = field("password")?;
    let obfs = field("obfs")?;
    let method = field("method")?;
    let protocol = field("protocol")?;
    let port = field("port")?;
    let server = field("server")?;

    let port: u16 = port
        .parse()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| Error::Parse(format!("SSR link has invalid port {}", port)))?;
    let server = server.trim_start_matches('[').trim_end_matches(']');
    let password = decode_str(password).ok_or_else(|| Error::Parse("SSR password is not base64".into()))?;

    let mut obfs_param = String::new();
    let mut protocol_param = String::new();
    let mut remarks = None;
    for pair in query.unwrap_or_default().split('&') {
        let Some((key, value)) = pair.split_once('=') else {
            continue;
        };
        let value = decode_str(value).unwrap_or_default();
        match key {
            "obfsparam" => obfs_param = value,
            "protoparam" => protocol_param = value,
            "remarks" if !value.trim().is_empty() => remarks = Some(value.trim().to_string()),
            _ => {}
        }
    }

    let name = remarks.unwrap_or_else(|| format!("SSR node-{}", ordinal));
    let tunnel = TunnelConfig::new(method, password)
        .with_protocol(protocol, protocol_param)
        .with_obfs(obfs, obfs_param);

    Ok(Node::new(name, server, port, Some(tunnel)))
}

/// Canonical link for a tunnel node
pub fn encode_link(node: &Node) -> Option<String> {
    let tunnel = node.tunnel()?;
    let main = format!(
        "{}:{}:{}:{}:{}:{}/?obfsparam={}&protoparam={}&remarks={}",
        node.address(),
        node.port(),
        tunnel.protocol,
        tunnel.method,
        tunnel.obfs,
        encode_url_safe(tunnel.password.as_bytes()),
        encode_url_safe(tunnel.obfs_param.as_bytes()),
        encode_url_safe(tunnel.protocol_param.as_bytes()),
        encode_url_safe(node.name().as_bytes()),
    );
    Some(format!("{}{}", SCHEME, encode_url_safe(main.as_bytes())))
}
