//! Node selection policy
//!
//! Pure function over a node slice: no IO, no locking. The registry applies
//! the result under its own lock.
//!
//! Policy, in order:
//! 1. With custom preference on, the first online custom node wins.
//! 2. `auto`: lowest latency among online nodes, unknown latency last,
//!    ties resolved by list order.
//! 3. Index: that node if online, otherwise `auto`.
//! 4. Name: first online node with that exact name, otherwise `auto`.

use std::sync::Arc;

use tracing::debug;

use super::Node;

/// Which node to use
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Auto,
    Index(usize),
    Name(String),
}

impl Selector {
    /// `"auto"`, an all-digit index, or a literal node name
    pub fn parse(s: &str) -> Self {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("auto") {
            return Selector::Auto;
        }
        if s.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(index) = s.parse() {
                return Selector::Index(index);
            }
        }
        Selector::Name(s.to_string())
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Selector::Auto => write!(f, "auto"),
            Selector::Index(i) => write!(f, "#{}", i),
            Selector::Name(name) => write!(f, "'{}'", name),
        }
    }
}

/// Resolution stage; a requested lookup falls back to auto at most once
enum Step<'a> {
    Requested(&'a Selector),
    Auto,
}

/// Pick a node, or `None` when no node is online
pub fn select(nodes: &[Arc<Node>], selector: &Selector, prefer_custom: bool) -> Option<Arc<Node>> {
    if !nodes.iter().any(|n| n.is_online()) {
        return None;
    }

    if prefer_custom {
        if let Some(node) = nodes.iter().find(|n| n.is_custom() && n.is_online()) {
            return Some(node.clone());
        }
    }

    let mut step = Step::Requested(selector);
    loop {
        step = match step {
            Step::Auto | Step::Requested(Selector::Auto) => return fastest(nodes),
            Step::Requested(Selector::Index(index)) => match nodes.get(*index) {
                Some(node) if node.is_online() => return Some(node.clone()),
                Some(node) => {
                    debug!("Node #{} ({}) is {}, falling back to auto", index, node.name(), node.status());
                    Step::Auto
                }
                // Out of range digits may still be a node name
                None => match by_name(nodes, &index.to_string()) {
                    Some(node) => return Some(node),
                    None => Step::Auto,
                },
            },
            Step::Requested(Selector::Name(name)) => match by_name(nodes, name) {
                Some(node) => return Some(node),
                None => {
                    debug!("Node '{}' missing or not online, falling back to auto", name);
                    Step::Auto
                }
            },
        };
    }
}

fn by_name(nodes: &[Arc<Node>], name: &str) -> Option<Arc<Node>> {
    nodes
        .iter()
        .find(|n| n.name() == name && n.is_online())
        .cloned()
}

/// Lowest latency online node; `min_by_key` keeps the first of equal keys
fn fastest(nodes: &[Arc<Node>]) -> Option<Arc<Node>> {
    nodes
        .iter()
        .filter(|n| n.is_online())
        .min_by_key(|n| {
            let latency = n.latency_ms();
            (latency.is_none(), latency.unwrap_or(u64::MAX))
        })
        .cloned()
}
