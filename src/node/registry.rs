//! Node registry
//!
//! Owns the node list and the current node as one unit behind a single
//! short-held lock. Multi-step cycles (refresh, check, select) also take
//! the async cycle lock so they never interleave; failover takes it only
//! when it is free. Network IO happens with only the cycle lock held.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;

use super::selector::{self, Selector};
use super::{HealthChecker, Node};

#[derive(Default)]
struct State {
    nodes: Vec<Arc<Node>>,
    current: Option<Arc<Node>>,
    last_update: Option<DateTime<Local>>,
}

pub struct Registry {
    state: Mutex<State>,
    cycle: tokio::sync::Mutex<()>,
    checker: HealthChecker,
    prefer_custom: bool,
}

impl Registry {
    pub fn new(nodes: Vec<Node>, checker: HealthChecker, prefer_custom: bool) -> Self {
        let state = State {
            nodes: nodes.into_iter().map(Arc::new).collect(),
            ..State::default()
        };
        Self {
            state: Mutex::new(state),
            cycle: tokio::sync::Mutex::new(()),
            checker,
            prefer_custom,
        }
    }

    pub fn all_nodes(&self) -> Vec<Arc<Node>> {
        self.state.lock().nodes.clone()
    }

    pub fn current_node(&self) -> Option<Arc<Node>> {
        self.state.lock().current.clone()
    }

    pub fn last_update(&self) -> Option<DateTime<Local>> {
        self.state.lock().last_update
    }

    pub fn prefers_custom(&self) -> bool {
        self.prefer_custom
    }

    pub fn checker(&self) -> &HealthChecker {
        &self.checker
    }

    /// Apply a selection against the last known health, without probing.
    ///
    /// Returns false, leaving the current node as is, when the list is empty
    /// or no node is online.
    pub fn pick(&self, selector: &Selector) -> bool {
        let mut state = self.state.lock();
        if state.nodes.is_empty() {
            warn!("[registry] No nodes to select from");
            return false;
        }

        match selector::select(&state.nodes, selector, self.prefer_custom) {
            Some(node) => {
                info!("[registry] Selected {} ({}, latency {:?}ms)", node, selector, node.latency_ms());
                state.current = Some(node);
                true
            }
            None => {
                warn!("[registry] No online node for selector {}", selector);
                false
            }
        }
    }

    /// Probe every node, then select
    pub async fn select(&self, selector: &Selector) -> bool {
        let _cycle = self.cycle.lock().await;
        let nodes = self.all_nodes();
        if nodes.is_empty() {
            warn!("[registry] No nodes to select from");
            return false;
        }
        self.checker.check_all(&nodes).await;
        self.pick(selector)
    }

    /// Probe every node and return the online ones
    pub async fn check_all(&self) -> Vec<Arc<Node>> {
        let _cycle = self.cycle.lock().await;
        let nodes = self.all_nodes();
        self.checker.check_all(&nodes).await
    }

    /// Replace the subscription nodes with the result of `fetch`.
    ///
    /// On error nothing changes. On success custom nodes are kept in front of
    /// the new nodes, then the current node is chosen again. Returns the
    /// number of nodes the subscription produced.
    pub async fn refresh<F>(&self, fetch: F, selector: &Selector) -> Result<usize>
    where
        F: Future<Output = Result<Vec<Node>>>,
    {
        let _cycle = self.cycle.lock().await;
        let fresh = fetch.await?;
        let count = fresh.len();

        let forced = {
            let mut state = self.state.lock();
            let was_custom = state.current.as_ref().is_some_and(|n| n.is_custom());

            let mut nodes: Vec<Arc<Node>> = state.nodes.iter().filter(|n| n.is_custom()).cloned().collect();
            nodes.extend(fresh.into_iter().map(Arc::new));

            let stale = state
                .current
                .as_ref()
                .is_some_and(|current| !nodes.iter().any(|n| Arc::ptr_eq(n, current)));
            if stale {
                state.current = None;
            }

            state.nodes = nodes;
            state.last_update = Some(Local::now());

            let forced = if self.prefer_custom || was_custom {
                state.nodes.iter().find(|n| n.is_custom()).cloned()
            } else {
                None
            };
            if let Some(node) = &forced {
                state.current = Some(node.clone());
            }
            forced
        };

        info!("[registry] Subscription refreshed, {} nodes", count);

        match forced {
            Some(node) => info!("[registry] Keeping custom node {}", node),
            None => {
                let nodes = self.all_nodes();
                self.checker.check_all(&nodes).await;
                self.pick(selector);
            }
        }

        Ok(count)
    }

    /// Re-probe a node that just failed and choose again.
    ///
    /// The failed node stays a candidate only if the probe finds it online.
    /// Never waits behind a running cycle: if one holds the cycle lock the
    /// reselect runs without it. Returns the new current node, or `None`
    /// when nothing is online.
    pub async fn failover(&self, failed: &Arc<Node>) -> Option<Arc<Node>> {
        let _cycle = match self.cycle.try_lock() {
            Ok(guard) => Some(guard),
            Err(_) => {
                debug!("[registry] Cycle in progress, failing over {} without it", failed.name());
                None
            }
        };
        let recovered = self.checker.probe(failed).await;

        let mut state = self.state.lock();
        match selector::select(&state.nodes, &Selector::Auto, self.prefer_custom) {
            Some(node) => {
                if Arc::ptr_eq(&node, failed) {
                    info!("[registry] {} still online, keeping it", failed.name());
                } else {
                    info!("[registry] Failover {} -> {}", failed.name(), node);
                }
                state.current = Some(node.clone());
                Some(node)
            }
            None => {
                debug!("[registry] No failover target (failed node online: {})", recovered);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use tokio::net::TcpListener;

    fn registry(nodes: Vec<Node>, prefer_custom: bool) -> Registry {
        Registry::new(nodes, HealthChecker::default(), prefer_custom)
    }

    async fn dead_port() -> u16 {
        TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_empty_registry_select_fails() {
        let registry = registry(Vec::new(), false);
        assert!(!registry.select(&Selector::Auto).await);
        assert!(!registry.pick(&Selector::Auto));
        assert!(registry.current_node().is_none());
    }

    #[tokio::test]
    async fn test_select_probes_then_picks() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let registry = registry(
            vec![
                Node::new("down", "127.0.0.1", dead_port().await, None),
                Node::new("up", "127.0.0.1", open, None),
            ],
            false,
        );

        assert!(registry.select(&Selector::Name("down".into())).await);
        assert_eq!(registry.current_node().unwrap().name(), "up");
    }

    #[tokio::test]
    async fn test_failed_refresh_leaves_state() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let registry = registry(vec![Node::new("a", "127.0.0.1", open, None)], false);
        assert!(registry.select(&Selector::Auto).await);

        let before: Vec<_> = registry.all_nodes();
        let current = registry.current_node().unwrap();

        let result = registry
            .refresh(async { Err(Error::Subscription("HTTP 500".into())) }, &Selector::Auto)
            .await;
        assert!(result.is_err());

        let after = registry.all_nodes();
        assert_eq!(before.len(), after.len());
        assert!(before.iter().zip(&after).all(|(a, b)| Arc::ptr_eq(a, b)));
        assert!(Arc::ptr_eq(&current, &registry.current_node().unwrap()));
        assert!(registry.last_update().is_none());
    }

    #[tokio::test]
    async fn test_refresh_keeps_custom_nodes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let registry = registry(
            vec![
                Node::new("custom-node-1", "127.0.0.1", open, None),
                Node::new("old", "127.0.0.1", open, None),
            ],
            false,
        );

        let fresh = vec![Node::new("new", "127.0.0.1", open, None)];
        let count = registry.refresh(async { Ok(fresh) }, &Selector::Auto).await.unwrap();
        assert_eq!(count, 1);

        let names: Vec<_> = registry.all_nodes().iter().map(|n| n.name().to_string()).collect();
        assert_eq!(names, vec!["custom-node-1", "new"]);
        assert!(registry.current_node().is_some());
        assert!(registry.last_update().is_some());
    }

    #[tokio::test]
    async fn test_refresh_stays_on_custom_node() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let registry = registry(vec![Node::new("custom-node-a", "127.0.0.1", open, None)], false);
        assert!(registry.select(&Selector::Auto).await);

        let fresh = vec![Node::new("fast", "127.0.0.1", open, None)];
        registry.refresh(async { Ok(fresh) }, &Selector::Auto).await.unwrap();
        assert_eq!(registry.current_node().unwrap().name(), "custom-node-a");
    }

    #[tokio::test]
    async fn test_refresh_clears_replaced_current() {
        let registry = registry(vec![Node::new("old", "127.0.0.1", dead_port().await, None)], false);
        registry.all_nodes()[0].mark_online(5);
        assert!(registry.pick(&Selector::Auto));

        let fresh = vec![Node::new("new", "127.0.0.1", dead_port().await, None)];
        registry.refresh(async { Ok(fresh) }, &Selector::Auto).await.unwrap();
        assert!(registry.current_node().is_none());
    }

    #[tokio::test]
    async fn test_failover_moves_to_other_node() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let registry = registry(
            vec![
                Node::new("first", "127.0.0.1", dead_port().await, None),
                Node::new("second", "127.0.0.1", open, None),
            ],
            false,
        );
        let nodes = registry.all_nodes();
        nodes[0].mark_online(1);
        nodes[1].mark_online(50);
        assert!(registry.pick(&Selector::Auto));
        assert_eq!(registry.current_node().unwrap().name(), "first");

        let next = registry.failover(&nodes[0]).await.unwrap();
        assert_eq!(next.name(), "second");
        assert!(!nodes[0].is_online());
        assert!(Arc::ptr_eq(&next, &registry.current_node().unwrap()));
    }

    #[tokio::test]
    async fn test_failover_keeps_recovered_custom_node() {
        let home = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let other = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let registry = registry(
            vec![
                Node::new("custom-node-home", "127.0.0.1", home.local_addr().unwrap().port(), None),
                Node::new("other", "127.0.0.1", other.local_addr().unwrap().port(), None),
            ],
            true,
        );
        assert!(registry.select(&Selector::Auto).await);
        let home_node = registry.current_node().unwrap();
        assert_eq!(home_node.name(), "custom-node-home");

        let next = registry.failover(&home_node).await.unwrap();
        assert_eq!(next.name(), "custom-node-home");
        assert_eq!(registry.current_node().unwrap().name(), "custom-node-home");
    }

    #[tokio::test]
    async fn test_failover_does_not_wait_for_cycle() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let registry = registry(
            vec![
                Node::new("first", "127.0.0.1", dead_port().await, None),
                Node::new("second", "127.0.0.1", open, None),
            ],
            false,
        );
        let nodes = registry.all_nodes();
        nodes[0].mark_online(1);
        nodes[1].mark_online(50);
        assert!(registry.pick(&Selector::Auto));

        // A refresh holding the cycle lock for its whole fetch
        let _busy = registry.cycle.lock().await;
        let next = tokio::time::timeout(std::time::Duration::from_secs(5), registry.failover(&nodes[0]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.name(), "second");
    }

    #[tokio::test]
    async fn test_failover_without_alternative() {
        let registry = registry(vec![Node::new("only", "127.0.0.1", dead_port().await, None)], false);
        let only = registry.all_nodes()[0].clone();
        assert!(registry.failover(&only).await.is_none());
    }
}
