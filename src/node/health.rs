//! Concurrent node health checks
//!
//! A probe is a plain TCP connect to the node endpoint. Every node gets its
//! own task; `check_all` returns only after all of them have finished.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tracing::{debug, info, warn};

use crate::transport::TcpTransport;

use super::Node;

/// Default probe connect timeout
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct HealthChecker {
    transport: TcpTransport,
}

impl HealthChecker {
    pub fn new(probe_timeout: Duration) -> Self {
        Self {
            transport: TcpTransport::with_timeout(probe_timeout),
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        self.transport.connect_timeout()
    }

    /// Probe one node and record the outcome on it
    pub async fn probe(&self, node: &Arc<Node>) -> bool {
        let start = Instant::now();
        match self.transport.connect_tcp(&node.endpoint()).await {
            Ok(_stream) => {
                let latency = start.elapsed().as_millis() as u64;
                node.mark_online(latency);
                debug!("[health] {}:{} ({}) online, {}ms", node.address(), node.port(), node.name(), latency);
                true
            }
            Err(e) => {
                node.mark_offline();
                warn!("[health] {}:{} ({}) offline: {}", node.address(), node.port(), node.name(), e);
                false
            }
        }
    }

    /// Probe all nodes concurrently, returning the online ones in list order
    pub async fn check_all(&self, nodes: &[Arc<Node>]) -> Vec<Arc<Node>> {
        let probes = nodes.iter().cloned().map(|node| {
            let checker = self.clone();
            tokio::spawn(async move { checker.probe(&node).await })
        });

        for result in join_all(probes).await {
            if let Err(e) = result {
                warn!("[health] Probe task failed: {}", e);
            }
        }

        let online: Vec<_> = nodes.iter().filter(|n| n.is_online()).cloned().collect();
        info!("[health] {}/{} nodes online", online.len(), nodes.len());
        online
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(DEFAULT_PROBE_TIMEOUT)
    }
}
