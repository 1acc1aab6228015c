//! Accessor surface over the running proxy
//!
//! Everything an operator can ask for: list nodes, read the current node and
//! stats, pick a node, refresh the subscription, run a health check. The
//! control API is a thin JSON layer over this.

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::node::custom::load_custom_nodes;
use crate::node::{HealthChecker, NodeView, Registry, Selector};
use crate::subscription::SubscriptionClient;

use super::metrics::{NODES_ONLINE, NODES_TOTAL, SUBSCRIPTION_REFRESHES};
use super::stats::{Stats, StatsSnapshot};

struct Subscription {
    client: SubscriptionClient,
    url: String,
}

pub struct Controller {
    registry: Arc<Registry>,
    stats: Arc<Stats>,
    subscription: Option<Subscription>,
    default_selector: Selector,
}

impl Controller {
    /// Build the registry from the custom nodes in `config`; no network IO
    pub fn from_config(config: &Config) -> Result<Self> {
        let nodes = load_custom_nodes(config);
        let checker = HealthChecker::new(config.timeouts.probe());
        let registry = Arc::new(Registry::new(nodes, checker, config.prefers_custom_nodes()));

        let subscription = match config.subscription() {
            Some(url) => Some(Subscription {
                client: SubscriptionClient::new(config.timeouts.subscription())?,
                url: url.to_string(),
            }),
            None => None,
        };

        Ok(Self {
            registry,
            stats: Arc::new(Stats::new()),
            subscription,
            default_selector: Selector::parse(&config.default_node),
        })
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    pub fn has_subscription(&self) -> bool {
        self.subscription.is_some()
    }

    /// Initial fetch and selection
    pub async fn bootstrap(&self) {
        if self.has_subscription() {
            if let Err(e) = self.update_subscription().await {
                warn!("[controller] Initial subscription fetch failed: {}", e);
            }
        } else if !self.registry.select(&self.default_selector).await {
            warn!("[controller] No node available at startup");
        }
        self.update_node_gauges();
    }

    pub fn all_nodes(&self) -> Vec<NodeView> {
        self.registry.all_nodes().iter().map(|n| n.view()).collect()
    }

    pub fn current_node(&self) -> Option<NodeView> {
        self.registry.current_node().map(|n| n.view())
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Probe all nodes and apply `"auto"`, an index or a name
    pub async fn select_node(&self, selector: &str) -> bool {
        let selected = self.registry.select(&Selector::parse(selector)).await;
        self.update_node_gauges();
        selected
    }

    /// Fetch the subscription and reselect; returns the number of nodes fetched.
    ///
    /// A failed fetch keeps the node list but still probes and reselects, so
    /// a dead current node is replaced even while the subscription is down.
    pub async fn update_subscription(&self) -> Result<usize> {
        let Some(subscription) = &self.subscription else {
            return Err(Error::Config("no subscription URL configured".into()));
        };

        let result = self
            .registry
            .refresh(subscription.client.fetch(&subscription.url), &self.default_selector)
            .await;

        match &result {
            Ok(count) => {
                SUBSCRIPTION_REFRESHES.inc();
                info!("[controller] Subscription updated, {} nodes", count);
            }
            Err(e) => {
                warn!("[controller] Subscription update failed, keeping current nodes: {}", e);
                if !self.registry.select(&self.default_selector).await {
                    warn!("[controller] No node available after failed update");
                }
            }
        }
        self.update_node_gauges();
        result
    }

    /// Probe every node; returns `(online, total)`
    pub async fn check_all_nodes(&self) -> (usize, usize) {
        let online = self.registry.check_all().await.len();
        let total = self.registry.all_nodes().len();
        self.update_node_gauges();
        (online, total)
    }

    fn update_node_gauges(&self) {
        let nodes = self.registry.all_nodes();
        NODES_TOTAL.set(nodes.len() as i64);
        NODES_ONLINE.set(nodes.iter().filter(|n| n.is_online()).count() as i64);
    }
}
