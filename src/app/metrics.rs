//! Prometheus-based metrics module
//!
//! Process-wide mirrors of the stats counters plus node health gauges.
//! Exposed via the /metrics endpoint of the control API.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntGauge, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // === Connection Metrics ===

    pub static ref CONNECTIONS_TOTAL: IntCounter = IntCounter::new(
        "nodemux_connections_total",
        "Total number of client connections accepted"
    ).expect("valid metric");

    pub static ref CONNECTIONS_ACTIVE: IntGauge = IntGauge::new(
        "nodemux_connections_active",
        "Number of currently active client connections"
    ).expect("valid metric");

    pub static ref CONNECTIONS_FAILED: IntCounter = IntCounter::new(
        "nodemux_connections_failed_total",
        "Connections closed because no upstream could be opened"
    ).expect("valid metric");

    pub static ref FAILOVERS_TOTAL: IntCounter = IntCounter::new(
        "nodemux_failovers_total",
        "Times the dispatcher moved to another node after an upstream failure"
    ).expect("valid metric");

    // === Traffic Metrics ===

    pub static ref TRAFFIC_BYTES: IntCounter = IntCounter::new(
        "nodemux_traffic_bytes_total",
        "Total bytes relayed in both directions"
    ).expect("valid metric");

    // === Node Metrics ===

    pub static ref NODES_TOTAL: IntGauge = IntGauge::new(
        "nodemux_nodes_total",
        "Number of known nodes"
    ).expect("valid metric");

    pub static ref NODES_ONLINE: IntGauge = IntGauge::new(
        "nodemux_nodes_online",
        "Number of nodes online after the last health check"
    ).expect("valid metric");

    pub static ref SUBSCRIPTION_REFRESHES: IntCounter = IntCounter::new(
        "nodemux_subscription_refreshes_total",
        "Successful subscription refreshes"
    ).expect("valid metric");

    // === Connection Duration ===

    pub static ref CONNECTION_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "nodemux_connection_duration_seconds",
            "Connection duration in seconds"
        ).buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 600.0, 1800.0, 3600.0]),
        &["mode"]
    ).expect("valid metric");
}

/// Register all metrics with the global registry; repeated calls are harmless
pub fn init_metrics() {
    REGISTRY.register(Box::new(CONNECTIONS_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(CONNECTIONS_ACTIVE.clone())).ok();
    REGISTRY.register(Box::new(CONNECTIONS_FAILED.clone())).ok();
    REGISTRY.register(Box::new(FAILOVERS_TOTAL.clone())).ok();

    REGISTRY.register(Box::new(TRAFFIC_BYTES.clone())).ok();

    REGISTRY.register(Box::new(NODES_TOTAL.clone())).ok();
    REGISTRY.register(Box::new(NODES_ONLINE.clone())).ok();
    REGISTRY.register(Box::new(SUBSCRIPTION_REFRESHES.clone())).ok();

    REGISTRY.register(Box::new(CONNECTION_DURATION_SECONDS.clone())).ok();
}

/// Helper struct for tracking a single connection's duration
pub struct ConnectionMetrics {
    mode: &'static str,
    start_time: std::time::Instant,
}

impl ConnectionMetrics {
    pub fn new(mode: &'static str) -> Self {
        Self {
            mode,
            start_time: std::time::Instant::now(),
        }
    }

    /// Record connection completion with duration
    pub fn record_completion(&self) {
        let duration = self.start_time.elapsed().as_secs_f64();
        CONNECTION_DURATION_SECONDS
            .with_label_values(&[self.mode])
            .observe(duration);
    }
}

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * 1024 * 1024;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}
