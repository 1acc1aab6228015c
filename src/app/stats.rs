//! Connection and traffic counters
//!
//! Exact values live behind one short-held lock; every update is mirrored
//! into the process-wide Prometheus metrics.

use parking_lot::Mutex;
use serde::Serialize;

use super::metrics::{
    CONNECTIONS_ACTIVE, CONNECTIONS_FAILED, CONNECTIONS_TOTAL, FAILOVERS_TOTAL, TRAFFIC_BYTES,
};

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_bytes: u64,
    pub failed_connections: u64,
    pub failovers: u64,
}

#[derive(Default)]
pub struct Stats {
    inner: Mutex<StatsSnapshot>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&self) {
        let mut s = self.inner.lock();
        s.total_connections += 1;
        s.active_connections += 1;
        CONNECTIONS_TOTAL.inc();
        CONNECTIONS_ACTIVE.inc();
    }

    pub fn connection_closed(&self) {
        let mut s = self.inner.lock();
        if s.active_connections > 0 {
            s.active_connections -= 1;
            CONNECTIONS_ACTIVE.dec();
        }
    }

    pub fn connection_failed(&self) {
        self.inner.lock().failed_connections += 1;
        CONNECTIONS_FAILED.inc();
    }

    pub fn add_traffic(&self, bytes: u64) {
        if bytes == 0 {
            return;
        }
        self.inner.lock().total_bytes += bytes;
        TRAFFIC_BYTES.inc_by(bytes);
    }

    pub fn record_failover(&self) {
        self.inner.lock().failovers += 1;
        FAILOVERS_TOTAL.inc();
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        *self.inner.lock()
    }
}
