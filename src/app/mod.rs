//! Application Layer
//!
//! This module contains:
//! - Dispatcher: per-connection flow (sniff -> current node -> relay)
//! - Controller: accessor surface over registry, stats and subscription
//! - Runtime: listener, background refresh and shutdown
//! - Api: JSON control API and Prometheus metrics

pub mod api;
mod controller;
mod dispatcher;
pub mod metrics;
mod runtime;
mod stats;

pub use controller::Controller;
pub use dispatcher::Dispatcher;
pub use runtime::Runtime;
pub use stats::{Stats, StatsSnapshot};
