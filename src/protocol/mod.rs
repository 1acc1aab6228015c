//! Proxy protocol layer
//!
//! Only HTTP CONNECT is spoken: sniffed on the inbound side, re-issued to
//! chained plain proxy nodes on the outbound side.

pub mod http;

pub use http::{HttpConnector, Sniffed};
