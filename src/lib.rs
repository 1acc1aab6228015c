//! nodemux - local forward proxy over interchangeable upstream nodes
//!
//! # Architecture
//!
//! ```text
//! client -> HTTP CONNECT sniff -> current node -> tunnel codec | plain TCP -> relay
//!                                      ^
//!          subscription -> registry -> health check -> selector
//! ```
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Stream, Address, relay pipe
//! ├── transport/       # Raw TCP connect and listen
//! ├── protocol/        # HTTP CONNECT sniffing and chaining
//! ├── tunnel/          # Obfuscated tunnel codec
//! ├── node/            # Node model, registry, health checks, selection
//! ├── subscription/    # Subscription fetch and link decoders
//! └── app/             # Dispatcher, Controller, Runtime, control API
//! ```

// Core types
pub mod common;
pub mod error;

// Layers
pub mod transport;
pub mod protocol;
pub mod tunnel;

// Nodes
pub mod node;
pub mod subscription;

pub mod app;
pub mod config;

// Re-exports for convenience
pub use common::{Address, Stream};
pub use error::{Error, Result};
pub use config::Config;

pub use app::{Controller, Dispatcher, Runtime};
pub use node::{Node, Registry, Selector};
pub use transport::Transport;
