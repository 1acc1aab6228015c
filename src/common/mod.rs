//! Common types and abstractions
//!
//! - Stream: unified async I/O abstraction for plain sockets and tunnels
//! - Address: network address representation
//! - Pipe: cancellable bidirectional relay

mod address;
pub mod pipe;
mod stream;

pub use address::Address;
pub use stream::{AsyncReadWrite, IntoStream, Stream};

// Re-export error types from crate root
pub use crate::error::{Error, Result};
