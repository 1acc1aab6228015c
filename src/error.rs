//! Error types for nodemux

use thiserror::Error;

/// Main error type for nodemux
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Subscription error: {0}")]
    Subscription(String),

    /// Upstream subscription service answered 429; the caller keeps its node list.
    #[error("Subscription rate limited")]
    RateLimited,

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("No node available")]
    NoNodeAvailable,

    /// The node's tunnel could not be established (socket or cipher setup).
    #[error("Tunnel unavailable via [{node}]: {reason}")]
    TunnelUnavailable { node: String, reason: String },

    /// The node is reachable but refused to reach the requested target.
    #[error("Target unreachable: {0}")]
    TargetUnreachable(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Timeout")]
    Timeout,

    #[error("Unsupported feature: {0}")]
    Unsupported(String),
}

impl Error {
    /// True when the node or the path to it failed, as opposed to a local
    /// limitation such as `Unsupported`
    pub fn is_upstream_failure(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Timeout
                | Error::Protocol(_)
                | Error::TunnelUnavailable { .. }
                | Error::TargetUnreachable(_)
        )
    }

    pub(crate) fn tunnel(node: &str, reason: impl std::fmt::Display) -> Self {
        Error::TunnelUnavailable {
            node: node.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}

/// Result type alias for nodemux
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_failure_classification() {
        assert!(Error::tunnel("a", "refused").is_upstream_failure());
        assert!(Error::TargetUnreachable("x:443".into()).is_upstream_failure());
        assert!(Error::Timeout.is_upstream_failure());
        assert!(Error::Io(std::io::ErrorKind::ConnectionRefused.into()).is_upstream_failure());

        assert!(!Error::Unsupported("raw".into()).is_upstream_failure());
        assert!(!Error::NoNodeAvailable.is_upstream_failure());
        assert!(!Error::Config("bad".into()).is_upstream_failure());
    }
}
