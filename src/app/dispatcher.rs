//! Dispatcher - per-connection flow
//!
//! ```text
//! ACCEPTED -> PROBING_HTTP -> CONNECT_TUNNEL | RAW_RELAY -> RELAYING -> CLOSED
//! ```
//!
//! The client is sniffed for an HTTP CONNECT request. A CONNECT gets
//! `200 Connection Established` right away, then the current node carries
//! the connection: through the tunnel codec when the node has credentials,
//! or as a chained CONNECT to a plain proxy node. Anything else is relayed
//! raw to the node, consumed bytes first.
//!
//! An upstream failure triggers one failover through the registry before
//! the client is dropped.

use std::sync::Arc;
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::pipe::relay;
use crate::common::{Address, IntoStream, Result, Stream};
use crate::config::TimeoutConfig;
use crate::error::Error;
use crate::node::{Node, Registry};
use crate::protocol::http::{self, HttpConnector, Sniffed, CONNECT_ESTABLISHED};
use crate::transport::{TcpTransport, Transport};
use crate::tunnel;

use super::metrics::{format_bytes, ConnectionMetrics};
use super::stats::Stats;

/// Counts a connection as active for exactly as long as it lives
struct ConnectionGuard<'a> {
    stats: &'a Stats,
}

impl<'a> ConnectionGuard<'a> {
    fn new(stats: &'a Stats) -> Self {
        stats.connection_opened();
        Self { stats }
    }
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        self.stats.connection_closed();
    }
}

pub struct Dispatcher {
    registry: Arc<Registry>,
    stats: Arc<Stats>,
    transport: TcpTransport,
    timeouts: TimeoutConfig,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, stats: Arc<Stats>, timeouts: TimeoutConfig) -> Self {
        Self {
            registry,
            stats,
            transport: TcpTransport::with_timeout(timeouts.connect()),
            timeouts,
        }
    }

    /// Handle one client connection to completion
    pub async fn dispatch(&self, mut client: Stream, source: Address) -> Result<()> {
        let _guard = ConnectionGuard::new(&self.stats);
        let start = Instant::now();

        let (target, pending) = match http::sniff(&mut client, self.timeouts.sniff()).await? {
            Sniffed::Connect { target, leftover } => {
                debug!("[dispatcher] {} CONNECT {}", source, target);
                client.write_all(CONNECT_ESTABLISHED).await?;
                client.flush().await?;
                (Some(target), leftover)
            }
            Sniffed::Raw { consumed } => {
                debug!("[dispatcher] {} not CONNECT, raw relay ({} bytes consumed)", source, consumed.len());
                (None, consumed)
            }
        };

        let (node, mut upstream) = match self.open_upstream(target.as_ref()).await {
            Ok(opened) => opened,
            Err(e) => {
                self.stats.connection_failed();
                return Err(e);
            }
        };

        let destination = target.as_ref().map_or_else(|| "raw".to_string(), |t| t.to_string());
        info!("[dispatcher] {} -> {} via [{}]", source, destination, node.name());

        if !pending.is_empty() {
            upstream.write_all(&pending).await?;
            upstream.flush().await?;
            self.stats.add_traffic(pending.len() as u64);
        }

        let mode = match (&target, node.tunnel()) {
            (None, _) => "raw",
            (Some(_), Some(_)) => "tunnel",
            (Some(_), None) => "connect",
        };
        let conn_metrics = ConnectionMetrics::new(mode);

        let stats = self.stats.clone();
        let on_traffic = move |n: u64| stats.add_traffic(n);
        let (up, down) = relay(
            client,
            upstream,
            CancellationToken::new(),
            self.timeouts.idle(),
            &on_traffic,
        )
        .await;

        conn_metrics.record_completion();
        info!(
            "[dispatcher] Closed: {} -> {} via [{}] (↑{} ↓{} {:?})",
            source,
            destination,
            node.name(),
            format_bytes(up + pending.len() as u64),
            format_bytes(down),
            start.elapsed()
        );
        Ok(())
    }

    /// Open the upstream through the current node, failing over once
    async fn open_upstream(&self, target: Option<&Address>) -> Result<(Arc<Node>, Stream)> {
        let node = self.registry.current_node().ok_or(Error::NoNodeAvailable)?;

        let first_error = match self.connect_via(&node, target).await {
            Ok(stream) => return Ok((node, stream)),
            Err(e) => e,
        };
        warn!("[dispatcher] Upstream via {} failed: {}", node, first_error);
        if !first_error.is_upstream_failure() {
            return Err(first_error);
        }

        let Some(next) = self.registry.failover(&node).await else {
            return Err(first_error);
        };
        if !Arc::ptr_eq(&next, &node) {
            self.stats.record_failover();
        }

        match self.connect_via(&next, target).await {
            Ok(stream) => Ok((next, stream)),
            Err(e) => {
                warn!("[dispatcher] Upstream via {} failed after failover: {}", next, e);
                Err(e)
            }
        }
    }

    async fn connect_via(&self, node: &Node, target: Option<&Address>) -> Result<Stream> {
        match (node.tunnel(), target) {
            (Some(_), Some(target)) => {
                let stream = tunnel::connect(node, target, self.timeouts.connect()).await?;
                Ok(stream.into_stream())
            }
            (Some(_), None) => Err(Error::Unsupported(format!(
                "raw relay through tunnel node {} has no target",
                node.name()
            ))),
            (None, target) => {
                let mut stream = self.transport.connect(&node.endpoint()).await?;
                if let Some(target) = target {
                    tokio::time::timeout(self.timeouts.connect(), HttpConnector::handshake(&mut stream, target))
                        .await??;
                }
                Ok(stream)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{HealthChecker, TunnelConfig};
    use crate::tunnel::stream::{Inbound, Outbound};
    use tokio::io::{AsyncReadExt, DuplexStream};
    use tokio::net::{TcpListener, TcpStream};

    fn source() -> Address {
        Address::parse("127.0.0.1:50000").unwrap()
    }

    fn dispatcher(nodes: Vec<Node>) -> (Dispatcher, Arc<Registry>, Arc<Stats>) {
        let registry = Arc::new(Registry::new(nodes, HealthChecker::default(), false));
        let stats = Arc::new(Stats::new());
        let dispatcher = Dispatcher::new(registry.clone(), stats.clone(), TimeoutConfig::default());
        (dispatcher, registry, stats)
    }

    /// Serve every accepted connection with `handler`; health probes connect too
    async fn spawn_node<F, Fut>(handler: F) -> u16
    where
        F: Fn(TcpStream) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(handler(socket));
            }
        });
        port
    }

    /// Plain node that answers a chained CONNECT, then echoes
    async fn connect_proxy_node() -> u16 {
        spawn_node(|mut socket| async move {
            let mut head = Vec::new();
            while !head.ends_with(b"\r\n\r\n") {
                match socket.read_u8().await {
                    Ok(b) => head.push(b),
                    Err(_) => return,
                }
            }
            if !head.starts_with(b"CONNECT example.com:443 HTTP/1.1\r\n") {
                return;
            }
            if socket.write_all(b"HTTP/1.1 200 OK\r\n\r\n").await.is_ok() {
                echo(socket).await;
            }
        })
        .await
    }

    /// Plain node that echoes whatever arrives
    async fn echo_node() -> u16 {
        spawn_node(echo).await
    }

    async fn echo(mut socket: TcpStream) {
        let mut buf = [0u8; 1024];
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    async fn dead_port() -> u16 {
        TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap().port()
    }

    async fn read_exactly(client: &mut DuplexStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        client.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_connect_through_plain_node() {
        let port = connect_proxy_node().await;
        let (dispatcher, registry, stats) = dispatcher(vec![Node::new("plain", "127.0.0.1", port, None)]);
        assert!(registry.select(&crate::node::Selector::Auto).await);

        let (mut client, inbound) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move { dispatcher.dispatch(Box::new(inbound), source()).await });

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\nhello")
            .await
            .unwrap();
        assert_eq!(read_exactly(&mut client, CONNECT_ESTABLISHED.len()).await, CONNECT_ESTABLISHED);
        assert_eq!(read_exactly(&mut client, 5).await, b"hello");

        drop(client);
        task.await.unwrap().unwrap();

        let snap = stats.snapshot();
        assert_eq!(snap.total_connections, 1);
        assert_eq!(snap.active_connections, 0);
        assert_eq!(snap.total_bytes, 10);
    }

    #[tokio::test]
    async fn test_raw_fallback_forwards_consumed_bytes() {
        let port = echo_node().await;
        let (dispatcher, registry, _stats) = dispatcher(vec![Node::new("plain", "127.0.0.1", port, None)]);
        assert!(registry.select(&crate::node::Selector::Auto).await);

        let (mut client, inbound) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move { dispatcher.dispatch(Box::new(inbound), source()).await });

        client.write_all(b"\x05\x01\x00").await.unwrap();
        assert_eq!(read_exactly(&mut client, 3).await, b"\x05\x01\x00");
        client.write_all(b"more").await.unwrap();
        assert_eq!(read_exactly(&mut client, 4).await, b"more");

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connect_through_tunnel_node() {
        let config = TunnelConfig::new("chacha20-ietf", "secret");
        let server_config = config.clone();

        let port = spawn_node(move |mut socket| {
            let config = server_config.clone();
            async move {
                let mut inbound = Inbound::new(&config);
                let mut outbound = Outbound::new(&config).unwrap();
                // 0x03 + len + "example.com" + port
                let header_len = 1 + 1 + 11 + 2;
                let mut received = Vec::new();
                let mut buf = [0u8; 1024];
                while received.len() < header_len + 4 {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => received.extend(inbound.decode(&buf[..n]).unwrap()),
                    }
                }
                assert_eq!(&received[2..13], b"example.com");
                let reply = outbound.encode(&received[header_len..]).unwrap();
                socket.write_all(&reply).await.unwrap();
                let _ = socket.read(&mut buf).await;
            }
        })
        .await;

        let (dispatcher, registry, _stats) = dispatcher(vec![Node::new("tun", "127.0.0.1", port, Some(config))]);
        assert!(registry.select(&crate::node::Selector::Auto).await);

        let (mut client, inbound) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move { dispatcher.dispatch(Box::new(inbound), source()).await });

        client.write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n").await.unwrap();
        assert_eq!(read_exactly(&mut client, CONNECT_ESTABLISHED.len()).await, CONNECT_ESTABLISHED);
        client.write_all(b"ping").await.unwrap();
        assert_eq!(read_exactly(&mut client, 4).await, b"ping");

        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failover_to_second_node() {
        let good = echo_node().await;
        let (dispatcher, registry, stats) = dispatcher(vec![
            Node::new("broken", "127.0.0.1", dead_port().await, None),
            Node::new("good", "127.0.0.1", good, None),
        ]);

        // Stale health: the broken node still looks fastest
        let nodes = registry.all_nodes();
        nodes[0].mark_online(1);
        nodes[1].mark_online(50);
        assert!(registry.pick(&crate::node::Selector::Auto));
        assert_eq!(registry.current_node().unwrap().name(), "broken");

        let (mut client, inbound) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move { dispatcher.dispatch(Box::new(inbound), source()).await });

        client.write_all(b"\x16\x03\x01").await.unwrap();
        assert_eq!(read_exactly(&mut client, 3).await, b"\x16\x03\x01");

        drop(client);
        task.await.unwrap().unwrap();

        assert_eq!(registry.current_node().unwrap().name(), "good");
        let snap = stats.snapshot();
        assert_eq!(snap.failovers, 1);
        assert_eq!(snap.failed_connections, 0);
        assert_eq!(snap.active_connections, 0);
    }

    #[tokio::test]
    async fn test_raw_through_tunnel_node_is_unsupported() {
        let port = echo_node().await;
        let (dispatcher, registry, stats) = dispatcher(vec![Node::new(
            "tun",
            "127.0.0.1",
            port,
            Some(TunnelConfig::new("aes-256-cfb", "pw")),
        )]);
        assert!(registry.select(&crate::node::Selector::Auto).await);

        let (mut client, inbound) = tokio::io::duplex(4096);
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let err = dispatcher.dispatch(Box::new(inbound), source()).await.unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));

        let snap = stats.snapshot();
        assert_eq!(snap.failed_connections, 1);
        assert_eq!(snap.active_connections, 0);
    }

    #[tokio::test]
    async fn test_raw_client_keeps_custom_tunnel_node() {
        let home = echo_node().await;
        let other = echo_node().await;
        let registry = Arc::new(Registry::new(
            vec![
                Node::new("custom-node-home", "127.0.0.1", home, Some(TunnelConfig::new("aes-256-cfb", "pw"))),
                Node::new("other", "127.0.0.1", other, None),
            ],
            HealthChecker::default(),
            true,
        ));
        let stats = Arc::new(Stats::new());
        let dispatcher = Dispatcher::new(registry.clone(), stats.clone(), TimeoutConfig::default());
        assert!(registry.select(&crate::node::Selector::Auto).await);
        assert_eq!(registry.current_node().unwrap().name(), "custom-node-home");

        let (mut client, inbound) = tokio::io::duplex(4096);
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let err = dispatcher.dispatch(Box::new(inbound), source()).await.unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));

        assert_eq!(registry.current_node().unwrap().name(), "custom-node-home");
        assert_eq!(stats.snapshot().failovers, 0);
    }

    #[tokio::test]
    async fn test_no_current_node() {
        let (dispatcher, _registry, stats) = dispatcher(Vec::new());
        let (mut client, inbound) = tokio::io::duplex(4096);
        client.write_all(b"CONNECT a.example:443 HTTP/1.1\r\n\r\n").await.unwrap();

        let err = dispatcher.dispatch(Box::new(inbound), source()).await.unwrap_err();
        assert!(matches!(err, Error::NoNodeAvailable));
        assert_eq!(stats.snapshot().active_connections, 0);
        assert_eq!(stats.snapshot().total_connections, 1);
    }
}
