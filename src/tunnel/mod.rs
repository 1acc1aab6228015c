//! Obfuscated tunnel codec
//!
//! Makes a tunnel node look like a plain byte stream: key derivation,
//! cipher selection, protocol framing and obfuscation.
//!
//! ```text
//! send:    data -> protocol -> cipher -> obfs -> socket
//! receive: socket -> obfs -> cipher -> protocol -> data
//! ```

pub mod aead;
pub mod cipher;
pub mod kdf;
pub mod obfs;
pub mod protocol;
pub mod stream;

pub use stream::TunnelStream;

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::common::Address;
use crate::error::{Error, Result};
use crate::node::Node;
use crate::transport::TcpTransport;

use self::cipher::Method;

/// Open a tunnel session through `node` to `target`.
///
/// Socket, cipher or first-packet failures are `TunnelUnavailable`; they say
/// nothing about whether the target itself is reachable.
pub async fn connect(node: &Node, target: &Address, connect_timeout: Duration) -> Result<TunnelStream<TcpStream>> {
    let config = node
        .tunnel()
        .ok_or_else(|| Error::tunnel(node.name(), "node has no tunnel credentials"))?;

    if !Method::parse(&config.method).is_supported() {
        warn!(
            "[tunnel] {} uses unsupported method {}, traffic will NOT be encrypted",
            node.name(),
            config.method
        );
    }

    let address_block = target.to_socks_bytes()?;

    let socket = TcpTransport::with_timeout(connect_timeout)
        .connect_tcp(&node.endpoint())
        .await
        .map_err(|e| Error::tunnel(node.name(), format!("connect {}:{} failed: {}", node.address(), node.port(), e)))?;

    let mut stream =
        TunnelStream::new(socket, config).map_err(|e| Error::tunnel(node.name(), format!("cipher setup failed: {}", e)))?;

    tokio::time::timeout(connect_timeout, stream.handshake(&address_block))
        .await
        .map_err(|_| Error::tunnel(node.name(), "first packet timed out"))?
        .map_err(|e| Error::tunnel(node.name(), format!("first packet failed: {}", e)))?;

    debug!(
        "[tunnel] {} ({}:{}) -> {} established",
        node.name(),
        node.address(),
        node.port(),
        target
    );
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::TunnelConfig;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = TunnelConfig::new("aes-256-cfb", "pw").with_protocol("origin", "");
        let node = Node::new("tun", "127.0.0.1", port, Some(config.clone()));

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut inbound = stream::Inbound::new(&config);
            let mut outbound = stream::Outbound::new(&config).unwrap();

            // 0x03 + len + "example.com" + port 443
            let expected_len = 1 + 1 + 11 + 2;
            let mut received = Vec::new();
            let mut buf = [0u8; 512];
            while received.len() < expected_len + 5 {
                let n = socket.read(&mut buf).await.unwrap();
                assert!(n > 0);
                received.extend(inbound.decode(&buf[..n]).unwrap());
            }
            assert_eq!(received[0], 0x03);
            assert_eq!(&received[2..13], b"example.com");
            assert_eq!(&received[13..15], &443u16.to_be_bytes());
            assert_eq!(&received[15..], b"hello");

            socket.write_all(&outbound.encode(b"world").unwrap()).await.unwrap();
        });

        let target = Address::Domain("example.com".into(), 443);
        let mut stream = connect(&node, &target, Duration::from_secs(5)).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        stream.flush().await.unwrap();

        let mut reply = [0u8; 5];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"world");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_node_is_tunnel_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let node = Node::new("gone", "127.0.0.1", port, Some(TunnelConfig::new("aes-128-cfb", "pw")));
        let target = Address::Domain("example.com".into(), 80);
        let err = connect(&node, &target, Duration::from_secs(2)).await.err().expect("connect should fail");
        assert!(matches!(err, Error::TunnelUnavailable { ref node, .. } if node == "gone"));
    }

    #[tokio::test]
    async fn test_plain_node_has_no_tunnel() {
        let node = Node::new("plain", "127.0.0.1", 1, None);
        let target = Address::Domain("example.com".into(), 80);
        let err = connect(&node, &target, Duration::from_secs(1)).await.err().expect("connect should fail");
        assert!(matches!(err, Error::TunnelUnavailable { .. }));
    }
}
