//! Tunnel session over a byte stream
//!
//! Send: protocol -> cipher -> obfs, with the IV (or salt) in front of the
//! first packet. Receive mirrors it: obfs -> server IV -> decrypt ->
//! protocol.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};

use crate::error::{Error, Result};
use crate::node::TunnelConfig;

use super::aead::{AeadCipher, ChunkDecoder, ChunkEncoder};
use super::cipher::{key_len, Direction, Keystream, Method};
use super::kdf::{evp_bytes_to_key, session_subkey};
use super::obfs::{ObfsDecoder, ObfsEncoder, ObfsKind};
use super::protocol::ProtocolLayer;

const READ_CHUNK: usize = 16 * 1024;

enum Sealer {
    Stream(Keystream),
    Aead(ChunkEncoder),
}

enum Opener {
    Stream(Keystream),
    Aead(ChunkDecoder),
}

fn sealer(method: Method, key: &[u8], iv: &[u8]) -> Result<Sealer> {
    match method {
        Method::Aead(kind) => {
            let subkey = session_subkey(key, iv)?;
            Ok(Sealer::Aead(ChunkEncoder::new(AeadCipher::new(kind, &subkey)?)))
        }
        _ => Ok(Sealer::Stream(Keystream::new(method, key, iv, Direction::Encrypt)?)),
    }
}

fn opener(method: Method, key: &[u8], iv: &[u8]) -> Result<Opener> {
    match method {
        Method::Aead(kind) => {
            let subkey = session_subkey(key, iv)?;
            Ok(Opener::Aead(ChunkDecoder::new(AeadCipher::new(kind, &subkey)?)))
        }
        _ => Ok(Opener::Stream(Keystream::new(method, key, iv, Direction::Decrypt)?)),
    }
}

/// Outgoing half of the layering
pub struct Outbound {
    protocol: ProtocolLayer,
    sealer: Sealer,
    obfs: ObfsEncoder,
    iv: Option<Vec<u8>>,
}

impl Outbound {
    pub fn new(config: &TunnelConfig) -> Result<Self> {
        let method = Method::parse(&config.method);
        let key = evp_bytes_to_key(config.password.as_bytes(), key_len(&config.method));

        let mut iv = vec![0u8; method.iv_len()];
        rand::thread_rng().fill_bytes(&mut iv);

        Ok(Self {
            protocol: ProtocolLayer::new(&config.protocol, &key, &config.protocol_param),
            sealer: sealer(method, &key, &iv)?,
            obfs: ObfsEncoder::new(ObfsKind::parse(&config.obfs)),
            iv: Some(iv),
        })
    }

    pub fn encode(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut payload = self.protocol.encode(data)?;
        let sealed = match &mut self.sealer {
            Sealer::Stream(keystream) => {
                keystream.apply(&mut payload);
                payload
            }
            Sealer::Aead(encoder) => encoder.encode(&payload)?,
        };

        let packet = match self.iv.take() {
            Some(mut iv) => {
                iv.extend_from_slice(&sealed);
                iv
            }
            None => sealed,
        };
        self.obfs.encode(packet)
    }
}

/// Incoming half of the layering
pub struct Inbound {
    method: Method,
    key: Vec<u8>,
    obfs: ObfsDecoder,
    protocol: ProtocolLayer,
    iv: Vec<u8>,
    opener: Option<Opener>,
}

impl Inbound {
    pub fn new(config: &TunnelConfig) -> Self {
        let method = Method::parse(&config.method);
        let key = evp_bytes_to_key(config.password.as_bytes(), key_len(&config.method));
        Self {
            protocol: ProtocolLayer::new(&config.protocol, &key, &config.protocol_param),
            obfs: ObfsDecoder::new(ObfsKind::parse(&config.obfs)),
            method,
            key,
            iv: Vec::new(),
            opener: None,
        }
    }

    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let data = self.obfs.decode(data)?;
        let mut data = data.as_slice();

        if self.opener.is_none() {
            let wanted = self.method.iv_len() - self.iv.len();
            let take = wanted.min(data.len());
            self.iv.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.iv.len() < self.method.iv_len() {
                return Ok(Vec::new());
            }
            self.opener = Some(opener(self.method, &self.key, &self.iv)?);
        }

        let plain = match &mut self.opener {
            Some(Opener::Stream(keystream)) => {
                let mut buf = data.to_vec();
                keystream.apply(&mut buf);
                buf
            }
            Some(Opener::Aead(decoder)) => decoder.decode(data)?,
            None => Vec::new(),
        };
        Ok(self.protocol.decode(plain))
    }
}

/// Tunnel session as an ordinary async byte stream
pub struct TunnelStream<S> {
    inner: S,
    outbound: Outbound,
    inbound: Inbound,
    read_buf: Vec<u8>,
    read_pos: usize,
    scratch: Box<[u8]>,
    write_buf: Vec<u8>,
    write_pos: usize,
}

fn io_error(e: Error) -> io::Error {
    match e {
        Error::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other.to_string()),
    }
}

impl<S> TunnelStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(inner: S, config: &TunnelConfig) -> Result<Self> {
        Ok(Self {
            inner,
            outbound: Outbound::new(config)?,
            inbound: Inbound::new(config),
            read_buf: Vec::new(),
            read_pos: 0,
            scratch: vec![0u8; READ_CHUNK].into_boxed_slice(),
            write_buf: Vec::new(),
            write_pos: 0,
        })
    }

    /// Send the first packet carrying the target address block
    pub async fn handshake(&mut self, address_block: &[u8]) -> Result<()> {
        let packet = self.outbound.encode(address_block)?;
        self.inner.write_all(&packet).await?;
        self.inner.flush().await?;
        Ok(())
    }

    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.write_pos < self.write_buf.len() {
            let n = ready!(Pin::new(&mut self.inner).poll_write(cx, &self.write_buf[self.write_pos..]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.write_pos += n;
        }
        self.write_buf.clear();
        self.write_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S> AsyncRead for TunnelStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.read_pos < this.read_buf.len() {
                let n = buf.remaining().min(this.read_buf.len() - this.read_pos);
                buf.put_slice(&this.read_buf[this.read_pos..this.read_pos + n]);
                this.read_pos += n;
                return Poll::Ready(Ok(()));
            }

            let mut raw = ReadBuf::new(&mut this.scratch);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut raw))?;
            if raw.filled().is_empty() {
                return Poll::Ready(Ok(()));
            }

            this.read_buf = this.inbound.decode(raw.filled()).map_err(io_error)?;
            this.read_pos = 0;
        }
    }
}

impl<S> AsyncWrite for TunnelStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        this.write_buf = this.outbound.encode(buf).map_err(io_error)?;
        this.write_pos = 0;
        // The bytes are accepted; anything not written yet goes out on the next flush
        if let Poll::Ready(Err(e)) = this.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn config(method: &str) -> TunnelConfig {
        TunnelConfig::new(method, "correct horse")
    }

    #[test]
    fn test_outbound_inbound_mirror() {
        for method in ["aes-256-cfb", "aes-128-ctr", "chacha20", "chacha20-ietf", "aes-256-gcm", "rc4-md5"] {
            let config = config(method);
            let mut client = Outbound::new(&config).unwrap();
            let mut server = Inbound::new(&config);

            let first = client.encode(b"\x03\x0bexample.com\x01\xbb").unwrap();
            assert!(first.len() >= Method::parse(method).iv_len());

            let mut plain = Vec::new();
            // IV arrives split across reads
            plain.extend(server.decode(&first[..3]).unwrap());
            plain.extend(server.decode(&first[3..]).unwrap());
            plain.extend(server.decode(&client.encode(b"GET /").unwrap()).unwrap());
            assert_eq!(plain, b"\x03\x0bexample.com\x01\xbbGET /", "{}", method);
        }
    }

    #[test]
    fn test_first_packet_layering() {
        let config = config("aes-128-cfb")
            .with_protocol("auth_aes128_md5", "")
            .with_obfs("tls1.2_ticket_auth", "cdn.example");
        let mut client = Outbound::new(&config).unwrap();
        let first = client.encode(&[0x01, 127, 0, 0, 1, 0, 80]).unwrap();

        // TLS hello wraps IV + encrypted (header + address + tag)
        let inner_len = 16 + 12 + 7 + 4;
        assert_eq!(first[0], 0x16);
        assert_eq!(u16::from_be_bytes([first[3], first[4]]) as usize, inner_len + 32);
        assert_eq!(first.len(), 5 + 32 + inner_len);

        // Later packets: cipher only
        assert_eq!(client.encode(b"abc").unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_stream_round_trip() {
        let config = config("chacha20-ietf");
        let (client_io, mut server_io) = tokio::io::duplex(64 * 1024);
        let mut tunnel = TunnelStream::new(client_io, &config).unwrap();

        let server_config = config.clone();
        let server = tokio::spawn(async move {
            let mut inbound = Inbound::new(&server_config);
            let mut outbound = Outbound::new(&server_config).unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            while received.len() < 7 + 4 {
                let n = server_io.read(&mut buf).await.unwrap();
                received.extend(inbound.decode(&buf[..n]).unwrap());
            }
            assert_eq!(&received[..7], &[0x01, 10, 0, 0, 1, 0x1f, 0x90]);
            assert_eq!(&received[7..], b"ping");

            let reply = outbound.encode(b"pong").unwrap();
            server_io.write_all(&reply).await.unwrap();
        });

        tunnel.handshake(&[0x01, 10, 0, 0, 1, 0x1f, 0x90]).await.unwrap();
        tunnel.write_all(b"ping").await.unwrap();
        tunnel.flush().await.unwrap();

        let mut reply = [0u8; 4];
        tunnel.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");
        server.await.unwrap();
    }
}
