//! HTTP CONNECT front end and chained CONNECT client

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;

use crate::common::{Address, Result};
use crate::error::Error;

/// Largest request header accepted while sniffing
pub const MAX_HEADER_LEN: usize = 8 * 1024;

pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

const HEADER_END: &[u8] = b"\r\n\r\n";
const CONNECT_PREFIX: &[u8] = b"CONNECT ";

/// Outcome of inspecting the first bytes from a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// A complete CONNECT header of `header_len` bytes
    Connect { target: Address, header_len: usize },
    /// Could still become a CONNECT request
    Incomplete,
    /// Not a CONNECT request
    Other,
}

/// Classify buffered client bytes
pub fn parse_connect(buf: &[u8]) -> Request {
    let prefix_len = buf.len().min(CONNECT_PREFIX.len());
    if !buf[..prefix_len].eq_ignore_ascii_case(&CONNECT_PREFIX[..prefix_len]) {
        return Request::Other;
    }

    let Some(end) = find(buf, HEADER_END) else {
        return Request::Incomplete;
    };

    let Ok(head) = std::str::from_utf8(&buf[..end]) else {
        return Request::Other;
    };
    let request_line = head.lines().next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (Some(_method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next()) else {
        return Request::Other;
    };
    if !version.starts_with("HTTP/") {
        return Request::Other;
    }

    match parse_host_port(target) {
        Ok(target) => Request::Connect {
            target,
            header_len: end + HEADER_END.len(),
        },
        Err(_) => Request::Other,
    }
}

/// What the client turned out to send
#[derive(Debug)]
pub enum Sniffed {
    /// CONNECT request; `leftover` followed the header in the same reads
    Connect { target: Address, leftover: Vec<u8> },
    /// Anything else; `consumed` must be forwarded before the rest of the stream
    Raw { consumed: Vec<u8> },
}

/// Read from `stream` until the bytes are known to be a CONNECT request or
/// not, `MAX_HEADER_LEN` is reached, or `timeout` runs out.
///
/// A timeout is not an error; whatever was read is handed back as raw.
pub async fn sniff<S>(stream: &mut S, timeout: Duration) -> Result<Sniffed>
where
    S: AsyncRead + Unpin,
{
    let deadline = Instant::now() + timeout;
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        match parse_connect(&buf) {
            Request::Connect { target, header_len } => {
                let leftover = buf.split_off(header_len);
                return Ok(Sniffed::Connect { target, leftover });
            }
            Request::Other => return Ok(Sniffed::Raw { consumed: buf }),
            Request::Incomplete if buf.len() >= MAX_HEADER_LEN => {
                return Ok(Sniffed::Raw { consumed: buf });
            }
            Request::Incomplete => {}
        }

        let want = chunk.len().min(MAX_HEADER_LEN - buf.len());
        let n = match tokio::time::timeout_at(deadline, stream.read(&mut chunk[..want])).await {
            Ok(read) => read?,
            Err(_) => return Ok(Sniffed::Raw { consumed: buf }),
        };
        if n == 0 {
            return Ok(Sniffed::Raw { consumed: buf });
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Re-issues CONNECT to a chained plain HTTP proxy node
pub struct HttpConnector;

impl HttpConnector {
    /// Send `CONNECT target` and wait for the status line and headers.
    ///
    /// Headers are read byte by byte so nothing past them is consumed.
    pub async fn handshake<S>(stream: &mut S, target: &Address) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let target = target.to_string();
        let request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n\r\n", target, target);
        stream.write_all(request.as_bytes()).await?;
        stream.flush().await?;

        let mut head = Vec::with_capacity(128);
        while !head.ends_with(HEADER_END) {
            if head.len() >= MAX_HEADER_LEN {
                return Err(Error::Protocol("CONNECT response header too large".into()));
            }
            let byte = stream.read_u8().await.map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => Error::Protocol("node closed during CONNECT".into()),
                _ => Error::Io(e),
            })?;
            head.push(byte);
        }

        let head = String::from_utf8_lossy(&head);
        let status_line = head.lines().next().unwrap_or_default();
        let status = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| Error::Protocol(format!("Invalid HTTP response: {}", status_line)))?;

        if status != 200 {
            return Err(Error::TargetUnreachable(format!("{} ({})", target, status_line.trim())));
        }
        Ok(())
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Parse `host:port`; a missing port means 443
fn parse_host_port(s: &str) -> Result<Address> {
    if let Ok(addr) = s.parse() {
        return Ok(Address::Socket(addr));
    }

    let (host, port) = match s.rsplit_once(':') {
        Some((h, p)) if !h.ends_with(':') => {
            let port: u16 = p
                .parse()
                .map_err(|_| Error::InvalidAddress(format!("Invalid port: {}", p)))?;
            (h, port)
        }
        _ => (s, 443),
    };

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(Error::InvalidAddress(s.to_string()));
    }
    Ok(Address::new(host, port))
}
