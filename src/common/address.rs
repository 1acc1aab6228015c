//! Address type for network connections

use std::net::{IpAddr, SocketAddr};

use crate::error::{Error, Result};

/// SOCKS5 address type tags, also used by the tunnel request header
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Network address representation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IP socket address (IP + port)
    Socket(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl Address {
    /// Create from host and port, keeping IP literals as socket addresses
    pub fn new(host: &str, port: u16) -> Self {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        match host.parse::<IpAddr>() {
            Ok(ip) => Address::Socket(SocketAddr::new(ip, port)),
            Err(_) => Address::Domain(host.to_string(), port),
        }
    }

    /// Parse a `host:port` string (IPv6 hosts must be bracketed)
    pub fn parse(s: &str) -> Result<Self> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Address::Socket(addr));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::InvalidAddress(format!("missing port: {}", s)))?;
        let port: u16 = port
            .parse()
            .map_err(|_| Error::InvalidAddress(format!("invalid port: {}", s)))?;
        if host.is_empty() {
            return Err(Error::InvalidAddress(format!("missing host: {}", s)));
        }

        Ok(Address::new(host, port))
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Encode as a SOCKS5-style address block: type, address, big-endian port
    pub fn to_socks_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(32);
        match self {
            Address::Socket(SocketAddr::V4(addr)) => {
                out.push(ATYP_IPV4);
                out.extend_from_slice(&addr.ip().octets());
            }
            Address::Socket(SocketAddr::V6(addr)) => {
                out.push(ATYP_IPV6);
                out.extend_from_slice(&addr.ip().octets());
            }
            Address::Domain(domain, _) => {
                let len = u8::try_from(domain.len())
                    .map_err(|_| Error::InvalidAddress(format!("domain too long: {}", domain)))?;
                out.push(ATYP_DOMAIN);
                out.push(len);
                out.extend_from_slice(domain.as_bytes());
            }
        }
        out.extend_from_slice(&self.port().to_be_bytes());
        Ok(out)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}
