//! Protocol layer, applied before encryption
//!
//! `auth_aes128_md5` prefixes the first packet with
//! `[utc u32 LE][client id u32 LE][connection id u32 LE]` and appends the
//! first 4 bytes of `HMAC-MD5(md5(key || protocol_param), header || payload)`.
//! Later packets and the receive path pass through.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use md5::Md5;
use rand::Rng;
use tracing::warn;

use crate::error::{Error, Result};

use super::kdf::md5;

pub const AUTH_HEADER_LEN: usize = 12;
pub const AUTH_TAG_LEN: usize = 4;

type HmacMd5 = Hmac<Md5>;

#[derive(Debug)]
pub enum ProtocolLayer {
    Origin,
    AuthAes128Md5 { mac_key: [u8; 16], sent_header: bool },
    Passthrough,
}

impl ProtocolLayer {
    pub fn new(name: &str, key: &[u8], param: &str) -> Self {
        match name {
            "" | "origin" => ProtocolLayer::Origin,
            "auth_aes128_md5" => {
                let mut material = key.to_vec();
                material.extend_from_slice(param.as_bytes());
                ProtocolLayer::AuthAes128Md5 {
                    mac_key: md5(&material),
                    sent_header: false,
                }
            }
            other => {
                warn!("[tunnel] Unsupported protocol {}, sending data unframed", other);
                ProtocolLayer::Passthrough
            }
        }
    }

    pub fn encode(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            ProtocolLayer::AuthAes128Md5 { mac_key, sent_header } if !*sent_header => {
                *sent_header = true;
                let mut rng = rand::thread_rng();
                auth_packet(mac_key, unix_time(), rng.gen(), rng.gen(), data)
            }
            _ => Ok(data.to_vec()),
        }
    }

    pub fn decode(&mut self, data: Vec<u8>) -> Vec<u8> {
        data
    }
}

fn unix_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default()
}

pub(crate) fn auth_packet(
    mac_key: &[u8],
    utc: u32,
    client_id: u32,
    connection_id: u32,
    data: &[u8],
) -> Result<Vec<u8>> {
    let mut packet = Vec::with_capacity(AUTH_HEADER_LEN + data.len() + AUTH_TAG_LEN);
    packet.extend_from_slice(&utc.to_le_bytes());
    packet.extend_from_slice(&client_id.to_le_bytes());
    packet.extend_from_slice(&connection_id.to_le_bytes());
    packet.extend_from_slice(data);

    let tag = auth_tag(mac_key, &packet)?;
    packet.extend_from_slice(&tag);
    Ok(packet)
}

pub(crate) fn auth_tag(mac_key: &[u8], data: &[u8]) -> Result<[u8; AUTH_TAG_LEN]> {
    let mut mac = <HmacMd5 as Mac>::new_from_slice(mac_key)
        .map_err(|e| Error::Crypto(format!("HMAC key rejected: {}", e)))?;
    mac.update(data);
    let digest = mac.finalize().into_bytes();
    let mut tag = [0u8; AUTH_TAG_LEN];
    tag.copy_from_slice(&digest[..AUTH_TAG_LEN]);
    Ok(tag)
}
