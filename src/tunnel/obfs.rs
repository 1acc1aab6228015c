//! Obfuscation layer, applied after encryption
//!
//! `tls1.2_ticket_auth` dresses the first packet as a TLS ClientHello:
//! `16 03 01 | be16(len + 32) | 01 00 00 1c | 28 random bytes | data`.
//! On receive, TLS records are unwrapped: handshake and change-cipher-spec
//! records are dropped, application-data payloads are kept. A peer that
//! does not answer with TLS records is read as-is.

use bytes::{Buf, BytesMut};
use rand::RngCore;
use tracing::warn;

use crate::error::{Error, Result};

const CONTENT_CHANGE_CIPHER_SPEC: u8 = 0x14;
const CONTENT_ALERT: u8 = 0x15;
const CONTENT_HANDSHAKE: u8 = 0x16;
const CONTENT_APPLICATION_DATA: u8 = 0x17;

const RECORD_HEADER_LEN: usize = 5;
const HELLO_RANDOM_LEN: usize = 28;
/// Hello prefix plus random bytes
const HELLO_OVERHEAD: usize = 4 + HELLO_RANDOM_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObfsKind {
    Plain,
    TlsTicketAuth,
    Passthrough,
}

impl ObfsKind {
    pub fn parse(name: &str) -> Self {
        match name {
            "" | "plain" => ObfsKind::Plain,
            "tls1.2_ticket_auth" => ObfsKind::TlsTicketAuth,
            other => {
                warn!("[tunnel] Unsupported obfs {}, sending data undisguised", other);
                ObfsKind::Passthrough
            }
        }
    }
}

/// Send side
#[derive(Debug)]
pub struct ObfsEncoder {
    kind: ObfsKind,
    sent_hello: bool,
}

impl ObfsEncoder {
    pub fn new(kind: ObfsKind) -> Self {
        Self { kind, sent_hello: false }
    }

    pub fn encode(&mut self, data: Vec<u8>) -> Result<Vec<u8>> {
        if self.kind != ObfsKind::TlsTicketAuth || self.sent_hello {
            return Ok(data);
        }
        self.sent_hello = true;

        let length = u16::try_from(data.len() + HELLO_OVERHEAD)
            .map_err(|_| Error::Protocol(format!("first packet too large ({} bytes)", data.len())))?;

        let mut random = [0u8; HELLO_RANDOM_LEN];
        rand::thread_rng().fill_bytes(&mut random);

        let mut packet = Vec::with_capacity(RECORD_HEADER_LEN + HELLO_OVERHEAD + data.len());
        packet.extend_from_slice(&[CONTENT_HANDSHAKE, 0x03, 0x01]);
        packet.extend_from_slice(&length.to_be_bytes());
        packet.extend_from_slice(&[0x01, 0x00, 0x00, 0x1c]);
        packet.extend_from_slice(&random);
        packet.extend_from_slice(&data);
        Ok(packet)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecvMode {
    /// Waiting for the first byte to tell whether the peer speaks TLS records
    Undecided,
    Records,
    Raw,
}

/// Receive side
#[derive(Debug)]
pub struct ObfsDecoder {
    mode: RecvMode,
    buffer: BytesMut,
}

impl ObfsDecoder {
    pub fn new(kind: ObfsKind) -> Self {
        let mode = match kind {
            ObfsKind::TlsTicketAuth => RecvMode::Undecided,
            ObfsKind::Plain | ObfsKind::Passthrough => RecvMode::Raw,
        };
        Self {
            mode,
            buffer: BytesMut::new(),
        }
    }

    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        if self.mode == RecvMode::Undecided {
            match data.first() {
                None => return Ok(Vec::new()),
                Some(&b) if (CONTENT_CHANGE_CIPHER_SPEC..=CONTENT_APPLICATION_DATA).contains(&b) => {
                    self.mode = RecvMode::Records;
                }
                Some(_) => self.mode = RecvMode::Raw,
            }
        }
        if self.mode == RecvMode::Raw {
            return Ok(data.to_vec());
        }

        self.buffer.extend_from_slice(data);
        let mut out = Vec::new();
        while self.buffer.len() >= RECORD_HEADER_LEN {
            let content_type = self.buffer[0];
            let len = u16::from_be_bytes([self.buffer[3], self.buffer[4]]) as usize;
            if self.buffer.len() < RECORD_HEADER_LEN + len {
                break;
            }
            self.buffer.advance(RECORD_HEADER_LEN);
            let payload = self.buffer.split_to(len);

            match content_type {
                CONTENT_APPLICATION_DATA => out.extend_from_slice(&payload),
                CONTENT_HANDSHAKE | CONTENT_CHANGE_CIPHER_SPEC => {}
                CONTENT_ALERT => return Err(Error::Protocol("TLS alert from node".into())),
                other => return Err(Error::Protocol(format!("unexpected TLS record type {:#04x}", other))),
            }
        }
        Ok(out)
    }
}
