//! AEAD shadowsocks ciphers
//!
//! Supports:
//! - ChaCha20-Poly1305 (`chacha20-ietf-poly1305`)
//! - AES-128-GCM
//! - AES-256-GCM
//!
//! The stream is a salt followed by chunks `[len(2) + tag][payload + tag]`,
//! each sealed with a little-endian counter nonce.

use aes_gcm::{
    aead::{Aead as AeadTrait, KeyInit},
    Aes128Gcm, Aes256Gcm, Nonce,
};
use bytes::BytesMut;
use chacha20poly1305::ChaCha20Poly1305;

use crate::error::{Error, Result};

/// Nonce size for AEAD ciphers (12 bytes)
pub const NONCE_SIZE: usize = 12;

/// Tag size for AEAD ciphers (16 bytes)
pub const TAG_SIZE: usize = 16;

/// Largest payload in one chunk
pub const MAX_PAYLOAD_SIZE: usize = 0x3FFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadKind {
    ChaCha20Poly1305,
    Aes128Gcm,
    Aes256Gcm,
}

impl AeadKind {
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "chacha20-ietf-poly1305" | "chacha20-poly1305" => Some(AeadKind::ChaCha20Poly1305),
            "aes-128-gcm" => Some(AeadKind::Aes128Gcm),
            "aes-256-gcm" => Some(AeadKind::Aes256Gcm),
            _ => None,
        }
    }

    pub fn key_size(&self) -> usize {
        match self {
            AeadKind::ChaCha20Poly1305 => 32,
            AeadKind::Aes128Gcm => 16,
            AeadKind::Aes256Gcm => 32,
        }
    }

    /// Salt is as long as the key
    pub fn salt_size(&self) -> usize {
        self.key_size()
    }
}

enum CipherInner {
    ChaCha20Poly1305(ChaCha20Poly1305),
    Aes128Gcm(Aes128Gcm),
    Aes256Gcm(Aes256Gcm),
}

/// AEAD cipher with an incrementing nonce
pub struct AeadCipher {
    inner: CipherInner,
    counter: u64,
}

impl AeadCipher {
    pub fn new(kind: AeadKind, key: &[u8]) -> Result<Self> {
        if key.len() != kind.key_size() {
            return Err(Error::Crypto(format!(
                "Invalid key size: expected {}, got {}",
                kind.key_size(),
                key.len()
            )));
        }

        let inner = match kind {
            AeadKind::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
                .map(CipherInner::ChaCha20Poly1305)
                .map_err(|e| Error::Crypto(format!("Failed to create cipher: {}", e)))?,
            AeadKind::Aes128Gcm => Aes128Gcm::new_from_slice(key)
                .map(CipherInner::Aes128Gcm)
                .map_err(|e| Error::Crypto(format!("Failed to create cipher: {}", e)))?,
            AeadKind::Aes256Gcm => Aes256Gcm::new_from_slice(key)
                .map(CipherInner::Aes256Gcm)
                .map_err(|e| Error::Crypto(format!("Failed to create cipher: {}", e)))?,
        };

        Ok(Self { inner, counter: 0 })
    }

    fn next_nonce(&mut self) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..8].copy_from_slice(&self.counter.to_le_bytes());
        self.counter = self.counter.wrapping_add(1);
        nonce
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce_bytes = self.next_nonce();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let result = match &self.inner {
            CipherInner::ChaCha20Poly1305(cipher) => cipher.encrypt(nonce, plaintext),
            CipherInner::Aes128Gcm(cipher) => cipher.encrypt(nonce, plaintext),
            CipherInner::Aes256Gcm(cipher) => cipher.encrypt(nonce, plaintext),
        };
        result.map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))
    }

    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_SIZE {
            return Err(Error::Crypto("Ciphertext too short".to_string()));
        }
        let nonce_bytes = self.next_nonce();
        let nonce = Nonce::from_slice(&nonce_bytes);
        let result = match &self.inner {
            CipherInner::ChaCha20Poly1305(cipher) => cipher.decrypt(nonce, ciphertext),
            CipherInner::Aes128Gcm(cipher) => cipher.decrypt(nonce, ciphertext),
            CipherInner::Aes256Gcm(cipher) => cipher.decrypt(nonce, ciphertext),
        };
        result.map_err(|e| Error::Crypto(format!("Decryption failed: {}", e)))
    }
}

/// Splits outgoing data into sealed chunks
pub struct ChunkEncoder {
    cipher: AeadCipher,
}

impl ChunkEncoder {
    pub fn new(cipher: AeadCipher) -> Self {
        Self { cipher }
    }

    pub fn encode(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let chunks = data.len().div_ceil(MAX_PAYLOAD_SIZE);
        let mut out = Vec::with_capacity(data.len() + chunks * (2 + 2 * TAG_SIZE));
        for chunk in data.chunks(MAX_PAYLOAD_SIZE) {
            out.extend(self.cipher.seal(&(chunk.len() as u16).to_be_bytes())?);
            out.extend(self.cipher.seal(chunk)?);
        }
        Ok(out)
    }
}

/// Reassembles chunks from arbitrary read boundaries
pub struct ChunkDecoder {
    cipher: AeadCipher,
    buffer: BytesMut,
    payload_len: Option<usize>,
}

impl ChunkDecoder {
    pub fn new(cipher: AeadCipher) -> Self {
        Self {
            cipher,
            buffer: BytesMut::new(),
            payload_len: None,
        }
    }

    /// Feed ciphertext, returning every payload byte completed so far
    pub fn decode(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.buffer.extend_from_slice(data);
        let mut out = Vec::new();

        loop {
            match self.payload_len {
                None => {
                    if self.buffer.len() < 2 + TAG_SIZE {
                        break;
                    }
                    let header = self.buffer.split_to(2 + TAG_SIZE);
                    let len = self.cipher.open(&header)?;
                    let len = u16::from_be_bytes([len[0], len[1]]) as usize & MAX_PAYLOAD_SIZE;
                    self.payload_len = Some(len);
                }
                Some(len) => {
                    if self.buffer.len() < len + TAG_SIZE {
                        break;
                    }
                    let sealed = self.buffer.split_to(len + TAG_SIZE);
                    out.extend(self.cipher.open(&sealed)?);
                    self.payload_len = None;
                }
            }
        }

        Ok(out)
    }
}
