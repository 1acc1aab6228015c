//! Cipher selection by method name
//!
//! Stream methods (AES-CFB/CTR, ChaCha20) run a keystream over the bytes
//! after a random IV. AEAD methods live in `super::aead`. Anything else is a
//! pass-through: the tunnel still works but nothing is encrypted.

use aes::cipher::{KeyIvInit, StreamCipher};
use aes::{Aes128, Aes192, Aes256};
use cfb_mode::{BufDecryptor, BufEncryptor};
use chacha20::{ChaCha20, ChaCha20Legacy};
use ctr::Ctr128BE;

use crate::error::{Error, Result};

use super::aead::AeadKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Aes128Cfb,
    Aes192Cfb,
    Aes256Cfb,
    Aes128Ctr,
    Aes192Ctr,
    Aes256Ctr,
    /// Original ChaCha20 with an 8-byte nonce
    ChaCha20,
    /// RFC 7539 ChaCha20 with a 12-byte nonce
    ChaCha20Ietf,
    Aead(AeadKind),
    Unsupported,
}

impl Method {
    pub fn parse(name: &str) -> Self {
        let name = name.trim().to_ascii_lowercase();
        if let Some(kind) = AeadKind::from_method(&name) {
            return Method::Aead(kind);
        }
        match name.as_str() {
            "aes-128-cfb" => Method::Aes128Cfb,
            "aes-192-cfb" => Method::Aes192Cfb,
            "aes-256-cfb" => Method::Aes256Cfb,
            "aes-128-ctr" => Method::Aes128Ctr,
            "aes-192-ctr" => Method::Aes192Ctr,
            "aes-256-ctr" => Method::Aes256Ctr,
            "chacha20" => Method::ChaCha20,
            "chacha20-ietf" => Method::ChaCha20Ietf,
            _ => Method::Unsupported,
        }
    }

    /// Bytes sent ahead of the ciphertext: the IV, or the salt for AEAD
    pub fn iv_len(&self) -> usize {
        match self {
            Method::Aes128Cfb
            | Method::Aes192Cfb
            | Method::Aes256Cfb
            | Method::Aes128Ctr
            | Method::Aes192Ctr
            | Method::Aes256Ctr => 16,
            Method::ChaCha20 => 8,
            Method::ChaCha20Ietf => 12,
            Method::Aead(kind) => kind.salt_size(),
            Method::Unsupported => 0,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Method::Unsupported)
    }
}

/// Key length for a method name; unknown names get 32
pub fn key_len(method: &str) -> usize {
    let method = method.trim().to_ascii_lowercase();
    if let Some(kind) = AeadKind::from_method(&method) {
        return kind.key_size();
    }
    if method.starts_with("aes-128-") || method == "rc4-md5" {
        16
    } else if method.starts_with("aes-192-") {
        24
    } else {
        32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// Running keystream for one direction of a stream-cipher session
#[allow(clippy::large_enum_variant)]
pub enum Keystream {
    Aes128CfbEnc(BufEncryptor<Aes128>),
    Aes192CfbEnc(BufEncryptor<Aes192>),
    Aes256CfbEnc(BufEncryptor<Aes256>),
    Aes128CfbDec(BufDecryptor<Aes128>),
    Aes192CfbDec(BufDecryptor<Aes192>),
    Aes256CfbDec(BufDecryptor<Aes256>),
    Aes128Ctr(Ctr128BE<Aes128>),
    Aes192Ctr(Ctr128BE<Aes192>),
    Aes256Ctr(Ctr128BE<Aes256>),
    ChaCha20(ChaCha20Legacy),
    ChaCha20Ietf(ChaCha20),
    Passthrough,
}

fn init<C: KeyIvInit>(key: &[u8], iv: &[u8]) -> Result<C> {
    C::new_from_slices(key, iv).map_err(|_| {
        Error::Crypto(format!("invalid key/IV length ({} / {} bytes)", key.len(), iv.len()))
    })
}

impl Keystream {
    /// AEAD methods are rejected here; they are not keystreams
    pub fn new(method: Method, key: &[u8], iv: &[u8], direction: Direction) -> Result<Self> {
        use Direction::*;

        let keystream = match (method, direction) {
            (Method::Aes128Cfb, Encrypt) => Keystream::Aes128CfbEnc(init(key, iv)?),
            (Method::Aes192Cfb, Encrypt) => Keystream::Aes192CfbEnc(init(key, iv)?),
            (Method::Aes256Cfb, Encrypt) => Keystream::Aes256CfbEnc(init(key, iv)?),
            (Method::Aes128Cfb, Decrypt) => Keystream::Aes128CfbDec(init(key, iv)?),
            (Method::Aes192Cfb, Decrypt) => Keystream::Aes192CfbDec(init(key, iv)?),
            (Method::Aes256Cfb, Decrypt) => Keystream::Aes256CfbDec(init(key, iv)?),
            (Method::Aes128Ctr, _) => Keystream::Aes128Ctr(init(key, iv)?),
            (Method::Aes192Ctr, _) => Keystream::Aes192Ctr(init(key, iv)?),
            (Method::Aes256Ctr, _) => Keystream::Aes256Ctr(init(key, iv)?),
            (Method::ChaCha20, _) => Keystream::ChaCha20(init(key, iv)?),
            (Method::ChaCha20Ietf, _) => Keystream::ChaCha20Ietf(init(key, iv)?),
            (Method::Unsupported, _) => Keystream::Passthrough,
            (Method::Aead(_), _) => {
                return Err(Error::Crypto("AEAD method has no keystream".into()));
            }
        };
        Ok(keystream)
    }

    /// Encrypt or decrypt in place
    pub fn apply(&mut self, data: &mut [u8]) {
        match self {
            Keystream::Aes128CfbEnc(c) => c.encrypt(data),
            Keystream::Aes192CfbEnc(c) => c.encrypt(data),
            Keystream::Aes256CfbEnc(c) => c.encrypt(data),
            Keystream::Aes128CfbDec(c) => c.decrypt(data),
            Keystream::Aes192CfbDec(c) => c.decrypt(data),
            Keystream::Aes256CfbDec(c) => c.decrypt(data),
            Keystream::Aes128Ctr(c) => c.apply_keystream(data),
            Keystream::Aes192Ctr(c) => c.apply_keystream(data),
            Keystream::Aes256Ctr(c) => c.apply_keystream(data),
            Keystream::ChaCha20(c) => c.apply_keystream(data),
            Keystream::ChaCha20Ietf(c) => c.apply_keystream(data),
            Keystream::Passthrough => {}
        }
    }
}
