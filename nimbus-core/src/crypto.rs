//! Keystream encryption for slabs and object streams
//!
//! The storage protocol encrypts by XORing data with an XChaCha20
//! keystream; there is no authentication tag because sectors are
//! integrity-checked through their Merkle roots. Each slab carries its
//! own key, distinct from the parent object's key.

use crate::error::{NimbusError, Result};
use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::{Key, XChaCha20, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Key size (32 bytes)
pub const KEY_SIZE: usize = 32;

/// Keystream nonce size (24 bytes)
pub const NONCE_SIZE: usize = 24;

/// An XChaCha20 encryption key
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; KEY_SIZE]);

impl EncryptionKey {
    /// Generate a new random encryption key
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a slice (validates length)
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        if slice.len() != KEY_SIZE {
            return Err(NimbusError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: slice.len(),
            });
        }
        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(slice);
        Ok(Self(key))
    }

    /// Get the raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    /// XOR `data` with the keystream for shard `index`, starting at
    /// 64-byte block `counter`. Byte 1 of the nonce carries the shard
    /// index so every shard of a slab sees a distinct stream.
    pub fn xor_shard(&self, data: &mut [u8], index: u8, counter: u32) {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[1] = index;
        let mut cipher = XChaCha20::new(
            Key::from_slice(&self.0),
            XNonce::from_slice(&nonce),
        );
        cipher.seek(u64::from(counter) * 64);
        cipher.apply_keystream(data);
    }

    /// XOR `data` with the zero-nonce keystream at byte `offset`. Used
    /// to encrypt an object's source stream, slab buffer by slab buffer.
    pub fn xor_stream_at(&self, data: &mut [u8], offset: u64) {
        let nonce = [0u8; NONCE_SIZE];
        let mut cipher = XChaCha20::new(
            Key::from_slice(&self.0),
            XNonce::from_slice(&nonce),
        );
        cipher.seek(offset);
        cipher.apply_keystream(data);
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptionKey([REDACTED])")
    }
}

impl Drop for EncryptionKey {
    fn drop(&mut self) {
        // Zero key material on drop
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

impl Serialize for EncryptionKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for EncryptionKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        EncryptionKey::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}
