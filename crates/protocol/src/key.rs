//! Shared secret used to seal every frame on a connection.
//!
//! The key is exactly [`DIGEST_SIZE`] bytes long. It is only ever stored as
//! hex and is never sent over the wire.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{ProtocolError, Result};
use crate::integrity::DIGEST_SIZE;

/// A shared HMAC key.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey([u8; DIGEST_SIZE]);

impl SharedKey {
    /// Generates a new random key using the operating system RNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; DIGEST_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Creates a key from raw bytes, checking the length.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key: [u8; DIGEST_SIZE] =
            bytes
                .try_into()
                .map_err(|_| ProtocolError::InvalidKeyLength {
                    expected: DIGEST_SIZE,
                    got: bytes.len(),
                })?;
        Ok(Self(key))
    }

    /// Decodes a key from its hex representation.
    ///
    /// Surrounding whitespace is ignored, so the contents of a key file can
    /// be passed in directly.
    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = hex::decode(text.trim())?;
        Self::from_bytes(&bytes)
    }

    /// Encodes the key as lowercase hex for storage.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; DIGEST_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedKey(<redacted>)")
    }
}
