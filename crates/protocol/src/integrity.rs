//! Running HMAC state for one direction of a connection.
//!
//! Each direction owns a [`DigestStream`] seeded once with the shared key and
//! a direction-specific IV. Every byte sent (or received) is folded into it,
//! and each frame digest is folded back in after it is produced, so the
//! digest of a frame depends on every frame before it in that direction.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::key::SharedKey;

type HmacSha256 = Hmac<Sha256>;

/// Size in bytes of a frame digest (and of the shared key).
pub const DIGEST_SIZE: usize = 32;

/// IV for frames travelling client to server.
pub const CLIENT_IV: &[u8] = b"CLNT";

/// IV for frames travelling server to client.
pub const SERVER_IV: &[u8] = b"SRVR";

/// A frame digest.
pub type Digest = [u8; DIGEST_SIZE];

/// Running keyed digest over one direction of the byte stream.
#[derive(Clone)]
pub struct DigestStream {
    mac: HmacSha256,
}

impl DigestStream {
    /// Seeds a new stream with the shared key and a direction IV.
    pub fn new(key: &SharedKey, iv: &[u8]) -> Self {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(key.as_bytes())
            .unwrap_or_else(|_| unreachable!("HMAC accepts keys of any length"));
        mac.update(iv);
        Self { mac }
    }

    /// Folds bytes into the running state.
    pub fn update(&mut self, data: &[u8]) {
        self.mac.update(data);
    }

    /// Returns the digest of everything folded in so far without consuming
    /// the running state.
    pub fn digest(&self) -> Digest {
        let bytes = self.mac.clone().finalize().into_bytes();
        let mut out = [0u8; DIGEST_SIZE];
        out.copy_from_slice(&bytes);
        out
    }

    /// Sender side: folds `data` in, produces the digest, then folds the
    /// digest itself in so it covers the next frame.
    pub fn seal(&mut self, data: &[u8]) -> Digest {
        self.update(data);
        let digest = self.digest();
        self.update(&digest);
        digest
    }

    /// Receiver side: compares a transmitted digest with the digest of
    /// everything folded in so far.
    ///
    /// On a match the digest is folded in, mirroring [`DigestStream::seal`].
    /// On a mismatch the state is left as is.
    pub fn verify(&mut self, received: &[u8]) -> bool {
        if self.mac.clone().verify_slice(received).is_err() {
            return false;
        }
        self.update(received);
        true
    }
}

impl std::fmt::Debug for DigestStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigestStream").finish_non_exhaustive()
    }
}
