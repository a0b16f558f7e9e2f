//! Challenge-response handshake.
//!
//! Both sides send a CHALLENGE carrying a fresh nonce as soon as the
//! transport is up, and each echoes the other's nonce back as a
//! CHALLENGE_RESPONSE. A side considers its peer verified once the echo
//! matches its own nonce. The echo only validates because the HMAC layer is
//! already active, so a peer without the shared key never gets this far.
//!
//! ```text
//! client                         server
//!   -- CHALLENGE(nc) ----------->
//!   <----------- CHALLENGE(ns) --
//!   -- CHALLENGE_RESPONSE(ns) -->       server: verified
//!   <-- CHALLENGE_RESPONSE(nc) --       client: verified
//!   -- INIT -------------------->
//!   <-------------------- INIT --       both: ready
//! ```

use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{ProtocolError, Result};
use crate::framing::{FrameDecoder, FrameEncoder};
use crate::integrity::{DigestStream, CLIENT_IV, DIGEST_SIZE, SERVER_IV};
use crate::key::SharedKey;

/// Which end of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Connecting side.
    Client,
    /// Accepting side.
    Server,
}

impl Role {
    /// IV seeding the send-direction digest stream.
    pub fn send_iv(self) -> &'static [u8] {
        match self {
            Role::Client => CLIENT_IV,
            Role::Server => SERVER_IV,
        }
    }

    /// IV seeding the receive-direction digest stream.
    pub fn recv_iv(self) -> &'static [u8] {
        match self {
            Role::Client => SERVER_IV,
            Role::Server => CLIENT_IV,
        }
    }

    /// Builds the sealed encoder/decoder pair for this end of a connection.
    pub fn channel(self, key: &SharedKey, max_payload: usize) -> (FrameEncoder, FrameDecoder) {
        let encoder = FrameEncoder::new(DigestStream::new(key, self.send_iv()))
            .with_max_payload(max_payload);
        let decoder = FrameDecoder::new(DigestStream::new(key, self.recv_iv()))
            .with_max_payload(max_payload);
        (encoder, decoder)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

/// A locally generated challenge: current UNIX time as a big-endian f64
/// followed by random padding, `DIGEST_SIZE` bytes in total.
#[derive(Clone, PartialEq, Eq)]
pub struct Nonce([u8; DIGEST_SIZE]);

impl Nonce {
    /// Generates a fresh nonce.
    pub fn generate() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let mut bytes = [0u8; DIGEST_SIZE];
        bytes[..8].copy_from_slice(&now.to_be_bytes());
        OsRng.fill_bytes(&mut bytes[8..]);
        Self(bytes)
    }

    /// Raw nonce bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Nonce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Nonce({})", hex::encode(&self.0[..8]))
    }
}

/// Progress of the handshake on one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakePhase {
    /// No transport yet.
    Unconnected,
    /// Transport attached, challenge not yet sent.
    SocketSet,
    /// Our challenge is out, waiting for the echo.
    ChallengeSent,
    /// The peer echoed our nonce.
    Verified,
    /// INIT has been exchanged.
    Ready,
}

/// Handshake state machine for one end of a connection.
#[derive(Debug)]
pub struct Handshake {
    role: Role,
    phase: HandshakePhase,
    nonce: Option<Nonce>,
}

impl Handshake {
    /// Creates a handshake in the [`HandshakePhase::Unconnected`] phase.
    pub fn new(role: Role) -> Self {
        Self {
            role,
            phase: HandshakePhase::Unconnected,
            nonce: None,
        }
    }

    /// Our role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Current phase.
    pub fn phase(&self) -> HandshakePhase {
        self.phase
    }

    /// Returns true once the peer has echoed our nonce.
    pub fn is_verified(&self) -> bool {
        matches!(self.phase, HandshakePhase::Verified | HandshakePhase::Ready)
    }

    /// Returns true once INIT has been exchanged.
    pub fn is_ready(&self) -> bool {
        self.phase == HandshakePhase::Ready
    }

    /// Records that the transport is attached.
    pub fn socket_set(&mut self) {
        if self.phase == HandshakePhase::Unconnected {
            self.phase = HandshakePhase::SocketSet;
        }
    }

    /// Generates our nonce and returns the CHALLENGE payload.
    pub fn challenge(&mut self) -> Result<Vec<u8>> {
        if self.phase != HandshakePhase::SocketSet {
            return Err(ProtocolError::HandshakeFailed(format!(
                "cannot send challenge in phase {:?}",
                self.phase
            )));
        }
        let nonce = Nonce::generate();
        let payload = nonce.as_bytes().to_vec();
        self.nonce = Some(nonce);
        self.phase = HandshakePhase::ChallengeSent;
        Ok(payload)
    }

    /// Builds the CHALLENGE_RESPONSE for a challenge received from the peer.
    /// The echo is the exact bytes received.
    pub fn answer(&self, challenge: &[u8]) -> Vec<u8> {
        challenge.to_vec()
    }

    /// Checks the peer's echo against our nonce.
    ///
    /// On a match the phase moves to [`HandshakePhase::Verified`]. On a
    /// mismatch it is left unchanged and the caller reports
    /// `Invalid nonce` to the peer.
    pub fn check_response(&mut self, echo: &[u8]) -> Result<()> {
        if self.phase != HandshakePhase::ChallengeSent {
            return Err(ProtocolError::HandshakeFailed(
                "Unexpected challenge response".to_string(),
            ));
        }
        match &self.nonce {
            Some(nonce) if nonce.as_bytes() == echo => {
                self.phase = HandshakePhase::Verified;
                Ok(())
            }
            _ => Err(ProtocolError::HandshakeFailed("Invalid nonce".to_string())),
        }
    }

    /// Moves a verified handshake to [`HandshakePhase::Ready`].
    pub fn mark_ready(&mut self) -> Result<()> {
        if !self.is_verified() {
            return Err(ProtocolError::HandshakeIncomplete);
        }
        self.phase = HandshakePhase::Ready;
        Ok(())
    }
}
