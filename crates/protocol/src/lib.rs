//! # EasyCluster Protocol Library
//!
//! Wire-level building blocks for EasyCluster connections: the shared key,
//! per-direction running HMAC streams, the resumable frame codec and the
//! challenge-response handshake.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │       Request / Response / Init         │  encoded records
//! ├─────────────────────────────────────────┤
//! │        Challenge-response handshake     │  nonce echo
//! ├─────────────────────────────────────────┤
//! │     Framing + running HMAC digests      │  type, length, LZ4
//! ├─────────────────────────────────────────┤
//! │        Transport (TCP, Unix, pipe)      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Inbound, MessageType, Role, SharedKey, MAX_FRAME_SIZE};
//!
//! let key = SharedKey::generate();
//! let (mut client_tx, _) = Role::Client.channel(&key, MAX_FRAME_SIZE);
//! let (_, mut server_rx) = Role::Server.channel(&key, MAX_FRAME_SIZE);
//!
//! let bytes = client_tx.encode(MessageType::Challenge, b"nonce").unwrap();
//! let mut completed = None;
//! let mut rest = &bytes[..];
//! while !rest.is_empty() {
//!     let n = server_rx.wanted().min(rest.len());
//!     completed = server_rx.feed(&rest[..n]).unwrap();
//!     rest = &rest[n..];
//! }
//! assert!(matches!(completed, Some(Inbound::Message(_))));
//! ```
//!
//! ## Modules
//!
//! - [`key`]: Shared key
//! - [`integrity`]: Running HMAC streams
//! - [`framing`]: Frame encoder and resumable decoder
//! - [`handshake`]: Nonce challenge and peer verification
//! - [`messages`]: INIT payload and version checks
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod handshake;
pub mod integrity;
pub mod key;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::{
    DecodeState, Frame, FrameDecoder, FrameEncoder, Inbound, MessageType, COMPRESSED_FLAG,
    COMPRESSION_THRESHOLD, FRAME_HEADER_SIZE, MAX_FRAME_SIZE, MAX_UNVERIFIED_PAYLOAD,
};
pub use handshake::{Handshake, HandshakePhase, Nonce, Role};
pub use integrity::{Digest, DigestStream, CLIENT_IV, DIGEST_SIZE, SERVER_IV};
pub use key::SharedKey;
pub use messages::{is_compatible, InitInfo, PROTOCOL_VERSION};
