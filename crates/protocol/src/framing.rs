//! Typed, length-prefixed, digest-sealed frames.
//!
//! # Frame Format
//!
//! Each frame consists of:
//! - 1 byte: message type (bit 7 set = payload is LZ4 compressed)
//! - 4 bytes: payload length (big-endian)
//! - N bytes: payload
//! - 32 bytes: running HMAC digest, omitted for [`MessageType::Error`]
//!
//! # Compression
//!
//! Once both peers have agreed to it, record payloads (request, response and
//! init) of at least [`COMPRESSION_THRESHOLD`] bytes are compressed with LZ4.
//! The compressed form is only used when it is actually smaller.

use crate::error::{ProtocolError, Result};
use crate::integrity::{DigestStream, DIGEST_SIZE};

/// Frame header size: 1 (type) + 4 (length) = 5 bytes.
pub const FRAME_HEADER_SIZE: usize = 5;

/// Bit OR'ed into the type byte of a compressed record frame.
pub const COMPRESSED_FLAG: u8 = 0x80;

/// Record payloads shorter than this are never compressed.
pub const COMPRESSION_THRESHOLD: usize = 32;

/// Default maximum payload size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Largest payload accepted from a peer that has not been verified yet.
pub const MAX_UNVERIFIED_PAYLOAD: usize = 256;

/// Kind of a frame, carried in the low bits of the type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Fault report. Never sealed with a digest.
    Error = 0,
    /// Nonce sent by each side as soon as the transport is up.
    Challenge = 1,
    /// Echo of the peer's nonce.
    ChallengeResponse = 2,
    /// Liveness ping with an empty payload.
    Keepalive = 3,
    /// Encoded request record.
    Request = 4,
    /// Encoded response record.
    Response = 5,
    /// Encoded connection parameters.
    Init = 6,
}

impl MessageType {
    /// Returns the raw type byte without the compression flag.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Returns true for the types whose payload is an encoded record and
    /// therefore requires a verified peer.
    #[inline]
    pub fn is_record(self) -> bool {
        matches!(
            self,
            MessageType::Request | MessageType::Response | MessageType::Init
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(byte: u8) -> std::result::Result<Self, u8> {
        match byte {
            0 => Ok(MessageType::Error),
            1 => Ok(MessageType::Challenge),
            2 => Ok(MessageType::ChallengeResponse),
            3 => Ok(MessageType::Keepalive),
            4 => Ok(MessageType::Request),
            5 => Ok(MessageType::Response),
            6 => Ok(MessageType::Init),
            other => Err(other),
        }
    }
}

/// A verified, decompressed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type.
    pub msg_type: MessageType,
    /// The payload data (uncompressed form).
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame.
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }
}

/// Outcome of a completed inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A frame whose digest checked out.
    Message(Frame),
    /// The peer sent an ERROR frame with this payload.
    PeerError(Vec<u8>),
    /// The transmitted digest did not match. The frame was discarded.
    DigestMismatch,
    /// The digest matched but the type byte is not one we know.
    UnknownType(u8),
}

/// Seals outbound frames with the send-direction digest stream.
#[derive(Debug)]
pub struct FrameEncoder {
    stream: DigestStream,
    compression: bool,
    max_payload: usize,
}

impl FrameEncoder {
    /// Create an encoder over the send-direction digest stream.
    pub fn new(stream: DigestStream) -> Self {
        Self {
            stream,
            compression: false,
            max_payload: MAX_FRAME_SIZE,
        }
    }

    /// Set the maximum payload size.
    pub fn with_max_payload(mut self, max: usize) -> Self {
        self.max_payload = max;
        self
    }

    /// Enable or disable compression of record payloads.
    ///
    /// Only switched on once both peers have advertised support.
    pub fn set_compression(&mut self, enabled: bool) {
        self.compression = enabled;
    }

    /// Returns true when record payloads may be compressed.
    pub fn compression(&self) -> bool {
        self.compression
    }

    /// Encode one frame: header, payload and (except for ERROR) digest.
    ///
    /// The header and payload are folded into the send stream in every case,
    /// so the peer's receive stream stays in step even for ERROR frames.
    pub fn encode(&mut self, msg_type: MessageType, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > self.max_payload {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len(),
                max: self.max_payload,
            });
        }

        let mut type_byte = msg_type.as_byte();
        let compressed;
        let body: &[u8] = if self.compression
            && msg_type.is_record()
            && payload.len() >= COMPRESSION_THRESHOLD
        {
            compressed = lz4_flex::compress_prepend_size(payload);
            if compressed.len() < payload.len() {
                type_byte |= COMPRESSED_FLAG;
                &compressed
            } else {
                payload
            }
        } else {
            payload
        };

        let len = u32::try_from(body.len()).map_err(|_| ProtocolError::FrameTooLarge {
            size: body.len(),
            max: u32::MAX as usize,
        })?;

        let mut output = Vec::with_capacity(FRAME_HEADER_SIZE + body.len() + DIGEST_SIZE);
        output.push(type_byte);
        output.extend_from_slice(&len.to_be_bytes());
        output.extend_from_slice(body);

        if msg_type == MessageType::Error {
            self.stream.update(&output);
        } else {
            let digest = self.stream.seal(&output);
            output.extend_from_slice(&digest);
        }

        Ok(output)
    }
}

/// Where the decoder is within the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    /// Waiting for the 5-byte header.
    AwaitingHeader,
    /// Header parsed, collecting the payload.
    AwaitingPayload,
    /// Payload collected, collecting the digest.
    AwaitingDigest,
}

/// Resumable inbound frame parser.
///
/// The decoder always knows exactly how many bytes it still needs
/// ([`FrameDecoder::wanted`]), so callers can read precisely that many and
/// never over-read past a frame boundary. Partial state survives across
/// calls, which lets a non-blocking reader give up and resume later.
#[derive(Debug)]
pub struct FrameDecoder {
    stream: DigestStream,
    state: DecodeState,
    wanted: usize,
    buf: Vec<u8>,
    type_byte: u8,
    payload: Vec<u8>,
    verified: bool,
    max_payload: usize,
}

impl FrameDecoder {
    /// Create a decoder over the receive-direction digest stream.
    pub fn new(stream: DigestStream) -> Self {
        Self {
            stream,
            state: DecodeState::AwaitingHeader,
            wanted: FRAME_HEADER_SIZE,
            buf: Vec::with_capacity(FRAME_HEADER_SIZE),
            type_byte: 0,
            payload: Vec::new(),
            verified: false,
            max_payload: MAX_FRAME_SIZE,
        }
    }

    /// Set the maximum payload size accepted once the peer is verified.
    pub fn with_max_payload(mut self, max: usize) -> Self {
        self.max_payload = max;
        self
    }

    /// Lift the small pre-verification size limit.
    pub fn set_verified(&mut self, verified: bool) {
        self.verified = verified;
    }

    /// Current parse state.
    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Number of bytes still expected for the current state.
    pub fn wanted(&self) -> usize {
        self.wanted
    }

    /// Returns true when no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        self.state == DecodeState::AwaitingHeader && self.buf.is_empty()
    }

    /// Feed up to [`FrameDecoder::wanted`] bytes.
    ///
    /// Returns `Ok(Some(_))` when these bytes completed a frame and
    /// `Ok(None)` when more input is needed. Size violations are errors; the
    /// decoder should not be fed again after one.
    pub fn feed(&mut self, data: &[u8]) -> Result<Option<Inbound>> {
        if data.len() > self.wanted {
            return Err(ProtocolError::MalformedFrame(format!(
                "fed {} bytes but only {} are expected",
                data.len(),
                self.wanted
            )));
        }

        match self.state {
            DecodeState::AwaitingHeader | DecodeState::AwaitingPayload => {
                self.stream.update(data)
            }
            DecodeState::AwaitingDigest => {}
        }
        self.buf.extend_from_slice(data);
        self.wanted -= data.len();
        if self.wanted > 0 {
            return Ok(None);
        }

        let chunk = std::mem::take(&mut self.buf);
        match self.state {
            DecodeState::AwaitingHeader => self.header_complete(&chunk),
            DecodeState::AwaitingPayload => {
                self.payload = chunk;
                Ok(self.payload_complete())
            }
            DecodeState::AwaitingDigest => self.digest_complete(&chunk).map(Some),
        }
    }

    fn header_complete(&mut self, header: &[u8]) -> Result<Option<Inbound>> {
        self.type_byte = header[0];
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;

        if !self.verified && len > MAX_UNVERIFIED_PAYLOAD {
            return Err(ProtocolError::HandshakeFailed(
                "Initial message too long".to_string(),
            ));
        }
        if len > self.max_payload {
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: self.max_payload,
            });
        }

        if len == 0 {
            self.payload = Vec::new();
            return Ok(self.payload_complete());
        }
        self.state = DecodeState::AwaitingPayload;
        self.wanted = len;
        self.buf.reserve(len);
        Ok(None)
    }

    fn payload_complete(&mut self) -> Option<Inbound> {
        if self.type_byte == MessageType::Error.as_byte() {
            let payload = std::mem::take(&mut self.payload);
            self.reset();
            return Some(Inbound::PeerError(payload));
        }
        self.state = DecodeState::AwaitingDigest;
        self.wanted = DIGEST_SIZE;
        None
    }

    fn digest_complete(&mut self, digest: &[u8]) -> Result<Inbound> {
        let type_byte = self.type_byte;
        let payload = std::mem::take(&mut self.payload);
        self.reset();

        if !self.stream.verify(digest) {
            return Ok(Inbound::DigestMismatch);
        }

        let msg_type = match MessageType::try_from(type_byte & !COMPRESSED_FLAG) {
            Ok(t) => t,
            Err(_) => return Ok(Inbound::UnknownType(type_byte)),
        };
        if type_byte & COMPRESSED_FLAG != 0 && !msg_type.is_record() {
            return Ok(Inbound::UnknownType(type_byte));
        }

        let payload = if type_byte & COMPRESSED_FLAG != 0 {
            self.decompress(&payload)?
        } else {
            payload
        };

        Ok(Inbound::Message(Frame { msg_type, payload }))
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < 4 {
            return Err(ProtocolError::MalformedFrame(
                "compressed payload is missing its size prefix".to_string(),
            ));
        }
        let size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if size > self.max_payload {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.max_payload,
            });
        }
        lz4_flex::decompress_size_prepended(data).map_err(|e| {
            ProtocolError::MalformedFrame(format!("failed to decompress payload: {}", e))
        })
    }

    fn reset(&mut self) {
        self.state = DecodeState::AwaitingHeader;
        self.wanted = FRAME_HEADER_SIZE;
        self.buf.clear();
    }
}
