//! Connection state machine.
//!
//! A [`Connection`] owns one end of a duplex byte stream. It runs the
//! challenge-response handshake, seals outbound frames, drives the resumable
//! frame decoder, and hands verified REQUEST, RESPONSE and INIT payloads to
//! the [`FrameHandler`] attached by the client or server that owns it.
//!
//! Sends are serialised by the writer mutex, so the send HMAC stream and the
//! byte stream always advance together. Pumpers are serialised by the reader
//! mutex. Dispatch runs while the reader lock is held, so frames are handed
//! upwards in the order they arrived.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::{Duration, Instant};

use futures_util::future::{BoxFuture, FutureExt};
use protocol::{
    Frame, FrameDecoder, FrameEncoder, Handshake, HandshakePhase, Inbound, InitInfo, MessageType,
    ProtocolError, Role, SharedKey,
};
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::codec::RecordCodec;
use crate::error::{Error, Result};

/// Any duplex byte stream a connection can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

type BoxedTransport = Box<dyn Transport>;

/// Coarse lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport attached, no challenge sent yet.
    Connecting,
    /// Challenge sent, waiting for the peer's echo and INIT.
    Handshaking,
    /// Both INIT records exchanged; requests flow.
    Ready,
    /// Closed locally or by the peer.
    Closed,
}

/// What we know about the other end of the transport.
#[derive(Debug, Clone, Default)]
pub struct PeerInfo {
    /// Display name, usually the socket address.
    pub name: String,
    /// Underlying socket descriptor, for external readiness polling.
    pub raw_fd: Option<i32>,
}

impl PeerInfo {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            raw_fd: None,
        }
    }
}

/// Construction parameters for a [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// INIT record we send once the peer is verified.
    pub local_init: InitInfo,
    /// Record serializer shared with the layer above.
    pub codec: Arc<dyn RecordCodec>,
    /// Buffer REQUEST/RESPONSE sends until ready instead of failing.
    pub queue_before_ready: bool,
    /// Largest frame payload accepted once verified.
    pub max_frame_size: usize,
}

/// Upper layer receiving verified records and lifecycle events.
pub(crate) trait FrameHandler: Send + Sync {
    /// Peer INIT received. An error aborts the handshake.
    fn on_init(&self, peer: &InitInfo) -> Result<()>;

    /// REQUEST payload received.
    fn on_request(&self, payload: Vec<u8>) -> BoxFuture<'_, Result<()>>;

    /// RESPONSE payload received.
    fn on_response(&self, payload: Vec<u8>) -> Result<()>;

    /// The connection closed. Called exactly once.
    fn on_close(&self, reason: &str);
}

struct Reader {
    io: BufReader<ReadHalf<BoxedTransport>>,
    decoder: FrameDecoder,
}

impl Reader {
    /// Reads until the decoder completes a frame.
    ///
    /// Bytes are moved into the decoder and consumed from the buffer without
    /// an await in between, so dropping this future never loses input.
    async fn next_inbound(&mut self) -> protocol::Result<Inbound> {
        loop {
            let buf = self.io.fill_buf().await?;
            if buf.is_empty() {
                return Err(ProtocolError::ConnectionClosed(
                    "Connection closed by peer".to_string(),
                ));
            }
            let n = buf.len().min(self.decoder.wanted());
            let completed = self.decoder.feed(&buf[..n]);
            self.io.consume(n);
            if let Some(inbound) = completed? {
                return Ok(inbound);
            }
        }
    }
}

struct Writer {
    io: WriteHalf<BoxedTransport>,
    encoder: FrameEncoder,
}

struct Shared {
    handshake: Handshake,
    closed: Option<String>,
    peer_init: Option<InitInfo>,
    queued: VecDeque<(MessageType, Vec<u8>)>,
    last_frame: Instant,
}

struct ConnInner {
    role: Role,
    peer: PeerInfo,
    local_init: InitInfo,
    codec: Arc<dyn RecordCodec>,
    queue_before_ready: bool,
    reader: tokio::sync::Mutex<Reader>,
    writer: tokio::sync::Mutex<Writer>,
    shared: Mutex<Shared>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
    has_reader: AtomicBool,
    handler: OnceLock<Weak<dyn FrameHandler>>,
}

/// Cheap-clone handle to one end of an authenticated channel.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.inner.role)
            .field("peer", &self.inner.peer.name)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Wraps a connected transport. Nothing is sent until [`start`].
    ///
    /// [`start`]: Connection::start
    pub fn new(
        transport: impl Transport,
        key: &SharedKey,
        role: Role,
        peer: PeerInfo,
        options: ConnectionOptions,
    ) -> Self {
        let boxed: BoxedTransport = Box::new(transport);
        let (read_half, write_half) = tokio::io::split(boxed);
        let (encoder, decoder) = role.channel(key, options.max_frame_size);

        let mut handshake = Handshake::new(role);
        handshake.socket_set();

        let (state, _) = watch::channel(ConnectionState::Connecting);

        Self {
            inner: Arc::new(ConnInner {
                role,
                peer,
                local_init: options.local_init,
                codec: options.codec,
                queue_before_ready: options.queue_before_ready,
                reader: tokio::sync::Mutex::new(Reader {
                    io: BufReader::new(read_half),
                    decoder,
                }),
                writer: tokio::sync::Mutex::new(Writer {
                    io: write_half,
                    encoder,
                }),
                shared: Mutex::new(Shared {
                    handshake,
                    closed: None,
                    peer_init: None,
                    queued: VecDeque::new(),
                    last_frame: Instant::now(),
                }),
                state,
                cancel: CancellationToken::new(),
                has_reader: AtomicBool::new(false),
                handler: OnceLock::new(),
            }),
        }
    }

    pub(crate) fn attach(&self, handler: Weak<dyn FrameHandler>) {
        let _ = self.inner.handler.set(handler);
    }

    fn handler(&self) -> Option<Arc<dyn FrameHandler>> {
        self.inner.handler.get().and_then(Weak::upgrade)
    }

    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.inner
            .shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn peer_name(&self) -> &str {
        &self.inner.peer.name
    }

    /// Socket descriptor of the transport, when it has one.
    pub fn raw_fd(&self) -> Option<i32> {
        self.inner.peer.raw_fd
    }

    pub fn codec(&self) -> &Arc<dyn RecordCodec> {
        &self.inner.codec
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn is_closed(&self) -> bool {
        self.shared().closed.is_some()
    }

    pub fn is_verified(&self) -> bool {
        self.shared().handshake.is_verified()
    }

    pub fn handshake_phase(&self) -> HandshakePhase {
        self.shared().handshake.phase()
    }

    /// Protocol version announced in the peer's INIT.
    pub fn peer_version(&self) -> Option<String> {
        self.shared().peer_init.as_ref().map(|i| i.version.clone())
    }

    /// The peer's full INIT record.
    pub fn peer_init(&self) -> Option<InitInfo> {
        self.shared().peer_init.clone()
    }

    /// Time since the last verified frame arrived.
    pub fn idle_for(&self) -> Duration {
        self.shared().last_frame.elapsed()
    }

    /// Watch channel following [`ConnectionState`] changes.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Marks that a dedicated task is pumping this connection.
    pub(crate) fn set_has_reader(&self, value: bool) {
        self.inner.has_reader.store(value, Ordering::SeqCst);
    }

    pub fn has_reader(&self) -> bool {
        self.inner.has_reader.load(Ordering::SeqCst)
    }

    fn closed_error(&self) -> Error {
        let reason = self
            .shared()
            .closed
            .clone()
            .unwrap_or_else(|| "Connection has been closed".to_string());
        Error::ConnectionClosed(reason)
    }

    /// Sends our CHALLENGE. Later calls do nothing.
    pub async fn start(&self) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        let challenge = {
            let mut shared = self.shared();
            if let Some(reason) = &shared.closed {
                return Err(Error::ConnectionClosed(reason.clone()));
            }
            if shared.handshake.phase() != HandshakePhase::SocketSet {
                return Ok(());
            }
            shared.handshake.challenge()?
        };
        self.inner.state.send_replace(ConnectionState::Handshaking);
        tracing::debug!(peer = %self.peer_name(), role = %self.role(), "Sending challenge");
        self.write_frame(&mut writer, MessageType::Challenge, &challenge)
            .await
    }

    /// Sends one frame.
    ///
    /// REQUEST and RESPONSE frames issued before the connection is ready are
    /// queued and flushed in order once it is, or rejected with
    /// [`Error::NotReady`] when queueing is disabled.
    ///
    /// Not cancel-safe: a send dropped mid-write leaves the stream unusable.
    pub async fn send_message(&self, msg_type: MessageType, payload: Vec<u8>) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        {
            let mut shared = self.shared();
            if let Some(reason) = &shared.closed {
                return Err(Error::ConnectionClosed(reason.clone()));
            }
            if msg_type.is_record()
                && msg_type != MessageType::Init
                && !shared.handshake.is_ready()
            {
                if !self.inner.queue_before_ready {
                    return Err(Error::NotReady);
                }
                shared.queued.push_back((msg_type, payload));
                return Ok(());
            }
        }
        self.write_frame(&mut writer, msg_type, &payload).await
    }

    async fn send_control(&self, msg_type: MessageType, payload: &[u8]) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        if let Some(reason) = &self.shared().closed {
            return Err(Error::ConnectionClosed(reason.clone()));
        }
        self.write_frame(&mut writer, msg_type, payload).await
    }

    async fn send_error(&self, text: &str) -> Result<()> {
        self.send_control(MessageType::Error, text.as_bytes()).await
    }

    async fn write_frame(
        &self,
        writer: &mut Writer,
        msg_type: MessageType,
        payload: &[u8],
    ) -> Result<()> {
        let bytes = writer.encoder.encode(msg_type, payload)?;
        let written = async {
            writer.io.write_all(&bytes).await?;
            writer.io.flush().await
        }
        .await;
        if let Err(err) = written {
            let err = ProtocolError::from(err);
            self.close(&err.to_string());
            return Err(err.into());
        }
        Ok(())
    }

    /// Advances the receive state machine.
    ///
    /// With `block = false` only bytes that are already available are read;
    /// a partial frame stays buffered for the next call. With `block = true`
    /// this waits until a frame has been handled. Returns `Ok(true)` exactly
    /// when a complete verified frame was dispatched.
    pub async fn pump(&self, block: bool) -> Result<bool> {
        if self.is_closed() {
            return Err(self.closed_error());
        }
        let mut reader = if block {
            tokio::select! {
                guard = self.inner.reader.lock() => guard,
                _ = self.inner.cancel.cancelled() => return Err(self.closed_error()),
            }
        } else {
            match self.inner.reader.try_lock() {
                Ok(guard) => guard,
                Err(_) => return Ok(false),
            }
        };
        self.pump_locked(&mut reader, block).await
    }

    async fn pump_locked(&self, reader: &mut Reader, block: bool) -> Result<bool> {
        let inbound = if block {
            tokio::select! {
                inbound = reader.next_inbound() => inbound,
                _ = self.inner.cancel.cancelled() => return Err(self.closed_error()),
            }
        } else {
            match reader.next_inbound().now_or_never() {
                Some(inbound) => inbound,
                None => return Ok(false),
            }
        };

        match inbound {
            Ok(inbound) => self.dispatch(reader, inbound).await,
            Err(err) => Err(self.read_failed(err).await),
        }
    }

    async fn read_failed(&self, err: ProtocolError) -> Error {
        match &err {
            ProtocolError::HandshakeFailed(text) => {
                tracing::warn!(peer = %self.peer_name(), error = %text, "Rejecting unverified peer");
                let _ = self.send_error(text).await;
            }
            ProtocolError::ConnectionClosed(_) => {
                tracing::debug!(peer = %self.peer_name(), "Peer closed the connection");
            }
            _ => {
                tracing::warn!(peer = %self.peer_name(), error = %err, "Transport error");
            }
        }
        self.close(&err.to_string());
        err.into()
    }

    async fn dispatch(&self, reader: &mut Reader, inbound: Inbound) -> Result<bool> {
        match inbound {
            Inbound::PeerError(payload) => {
                let text = String::from_utf8_lossy(&payload).into_owned();
                tracing::warn!(peer = %self.peer_name(), error = %text, "Peer reported an error");
                Err(ProtocolError::PeerError(text).into())
            }
            Inbound::DigestMismatch => {
                tracing::warn!(peer = %self.peer_name(), "Dropping frame with bad digest");
                self.send_error("HMAC error").await?;
                Ok(false)
            }
            Inbound::UnknownType(byte) => {
                tracing::warn!(peer = %self.peer_name(), type_byte = byte, "Dropping frame of unknown type");
                self.send_error("Invalid message type").await?;
                Ok(false)
            }
            Inbound::Message(frame) if frame.msg_type.is_record() && !self.is_verified() => {
                tracing::warn!(
                    peer = %self.peer_name(),
                    msg_type = ?frame.msg_type,
                    "Dropping record from unverified peer"
                );
                self.send_error("Not verified").await?;
                Ok(false)
            }
            Inbound::Message(frame) => {
                self.shared().last_frame = Instant::now();
                self.handle_frame(reader, frame).await?;
                Ok(true)
            }
        }
    }

    async fn handle_frame(&self, reader: &mut Reader, frame: Frame) -> Result<()> {
        match frame.msg_type {
            MessageType::Challenge => {
                self.start().await?;
                let echo = self.shared().handshake.answer(&frame.payload);
                self.send_control(MessageType::ChallengeResponse, &echo)
                    .await
            }
            MessageType::ChallengeResponse => {
                let checked = self.shared().handshake.check_response(&frame.payload);
                match checked {
                    Ok(()) => {
                        reader.decoder.set_verified(true);
                        tracing::debug!(peer = %self.peer_name(), "Peer verified");
                        let init = self.inner.codec.encode_init(&self.inner.local_init)?;
                        self.send_control(MessageType::Init, &init).await
                    }
                    Err(err) => {
                        tracing::warn!(peer = %self.peer_name(), error = %err, "Challenge response rejected");
                        let text = match err {
                            ProtocolError::HandshakeFailed(text) => text,
                            other => other.to_string(),
                        };
                        self.send_error(&text).await
                    }
                }
            }
            MessageType::Init => self.handle_init(&frame.payload).await,
            MessageType::Request => match self.handler() {
                Some(handler) => match handler.on_request(frame.payload).await {
                    Err(Error::InvalidRecord(text)) => {
                        tracing::warn!(peer = %self.peer_name(), error = %text, "Rejecting malformed request");
                        let _ = self.send_error("Invalid request").await;
                        Err(Error::InvalidRecord(text))
                    }
                    handled => handled,
                },
                None => Ok(()),
            },
            MessageType::Response => match self.handler() {
                Some(handler) => handler.on_response(frame.payload),
                None => Ok(()),
            },
            MessageType::Keepalive => {
                tracing::trace!(peer = %self.peer_name(), "Keepalive");
                Ok(())
            }
            MessageType::Error => Ok(()),
        }
    }

    async fn handle_init(&self, payload: &[u8]) -> Result<()> {
        let peer_init = self.inner.codec.decode_init(payload)?;

        if let Err(err) = peer_init.check_version() {
            let text = match &err {
                ProtocolError::HandshakeFailed(text) => text.clone(),
                other => other.to_string(),
            };
            tracing::warn!(peer = %self.peer_name(), error = %text, "Handshake failed");
            let _ = self.send_error(&text).await;
            return Err(err.into());
        }

        if let Some(handler) = self.handler() {
            if let Err(err) = handler.on_init(&peer_init) {
                tracing::warn!(peer = %self.peer_name(), error = %err, "INIT rejected");
                let _ = self.send_error(&err.to_string()).await;
                return Err(err);
            }
        }

        self.shared().peer_init = Some(peer_init.clone());
        self.become_ready(&peer_init).await
    }

    async fn become_ready(&self, peer_init: &InitInfo) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        let queued = {
            let mut shared = self.shared();
            if let Some(reason) = &shared.closed {
                return Err(Error::ConnectionClosed(reason.clone()));
            }
            shared.handshake.mark_ready()?;
            std::mem::take(&mut shared.queued)
        };
        writer
            .encoder
            .set_compression(self.inner.local_init.enable_compression && peer_init.enable_compression);
        self.inner.state.send_replace(ConnectionState::Ready);

        tracing::info!(
            peer = %self.peer_name(),
            role = %self.role(),
            version = %peer_init.version,
            compression = writer.encoder.compression(),
            queued = queued.len(),
            "Connection established"
        );

        for (msg_type, payload) in queued {
            self.write_frame(&mut writer, msg_type, &payload).await?;
        }
        Ok(())
    }

    /// Pumps until `done` resolves.
    ///
    /// Whoever holds the reader lock dispatches every frame, including the
    /// one that resolves `done`, so waiting for the lock races against
    /// `done` itself. With a dedicated reader task nothing is pumped here.
    pub(crate) async fn drive<F>(&self, mut done: F) -> Result<F::Output>
    where
        F: Future + Unpin,
    {
        loop {
            if let Some(out) = (&mut done).now_or_never() {
                return Ok(out);
            }
            if self.has_reader() {
                return tokio::select! {
                    out = &mut done => Ok(out),
                    _ = self.inner.cancel.cancelled() => match (&mut done).now_or_never() {
                        Some(out) => Ok(out),
                        None => Err(self.closed_error()),
                    },
                };
            }

            let mut reader = tokio::select! {
                biased;
                out = &mut done => return Ok(out),
                guard = self.inner.reader.lock() => guard,
                _ = self.inner.cancel.cancelled() => {
                    return match (&mut done).now_or_never() {
                        Some(out) => Ok(out),
                        None => Err(self.closed_error()),
                    };
                }
            };

            if let Some(out) = (&mut done).now_or_never() {
                return Ok(out);
            }
            if let Err(err) = self.pump_locked(&mut reader, true).await {
                drop(reader);
                return match (&mut done).now_or_never() {
                    Some(out) => Ok(out),
                    None => Err(err),
                };
            }
        }
    }

    /// Waits until both INIT records have been exchanged.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.subscribe();
        let ready = Box::pin(async move {
            rx.wait_for(|s| matches!(s, ConnectionState::Ready | ConnectionState::Closed))
                .await
                .map(|s| *s)
        });
        match self.drive(ready).await? {
            Ok(ConnectionState::Ready) => Ok(()),
            _ => Err(self.closed_error()),
        }
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await
    }

    /// Closes the connection. Returns false if it was already closed.
    ///
    /// Queued sends are discarded, the owner's close hook runs, blocked
    /// pumpers are woken and the transport is shut down.
    pub fn close(&self, reason: &str) -> bool {
        {
            let mut shared = self.shared();
            if shared.closed.is_some() {
                return false;
            }
            shared.closed = Some(reason.to_string());
            shared.queued.clear();
        }
        tracing::info!(peer = %self.peer_name(), role = %self.role(), reason, "Connection terminated");

        if let Some(handler) = self.handler() {
            handler.on_close(reason);
        }
        self.inner.cancel.cancel();
        self.inner.state.send_replace(ConnectionState::Closed);
        self.shutdown_transport();
        true
    }

    fn shutdown_transport(&self) {
        match self.inner.writer.try_lock() {
            Ok(mut writer) => {
                let _ = writer.io.shutdown().now_or_never();
            }
            Err(_) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let inner = Arc::clone(&self.inner);
                    handle.spawn(async move {
                        let mut writer = inner.writer.lock().await;
                        let _ = writer.io.shutdown().await;
                    });
                }
            }
        }
    }
}
