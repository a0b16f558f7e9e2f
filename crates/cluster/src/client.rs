//! Calling side of a connection.
//!
//! Every outbound call gets the next request id and the garbage ids queued
//! since the previous call, both taken under the call-table lock together
//! with the record encoding. Responses are matched to their pending
//! completion by id, whatever order they arrive in.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::thread::ThreadId;
use std::time::Duration;

use futures_util::future::BoxFuture;
use protocol::{InitInfo, MessageType, Role, SharedKey};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::codec::{self, ReferenceHook};
use crate::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionOptions, FrameHandler, PeerInfo, Transport};
use crate::error::{Error, Result};
use crate::exception::{ErrorMode, ExceptionReporter, StderrReporter};
use crate::proxy::{ProxyInner, ProxyTypeRegistry, RemoteProxy};
use crate::record::{Outcome, RequestRecord, ThreadTarget};
use crate::value::{Kwargs, Value, WireRef};

/// Chooses the logical thread for calls that do not name one.
pub trait ThreadIdPolicy: Send + Sync {
    fn thread_for_current(&self) -> ThreadTarget;
}

/// Always the same logical thread. The default is thread 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedThread(pub ThreadTarget);

impl Default for FixedThread {
    fn default() -> Self {
        FixedThread(ThreadTarget::Id(0))
    }
}

impl ThreadIdPolicy for FixedThread {
    fn thread_for_current(&self) -> ThreadTarget {
        self.0
    }
}

/// One logical thread per calling OS thread, numbered from 1.
#[derive(Debug)]
pub struct PerOsThread {
    ids: Mutex<HashMap<ThreadId, u64>>,
    next: AtomicU64,
}

impl Default for PerOsThread {
    fn default() -> Self {
        Self {
            ids: Mutex::new(HashMap::new()),
            next: AtomicU64::new(1),
        }
    }
}

impl PerOsThread {
    /// Logical thread ids handed out so far.
    pub fn assigned(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .ids
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }
}

impl ThreadIdPolicy for PerOsThread {
    fn thread_for_current(&self) -> ThreadTarget {
        let mut ids = self.ids.lock().unwrap_or_else(|p| p.into_inner());
        let id = *ids
            .entry(std::thread::current().id())
            .or_insert_with(|| self.next.fetch_add(1, Ordering::Relaxed));
        ThreadTarget::Id(id)
    }
}

/// Per-call overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Logical thread; `None` asks the client's thread policy.
    pub thread: Option<ThreadTarget>,
    /// Error surfacing; `None` uses the configured mode.
    pub error_mode: Option<ErrorMode>,
}

impl CallOptions {
    pub fn on_thread(thread: ThreadTarget) -> Self {
        Self {
            thread: Some(thread),
            ..Self::default()
        }
    }

    pub fn with_error_mode(mut self, mode: ErrorMode) -> Self {
        self.error_mode = Some(mode);
        self
    }
}

type SuccessFn = Box<dyn FnOnce(Value) + Send>;
type ErrorFn = Box<dyn FnOnce(Error) + Send>;

enum Completion {
    Channel(oneshot::Sender<Result<Value>>),
    Callback {
        on_success: SuccessFn,
        on_error: ErrorFn,
    },
}

impl Completion {
    /// Delivers `result`. A panicking callback is logged and swallowed.
    fn complete(self, id: u64, result: Result<Value>) {
        match self {
            Completion::Channel(tx) => {
                let _ = tx.send(result);
            }
            Completion::Callback {
                on_success,
                on_error,
            } => {
                let ran = catch_unwind(AssertUnwindSafe(move || match result {
                    Ok(value) => on_success(value),
                    Err(err) => on_error(err),
                }));
                if ran.is_err() {
                    tracing::error!(request_id = id, "Completion callback panicked");
                }
            }
        }
    }
}

struct CallTable {
    next_id: u64,
    pending: HashMap<u64, Completion>,
    garbage: Vec<u64>,
    proxies: HashMap<u64, Weak<ProxyInner>>,
    types: ProxyTypeRegistry,
    closed: bool,
}

pub(crate) struct ClientInner {
    me: Weak<ClientInner>,
    conn: Connection,
    calls: Mutex<CallTable>,
    thread_policy: RwLock<Arc<dyn ThreadIdPolicy>>,
    reporter: RwLock<Arc<dyn ExceptionReporter>>,
    error_mode: ErrorMode,
    keep_alive_timeout: Option<Duration>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// Substitutes proxies on the calling side.
///
/// Every proxy produced while decoding is also pushed to `retained`, which
/// outlives the call-table guard, so no proxy is dropped while the table is
/// locked.
struct ClientHook<'a> {
    table: &'a mut CallTable,
    me: &'a Weak<ClientInner>,
    retained: &'a mut Vec<RemoteProxy>,
}

impl ReferenceHook for ClientHook<'_> {
    fn export(&mut self, value: &Value) -> Result<WireRef> {
        match value {
            Value::Proxy(proxy) => {
                if !proxy.is_connected() {
                    return Err(Error::ConnectionClosed(
                        "Connection has been closed".to_string(),
                    ));
                }
                if !proxy.belongs_to(self.me) {
                    return Err(Error::ForeignProxy {
                        object_id: proxy.object_id(),
                    });
                }
                Ok(WireRef::back(proxy.object_id()))
            }
            other => Err(Error::InvalidRecord(format!(
                "a client cannot export a local {}",
                other.kind_name()
            ))),
        }
    }

    fn import(&mut self, reference: WireRef) -> Result<Value> {
        let ptype = self.table.types.resolve(reference.type_id, reference.descriptor);
        // The server still holds this id, so an unsent release is stale.
        self.table.garbage.retain(|id| *id != reference.id);

        let existing = self
            .table
            .proxies
            .get(&reference.id)
            .and_then(Weak::upgrade)
            .map(RemoteProxy::from_inner);
        let proxy = match existing {
            Some(proxy) => proxy,
            None => {
                let proxy = RemoteProxy::new(reference.id, ptype, self.me.clone());
                self.table.proxies.insert(reference.id, proxy.downgrade());
                proxy
            }
        };
        self.retained.push(proxy.clone());
        Ok(Value::Proxy(proxy))
    }
}

fn collect_proxies(values: &[Value], out: &mut Vec<RemoteProxy>) {
    for value in values {
        match value {
            Value::Proxy(proxy) => out.push(proxy.clone()),
            Value::List(items) => collect_proxies(items, out),
            Value::Map(map) => {
                for item in map.values() {
                    collect_proxies(std::slice::from_ref(item), out)
                }
            }
            _ => {}
        }
    }
}

impl ClientInner {
    fn calls(&self) -> MutexGuard<'_, CallTable> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Called from a proxy's drop. Queues `id` as garbage only if the table
    /// still maps it to the dropping proxy.
    pub(crate) fn release_proxy(&self, id: u64, proxy: *const ProxyInner) {
        let mut table = self.calls();
        if table.closed {
            return;
        }
        let current = table
            .proxies
            .get(&id)
            .is_some_and(|weak| std::ptr::eq(weak.as_ptr(), proxy));
        if current {
            table.proxies.remove(&id);
            table.garbage.push(id);
            tracing::trace!(object_id = id, "Proxy released");
        }
    }

    /// Allocates an id, captures garbage and encodes the request, all under
    /// the call-table lock.
    fn register(
        &self,
        thread: ThreadTarget,
        target: u64,
        method: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        completion: Completion,
    ) -> Result<(u64, Vec<u8>)> {
        let mut retained = Vec::new();
        collect_proxies(&args, &mut retained);
        for value in kwargs.values() {
            collect_proxies(std::slice::from_ref(value), &mut retained);
        }
        let mut completion = Some(completion);

        let mut table = self.calls();
        if table.closed {
            return Err(Error::ConnectionClosed(
                "Connection has been closed".to_string(),
            ));
        }
        let id = table.next_id;
        let garbage = std::mem::take(&mut table.garbage);
        let record = RequestRecord::call(id, garbage.clone(), thread, target, method, args, kwargs);

        let encoded = {
            let mut hook = ClientHook {
                table: &mut *table,
                me: &self.me,
                retained: &mut retained,
            };
            codec::encode_request(self.conn.codec().as_ref(), &mut hook, record)
        };
        match encoded {
            Ok(payload) => {
                table.next_id += 1;
                if let Some(completion) = completion.take() {
                    table.pending.insert(id, completion);
                }
                tracing::debug!(
                    request_id = id,
                    thread = %thread,
                    target,
                    method,
                    garbage = garbage.len(),
                    "Sending request"
                );
                Ok((id, payload))
            }
            Err(err) => {
                table.garbage.splice(0..0, garbage);
                Err(err)
            }
        }
    }

    async fn transmit(&self, id: u64, payload: Vec<u8>) -> Result<()> {
        if let Err(err) = self.conn.send_message(MessageType::Request, payload).await {
            let completion = self.calls().pending.remove(&id);
            drop(completion);
            return Err(err);
        }
        Ok(())
    }

    fn error_mode(&self) -> ErrorMode {
        self.error_mode
    }

    fn reporter(&self) -> Arc<dyn ExceptionReporter> {
        Arc::clone(&self.reporter.read().unwrap_or_else(|p| p.into_inner()))
    }

    fn thread_policy(&self) -> Arc<dyn ThreadIdPolicy> {
        Arc::clone(&self.thread_policy.read().unwrap_or_else(|p| p.into_inner()))
    }
}

impl FrameHandler for ClientInner {
    fn on_init(&self, peer: &InitInfo) -> Result<()> {
        tracing::debug!(peer = %self.conn.peer_name(), version = %peer.version, "Server INIT received");
        Ok(())
    }

    fn on_request(&self, _payload: Vec<u8>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            tracing::warn!(peer = %self.conn.peer_name(), "Ignoring request sent to a client");
            Ok(())
        })
    }

    fn on_response(&self, payload: Vec<u8>) -> Result<()> {
        let mut retained = Vec::new();
        let (record, completion) = {
            let mut table = self.calls();
            let record = {
                let mut hook = ClientHook {
                    table: &mut *table,
                    me: &self.me,
                    retained: &mut retained,
                };
                codec::decode_response(self.conn.codec().as_ref(), &mut hook, &payload)?
            };
            let completion = table.pending.remove(&record.id);
            (record, completion)
        };
        // The decoded value now holds the only references the caller sees.
        drop(retained);

        let Some(completion) = completion else {
            tracing::warn!(request_id = record.id, "Response for unknown request id");
            return Ok(());
        };
        tracing::debug!(request_id = record.id, "Response received");
        let result = match record.outcome {
            Outcome::Value(value) => Ok(value),
            Outcome::Exception(exc) => Err(Error::RemoteException(exc)),
        };
        completion.complete(record.id, result);
        Ok(())
    }

    fn on_close(&self, reason: &str) {
        let (pending, proxies) = {
            let mut table = self.calls();
            table.closed = true;
            table.garbage.clear();
            let pending: Vec<(u64, Completion)> = table.pending.drain().collect();
            let proxies: Vec<Arc<ProxyInner>> = table
                .proxies
                .drain()
                .filter_map(|(_, weak)| weak.upgrade())
                .collect();
            (pending, proxies)
        };

        for proxy in &proxies {
            proxy.disconnect();
        }
        drop(proxies);

        let outstanding = pending.len();
        for (id, completion) in pending {
            completion.complete(id, Err(Error::ConnectionClosed(reason.to_string())));
        }
        if outstanding > 0 {
            tracing::debug!(outstanding, reason, "Resolved outstanding requests on close");
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.conn.close("Client dropped");
        if let Some(reader) = self.reader.get_mut().ok().and_then(Option::take) {
            reader.abort();
        }
    }
}

/// A connection to a server, seen from the calling side.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("connection", &self.inner.conn)
            .finish()
    }
}

impl Client {
    /// Wraps a connected transport and sends the opening challenge.
    pub async fn new(
        transport: impl Transport,
        key: &SharedKey,
        config: &ConnectionConfig,
    ) -> Result<Self> {
        Self::with_peer(transport, key, PeerInfo::named("server"), config).await
    }

    /// Like [`Client::new`] with explicit peer details.
    pub async fn with_peer(
        transport: impl Transport,
        key: &SharedKey,
        peer: PeerInfo,
        config: &ConnectionConfig,
    ) -> Result<Self> {
        let options = ConnectionOptions {
            local_init: InitInfo::client(
                config.definitions_module.clone(),
                config.keep_alive_interval_secs,
                config.enable_compression,
            ),
            codec: config.codec.build(),
            queue_before_ready: config.queue_before_ready,
            max_frame_size: config.max_frame_size,
        };
        let conn = Connection::new(transport, key, Role::Client, peer, options);

        let inner = Arc::new_cyclic(|me| ClientInner {
            me: me.clone(),
            conn: conn.clone(),
            calls: Mutex::new(CallTable {
                next_id: 1,
                pending: HashMap::new(),
                garbage: Vec::new(),
                proxies: HashMap::new(),
                types: ProxyTypeRegistry::default(),
                closed: false,
            }),
            thread_policy: RwLock::new(Arc::new(FixedThread::default())),
            reporter: RwLock::new(Arc::new(StderrReporter)),
            error_mode: config.error_mode,
            keep_alive_timeout: config.keep_alive_timeout(),
            reader: Mutex::new(None),
        });
        let handler: Weak<dyn FrameHandler> = Arc::downgrade(&inner) as Weak<_>;
        conn.attach(handler);
        conn.start().await?;
        Ok(Self { inner })
    }

    /// Client over an accepted or connected TCP stream.
    pub async fn from_tcp(
        stream: TcpStream,
        key: &SharedKey,
        config: &ConnectionConfig,
    ) -> Result<Self> {
        let peer = tcp_peer(&stream);
        stream.set_nodelay(true).map_err(protocol::ProtocolError::from)?;
        Self::with_peer(stream, key, peer, config).await
    }

    /// Connects to `addr` over TCP.
    pub async fn connect(
        addr: impl ToSocketAddrs,
        key: &SharedKey,
        config: &ConnectionConfig,
    ) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(protocol::ProtocolError::from)?;
        Self::from_tcp(stream, key, config).await
    }

    pub(crate) fn from_inner(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.conn
    }

    pub fn peer_name(&self) -> &str {
        self.inner.conn.peer_name()
    }

    pub fn raw_fd(&self) -> Option<i32> {
        self.inner.conn.raw_fd()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.conn.is_ready()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.conn.is_closed()
    }

    /// Protocol version the server announced.
    pub fn server_version(&self) -> Option<String> {
        self.inner.conn.peer_version()
    }

    pub fn error_mode(&self) -> ErrorMode {
        self.inner.error_mode()
    }

    pub fn set_thread_policy(&self, policy: Arc<dyn ThreadIdPolicy>) {
        *self
            .inner
            .thread_policy
            .write()
            .unwrap_or_else(|p| p.into_inner()) = policy;
    }

    pub fn set_reporter(&self, reporter: Arc<dyn ExceptionReporter>) {
        *self.inner.reporter.write().unwrap_or_else(|p| p.into_inner()) = reporter;
    }

    /// Number of calls still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner.calls().pending.len()
    }

    /// Number of live proxies registered on this connection.
    pub fn proxy_count(&self) -> usize {
        self.inner
            .calls()
            .proxies
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Proxy for the server's root object.
    pub fn root(&self) -> RemoteProxy {
        let ptype = self.inner.calls().types.dynamic();
        RemoteProxy::new(0, ptype, self.inner.me.clone())
    }

    /// Single entry point for outbound calls.
    pub async fn send_request(
        &self,
        target: u64,
        method: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        options: CallOptions,
    ) -> Result<PendingCall> {
        let thread = options
            .thread
            .unwrap_or_else(|| self.inner.thread_policy().thread_for_current());
        let (tx, rx) = oneshot::channel();
        let (id, payload) =
            self.inner
                .register(thread, target, method, args, kwargs, Completion::Channel(tx))?;
        self.inner.transmit(id, payload).await?;
        Ok(PendingCall {
            id,
            rx,
            client: self.clone(),
            error_mode: options.error_mode.unwrap_or(self.inner.error_mode),
            outcome: None,
        })
    }

    /// Issues a call whose result is delivered to callbacks from whichever
    /// task dispatches the response. Returns the request id.
    #[allow(clippy::too_many_arguments)]
    pub async fn send_request_with_callback<S, E>(
        &self,
        target: u64,
        method: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        thread: Option<ThreadTarget>,
        on_success: S,
        on_error: E,
    ) -> Result<u64>
    where
        S: FnOnce(Value) + Send + 'static,
        E: FnOnce(Error) + Send + 'static,
    {
        let thread = thread.unwrap_or_else(|| self.inner.thread_policy().thread_for_current());
        let completion = Completion::Callback {
            on_success: Box::new(on_success),
            on_error: Box::new(on_error),
        };
        let (id, payload) = self
            .inner
            .register(thread, target, method, args, kwargs, completion)?;
        self.inner.transmit(id, payload).await?;
        Ok(id)
    }

    fn function_args(func: &str, args: Vec<Value>) -> Vec<Value> {
        let mut all = Vec::with_capacity(args.len() + 1);
        all.push(Value::from(func));
        all.extend(args);
        all
    }

    /// Calls a server function and waits for its result.
    pub async fn call(&self, func: &str, args: Vec<Value>, kwargs: Kwargs) -> Result<Value> {
        self.call_nonblocking(func, args, kwargs).await?.wait().await
    }

    /// Calls a server function without waiting.
    pub async fn call_nonblocking(
        &self,
        func: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<PendingCall> {
        self.send_request(
            0,
            "call",
            Self::function_args(func, args),
            kwargs,
            CallOptions::default(),
        )
        .await
    }

    /// Calls a server function, delivering the outcome to callbacks.
    pub async fn call_with_callback<S, E>(
        &self,
        func: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        on_success: S,
        on_error: E,
    ) -> Result<u64>
    where
        S: FnOnce(Value) + Send + 'static,
        E: FnOnce(Error) + Send + 'static,
    {
        self.send_request_with_callback(
            0,
            "call",
            Self::function_args(func, args),
            kwargs,
            None,
            on_success,
            on_error,
        )
        .await
    }

    pub async fn get_global(&self, name: &str) -> Result<Value> {
        self.send_request(0, "get_global", vec![Value::from(name)], Kwargs::new(), CallOptions::default())
            .await?
            .wait()
            .await
    }

    pub async fn set_global(&self, name: &str, value: Value) -> Result<()> {
        self.send_request(
            0,
            "set_global",
            vec![Value::from(name), value],
            Kwargs::new(),
            CallOptions::default(),
        )
        .await?
        .wait()
        .await?;
        Ok(())
    }

    /// Retires a logical thread on the server once its queue drains.
    pub async fn stop_remote_thread(&self, thread: u64) -> Result<()> {
        let payload = self
            .inner
            .conn
            .codec()
            .encode_request(&RequestRecord::terminate(thread))?;
        tracing::debug!(thread, "Stopping remote thread");
        self.inner
            .conn
            .send_message(MessageType::Request, payload)
            .await
    }

    /// Advances the connection. See [`Connection::pump`].
    pub async fn pump(&self, block: bool) -> Result<bool> {
        self.inner.conn.pump(block).await
    }

    pub async fn wait_ready(&self) -> Result<()> {
        self.inner.conn.wait_ready().await
    }

    /// Starts a task that pumps the connection until it closes. Waiting
    /// calls then only await their completion. Returns false if a reader
    /// is already running.
    ///
    /// When keep-alives were requested the reader closes the connection
    /// after the configured timeout without any frame.
    pub fn spawn_reader(&self) -> bool {
        let mut slot = self.inner.reader.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() {
            return false;
        }
        let conn = self.inner.conn.clone();
        conn.set_has_reader(true);
        *slot = Some(tokio::spawn(read_loop(conn, self.inner.keep_alive_timeout)));
        true
    }

    /// Closes the connection, failing outstanding calls and proxies.
    pub fn close(&self) {
        self.inner.conn.close("Connection closed by client");
    }
}

async fn read_loop(conn: Connection, timeout: Option<Duration>) {
    loop {
        let pumped = match timeout {
            Some(limit) => match tokio::time::timeout(limit, conn.pump(true)).await {
                Ok(pumped) => pumped,
                Err(_) => {
                    tracing::warn!(peer = %conn.peer_name(), "Remote server not responding");
                    conn.close("Remote server not responding");
                    return;
                }
            },
            None => conn.pump(true).await,
        };
        if let Err(err) = pumped {
            if !err.is_closed() {
                tracing::warn!(peer = %conn.peer_name(), error = %err, "Reader stopped");
            }
            conn.close(&err.to_string());
            return;
        }
    }
}

pub(crate) fn tcp_peer(stream: &TcpStream) -> PeerInfo {
    let name = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    #[cfg(unix)]
    let raw_fd = {
        use std::os::unix::io::AsRawFd;
        Some(stream.as_raw_fd())
    };
    #[cfg(not(unix))]
    let raw_fd = None;
    PeerInfo { name, raw_fd }
}

/// A call whose response has not been consumed yet.
pub struct PendingCall {
    id: u64,
    rx: oneshot::Receiver<Result<Value>>,
    client: Client,
    error_mode: ErrorMode,
    outcome: Option<Result<Value>>,
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("id", &self.id)
            .field("error_mode", &self.error_mode)
            .field("resolved", &self.outcome.is_some())
            .finish()
    }
}

impl PendingCall {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Socket descriptor to poll for readiness before calling
    /// [`PendingCall::read_response`].
    pub fn raw_fd(&self) -> Option<i32> {
        self.client.raw_fd()
    }

    /// True once the response has been dispatched. Never reads.
    pub fn has_response(&mut self) -> bool {
        if self.outcome.is_some() {
            return true;
        }
        match self.rx.try_recv() {
            Ok(result) => {
                self.outcome = Some(result);
                true
            }
            Err(oneshot::error::TryRecvError::Empty) => false,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.outcome = Some(Err(Error::ConnectionClosed(
                    "Connection has been closed".to_string(),
                )));
                true
            }
        }
    }

    /// Pumps the connection once (or until resolved when `block` is set)
    /// and reports whether the response is now available.
    pub async fn read_response(&mut self, block: bool) -> Result<bool> {
        if self.has_response() {
            return Ok(true);
        }
        if block {
            let result = self.resolve().await;
            self.outcome = Some(result);
            return Ok(true);
        }
        self.client.pump(false).await?;
        Ok(self.has_response())
    }

    async fn resolve(&mut self) -> Result<Value> {
        match self.client.inner.conn.drive(&mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::ConnectionClosed(
                "Connection has been closed".to_string(),
            )),
            Err(err) => Err(err),
        }
    }

    /// Waits for the result using the call's error mode.
    pub async fn wait(self) -> Result<Value> {
        let mode = self.error_mode;
        self.wait_with(mode).await
    }

    /// Waits for the result, surfacing a remote exception per `mode`.
    pub async fn wait_with(mut self, mode: ErrorMode) -> Result<Value> {
        let result = match self.outcome.take() {
            Some(result) => result,
            None => self.resolve().await,
        };
        match result {
            Err(Error::RemoteException(exc)) => match mode {
                ErrorMode::Original => {
                    self.client
                        .inner
                        .reporter()
                        .report(self.client.peer_name(), &exc);
                    Err(Error::Remote(exc.error))
                }
                ErrorMode::Quiet => Err(Error::Remote(exc.error)),
                ErrorMode::Wrapped => Err(Error::RemoteException(exc)),
            },
            other => other,
        }
    }
}
