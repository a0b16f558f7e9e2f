//! Serving side of a connection.
//!
//! A server answers the client's INIT by selecting a definitions module,
//! then executes each request against its object table. Object 0 is the
//! root object: it dispatches registered functions, globals and attribute
//! access on other exported objects. Objects returned to the client are
//! entered into the table and stay alive until the client reports their
//! proxies as garbage.

mod registry;
mod threads;

pub use registry::{Definitions, ExportRegistry, ExportedFn};
pub use threads::{Job, LogicalThreads};

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;

use futures_util::future::BoxFuture;
use protocol::{InitInfo, MessageType, ProtocolError, Role, SharedKey};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::client::tcp_peer;
use crate::codec::{self, ReferenceHook};
use crate::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionOptions, FrameHandler, PeerInfo, Transport};
use crate::error::{Error, Result};
use crate::exception::{RemoteError, RemoteException};
use crate::object::{LocalObject, RemoteObject};
use crate::record::{Outcome, RequestRecord, ResponseRecord, ThreadTarget};
use crate::value::{Kwargs, TypeDescriptor, Value, WireRef};

/// Object id of the root object.
pub const ROOT_ID: u64 = 0;

/// The root object of a connection.
///
/// Methods:
/// - `call(name, *args, **kwargs)`: run a registered function
/// - `get_global(name)` / `set_global(name, value)`
/// - `getattr(obj, name)`, `setattr(obj, name, value)`, `delattr(obj, name)`
/// - `getmethod(obj, name)`: `[true, nil]` for a method, otherwise
///   `[false, value]` with the attribute value
struct RootObject {
    registry: Arc<ExportRegistry>,
}

fn arg_str(args: &[Value], index: usize, method: &str) -> std::result::Result<String, RemoteError> {
    args.get(index)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            RemoteError::type_error(format!("{}() argument {} must be a string", method, index))
        })
}

fn arg_object(args: &[Value], method: &str) -> std::result::Result<LocalObject, RemoteError> {
    args.first()
        .and_then(Value::as_local)
        .cloned()
        .ok_or_else(|| RemoteError::type_error(format!("{}() needs an object argument", method)))
}

impl RemoteObject for RootObject {
    fn call_method(
        &self,
        method: &str,
        mut args: Vec<Value>,
        kwargs: Kwargs,
    ) -> std::result::Result<Value, RemoteError> {
        match method {
            "call" => {
                let name = arg_str(&args, 0, method)?;
                args.remove(0);
                self.registry.call(&name, args, kwargs)
            }
            "get_global" => self.registry.get_global(&arg_str(&args, 0, method)?),
            "set_global" => {
                let name = arg_str(&args, 0, method)?;
                let value = args.into_iter().nth(1).unwrap_or_default();
                self.registry.set_global(name, value);
                Ok(Value::Nil)
            }
            "getattr" => arg_object(&args, method)?.get_attr(&arg_str(&args, 1, method)?),
            "setattr" => {
                let object = arg_object(&args, method)?;
                let name = arg_str(&args, 1, method)?;
                let value = args.into_iter().nth(2).unwrap_or_default();
                object.set_attr(&name, value)?;
                Ok(Value::Nil)
            }
            "delattr" => {
                arg_object(&args, method)?.del_attr(&arg_str(&args, 1, method)?)?;
                Ok(Value::Nil)
            }
            "getmethod" => {
                let object = arg_object(&args, method)?;
                let name = arg_str(&args, 1, method)?;
                if object.has_method(&name) {
                    Ok(Value::List(vec![Value::Bool(true), Value::Nil]))
                } else {
                    let value = object.get_attr(&name)?;
                    Ok(Value::List(vec![Value::Bool(false), value]))
                }
            }
            other => Err(RemoteError::attribute_error(other)),
        }
    }

    fn has_method(&self, name: &str) -> bool {
        matches!(
            name,
            "call" | "get_global" | "set_global" | "getattr" | "setattr" | "delattr" | "getmethod"
        )
    }
}

/// Objects exported to the client, by id.
#[derive(Default)]
struct LocalTable {
    next_id: u64,
    objects: HashMap<u64, LocalObject>,
    by_addr: HashMap<usize, u64>,
    types: HashMap<TypeDescriptor, u64>,
    next_type_id: u64,
}

impl LocalTable {
    fn new() -> Self {
        Self {
            next_id: 1,
            next_type_id: 1,
            ..Self::default()
        }
    }

    fn remove(&mut self, id: u64) -> Option<LocalObject> {
        let object = self.objects.remove(&id)?;
        self.by_addr.remove(&object.addr());
        Some(object)
    }
}

/// Substitutes objects on the serving side.
///
/// Ids and type ids handed out while encoding are remembered so that a
/// record that fails to encode leaves the table as it was.
struct ServerHook<'a> {
    table: &'a mut LocalTable,
    root: Option<&'a LocalObject>,
    new_objects: Vec<u64>,
    new_types: Vec<TypeDescriptor>,
}

impl<'a> ServerHook<'a> {
    fn new(table: &'a mut LocalTable, root: Option<&'a LocalObject>) -> Self {
        Self {
            table,
            root,
            new_objects: Vec::new(),
            new_types: Vec::new(),
        }
    }

    /// Undoes this hook's exports. Returns the removed objects so they can
    /// be dropped after the table lock is released.
    fn rollback(self) -> Vec<LocalObject> {
        for descriptor in &self.new_types {
            self.table.types.remove(descriptor);
        }
        self.new_objects
            .iter()
            .filter_map(|id| self.table.remove(*id))
            .collect()
    }

    fn type_ref(&mut self, id: u64, object: &LocalObject) -> WireRef {
        let descriptor = object.descriptor();
        match self.table.types.get(&descriptor) {
            Some(type_id) => WireRef {
                id,
                type_id: Some(*type_id),
                descriptor: None,
            },
            None => {
                let type_id = self.table.next_type_id;
                self.table.next_type_id += 1;
                self.table.types.insert(descriptor.clone(), type_id);
                self.new_types.push(descriptor.clone());
                WireRef {
                    id,
                    type_id: Some(type_id),
                    descriptor: Some(descriptor),
                }
            }
        }
    }
}

impl ReferenceHook for ServerHook<'_> {
    fn export(&mut self, value: &Value) -> Result<WireRef> {
        let object = match value {
            Value::Local(object) => object,
            other => {
                return Err(Error::InvalidRecord(format!(
                    "a server cannot export a {}",
                    other.kind_name()
                )))
            }
        };
        if self.root.is_some_and(|root| root == object) {
            return Ok(self.type_ref(ROOT_ID, object));
        }
        let id = match self.table.by_addr.get(&object.addr()) {
            Some(id) => *id,
            None => {
                let id = self.table.next_id;
                self.table.next_id += 1;
                self.table.objects.insert(id, object.clone());
                self.table.by_addr.insert(object.addr(), id);
                self.new_objects.push(id);
                id
            }
        };
        Ok(self.type_ref(id, object))
    }

    fn import(&mut self, reference: WireRef) -> Result<Value> {
        if reference.id == ROOT_ID {
            if let Some(root) = self.root {
                return Ok(Value::Local(root.clone()));
            }
        }
        self.table
            .objects
            .get(&reference.id)
            .cloned()
            .map(Value::Local)
            .ok_or_else(|| Error::InvalidRecord(format!("unknown object id {}", reference.id)))
    }
}

pub(crate) struct ServerInner {
    me: Weak<ServerInner>,
    conn: Connection,
    definitions: Arc<Definitions>,
    root: OnceLock<LocalObject>,
    objects: Mutex<LocalTable>,
    threads: LogicalThreads,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    // Responses are encoded and written under this lock so that a type
    // descriptor always reaches the client before any bare reference to
    // its type id.
    send_lock: tokio::sync::Mutex<()>,
}

impl ServerInner {
    fn objects(&self) -> MutexGuard<'_, LocalTable> {
        self.objects.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lookup(&self, id: u64) -> Option<LocalObject> {
        if id == ROOT_ID {
            return self.root.get().cloned();
        }
        self.objects().objects.get(&id).cloned()
    }

    fn free_garbage(&self, garbage: &[u64]) {
        if garbage.is_empty() {
            return;
        }
        let freed: Vec<LocalObject> = {
            let mut table = self.objects();
            garbage
                .iter()
                .filter(|id| **id != ROOT_ID)
                .filter_map(|id| table.remove(*id))
                .collect()
        };
        tracing::debug!(requested = garbage.len(), freed = freed.len(), "Released objects");
    }

    /// Resolves the references in a decoded request.
    fn internalize(&self, record: &mut RequestRecord) -> Result<()> {
        let mut table = self.objects();
        let mut hook = ServerHook::new(&mut table, self.root.get());
        record.args = std::mem::take(&mut record.args)
            .into_iter()
            .map(|v| codec::internalize(v, &mut hook))
            .collect::<Result<_>>()?;
        record.kwargs = std::mem::take(&mut record.kwargs)
            .into_iter()
            .map(|(k, v)| Ok((k, codec::internalize(v, &mut hook)?)))
            .collect::<Result<_>>()?;
        Ok(())
    }

    fn encode_response(&self, record: ResponseRecord) -> Result<Vec<u8>> {
        let (encoded, discarded) = {
            let mut table = self.objects();
            let mut hook = ServerHook::new(&mut table, self.root.get());
            match codec::encode_response(self.conn.codec().as_ref(), &mut hook, record) {
                Ok(payload) => (Ok(payload), Vec::new()),
                Err(err) => (Err(err), hook.rollback()),
            }
        };
        drop(discarded);
        encoded
    }

    async fn send_response(&self, id: u64, target: u64, method: &str, outcome: Outcome) {
        let _guard = self.send_lock.lock().await;
        let payload = match self.encode_response(ResponseRecord { id, outcome }) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(request_id = id, error = %err, "Result could not be encoded");
                let exc = RemoteException::capture(RemoteError::type_error(err.to_string()), target, method);
                match self.encode_response(codec::exception_response(id, exc)) {
                    Ok(payload) => payload,
                    Err(err) => {
                        tracing::error!(request_id = id, error = %err, "Dropping response");
                        return;
                    }
                }
            }
        };
        if let Err(err) = self.conn.send_message(MessageType::Response, payload).await {
            tracing::debug!(request_id = id, error = %err, "Response not sent");
        }
    }

    async fn execute(self: Arc<Self>, record: RequestRecord) {
        let target = record.target.unwrap_or(ROOT_ID);
        let method = record.method.unwrap_or_default();
        tracing::debug!(request_id = ?record.id, target, method = %method, "Executing request");

        let result = match self.lookup(target) {
            Some(object) => {
                let name = method.clone();
                let (args, kwargs) = (record.args, record.kwargs);
                match tokio::task::spawn_blocking(move || object.call_method(&name, args, kwargs))
                    .await
                {
                    Ok(result) => result,
                    Err(err) => Err(RemoteError::new("Panic", err.to_string())),
                }
            }
            None => Err(RemoteError::new(
                "ReferenceError",
                format!("no object with id {}", target),
            )),
        };

        let outcome = match result {
            Ok(value) => Outcome::Value(value),
            Err(err) => {
                tracing::debug!(target, method = %method, error = %err, "Request raised");
                Outcome::Exception(RemoteException::capture(err, target, &method))
            }
        };
        if let Some(id) = record.id {
            self.send_response(id, target, &method, outcome).await;
        }
    }

    fn start_keepalive(&self, interval: Duration) {
        let conn = self.conn.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if conn.send_message(MessageType::Keepalive, Vec::new()).await.is_err() {
                            return;
                        }
                    }
                    _ = conn.closed() => return,
                }
            }
        });
        let previous = self
            .keepalive
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }
}

impl FrameHandler for ServerInner {
    fn on_init(&self, peer: &InitInfo) -> Result<()> {
        let module = peer.definitions_module.as_deref().unwrap_or_default();
        let registry = self.definitions.get(module).ok_or_else(|| {
            ProtocolError::HandshakeFailed(format!("Unknown definitions module: {}", module))
        })?;
        let _ = self.root.set(LocalObject::new(RootObject { registry }));

        if let Some(secs) = peer.keep_alive_interval.filter(|secs| *secs > 0) {
            self.start_keepalive(Duration::from_secs(secs));
        }
        tracing::debug!(
            peer = %self.conn.peer_name(),
            module,
            keep_alive = ?peer.keep_alive_interval,
            "Client INIT accepted"
        );
        Ok(())
    }

    fn on_request(&self, payload: Vec<u8>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            // An undecodable request cannot be answered; the connection ends.
            let mut record = self.conn.codec().decode_request(&payload)?;
            self.free_garbage(&record.garbage);

            if record.is_termination() {
                if let ThreadTarget::Id(thread) = record.thread {
                    tracing::debug!(thread, "Stopping logical thread");
                    self.threads.stop(thread);
                }
                return Ok(());
            }

            if let Err(err) = self.internalize(&mut record) {
                let target = record.target.unwrap_or(ROOT_ID);
                let method = record.method.clone().unwrap_or_default();
                tracing::warn!(error = %err, "Request references an unknown object");
                if let Some(id) = record.id {
                    let exc = RemoteException::capture(
                        RemoteError::new("ReferenceError", err.to_string()),
                        target,
                        &method,
                    );
                    self.send_response(id, target, &method, Outcome::Exception(exc))
                        .await;
                }
                return Ok(());
            }

            let Some(this) = self.me.upgrade() else {
                return Ok(());
            };
            match record.thread {
                ThreadTarget::Inline => this.execute(record).await,
                ThreadTarget::Single => {
                    tokio::spawn(this.execute(record));
                }
                ThreadTarget::Id(thread) => self.threads.submit(thread, Box::pin(this.execute(record))),
            }
            Ok(())
        })
    }

    fn on_response(&self, _payload: Vec<u8>) -> Result<()> {
        tracing::warn!(peer = %self.conn.peer_name(), "Ignoring response sent to a server");
        Ok(())
    }

    fn on_close(&self, _reason: &str) {
        self.threads.close_all();
        if let Some(task) = self.keepalive.lock().unwrap_or_else(|p| p.into_inner()).take() {
            task.abort();
        }
        let released = std::mem::replace(&mut *self.objects(), LocalTable::new());
        drop(released);
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        self.conn.close("Server dropped");
        if let Some(task) = self.keepalive.get_mut().ok().and_then(Option::take) {
            task.abort();
        }
    }
}

/// A connection to a client, seen from the serving side.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("connection", &self.inner.conn)
            .finish()
    }
}

impl Server {
    /// Wraps an accepted transport. Nothing happens until [`Server::run`].
    pub fn new(
        transport: impl Transport,
        key: &SharedKey,
        definitions: Arc<Definitions>,
        config: &ConnectionConfig,
    ) -> Self {
        Self::with_peer(transport, key, PeerInfo::named("client"), definitions, config)
    }

    /// Like [`Server::new`] with explicit peer details.
    pub fn with_peer(
        transport: impl Transport,
        key: &SharedKey,
        peer: PeerInfo,
        definitions: Arc<Definitions>,
        config: &ConnectionConfig,
    ) -> Self {
        let options = ConnectionOptions {
            local_init: InitInfo::server(config.enable_compression),
            codec: config.codec.build(),
            queue_before_ready: config.queue_before_ready,
            max_frame_size: config.max_frame_size,
        };
        let conn = Connection::new(transport, key, Role::Server, peer, options);

        let inner = Arc::new_cyclic(|me| ServerInner {
            me: me.clone(),
            conn: conn.clone(),
            definitions,
            root: OnceLock::new(),
            objects: Mutex::new(LocalTable::new()),
            threads: LogicalThreads::new(),
            keepalive: Mutex::new(None),
            send_lock: tokio::sync::Mutex::new(()),
        });
        let handler: Weak<dyn FrameHandler> = Arc::downgrade(&inner) as Weak<_>;
        conn.attach(handler);
        Self { inner }
    }

    /// Server over an accepted TCP stream.
    pub fn from_tcp(
        stream: TcpStream,
        key: &SharedKey,
        definitions: Arc<Definitions>,
        config: &ConnectionConfig,
    ) -> Result<Self> {
        let peer = tcp_peer(&stream);
        stream.set_nodelay(true).map_err(ProtocolError::from)?;
        Ok(Self::with_peer(stream, key, peer, definitions, config))
    }

    /// Sends the opening challenge and serves requests until the
    /// connection closes. Waits for logical threads to drain before
    /// returning. A connection closed by the peer or locally is not an
    /// error.
    pub async fn run(&self) -> Result<()> {
        let served = serve(&self.inner.conn).await;
        self.inner.threads.close_all();
        self.inner.threads.join().await;
        match served {
            Err(err) if !err.is_closed() => Err(err),
            _ => Ok(()),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.conn
    }

    pub fn peer_name(&self) -> &str {
        self.inner.conn.peer_name()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.conn.is_ready()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.conn.is_closed()
    }

    /// Objects currently exported to the client, the root excluded.
    pub fn object_count(&self) -> usize {
        self.inner.objects().objects.len()
    }

    /// Logical threads currently running.
    pub fn thread_count(&self) -> usize {
        self.inner.threads.len()
    }

    pub fn close(&self) {
        self.inner.conn.close("Connection closed by server");
    }
}

async fn serve(conn: &Connection) -> Result<()> {
    conn.start().await?;
    let err = loop {
        if let Err(err) = conn.pump(true).await {
            break err;
        }
    };
    if !err.is_closed() {
        tracing::warn!(peer = %conn.peer_name(), error = %err, "Serving stopped");
    }
    conn.close(&err.to_string());
    Err(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Exports;

    struct Counter;

    impl RemoteObject for Counter {
        fn descriptor(&self) -> TypeDescriptor {
            TypeDescriptor::Exports(Exports::new(&["incr"], &["value"], &[]))
        }

        fn call_method(
            &self,
            method: &str,
            _args: Vec<Value>,
            _kwargs: Kwargs,
        ) -> std::result::Result<Value, RemoteError> {
            Err(RemoteError::attribute_error(method))
        }

        fn get_attr(&self, name: &str) -> std::result::Result<Value, RemoteError> {
            match name {
                "value" => Ok(Value::Int(3)),
                _ => Err(RemoteError::attribute_error(name)),
            }
        }

        fn has_method(&self, name: &str) -> bool {
            name == "incr"
        }
    }

    fn root() -> RootObject {
        RootObject {
            registry: Arc::new(
                ExportRegistry::new()
                    .function("add", |args, _| {
                        let sum = args.iter().filter_map(Value::as_int).sum::<i64>();
                        Ok(Value::Int(sum))
                    })
                    .global("greeting", Value::from("hi")),
            ),
        }
    }

    #[test]
    fn test_root_call_and_globals() {
        let root = root();
        let sum = root
            .call_method("call", vec![Value::from("add"), Value::Int(2), Value::Int(5)], Kwargs::new())
            .unwrap();
        assert_eq!(sum, Value::Int(7));

        root.call_method("set_global", vec![Value::from("x"), Value::Int(1)], Kwargs::new())
            .unwrap();
        let x = root
            .call_method("get_global", vec![Value::from("x")], Kwargs::new())
            .unwrap();
        assert_eq!(x, Value::Int(1));

        let err = root.call_method("nope", vec![], Kwargs::new()).unwrap_err();
        assert!(err.is_attribute_error());
        let err = root.call_method("call", vec![Value::Int(1)], Kwargs::new()).unwrap_err();
        assert_eq!(err.kind, "TypeError");
    }

    #[test]
    fn test_root_attribute_access() {
        let root = root();
        let counter = Value::Local(LocalObject::new(Counter));

        let value = root
            .call_method("getattr", vec![counter.clone(), Value::from("value")], Kwargs::new())
            .unwrap();
        assert_eq!(value, Value::Int(3));

        let method = root
            .call_method("getmethod", vec![counter.clone(), Value::from("incr")], Kwargs::new())
            .unwrap();
        assert_eq!(method, Value::List(vec![Value::Bool(true), Value::Nil]));

        let attr = root
            .call_method("getmethod", vec![counter.clone(), Value::from("value")], Kwargs::new())
            .unwrap();
        assert_eq!(attr, Value::List(vec![Value::Bool(false), Value::Int(3)]));

        let err = root
            .call_method("setattr", vec![counter, Value::from("value"), Value::Int(4)], Kwargs::new())
            .unwrap_err();
        assert!(err.is_attribute_error());
    }

    #[test]
    fn test_export_reuses_ids_and_sends_descriptor_once() {
        let mut table = LocalTable::new();
        let a = LocalObject::new(Counter);
        let b = LocalObject::new(Counter);
        let mut hook = ServerHook::new(&mut table, None);

        let first = hook.export(&Value::Local(a.clone())).unwrap();
        assert_eq!(first.id, 1);
        assert!(first.descriptor.is_some());

        let again = hook.export(&Value::Local(a)).unwrap();
        assert_eq!(again.id, 1);
        assert!(again.descriptor.is_none());

        let other = hook.export(&Value::Local(b)).unwrap();
        assert_eq!(other.id, 2);
        assert_eq!(other.type_id, first.type_id);
        assert!(other.descriptor.is_none());
        assert_eq!(table.objects.len(), 2);
    }

    #[test]
    fn test_rollback_forgets_new_exports() {
        let mut table = LocalTable::new();
        let kept = LocalObject::new(Counter);
        ServerHook::new(&mut table, None)
            .export(&Value::Local(kept))
            .unwrap();

        let mut hook = ServerHook::new(&mut table, None);
        hook.export(&Value::Local(LocalObject::new(Counter))).unwrap();
        hook.export(&Value::Local(LocalObject::new(RootObject {
            registry: Arc::new(ExportRegistry::new()),
        })))
        .unwrap();
        let removed = hook.rollback();

        assert_eq!(removed.len(), 2);
        assert_eq!(table.objects.len(), 1);
        assert_eq!(table.by_addr.len(), 1);
        assert_eq!(table.types.len(), 1);
    }

    #[test]
    fn test_import_resolves_root_and_table() {
        let mut table = LocalTable::new();
        let root = LocalObject::new(root());
        let object = LocalObject::new(Counter);
        table.objects.insert(4, object.clone());

        let mut hook = ServerHook::new(&mut table, Some(&root));
        assert_eq!(hook.import(WireRef::back(ROOT_ID)).unwrap(), Value::Local(root.clone()));
        assert_eq!(hook.import(WireRef::back(4)).unwrap(), Value::Local(object));
        assert!(matches!(
            hook.import(WireRef::back(9)),
            Err(Error::InvalidRecord(_))
        ));
        assert!(hook.export(&Value::Int(1)).is_err());
    }
}
