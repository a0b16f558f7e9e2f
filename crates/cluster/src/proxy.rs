//! Client-side handles to objects living on the server.
//!
//! A [`RemoteProxy`] names a remote object by id and carries the capability
//! table of its type. Clones share one identity; when the last clone drops,
//! the id is queued as garbage and piggybacked on the next request.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use crate::client::{CallOptions, Client, ClientInner, PendingCall};
use crate::error::{Error, Result};
use crate::exception::ErrorMode;
use crate::value::{Exported, Exports, Kwargs, TypeDescriptor, Value};

/// Resolved capabilities of a remote type.
#[derive(Debug, PartialEq, Eq)]
pub struct ProxyType {
    descriptor: TypeDescriptor,
    exports: Exports,
}

impl ProxyType {
    fn new(descriptor: TypeDescriptor, exports: Exports) -> Self {
        Self {
            descriptor,
            exports,
        }
    }

    /// The descriptor as received from the server.
    pub fn descriptor(&self) -> &TypeDescriptor {
        &self.descriptor
    }

    pub fn exports(&self) -> &Exports {
        &self.exports
    }

    /// True when members are only discovered by asking the server.
    pub fn is_dynamic(&self) -> bool {
        self.exports.methods == Exported::All
    }
}

/// Well-known proxy classes, named instead of described inline.
#[derive(Debug, Clone)]
pub struct ProxyClassRegistry {
    classes: HashMap<String, Exports>,
}

impl Default for ProxyClassRegistry {
    fn default() -> Self {
        let mut registry = Self {
            classes: HashMap::new(),
        };
        registry.register("iterator", Exports::new(&["next"], &[], &[]));
        registry.register(
            "file",
            Exports::new(&["read", "write", "close", "flush"], &[], &[]),
        );
        registry
    }
}

impl ProxyClassRegistry {
    pub fn register(&mut self, name: impl Into<String>, exports: Exports) {
        self.classes.insert(name.into(), exports);
    }

    pub fn get(&self, name: &str) -> Option<&Exports> {
        self.classes.get(name)
    }
}

/// Proxy types seen on one connection, by the server's type id and by
/// structural descriptor.
#[derive(Debug, Default)]
pub struct ProxyTypeRegistry {
    classes: ProxyClassRegistry,
    by_type_id: HashMap<u64, Arc<ProxyType>>,
    by_descriptor: HashMap<TypeDescriptor, Arc<ProxyType>>,
}

impl ProxyTypeRegistry {
    pub fn with_classes(classes: ProxyClassRegistry) -> Self {
        Self {
            classes,
            ..Self::default()
        }
    }

    pub fn classes_mut(&mut self) -> &mut ProxyClassRegistry {
        &mut self.classes
    }

    /// Type for a reference's metadata.
    ///
    /// A descriptor is resolved (and remembered under `type_id`); a bare
    /// type id is looked up; neither, or an unknown id, yields the dynamic
    /// type.
    pub fn resolve(
        &mut self,
        type_id: Option<u64>,
        descriptor: Option<TypeDescriptor>,
    ) -> Arc<ProxyType> {
        let ptype = match (descriptor, type_id) {
            (Some(descriptor), _) => self.lookup(descriptor),
            (None, Some(id)) => match self.by_type_id.get(&id) {
                Some(ptype) => return Arc::clone(ptype),
                None => {
                    tracing::warn!(type_id = id, "Unknown remote type id, using a dynamic proxy");
                    self.dynamic()
                }
            },
            (None, None) => self.dynamic(),
        };
        if let Some(id) = type_id {
            self.by_type_id.insert(id, Arc::clone(&ptype));
        }
        ptype
    }

    pub fn dynamic(&mut self) -> Arc<ProxyType> {
        self.lookup(TypeDescriptor::dynamic())
    }

    fn lookup(&mut self, descriptor: TypeDescriptor) -> Arc<ProxyType> {
        if let Some(ptype) = self.by_descriptor.get(&descriptor) {
            return Arc::clone(ptype);
        }
        let exports = match &descriptor {
            TypeDescriptor::Exports(exports) => exports.clone(),
            TypeDescriptor::ProxyClass(name) => match self.classes.get(name) {
                Some(exports) => exports.clone(),
                None => {
                    tracing::warn!(class = %name, "Unknown proxy class, using a dynamic proxy");
                    Exports::dynamic()
                }
            },
        };
        let ptype = Arc::new(ProxyType::new(descriptor.clone(), exports));
        self.by_descriptor.insert(descriptor, Arc::clone(&ptype));
        ptype
    }

    pub fn len(&self) -> usize {
        self.by_descriptor.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_descriptor.is_empty()
    }
}

pub(crate) enum ProxyLink {
    Live(Weak<ClientInner>),
    Closed,
}

pub(crate) struct ProxyInner {
    id: u64,
    ptype: Arc<ProxyType>,
    link: Mutex<ProxyLink>,
    attr_cache: Mutex<HashMap<String, Value>>,
}

impl ProxyInner {
    fn link(&self) -> MutexGuard<'_, ProxyLink> {
        self.link.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn cache(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        self.attr_cache.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Redirects the proxy to the closed sentinel.
    pub(crate) fn disconnect(&self) {
        *self.link() = ProxyLink::Closed;
    }
}

impl Drop for ProxyInner {
    fn drop(&mut self) {
        if self.id == 0 {
            return;
        }
        let link = self.link.get_mut().unwrap_or_else(|p| p.into_inner());
        if let ProxyLink::Live(client) = link {
            if let Some(client) = client.upgrade() {
                client.release_proxy(self.id, self as *const ProxyInner);
            }
        }
    }
}

/// Handle to a remote object. Cloning yields the same proxy.
#[derive(Clone)]
pub struct RemoteProxy {
    inner: Arc<ProxyInner>,
}

impl RemoteProxy {
    pub(crate) fn new(id: u64, ptype: Arc<ProxyType>, client: Weak<ClientInner>) -> Self {
        Self {
            inner: Arc::new(ProxyInner {
                id,
                ptype,
                link: Mutex::new(ProxyLink::Live(client)),
                attr_cache: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ProxyInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ProxyInner> {
        Arc::downgrade(&self.inner)
    }

    /// Id of the object in the server's table. 0 is the root object.
    pub fn object_id(&self) -> u64 {
        self.inner.id
    }

    pub fn proxy_type(&self) -> &Arc<ProxyType> {
        &self.inner.ptype
    }

    /// False once the owning connection has closed.
    pub fn is_connected(&self) -> bool {
        match &*self.inner.link() {
            ProxyLink::Live(client) => client.strong_count() > 0,
            ProxyLink::Closed => false,
        }
    }

    /// Returns true if this proxy is bound to `client`.
    pub(crate) fn belongs_to(&self, client: &Weak<ClientInner>) -> bool {
        match &*self.inner.link() {
            ProxyLink::Live(own) => Weak::ptr_eq(own, client),
            ProxyLink::Closed => false,
        }
    }

    fn client(&self) -> Result<Client> {
        match &*self.inner.link() {
            ProxyLink::Live(client) => client
                .upgrade()
                .map(Client::from_inner)
                .ok_or_else(closed),
            ProxyLink::Closed => Err(closed()),
        }
    }

    fn check_method(&self, method: &str) -> Result<()> {
        if self.inner.ptype.exports.allows_method(method) {
            Ok(())
        } else {
            Err(self.unsupported(method))
        }
    }

    fn check_attr(&self, name: &str) -> Result<()> {
        if self.inner.ptype.exports.allows_attr(name) {
            Ok(())
        } else {
            Err(self.unsupported(name))
        }
    }

    fn unsupported(&self, member: &str) -> Error {
        Error::UnsupportedMember {
            object_id: self.inner.id,
            member: member.to_string(),
        }
    }

    /// Calls `method` and waits for the result.
    pub async fn call(&self, method: &str, args: Vec<Value>, kwargs: Kwargs) -> Result<Value> {
        self.call_with(method, args, kwargs, CallOptions::default())
            .await
    }

    /// Calls `method` with explicit thread and error options.
    pub async fn call_with(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        options: CallOptions,
    ) -> Result<Value> {
        self.call_nonblocking(method, args, kwargs, options)
            .await?
            .wait()
            .await
    }

    /// Issues a call and returns without waiting for the response.
    pub async fn call_nonblocking(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
        options: CallOptions,
    ) -> Result<PendingCall> {
        self.check_method(method)?;
        let client = self.client()?;
        client
            .send_request(self.inner.id, method, args, kwargs, options)
            .await
    }

    async fn root_call(&self, method: &str, mut args: Vec<Value>, mode: ErrorMode) -> Result<Value> {
        let client = self.client()?;
        args.insert(0, Value::Proxy(self.clone()));
        let options = CallOptions {
            error_mode: Some(mode),
            ..CallOptions::default()
        };
        client
            .send_request(0, method, args, Kwargs::new(), options)
            .await?
            .wait()
            .await
    }

    /// Reads an attribute. Cached attributes are fetched once.
    pub async fn get_attr(&self, name: &str) -> Result<Value> {
        self.check_attr(name)?;
        let cached = self.inner.ptype.exports.is_cached(name);
        if cached {
            if let Some(value) = self.inner.cache().get(name) {
                return Ok(value.clone());
            }
        }
        let mode = self.client()?.error_mode();
        let value = self
            .root_call("getattr", vec![Value::from(name)], mode)
            .await?;
        if cached {
            self.inner.cache().insert(name.to_string(), value.clone());
        }
        Ok(value)
    }

    /// Writes an attribute, invalidating any cached value.
    pub async fn set_attr(&self, name: &str, value: Value) -> Result<()> {
        self.check_attr(name)?;
        let mode = self.client()?.error_mode();
        let stale = self.inner.cache().remove(name);
        drop(stale);
        self.root_call("setattr", vec![Value::from(name), value], mode)
            .await?;
        Ok(())
    }

    /// Deletes an attribute, invalidating any cached value.
    pub async fn del_attr(&self, name: &str) -> Result<()> {
        self.check_attr(name)?;
        let mode = self.client()?.error_mode();
        let stale = self.inner.cache().remove(name);
        drop(stale);
        self.root_call("delattr", vec![Value::from(name)], mode)
            .await?;
        Ok(())
    }

    /// Returns true if `name` is a callable method of the remote object.
    ///
    /// Types with explicit export lists answer locally; dynamic types ask
    /// the server.
    pub async fn has_method(&self, name: &str) -> Result<bool> {
        if !self.inner.ptype.is_dynamic() {
            return Ok(self.inner.ptype.exports.allows_method(name));
        }
        match self
            .root_call("getmethod", vec![Value::from(name)], ErrorMode::Quiet)
            .await
        {
            Ok(Value::List(items)) => Ok(items.first().and_then(Value::as_bool).unwrap_or(false)),
            Ok(_) => Ok(false),
            Err(err) if err.remote_error().is_some_and(|e| e.is_attribute_error()) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

fn closed() -> Error {
    Error::ConnectionClosed("Connection has been closed".to_string())
}

impl PartialEq for RemoteProxy {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for RemoteProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteProxy({})", self.inner.id)
    }
}
