//! Objects that a server exposes to its clients.

use std::fmt;
use std::sync::Arc;

use crate::exception::RemoteError;
use crate::value::{Kwargs, TypeDescriptor, Value};

/// An object whose methods and attributes can be reached through a proxy.
///
/// Methods run on the blocking thread pool, so implementations may block.
pub trait RemoteObject: Send + Sync + 'static {
    /// Capabilities advertised to the client the first time an object of
    /// this type is exported. Defaults to fully dynamic.
    fn descriptor(&self) -> TypeDescriptor {
        TypeDescriptor::dynamic()
    }

    /// Invoke a method by name.
    fn call_method(&self, method: &str, args: Vec<Value>, kwargs: Kwargs)
        -> Result<Value, RemoteError>;

    /// Read an attribute.
    fn get_attr(&self, name: &str) -> Result<Value, RemoteError> {
        Err(RemoteError::attribute_error(name))
    }

    /// Write an attribute.
    fn set_attr(&self, name: &str, _value: Value) -> Result<(), RemoteError> {
        Err(RemoteError::attribute_error(name))
    }

    /// Delete an attribute.
    fn del_attr(&self, name: &str) -> Result<(), RemoteError> {
        Err(RemoteError::attribute_error(name))
    }

    /// Returns true if `name` is a callable method.
    fn has_method(&self, _name: &str) -> bool {
        false
    }
}

/// Shared handle to a [`RemoteObject`]. Equality is identity.
#[derive(Clone)]
pub struct LocalObject(Arc<dyn RemoteObject>);

impl LocalObject {
    pub fn new<T: RemoteObject>(object: T) -> Self {
        Self(Arc::new(object))
    }

    pub fn from_arc(object: Arc<dyn RemoteObject>) -> Self {
        Self(object)
    }

    /// Stable identity used to find the object's id in the export table.
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    pub fn descriptor(&self) -> TypeDescriptor {
        self.0.descriptor()
    }

    pub fn call_method(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Kwargs,
    ) -> Result<Value, RemoteError> {
        self.0.call_method(method, args, kwargs)
    }

    pub fn get_attr(&self, name: &str) -> Result<Value, RemoteError> {
        self.0.get_attr(name)
    }

    pub fn set_attr(&self, name: &str, value: Value) -> Result<(), RemoteError> {
        self.0.set_attr(name, value)
    }

    pub fn del_attr(&self, name: &str) -> Result<(), RemoteError> {
        self.0.del_attr(name)
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.0.has_method(name)
    }
}

impl PartialEq for LocalObject {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl fmt::Debug for LocalObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalObject({:#x})", self.addr())
    }
}
