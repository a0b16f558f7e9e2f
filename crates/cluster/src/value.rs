//! Dynamic values carried in requests and responses.
//!
//! Plain data crosses the wire as is. Object references never do: on the way
//! out a [`Value::Proxy`] or [`Value::Local`] is replaced by a compact
//! [`WireRef`], and on the way in each `WireRef` is turned back into a proxy
//! or a local object by the connection's reference hook.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::object::LocalObject;
use crate::proxy::RemoteProxy;

/// Keyword arguments.
pub type Kwargs = BTreeMap<String, Value>;

/// A dynamically typed value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Absence of a value.
    #[default]
    Nil,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Raw bytes.
    Bytes(#[serde(with = "serde_bytes")] Vec<u8>),
    /// Ordered sequence.
    List(Vec<Value>),
    /// String-keyed mapping.
    Map(BTreeMap<String, Value>),
    /// Object reference in wire form.
    Ref(WireRef),
    /// Handle to an object living on the peer.
    #[serde(skip)]
    Proxy(RemoteProxy),
    /// Object living here, to be exported to the peer.
    #[serde(skip)]
    Local(LocalObject),
}

impl Value {
    /// Short name of the variant, used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Ref(_) => "ref",
            Value::Proxy(_) => "proxy",
            Value::Local(_) => "object",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_proxy(&self) -> Option<&RemoteProxy> {
        match self {
            Value::Proxy(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_local(&self) -> Option<&LocalObject> {
        match self {
            Value::Local(o) => Some(o),
            _ => None,
        }
    }

    /// Consumes the value, returning the proxy it holds.
    pub fn into_proxy(self) -> Option<RemoteProxy> {
        match self {
            Value::Proxy(p) => Some(p),
            _ => None,
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Nil
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(map: BTreeMap<String, Value>) -> Self {
        Value::Map(map)
    }
}

impl From<RemoteProxy> for Value {
    fn from(p: RemoteProxy) -> Self {
        Value::Proxy(p)
    }
}

impl From<LocalObject> for Value {
    fn from(o: LocalObject) -> Self {
        Value::Local(o)
    }
}

/// Wire form of an object reference.
///
/// The first time an object of a given type is exported the reference
/// carries the type's [`TypeDescriptor`]; afterwards only its `type_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRef {
    /// Object id in the exporting side's table.
    pub id: u64,
    /// Type id in the exporting side's type table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub type_id: Option<u64>,
    /// Capabilities of the type, sent once per type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<TypeDescriptor>,
}

impl WireRef {
    /// A bare reference back to an object the receiver exported.
    pub fn back(id: u64) -> Self {
        Self {
            id,
            type_id: None,
            descriptor: None,
        }
    }
}

/// What a proxy for an object may do.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeDescriptor {
    /// Inline export lists.
    Exports(Exports),
    /// Name of a well-known proxy class.
    ProxyClass(String),
}

impl TypeDescriptor {
    /// Descriptor for an object whose members are discovered at call time.
    pub fn dynamic() -> Self {
        TypeDescriptor::Exports(Exports::dynamic())
    }
}

/// Exported members of a type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Exports {
    /// Callable methods.
    pub methods: Exported,
    /// Readable and writable attributes.
    pub attrs: Exported,
    /// Attributes that never change and may be cached by the proxy.
    pub cached_attrs: Vec<String>,
}

impl Exports {
    /// Exports with explicit name lists. Names are sorted so that equal sets
    /// compare equal.
    pub fn new(methods: &[&str], attrs: &[&str], cached_attrs: &[&str]) -> Self {
        Self {
            methods: Exported::named(methods),
            attrs: Exported::named(attrs),
            cached_attrs: sorted(cached_attrs),
        }
    }

    /// Everything allowed, nothing cached.
    pub fn dynamic() -> Self {
        Self {
            methods: Exported::All,
            attrs: Exported::All,
            cached_attrs: Vec::new(),
        }
    }

    pub fn allows_method(&self, name: &str) -> bool {
        self.methods.contains(name)
    }

    pub fn allows_attr(&self, name: &str) -> bool {
        self.attrs.contains(name) || self.is_cached(name)
    }

    pub fn is_cached(&self, name: &str) -> bool {
        self.cached_attrs.binary_search_by(|n| n.as_str().cmp(name)).is_ok()
    }
}

/// A member list, or "anything".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Exported {
    /// Any name is accepted; the peer decides.
    All,
    /// Only these names (sorted).
    Named(Vec<String>),
}

impl Exported {
    pub fn named(names: &[&str]) -> Self {
        Exported::Named(sorted(names))
    }

    pub fn contains(&self, name: &str) -> bool {
        match self {
            Exported::All => true,
            Exported::Named(names) => names.binary_search_by(|n| n.as_str().cmp(name)).is_ok(),
        }
    }
}

fn sorted(names: &[&str]) -> Vec<String> {
    let mut out: Vec<String> = names.iter().map(|s| s.to_string()).collect();
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exports_sorted_for_structural_equality() {
        let a = Exports::new(&["b", "a"], &["x"], &[]);
        let b = Exports::new(&["a", "b", "a"], &["x"], &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_exports_membership() {
        let exports = Exports::new(&["incr", "get"], &["value"], &["label"]);
        assert!(exports.allows_method("incr"));
        assert!(!exports.allows_method("value"));
        assert!(exports.allows_attr("value"));
        assert!(exports.allows_attr("label"));
        assert!(exports.is_cached("label"));
        assert!(!exports.is_cached("value"));
    }

    #[test]
    fn test_dynamic_allows_everything() {
        let exports = Exports::dynamic();
        assert!(exports.allows_method("anything"));
        assert!(exports.allows_attr("whatever"));
        assert!(!exports.is_cached("whatever"));
    }

    #[test]
    fn test_value_accessors() {
        assert_eq!(Value::from("hi").as_str(), Some("hi"));
        assert_eq!(Value::from(3i64).as_int(), Some(3));
        assert_eq!(Value::from(3i64).as_float(), Some(3.0));
        assert_eq!(Value::from(true).as_bool(), Some(true));
        assert!(Value::from(()).is_nil());
        assert_eq!(Value::default(), Value::Nil);
        assert_eq!(Value::from(vec![Value::Nil]).as_list().map(|l| l.len()), Some(1));
    }

    #[test]
    fn test_wire_ref_omits_empty_fields() {
        let json = serde_json::to_string(&WireRef::back(5)).unwrap();
        assert_eq!(json, r#"{"id":5}"#);
    }

    #[test]
    fn test_bytes_serialize_compactly_in_msgpack() {
        let value = Value::Bytes(vec![1, 2, 3]);
        let bytes = rmp_serde::to_vec(&value).unwrap();
        let decoded: Value = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, value);
    }
}
