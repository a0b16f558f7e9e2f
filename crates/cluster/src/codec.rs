//! Record serialization and object reference substitution.
//!
//! A [`RecordCodec`] turns records into bytes and back; it knows nothing
//! about object references. Before encoding, every [`Value::Proxy`] and
//! [`Value::Local`] in a record is replaced with a [`WireRef`] by the
//! connection's [`ReferenceHook`]; after decoding, every `WireRef` is handed
//! back to the hook to become a proxy or local object again.

use std::fmt;
use std::sync::Arc;

use protocol::InitInfo;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::exception::RemoteException;
use crate::record::{Outcome, RequestRecord, ResponseRecord};
use crate::value::{Kwargs, Value, WireRef};

/// Pluggable record serializer.
pub trait RecordCodec: Send + Sync + fmt::Debug {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    fn encode_request(&self, record: &RequestRecord) -> Result<Vec<u8>>;
    fn decode_request(&self, bytes: &[u8]) -> Result<RequestRecord>;
    fn encode_response(&self, record: &ResponseRecord) -> Result<Vec<u8>>;
    fn decode_response(&self, bytes: &[u8]) -> Result<ResponseRecord>;
    fn encode_init(&self, init: &InitInfo) -> Result<Vec<u8>>;
    fn decode_init(&self, bytes: &[u8]) -> Result<InitInfo>;
}

/// MessagePack records via `rmp-serde`. The default.
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgpackCodec;

impl MsgpackCodec {
    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(value).map_err(|e| Error::InvalidRecord(e.to_string()))
    }

    fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
        rmp_serde::from_slice(bytes).map_err(|e| Error::InvalidRecord(e.to_string()))
    }
}

impl RecordCodec for MsgpackCodec {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    fn encode_request(&self, record: &RequestRecord) -> Result<Vec<u8>> {
        Self::encode(record)
    }

    fn decode_request(&self, bytes: &[u8]) -> Result<RequestRecord> {
        Self::decode(bytes)
    }

    fn encode_response(&self, record: &ResponseRecord) -> Result<Vec<u8>> {
        Self::encode(record)
    }

    fn decode_response(&self, bytes: &[u8]) -> Result<ResponseRecord> {
        Self::decode(bytes)
    }

    fn encode_init(&self, init: &InitInfo) -> Result<Vec<u8>> {
        Self::encode(init)
    }

    fn decode_init(&self, bytes: &[u8]) -> Result<InitInfo> {
        Self::decode(bytes)
    }
}

/// JSON records via `serde_json`. Handy when debugging captures.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl JsonCodec {
    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::InvalidRecord(e.to_string()))
    }

    fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| Error::InvalidRecord(e.to_string()))
    }
}

impl RecordCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode_request(&self, record: &RequestRecord) -> Result<Vec<u8>> {
        Self::encode(record)
    }

    fn decode_request(&self, bytes: &[u8]) -> Result<RequestRecord> {
        Self::decode(bytes)
    }

    fn encode_response(&self, record: &ResponseRecord) -> Result<Vec<u8>> {
        Self::encode(record)
    }

    fn decode_response(&self, bytes: &[u8]) -> Result<ResponseRecord> {
        Self::decode(bytes)
    }

    fn encode_init(&self, init: &InitInfo) -> Result<Vec<u8>> {
        Self::encode(init)
    }

    fn decode_init(&self, bytes: &[u8]) -> Result<InitInfo> {
        Self::decode(bytes)
    }
}

/// Codec selection for configuration files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    #[default]
    Msgpack,
    Json,
}

impl CodecKind {
    pub fn build(self) -> Arc<dyn RecordCodec> {
        match self {
            CodecKind::Msgpack => Arc::new(MsgpackCodec),
            CodecKind::Json => Arc::new(JsonCodec),
        }
    }
}

/// Substitutes object references while records are encoded and decoded.
pub trait ReferenceHook {
    /// Wire form for an outbound [`Value::Proxy`] or [`Value::Local`].
    fn export(&mut self, value: &Value) -> Result<WireRef>;

    /// Local form for an inbound reference.
    fn import(&mut self, reference: WireRef) -> Result<Value>;
}

/// Replaces every proxy and local object in `value` with its wire form.
pub fn externalize(value: Value, hook: &mut dyn ReferenceHook) -> Result<Value> {
    Ok(match value {
        Value::Proxy(_) | Value::Local(_) => Value::Ref(hook.export(&value)?),
        Value::List(items) => Value::List(externalize_all(items, hook)?),
        Value::Map(map) => Value::Map(externalize_map(map, hook)?),
        other => other,
    })
}

/// Replaces every wire reference in `value` with its local form.
pub fn internalize(value: Value, hook: &mut dyn ReferenceHook) -> Result<Value> {
    Ok(match value {
        Value::Ref(reference) => hook.import(reference)?,
        Value::List(items) => Value::List(
            items
                .into_iter()
                .map(|v| internalize(v, hook))
                .collect::<Result<_>>()?,
        ),
        Value::Map(map) => Value::Map(
            map.into_iter()
                .map(|(k, v)| Ok((k, internalize(v, hook)?)))
                .collect::<Result<_>>()?,
        ),
        other => other,
    })
}

fn externalize_all(items: Vec<Value>, hook: &mut dyn ReferenceHook) -> Result<Vec<Value>> {
    items.into_iter().map(|v| externalize(v, hook)).collect()
}

fn externalize_map(map: Kwargs, hook: &mut dyn ReferenceHook) -> Result<Kwargs> {
    map.into_iter()
        .map(|(k, v)| Ok((k, externalize(v, hook)?)))
        .collect()
}

/// Substitutes references in a request's arguments, then encodes it.
pub fn encode_request(
    codec: &dyn RecordCodec,
    hook: &mut dyn ReferenceHook,
    mut record: RequestRecord,
) -> Result<Vec<u8>> {
    record.args = externalize_all(std::mem::take(&mut record.args), hook)?;
    record.kwargs = externalize_map(std::mem::take(&mut record.kwargs), hook)?;
    codec.encode_request(&record)
}

/// Decodes a request, then resolves references in its arguments.
pub fn decode_request(
    codec: &dyn RecordCodec,
    hook: &mut dyn ReferenceHook,
    bytes: &[u8],
) -> Result<RequestRecord> {
    let mut record = codec.decode_request(bytes)?;
    record.args = record
        .args
        .into_iter()
        .map(|v| internalize(v, hook))
        .collect::<Result<_>>()?;
    record.kwargs = record
        .kwargs
        .into_iter()
        .map(|(k, v)| Ok((k, internalize(v, hook)?)))
        .collect::<Result<_>>()?;
    Ok(record)
}

/// Substitutes references in a response's value, then encodes it.
pub fn encode_response(
    codec: &dyn RecordCodec,
    hook: &mut dyn ReferenceHook,
    record: ResponseRecord,
) -> Result<Vec<u8>> {
    let outcome = match record.outcome {
        Outcome::Value(v) => Outcome::Value(externalize(v, hook)?),
        exc => exc,
    };
    codec.encode_response(&ResponseRecord {
        id: record.id,
        outcome,
    })
}

/// Decodes a response, then resolves references in its value.
pub fn decode_response(
    codec: &dyn RecordCodec,
    hook: &mut dyn ReferenceHook,
    bytes: &[u8],
) -> Result<ResponseRecord> {
    let record = codec.decode_response(bytes)?;
    let outcome = match record.outcome {
        Outcome::Value(v) => Outcome::Value(internalize(v, hook)?),
        exc => exc,
    };
    Ok(ResponseRecord {
        id: record.id,
        outcome,
    })
}

/// Response carrying `exc` for request `id`.
pub fn exception_response(id: u64, exc: RemoteException) -> ResponseRecord {
    ResponseRecord {
        id,
        outcome: Outcome::Exception(exc),
    }
}
