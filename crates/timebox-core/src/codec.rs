//! Serializer strategies for the call channel.
//!
//! The executor and the runner agree on one [`Serializer`] at configuration
//! time. Everything that crosses the process boundary is first lowered to a
//! `serde_json::Value` and then encoded by the strategy, so a backend only has
//! to round-trip that one type.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, Result};

/// Encode/decode capability for values crossing the process boundary.
pub trait Serializer: Send + Sync + fmt::Debug {
    /// Stable name written into every blob header.
    fn name(&self) -> &str;

    /// Encode a value to bytes.
    fn encode(&self, value: &Value) -> Result<Vec<u8>>;

    /// Decode bytes produced by [`Serializer::encode`].
    fn decode(&self, bytes: &[u8]) -> Result<Value>;
}

/// JSON backend (`serde_json`).
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &str {
        "json"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// MessagePack backend (`rmp-serde`). Smaller blobs for large payloads.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessagePackSerializer;

impl Serializer for MessagePackSerializer {
    fn name(&self) -> &str {
        "msgpack"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(value).map_err(|e| Error::Serialization(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value> {
        rmp_serde::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// Look up one of the built-in serializers by its header name.
pub fn by_name(name: &str) -> Option<Arc<dyn Serializer>> {
    match name {
        "json" => Some(Arc::new(JsonSerializer)),
        "msgpack" | "messagepack" => Some(Arc::new(MessagePackSerializer)),
        _ => None,
    }
}

/// Lower a typed value and encode it.
pub fn encode_as<T: Serialize>(serializer: &dyn Serializer, value: &T) -> Result<Vec<u8>> {
    let value = serde_json::to_value(value).map_err(|e| Error::Serialization(e.to_string()))?;
    serializer.encode(&value)
}

/// Decode bytes and lift them into a typed value.
pub fn decode_as<T: DeserializeOwned>(serializer: &dyn Serializer, bytes: &[u8]) -> Result<T> {
    let value = serializer.decode(bytes)?;
    serde_json::from_value(value).map_err(|e| Error::Deserialization(e.to_string()))
}
