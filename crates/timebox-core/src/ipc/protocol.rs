//! Blobs exchanged with the child process.
//!
//! Each invocation writes exactly two blobs: the [`CallDescription`] going in
//! and the [`OutcomeEnvelope`] coming out. Both use the same framing:
//!
//! ```text
//! b"TBX1" | name_len (u8) | serializer name | payload_len (u32 LE) | payload
//! ```
//!
//! The serializer name lets the child pick the matching backend and lets the
//! parent reject an outcome encoded by a different one.

use std::io::{Read, Write};
use std::path::PathBuf;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::chain::{SerializedError, TaskError};
use crate::codec::{self, Serializer};
use crate::error::{Error, Result};

/// Magic bytes at the start of every blob.
pub const MAGIC: &[u8; 4] = b"TBX1";

/// Upper bound on a blob payload (256 MiB).
pub const MAX_PAYLOAD: usize = 256 * 1024 * 1024;

/// Positional and keyword arguments for a call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Arguments {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl Arguments {
    /// Empty argument list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Set a keyword argument.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    /// Append any serializable value as a positional argument.
    pub fn try_arg<T: Serialize>(self, value: &T) -> Result<Self> {
        let value =
            serde_json::to_value(value).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(self.arg(value))
    }

    /// Set any serializable value as a keyword argument.
    pub fn try_kwarg<T: Serialize>(self, name: impl Into<String>, value: &T) -> Result<Self> {
        let value =
            serde_json::to_value(value).map_err(|e| Error::Serialization(e.to_string()))?;
        Ok(self.kwarg(name, value))
    }

    /// Read positional argument `index` as `T`.
    ///
    /// Failures are reported as `TypeError` task errors so they reach the
    /// caller like any other failure of the target.
    pub fn positional<T: DeserializeOwned>(&self, index: usize) -> std::result::Result<T, TaskError> {
        let value = self.args.get(index).ok_or_else(|| {
            TaskError::new(
                "TypeError",
                format!("missing positional argument {} (got {})", index, self.args.len()),
            )
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            TaskError::new("TypeError", format!("positional argument {}: {}", index, e))
        })
    }

    /// Read keyword argument `name` as `T`, or `None` when absent.
    pub fn keyword<T: DeserializeOwned>(&self, name: &str) -> std::result::Result<Option<T>, TaskError> {
        match self.kwargs.get(name) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| TaskError::new("TypeError", format!("keyword argument '{}': {}", name, e))),
        }
    }

    /// Whether no arguments were supplied.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty() && self.kwargs.is_empty()
    }
}

/// A function run once in the child before the target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Initializer {
    /// Registry name of the initializer.
    pub function: String,
    #[serde(flatten)]
    pub arguments: Arguments,
}

impl Initializer {
    pub fn new(function: impl Into<String>, arguments: Arguments) -> Self {
        Self {
            function: function.into(),
            arguments,
        }
    }
}

/// Everything the child needs to run one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallDescription {
    /// Registry name of the target function.
    pub function: String,
    #[serde(flatten)]
    pub arguments: Arguments,
    /// Where the child writes its outcome.
    pub output: PathBuf,
    #[serde(default)]
    pub initializer: Option<Initializer>,
}

/// The single result written by the child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "payload", rename_all = "snake_case")]
pub enum OutcomeEnvelope {
    Success(Value),
    Failure(SerializedError),
}

impl OutcomeEnvelope {
    /// Envelope for a target's result.
    pub fn from_result(result: std::result::Result<Value, TaskError>) -> Self {
        match result {
            Ok(value) => Self::Success(value),
            Err(err) => Self::Failure(SerializedError::from_task(&err)),
        }
    }

    /// Turn the envelope back into the target's result.
    pub fn into_result(self) -> Result<std::result::Result<Value, TaskError>> {
        match self {
            Self::Success(value) => Ok(Ok(value)),
            Self::Failure(serialized) => Ok(Err(serialized.to_task()?)),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

/// Write a framed blob.
pub fn write_blob<W: Write, T: Serialize>(
    writer: &mut W,
    serializer: &dyn Serializer,
    message: &T,
) -> Result<()> {
    let payload = codec::encode_as(serializer, message)?;
    if payload.len() > MAX_PAYLOAD {
        return Err(Error::Protocol(format!(
            "payload too large: {} bytes",
            payload.len()
        )));
    }

    let name = serializer.name().as_bytes();
    let name_len = u8::try_from(name.len()).map_err(|_| {
        Error::Protocol(format!("serializer name too long: {}", serializer.name()))
    })?;

    writer.write_all(MAGIC)?;
    writer.write_all(&[name_len])?;
    writer.write_all(name)?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.flush()?;

    Ok(())
}

/// Read the header of a framed blob, returning the serializer name and payload.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<(String, Vec<u8>)> {
    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .map_err(|e| Error::Protocol(format!("failed to read blob header: {}", e)))?;
    if &magic != MAGIC {
        return Err(Error::Protocol(format!("bad magic: {:?}", magic)));
    }

    let mut name_len = [0u8; 1];
    reader
        .read_exact(&mut name_len)
        .map_err(|e| Error::Protocol(format!("failed to read serializer name length: {}", e)))?;
    let mut name = vec![0u8; name_len[0] as usize];
    reader
        .read_exact(&mut name)
        .map_err(|e| Error::Protocol(format!("failed to read serializer name: {}", e)))?;
    let name = String::from_utf8(name)
        .map_err(|e| Error::Protocol(format!("serializer name is not UTF-8: {}", e)))?;

    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .map_err(|e| Error::Protocol(format!("failed to read payload length: {}", e)))?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_PAYLOAD {
        return Err(Error::Protocol(format!("payload too large: {} bytes", len)));
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .map_err(|e| Error::Protocol(format!("truncated payload: {}", e)))?;

    Ok((name, payload))
}

/// Read a framed blob that must have been written with `serializer`.
pub fn read_blob<R: Read, T: DeserializeOwned>(
    reader: &mut R,
    serializer: &dyn Serializer,
) -> Result<T> {
    let (name, payload) = read_frame(reader)?;
    if name != serializer.name() {
        return Err(Error::Protocol(format!(
            "blob was written with serializer '{}', expected '{}'",
            name,
            serializer.name()
        )));
    }
    codec::decode_as(serializer, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{JsonSerializer, MessagePackSerializer};
    use serde_json::json;
    use std::io::Cursor;

    fn sample_call() -> CallDescription {
        CallDescription {
            function: "echo_args".to_string(),
            arguments: Arguments::new().arg(1).arg(2).kwarg("scale", 0.5),
            output: PathBuf::from("/tmp/timebox/abc/output.b"),
            initializer: Some(Initializer::new(
                "set_env",
                Arguments::new().arg("KEY").kwarg("value", "v"),
            )),
        }
    }

    #[test]
    fn test_call_description_roundtrip() {
        let call = sample_call();
        let mut buf = Vec::new();
        write_blob(&mut buf, &MessagePackSerializer, &call).unwrap();

        let decoded: CallDescription =
            read_blob(&mut Cursor::new(buf), &MessagePackSerializer).unwrap();
        assert_eq!(decoded, call);
    }

    #[test]
    fn test_call_description_flattens_arguments() {
        let value = serde_json::to_value(sample_call()).unwrap();
        assert_eq!(value["args"], json!([1, 2]));
        assert_eq!(value["kwargs"], json!({"scale": 0.5}));
        assert_eq!(value["initializer"]["function"], json!("set_env"));
    }

    #[test]
    fn test_failure_envelope_roundtrip() {
        let err = TaskError::new("RuntimeError", "Outer")
            .caused_by(TaskError::new("ValueError", "Inner"));
        let envelope = OutcomeEnvelope::from_result(Err(err.clone()));

        let mut buf = Vec::new();
        write_blob(&mut buf, &JsonSerializer, &envelope).unwrap();
        let decoded: OutcomeEnvelope = read_blob(&mut Cursor::new(buf), &JsonSerializer).unwrap();

        assert!(!decoded.is_success());
        assert_eq!(decoded.into_result().unwrap(), Err(err));
    }

    #[test]
    fn test_serializer_mismatch_rejected() {
        let mut buf = Vec::new();
        write_blob(&mut buf, &JsonSerializer, &OutcomeEnvelope::Success(json!(1))).unwrap();

        let result: Result<OutcomeEnvelope> =
            read_blob(&mut Cursor::new(buf), &MessagePackSerializer);
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_truncated_blob_rejected() {
        let mut buf = Vec::new();
        write_blob(&mut buf, &JsonSerializer, &OutcomeEnvelope::Success(json!("abc"))).unwrap();
        buf.truncate(buf.len() - 2);

        let result = read_frame(&mut Cursor::new(buf));
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let result = read_frame(&mut Cursor::new(b"NOPE\x04json".to_vec()));
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn test_argument_accessors() {
        let arguments = Arguments::new().arg(3).kwarg("name", "x");
        assert_eq!(arguments.positional::<i64>(0).unwrap(), 3);
        assert_eq!(arguments.keyword::<String>("name").unwrap().as_deref(), Some("x"));
        assert_eq!(arguments.keyword::<String>("missing").unwrap(), None);

        let err = arguments.positional::<i64>(1).unwrap_err();
        assert_eq!(err.kind(), "TypeError");
        let err = arguments.positional::<String>(0).unwrap_err();
        assert_eq!(err.kind(), "TypeError");
    }
}
