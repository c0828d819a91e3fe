//! Cross-process error chains.
//!
//! A [`TaskError`] is what a target function returns when it fails, and what the
//! caller gets back after the failure crossed the process boundary. On the wire
//! it travels as a [`SerializedError`]: the chain is flattened outermost-first,
//! and captured backtraces are pulled out into `(position, Traceback)` pairs so
//! the links themselves stay plain data.
//!
//! ```text
//! TaskError("RuntimeError", "Outer")          SerializedError
//!     └── cause: TaskError("ValueError")  =>    chain:      [RuntimeError: Outer, ValueError: Inner]
//!                                               tracebacks: [(0, Traceback { frames })]
//! ```

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::Serializer;
use crate::error::{Error, Result};

/// Kind used for panics caught in the child.
pub const PANIC_KIND: &str = "panic";

/// Kind used when the child cannot resolve the requested function.
pub const LOOKUP_KIND: &str = "LookupError";

/// A failure raised by a target function, with its cause chain.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskError {
    kind: String,
    message: String,
    args: Vec<Value>,
    traceback: Option<Traceback>,
    cause: Option<Box<TaskError>>,
}

impl TaskError {
    /// Create an error of the given kind with a message.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            args: Vec::new(),
            traceback: None,
            cause: None,
        }
    }

    /// Create an error whose message is derived from its constructor arguments.
    ///
    /// A single string argument becomes the message verbatim; anything else is
    /// rendered as JSON, so `RuntimeError(5)` reads as `RuntimeError: 5`.
    pub fn with_args(kind: impl Into<String>, args: Vec<Value>) -> Self {
        let message = match args.as_slice() {
            [] => String::new(),
            [Value::String(s)] => s.clone(),
            [single] => single.to_string(),
            many => Value::Array(many.to_vec()).to_string(),
        };
        Self {
            args,
            ..Self::new(kind, message)
        }
    }

    /// Build a task error from any Rust error, walking its `source()` chain.
    ///
    /// The outermost link is tagged with the short type name of `E`. Inner
    /// links keep their kind when they are themselves `TaskError`s and are
    /// tagged `"Error"` otherwise.
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error + 'static,
    {
        let mut this = Self::new(short_type_name::<E>(), err.to_string());
        this.cause = err.source().map(|source| Box::new(Self::from_source(source)));
        this
    }

    fn from_source(err: &(dyn std::error::Error + 'static)) -> Self {
        if let Some(task) = err.downcast_ref::<TaskError>() {
            return task.clone();
        }
        let mut this = Self::new("Error", err.to_string());
        this.cause = err.source().map(|source| Box::new(Self::from_source(source)));
        this
    }

    /// Create an error describing a panic payload.
    pub fn panic(message: impl Into<String>) -> Self {
        Self::new(PANIC_KIND, message)
    }

    /// Attach a cause to this error.
    pub fn caused_by(mut self, cause: TaskError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Attach a backtrace captured at the call site, if backtraces are enabled.
    ///
    /// Honors `RUST_BACKTRACE` / `RUST_LIB_BACKTRACE` like `Backtrace::capture`.
    pub fn capture_traceback(mut self) -> Self {
        self.traceback = Traceback::capture();
        self
    }

    /// Attach an explicit traceback stand-in.
    pub fn with_traceback(mut self, traceback: Traceback) -> Self {
        self.traceback = Some(traceback);
        self
    }

    /// The error kind (the original error's type identity).
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// The constructor arguments the error was created with.
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// The frame stand-ins captured for this link, if any.
    pub fn traceback(&self) -> Option<&Traceback> {
        self.traceback.as_ref()
    }

    /// The direct cause of this error.
    pub fn cause(&self) -> Option<&TaskError> {
        self.cause.as_deref()
    }

    /// Iterate the chain outermost-first, starting with `self`.
    pub fn chain(&self) -> impl Iterator<Item = &TaskError> {
        std::iter::successors(Some(self), |err| err.cause())
    }

    /// Whether the error is a panic caught in the child.
    pub fn is_panic(&self) -> bool {
        self.kind == PANIC_KIND
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for TaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

fn short_type_name<E>() -> String {
    let full = std::any::type_name::<E>();
    // Strip generic parameters before taking the last path segment.
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// Opaque, non-executable stand-in for the frames of a captured backtrace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Traceback {
    /// Rendered frame lines, outermost call last.
    pub frames: Vec<String>,
}

impl Traceback {
    /// Capture the current backtrace, or `None` when capturing is disabled.
    pub fn capture() -> Option<Self> {
        let backtrace = Backtrace::capture();
        if backtrace.status() != BacktraceStatus::Captured {
            return None;
        }
        let frames = backtrace
            .to_string()
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect();
        Some(Self { frames })
    }
}

/// One link of a flattened error chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLink {
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Wire representation of a [`TaskError`] chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedError {
    /// Links, outermost first. `chain[i + 1]` is the cause of `chain[i]`.
    pub chain: Vec<ErrorLink>,
    /// `(position in chain, traceback)` pairs, ordered by position.
    #[serde(default)]
    pub tracebacks: Vec<(usize, Traceback)>,
}

impl SerializedError {
    /// Flatten a task error chain.
    pub fn from_task(error: &TaskError) -> Self {
        let mut chain = Vec::new();
        let mut tracebacks = Vec::new();
        for (index, link) in error.chain().enumerate() {
            chain.push(ErrorLink {
                kind: link.kind.clone(),
                message: link.message.clone(),
                args: link.args.clone(),
            });
            if let Some(ref traceback) = link.traceback {
                tracebacks.push((index, traceback.clone()));
            }
        }
        Self { chain, tracebacks }
    }

    /// Rebuild the task error chain.
    pub fn to_task(&self) -> Result<TaskError> {
        if self.chain.is_empty() {
            return Err(Error::Deserialization(
                "serialized error has an empty chain".to_string(),
            ));
        }
        if let Some((index, _)) = self.tracebacks.iter().find(|(i, _)| *i >= self.chain.len()) {
            return Err(Error::Deserialization(format!(
                "traceback position {} out of range for chain of {}",
                index,
                self.chain.len()
            )));
        }

        let mut rebuilt: Option<TaskError> = None;
        for (index, link) in self.chain.iter().enumerate().rev() {
            let traceback = self
                .tracebacks
                .iter()
                .find(|(i, _)| *i == index)
                .map(|(_, tb)| tb.clone());
            rebuilt = Some(TaskError {
                kind: link.kind.clone(),
                message: link.message.clone(),
                args: link.args.clone(),
                traceback,
                cause: rebuilt.map(Box::new),
            });
        }
        rebuilt.ok_or_else(|| Error::Deserialization("empty error chain".to_string()))
    }

    /// Encode the error with a serializer.
    pub fn to_bytes(&self, serializer: &dyn Serializer) -> Result<Vec<u8>> {
        let value =
            serde_json::to_value(self).map_err(|e| Error::Serialization(e.to_string()))?;
        serializer.encode(&value)
    }

    /// Decode an error produced by [`SerializedError::to_bytes`].
    pub fn from_bytes(bytes: &[u8], serializer: &dyn Serializer) -> Result<Self> {
        let value = serializer.decode(bytes)?;
        serde_json::from_value(value).map_err(|e| {
            Error::Deserialization(format!("error is not a serialized error chain: {}", e))
        })
    }
}

impl From<&TaskError> for SerializedError {
    fn from(error: &TaskError) -> Self {
        Self::from_task(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonSerializer;
    use serde_json::json;

    #[derive(Debug, thiserror::Error)]
    #[error("outer failure")]
    struct Outer {
        #[source]
        inner: std::io::Error,
    }

    #[test]
    fn test_display() {
        assert_eq!(TaskError::new("ValueError", "bad").to_string(), "ValueError: bad");
        assert_eq!(TaskError::new("KeyboardInterrupt", "").to_string(), "KeyboardInterrupt");
    }

    #[test]
    fn test_with_args_message() {
        let err = TaskError::with_args("RuntimeError", vec![json!(5)]);
        assert_eq!(err.message(), "5");
        assert_eq!(err.args(), &[json!(5)]);

        let err = TaskError::with_args("RuntimeError", vec![json!("x")]);
        assert_eq!(err.message(), "x");

        let err = TaskError::with_args("RuntimeError", vec![json!(1), json!("a")]);
        assert_eq!(err.message(), r#"[1,"a"]"#);
    }

    #[test]
    fn test_chain_roundtrip_keeps_cause() {
        let err = TaskError::new("RuntimeError", "Outer")
            .caused_by(TaskError::new("ValueError", "Inner"));

        let rebuilt = SerializedError::from_task(&err).to_task().unwrap();
        assert_eq!(rebuilt.kind(), "RuntimeError");
        assert_eq!(rebuilt.message(), "Outer");

        let cause = rebuilt.cause().expect("cause should survive");
        assert_eq!(cause.kind(), "ValueError");
        assert_eq!(cause.message(), "Inner");
        assert!(cause.cause().is_none());
    }

    #[test]
    fn test_source_walks_chain() {
        let err = TaskError::new("A", "1")
            .caused_by(TaskError::new("B", "2").caused_by(TaskError::new("C", "3")));

        let mut kinds = Vec::new();
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(&err);
        while let Some(e) = current {
            kinds.push(e.to_string());
            current = e.source();
        }
        assert_eq!(kinds, vec!["A: 1", "B: 2", "C: 3"]);
    }

    #[test]
    fn test_tracebacks_are_extracted_by_position() {
        let tb = Traceback {
            frames: vec!["0: work".to_string(), "1: main".to_string()],
        };
        let err = TaskError::new("RuntimeError", "Outer")
            .caused_by(TaskError::new("ValueError", "Inner").with_traceback(tb.clone()));

        let serialized = SerializedError::from_task(&err);
        assert_eq!(serialized.chain.len(), 2);
        assert_eq!(serialized.tracebacks, vec![(1, tb.clone())]);

        let rebuilt = serialized.to_task().unwrap();
        assert!(rebuilt.traceback().is_none());
        assert_eq!(rebuilt.cause().and_then(|c| c.traceback()), Some(&tb));
    }

    #[test]
    fn test_out_of_range_traceback_rejected() {
        let serialized = SerializedError {
            chain: vec![ErrorLink {
                kind: "E".to_string(),
                message: String::new(),
                args: vec![],
            }],
            tracebacks: vec![(3, Traceback::default())],
        };
        assert!(matches!(serialized.to_task(), Err(Error::Deserialization(_))));
    }

    #[test]
    fn test_empty_chain_rejected() {
        let serialized = SerializedError {
            chain: vec![],
            tracebacks: vec![],
        };
        assert!(serialized.to_task().is_err());
    }

    #[test]
    fn test_from_error_walks_sources() {
        let err = Outer {
            inner: std::io::Error::other("disk gone"),
        };
        let task = TaskError::from_error(&err);
        assert_eq!(task.kind(), "Outer");
        assert_eq!(task.message(), "outer failure");
        let cause = task.cause().unwrap();
        assert_eq!(cause.kind(), "Error");
        assert_eq!(cause.message(), "disk gone");
    }

    #[test]
    fn test_bytes_roundtrip_through_serializer() {
        let err = TaskError::with_args("RuntimeError", vec![json!(5)])
            .caused_by(TaskError::panic("boom"));
        let bytes = SerializedError::from_task(&err).to_bytes(&JsonSerializer).unwrap();
        let rebuilt = SerializedError::from_bytes(&bytes, &JsonSerializer)
            .unwrap()
            .to_task()
            .unwrap();
        assert_eq!(rebuilt, err);
        assert!(rebuilt.cause().unwrap().is_panic());
    }

    #[test]
    fn test_from_bytes_rejects_other_values() {
        let bytes = JsonSerializer.encode(&json!({"not": "an error"})).unwrap();
        assert!(SerializedError::from_bytes(&bytes, &JsonSerializer).is_err());
    }
}
