//! Error types for timebox-core.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::chain::TaskError;
use crate::execute::CallbackErrors;

/// Result type for timebox-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in timebox-core.
#[derive(Debug, Error)]
pub enum Error {
    /// The deadline elapsed before the child produced an outcome.
    ///
    /// The child has been sent a termination signal by the time this is returned.
    #[error("timeout > {:.2}s", timeout.as_secs_f64())]
    Timeout { timeout: Duration },

    /// The child terminated without writing an outcome envelope.
    #[error("child process exited without an outcome: {}", path.display())]
    MissingOutcome { path: PathBuf },

    /// The target function failed inside the child; this is the reconstructed error.
    #[error(transparent)]
    Task(TaskError),

    /// One or more callbacks failed. Every callback still ran.
    #[error(transparent)]
    Callbacks(CallbackErrors),

    /// Failed to launch the child process.
    #[error("failed to spawn '{}': {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Malformed call-channel blob or serializer mismatch.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid operation (e.g., reading the outcome while the child still runs).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl Error {
    /// Whether this error means the deadline was exceeded.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// The reconstructed task error, if the target itself failed.
    pub fn as_task(&self) -> Option<&TaskError> {
        match self {
            Self::Task(err) => Some(err),
            _ => None,
        }
    }

    /// Render the error with a short recovery hint for operators.
    pub fn with_hint(&self) -> String {
        let hint = match self {
            Self::Timeout { .. } => {
                Some("raise the executor timeout or pass a longer timeout to result()")
            }
            Self::MissingOutcome { .. } => Some(
                "the worker crashed or was killed before writing its result; run it with TIMEBOX_LOG=debug",
            ),
            Self::Spawn { .. } => {
                Some("set TIMEBOX_WORKER_PATH or ExecutorConfig::with_program to the worker binary")
            }
            Self::Protocol(_) => {
                Some("executor and worker must be configured with the same serializer")
            }
            _ => None,
        };
        match hint {
            Some(hint) => format!("{self}\n  hint: {hint}"),
            None => self.to_string(),
        }
    }
}

impl From<TaskError> for Error {
    fn from(err: TaskError) -> Self {
        Self::Task(err)
    }
}

impl From<CallbackErrors> for Error {
    fn from(err: CallbackErrors) -> Self {
        Self::Callbacks(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message() {
        let err = Error::Timeout {
            timeout: Duration::from_millis(500),
        };
        assert_eq!(err.to_string(), "timeout > 0.50s");
        assert!(err.is_timeout());
    }

    #[test]
    fn test_task_error_is_transparent() {
        let err = Error::from(TaskError::new("RuntimeError", "x"));
        assert_eq!(err.to_string(), "RuntimeError: x");
        assert_eq!(err.as_task().map(|e| e.kind()), Some("RuntimeError"));
    }

    #[test]
    fn test_with_hint() {
        let err = Error::MissingOutcome {
            path: PathBuf::from("/tmp/out.b"),
        };
        assert!(err.with_hint().contains("hint:"));

        let err = Error::InvalidOperation("nope".to_string());
        assert_eq!(err.with_hint(), "invalid operation: nope");
    }
}
