//! Child-process entry point.
//!
//! A worker binary hands its [`Registry`] to a [`Runner`] and calls
//! [`Runner::main`]. The runner reads the call description named by
//! `TIMEBOX_INPUT_FILE`, runs the optional initializer and the target, and
//! writes exactly one outcome envelope as its last action:
//!
//! ```no_run
//! use std::process::ExitCode;
//! use serde_json::json;
//! use timebox_core::{Registry, Runner};
//!
//! fn main() -> ExitCode {
//!     let registry = Registry::new().register("ping", |_| Ok(json!("pong")));
//!     Runner::new(registry).main()
//! }
//! ```

use std::any::Any;
use std::fs::File;
use std::io::BufReader;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use crate::chain::TaskError;
use crate::codec::{self, Serializer};
use crate::error::{Error, Result};
use crate::ipc::{CallDescription, INPUT_FILE_ENV, OutcomeEnvelope, read_frame, write_outcome};
use crate::registry::{Registry, TaskResult};

/// Exit code when the target returned a value.
pub const EXIT_SUCCESS: u8 = 0;
/// Exit code when the target failed and a failure envelope was written.
pub const EXIT_FAILURE: u8 = 1;
/// Exit code when no envelope could be written.
pub const EXIT_NO_OUTCOME: u8 = 2;

/// Runs one call inside the child process.
pub struct Runner {
    registry: Registry,
    serializers: Vec<Arc<dyn Serializer>>,
}

impl Runner {
    /// Create a runner that understands the built-in serializers.
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            serializers: Vec::new(),
        }
    }

    /// Accept blobs written by a custom serializer.
    ///
    /// Custom serializers are matched by name before the built-in ones.
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializers.push(serializer);
        self
    }

    /// The registry targets are resolved in.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Whether this process was launched by an executor.
    pub fn is_child() -> bool {
        std::env::var_os(INPUT_FILE_ENV).is_some()
    }

    fn serializer_named(&self, name: &str) -> Option<Arc<dyn Serializer>> {
        self.serializers
            .iter()
            .find(|s| s.name() == name)
            .cloned()
            .or_else(|| codec::by_name(name))
    }

    /// Run the call named by `TIMEBOX_INPUT_FILE`.
    pub fn run_from_env(&self) -> Result<OutcomeEnvelope> {
        let input = std::env::var_os(INPUT_FILE_ENV).map(PathBuf::from).ok_or_else(|| {
            Error::InvalidOperation(format!("{} is not set", INPUT_FILE_ENV))
        })?;
        self.run(&input)
    }

    /// Run the call described at `input` and publish its outcome.
    pub fn run(&self, input: &Path) -> Result<OutcomeEnvelope> {
        let (name, payload) = read_frame(&mut BufReader::new(File::open(input)?))?;
        let serializer = self
            .serializer_named(&name)
            .ok_or_else(|| Error::Protocol(format!("unknown serializer '{}'", name)))?;
        let call: CallDescription = codec::decode_as(serializer.as_ref(), &payload)?;

        tracing::debug!(function = %call.function, serializer = %name, "running call");
        let envelope = OutcomeEnvelope::from_result(self.execute(&call));

        // Publishing the envelope must be the last thing the child does.
        write_outcome(&call.output, serializer.as_ref(), &envelope)?;
        Ok(envelope)
    }

    /// Run the initializer (if any) and then the target, catching panics.
    pub fn execute(&self, call: &CallDescription) -> TaskResult {
        if let Some(ref init) = call.initializer {
            tracing::debug!(initializer = %init.function, "running initializer");
            self.invoke_guarded(&init.function, init.arguments.clone())?;
        }
        self.invoke_guarded(&call.function, call.arguments.clone())
    }

    fn invoke_guarded(&self, name: &str, arguments: crate::ipc::Arguments) -> TaskResult {
        match panic::catch_unwind(AssertUnwindSafe(|| self.registry.invoke(name, arguments))) {
            Ok(result) => result,
            Err(payload) => Err(TaskError::panic(panic_message(payload.as_ref()))),
        }
    }

    /// Entry point for worker binaries.
    ///
    /// Exits with [`EXIT_SUCCESS`], [`EXIT_FAILURE`] or [`EXIT_NO_OUTCOME`].
    pub fn main(self) -> ExitCode {
        match self.run_from_env() {
            Ok(envelope) if envelope.is_success() => ExitCode::from(EXIT_SUCCESS),
            Ok(_) => ExitCode::from(EXIT_FAILURE),
            Err(e) => {
                tracing::error!("timebox runner failed before writing an outcome: {}", e);
                ExitCode::from(EXIT_NO_OUTCOME)
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{JsonSerializer, MessagePackSerializer};
    use crate::ipc::{Arguments, CallChannel, Initializer};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    static INIT_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn runner() -> Runner {
        let registry = Registry::new()
            .register("echo", |args| Ok(json!({"args": args.args, "kwargs": args.kwargs})))
            .register("fail", |_| {
                Err(TaskError::new("RuntimeError", "Outer")
                    .caused_by(TaskError::new("ValueError", "Inner")))
            })
            .register("explode", |_| panic!("kaboom"))
            .register("count_init", |_| {
                INIT_CALLS.fetch_add(1, Ordering::SeqCst);
                Ok(json!(null))
            })
            .register("bad_init", |_| Err(TaskError::new("OSError", "init failed")));
        Runner::new(registry)
    }

    fn prepare(
        temp: &TempDir,
        serializer: &dyn Serializer,
        function: &str,
        initializer: Option<Initializer>,
    ) -> CallChannel {
        let channel = CallChannel::create(temp.path()).unwrap();
        let call = CallDescription {
            function: function.to_string(),
            arguments: Arguments::new().arg(1).kwarg("k", "v"),
            output: channel.output().to_path_buf(),
            initializer,
        };
        channel.write_input(serializer, &call).unwrap();
        channel
    }

    #[test]
    fn test_success_envelope_written() {
        let temp = TempDir::new().unwrap();
        let channel = prepare(&temp, &JsonSerializer, "echo", None);

        let envelope = runner().run(channel.input()).unwrap();
        assert!(envelope.is_success());
        assert_eq!(
            channel.read_outcome(&JsonSerializer).unwrap(),
            Some(OutcomeEnvelope::Success(json!({"args": [1], "kwargs": {"k": "v"}})))
        );
    }

    #[test]
    fn test_failure_envelope_keeps_chain() {
        let temp = TempDir::new().unwrap();
        let channel = prepare(&temp, &MessagePackSerializer, "fail", None);

        runner().run(channel.input()).unwrap();
        let envelope = channel.read_outcome(&MessagePackSerializer).unwrap().unwrap();
        let err = envelope.into_result().unwrap().unwrap_err();
        assert_eq!(err.kind(), "RuntimeError");
        assert_eq!(err.cause().map(|c| c.message()), Some("Inner"));
    }

    #[test]
    fn test_panic_becomes_failure() {
        let temp = TempDir::new().unwrap();
        let channel = prepare(&temp, &JsonSerializer, "explode", None);

        let envelope = runner().run(channel.input()).unwrap();
        let err = envelope.into_result().unwrap().unwrap_err();
        assert!(err.is_panic());
        assert_eq!(err.message(), "kaboom");
    }

    #[test]
    fn test_unknown_function_becomes_failure() {
        let temp = TempDir::new().unwrap();
        let channel = prepare(&temp, &JsonSerializer, "nope", None);

        let envelope = runner().run(channel.input()).unwrap();
        let err = envelope.into_result().unwrap().unwrap_err();
        assert_eq!(err.kind(), crate::chain::LOOKUP_KIND);
    }

    #[test]
    fn test_initializer_runs_before_target() {
        let temp = TempDir::new().unwrap();
        let before = INIT_CALLS.load(Ordering::SeqCst);
        let channel = prepare(
            &temp,
            &JsonSerializer,
            "echo",
            Some(Initializer::new("count_init", Arguments::new())),
        );

        assert!(runner().run(channel.input()).unwrap().is_success());
        assert_eq!(INIT_CALLS.load(Ordering::SeqCst), before + 1);
    }

    #[test]
    fn test_failing_initializer_skips_target() {
        let temp = TempDir::new().unwrap();
        let channel = prepare(
            &temp,
            &JsonSerializer,
            "echo",
            Some(Initializer::new("bad_init", Arguments::new())),
        );

        let err = runner()
            .run(channel.input())
            .unwrap()
            .into_result()
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), "OSError");
    }

    #[test]
    fn test_missing_input_writes_nothing() {
        let temp = TempDir::new().unwrap();
        let result = runner().run(&temp.path().join("absent.b"));
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
