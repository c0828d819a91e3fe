//! Launching calls into fresh child processes.

use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::config::{ExecutorConfig, StdioMode};
use crate::error::{Error, Result};
use crate::ipc::{Arguments, CallChannel, CallDescription, INPUT_FILE_ENV, Initializer};

use super::callback::{BoxError, Callback, CallbackArgs, CallbackId, CallbackRegistry};
use super::invocation::Invocation;
use super::result::AsyncResult;
use super::watchdog::{CapturedStreams, Watchdog};

/// Runs each call in a new child process under a wall-clock deadline.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use timebox_core::{Arguments, TimeoutExecutor};
///
/// let executor = TimeoutExecutor::new(Duration::from_secs(1));
/// let handle = executor.apply::<i64>("add", Arguments::new().arg(1).arg(2))?;
/// assert_eq!(handle.result(None)?, 3);
/// # Ok::<(), timebox_core::Error>(())
/// ```
#[derive(Debug, Clone)]
pub struct TimeoutExecutor {
    timeout: Duration,
    config: ExecutorConfig,
    initializer: Option<Initializer>,
    callbacks: CallbackRegistry,
}

impl TimeoutExecutor {
    /// Executor using [`ExecutorConfig::default`].
    pub fn new(timeout: Duration) -> Self {
        Self::with_config(timeout, ExecutorConfig::default())
    }

    pub fn with_config(timeout: Duration, config: ExecutorConfig) -> Self {
        Self {
            timeout,
            config,
            initializer: None,
            callbacks: CallbackRegistry::new(),
        }
    }

    /// Deadline applied to every call.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Run `function` in every child before the target. Replaces any previous initializer.
    pub fn set_initializer(&mut self, function: impl Into<String>, arguments: Arguments) -> &mut Self {
        self.initializer = Some(Initializer::new(function, arguments));
        self
    }

    pub fn unset_initializer(&mut self) -> &mut Self {
        self.initializer = None;
        self
    }

    pub fn initializer(&self) -> Option<&Initializer> {
        self.initializer.as_ref()
    }

    /// Register a callback copied into every subsequent invocation.
    pub fn add_callback<F>(&mut self, func: F) -> CallbackId
    where
        F: Fn(&mut CallbackArgs<'_>) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.callbacks.add(Callback::new(func))
    }

    /// Remove a template callback. Invocations already started keep their copy.
    pub fn remove_callback(&mut self, id: CallbackId) -> bool {
        self.callbacks.remove(id)
    }

    pub fn callbacks(&self) -> Vec<Callback> {
        self.callbacks.list()
    }

    fn launch(&self, function: &str, arguments: Arguments) -> Launch {
        Launch {
            function: function.to_string(),
            arguments,
            timeout: self.timeout,
            config: self.config.clone(),
            initializer: self.initializer.clone(),
            template: self.callbacks.list(),
        }
    }

    /// Launch `function` in a child process and return immediately.
    pub fn apply<T: DeserializeOwned>(&self, function: &str, arguments: Arguments) -> Result<AsyncResult<T>> {
        let invocation = self.launch(function, arguments).start()?;
        Ok(AsyncResult::from_invocation(invocation))
    }

    /// Async variant of [`TimeoutExecutor::apply`]. Resolves once the child is launched.
    ///
    /// The whole launch runs on the blocking pool. Dropping this future does
    /// not interrupt it: a child that gets spawned is always supervised, and
    /// its deadline still applies.
    ///
    /// Await [`AsyncResult::delay`] on the returned handle for the outcome.
    pub async fn delay<T: DeserializeOwned>(
        &self,
        function: &str,
        arguments: Arguments,
    ) -> Result<AsyncResult<T>> {
        let launch = self.launch(function, arguments);
        let invocation = tokio::task::spawn_blocking(move || launch.start())
            .await
            .map_err(|e| Error::InvalidOperation(format!("launch task failed: {}", e)))??;
        Ok(AsyncResult::from_invocation(invocation))
    }
}

/// One call, detached from the executor so it can move to another thread.
struct Launch {
    function: String,
    arguments: Arguments,
    timeout: Duration,
    config: ExecutorConfig,
    initializer: Option<Initializer>,
    template: Vec<Callback>,
}

impl Launch {
    /// Allocate the scratch directory, write the call, spawn the child and
    /// start its watchdog. On failure nothing is left behind.
    fn start(self) -> Result<Arc<Invocation>> {
        let Launch {
            function,
            arguments,
            timeout,
            config,
            initializer,
            template,
        } = self;

        let channel = CallChannel::create(config.scratch_root())?;
        let call = CallDescription {
            function: function.clone(),
            arguments,
            output: channel.output().to_path_buf(),
            initializer,
        };

        let child = channel
            .write_input(config.serializer().as_ref(), &call)
            .and_then(|()| spawn_child(&config, &channel));
        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                discard(&channel);
                return Err(e);
            }
        };

        let captured = match config.stdio() {
            StdioMode::Capture => match CapturedStreams::spawn(child.stdout.take(), child.stderr.take()) {
                Ok(captured) => Some(captured),
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    discard(&channel);
                    return Err(e);
                }
            },
            StdioMode::Null | StdioMode::Inherit => None,
        };

        tracing::debug!(
            function = %function,
            pid = child.id(),
            ?timeout,
            dir = %channel.dir().display(),
            "launched child"
        );

        let invocation = Arc::new(Invocation::new(
            function,
            timeout,
            channel,
            Arc::clone(config.serializer()),
            child,
            template,
        ));
        // If the watchdog cannot start, dropping the invocation kills the child
        // and removes the scratch directory.
        Watchdog::new(
            Arc::clone(&invocation),
            config.poll_interval(),
            config.termination(),
            captured,
        )
        .start()?;

        Ok(invocation)
    }
}

fn spawn_child(config: &ExecutorConfig, channel: &CallChannel) -> Result<Child> {
    let mut cmd = Command::new(config.program());
    cmd.args(config.args())
        .envs(config.env().iter().map(|(k, v)| (k, v)))
        .env(INPUT_FILE_ENV, channel.input())
        .stdin(Stdio::null());

    match config.stdio() {
        StdioMode::Null => {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        StdioMode::Inherit => {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        }
        StdioMode::Capture => {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
    }

    cmd.spawn().map_err(|source| Error::Spawn {
        program: config.program().to_path_buf(),
        source,
    })
}

fn discard(channel: &CallChannel) {
    if let Err(e) = channel.cleanup() {
        tracing::warn!(dir = %channel.dir().display(), "failed to remove scratch directory: {}", e);
    }
}
