//! Caller-side handle to a running invocation.

use std::fmt;
use std::marker::PhantomData;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::Termination;
use crate::error::{Error, Result};

use super::callback::{BoxError, Callback, CallbackArgs, CallbackId};
use super::invocation::{Invocation, Outcome};
use super::watchdog::WatchdogState;

/// Handle to one child process and its eventual outcome.
///
/// Cloning is cheap; every clone observes the same invocation. The outcome
/// is decoded once and cached, so [`AsyncResult::result`] can be called
/// repeatedly.
///
/// A caller-side timeout (or dropping a pending [`AsyncResult::delay`]
/// future) terminates the child.
pub struct AsyncResult<T = Value> {
    inner: Arc<Invocation>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for AsyncResult<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for AsyncResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncResult")
            .field("function", &self.inner.function())
            .field("pid", &self.inner.pid())
            .field("state", &self.inner.state())
            .finish()
    }
}

/// Terminates the child unless it already exited. Runs on every exit path of
/// an async wait, including cancellation.
struct TerminateOnDrop<'a>(&'a Invocation);

impl Drop for TerminateOnDrop<'_> {
    fn drop(&mut self) {
        self.0.terminate(Termination::Terminate);
    }
}

impl<T> AsyncResult<T> {
    pub(crate) fn from_invocation(inner: Arc<Invocation>) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    /// The same invocation, decoded as another type.
    pub fn cast<U>(&self) -> AsyncResult<U> {
        AsyncResult::from_invocation(Arc::clone(&self.inner))
    }

    /// Name of the target function.
    pub fn function(&self) -> &str {
        self.inner.function()
    }

    /// OS process id of the child.
    pub fn pid(&self) -> u32 {
        self.inner.pid()
    }

    /// Deadline the watchdog enforces, measured from launch.
    pub fn deadline(&self) -> Duration {
        self.inner.deadline()
    }

    /// Scratch directory of this invocation.
    pub fn scratch_dir(&self) -> &Path {
        self.inner.scratch_dir()
    }

    /// Current watchdog state.
    pub fn state(&self) -> WatchdogState {
        self.inner.state()
    }

    /// Exit status, once the child has been reaped.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.inner.exit_status()
    }

    /// Whether the child was forcibly terminated.
    pub fn is_active(&self) -> bool {
        self.inner.forced()
    }

    /// Whether an outcome has been decoded and cached.
    pub fn has_result(&self) -> bool {
        self.inner.has_outcome()
    }

    /// Terminate the child now. No-op if it already exited or the handle was closed.
    pub fn terminate(&self) -> bool {
        self.inner.terminate(Termination::Terminate)
    }

    /// Block until the child exits, without decoding the outcome.
    ///
    /// `None` waits up to the invocation deadline. On timeout the child is
    /// terminated and [`Error::Timeout`] returned.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let timeout = timeout.unwrap_or(self.inner.deadline());
        if self.inner.wait_finished(timeout) {
            return Ok(());
        }
        self.inner.terminate(Termination::Terminate);
        Err(Error::Timeout { timeout })
    }

    /// Async variant of [`AsyncResult::wait`].
    pub async fn wait_async(&self, timeout: Option<Duration>) -> Result<()> {
        let timeout = timeout.unwrap_or(self.inner.deadline());
        let _guard = TerminateOnDrop(&self.inner);
        if self.inner.wait_finished_async(timeout).await {
            Ok(())
        } else {
            Err(Error::Timeout { timeout })
        }
    }

    /// Register a callback for this invocation only.
    ///
    /// Returns `None` if callbacks were already delivered.
    pub fn add_callback<F>(&self, func: F) -> Option<CallbackId>
    where
        F: Fn(&mut CallbackArgs<'_>) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.inner.add_callback(Callback::new(func))
    }

    /// Remove a callback. Returns `false` if it was not registered.
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        self.inner.remove_callback(id)
    }

    /// Executor callbacks followed by this invocation's own.
    pub fn callbacks(&self) -> Vec<Callback> {
        self.inner.callbacks()
    }

    /// Block until the watchdog closed, surfacing callback failures.
    ///
    /// Only the first call receives [`Error::Callbacks`].
    pub fn join(&self) -> Result<()> {
        self.inner.join_watchdog()
    }

    /// Terminate the child if it is still running and wait for the watchdog
    /// to close. Safe to call more than once.
    ///
    /// The first caller to join receives [`Error::Callbacks`] if any callback
    /// failed. Calling this from a callback is an [`Error::InvalidOperation`].
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    /// Async variant of [`AsyncResult::join`].
    pub async fn join_async(&self) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || inner.join_watchdog())
            .await
            .map_err(|e| Error::InvalidOperation(format!("join task failed: {}", e)))?
    }
}

impl<T: DeserializeOwned> AsyncResult<T> {
    /// Block for the outcome.
    ///
    /// `None` waits up to the invocation deadline. The target's own failure
    /// surfaces as [`Error::Task`] with its cause chain intact.
    pub fn result(&self, timeout: Option<Duration>) -> Result<T> {
        if !self.inner.has_outcome() {
            self.wait(timeout)?;
        }
        self.decode()
    }

    /// Await the outcome.
    ///
    /// The child is terminated if the wait times out or this future is
    /// dropped before completion.
    pub async fn delay(&self, timeout: Option<Duration>) -> Result<T> {
        if !self.inner.has_outcome() {
            self.wait_async(timeout).await?;
        }
        self.decode()
    }

    fn decode(&self) -> Result<T> {
        match self.inner.load_outcome()? {
            Outcome::Value(value) => serde_json::from_value(value.clone()).map_err(|e| {
                Error::Deserialization(format!("[{}] {}", self.inner.function(), e))
            }),
            Outcome::Failure(error) => Err(Error::Task(error.clone())),
        }
    }
}
