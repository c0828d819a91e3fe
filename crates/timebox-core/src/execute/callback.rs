//! Callbacks delivered after the child process ends.
//!
//! Callbacks run on the watchdog thread, in registration order, exactly once
//! per invocation. A failing callback never stops the ones after it; all
//! failures are collected into one [`CallbackErrors`].

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use super::result::AsyncResult;

/// Error type callbacks may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

type CallbackFn = dyn Fn(&mut CallbackArgs<'_>) -> Result<(), BoxError> + Send + Sync;

static NEXT_CALLBACK_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one registration, for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(u64);

impl CallbackId {
    fn next() -> Self {
        Self(NEXT_CALLBACK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "callback#{}", self.0)
    }
}

/// A registered callback.
#[derive(Clone)]
pub struct Callback {
    id: CallbackId,
    func: Arc<CallbackFn>,
}

impl Callback {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&mut CallbackArgs<'_>) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        Self {
            id: CallbackId::next(),
            func: Arc::new(func),
        }
    }

    pub fn id(&self) -> CallbackId {
        self.id
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Callback").field(&self.id).finish()
    }
}

/// What the child process looked like when callbacks ran.
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    /// Name of the target function.
    pub function: String,
    /// OS process id of the child.
    pub pid: u32,
    /// Exit status, if the child was reaped.
    pub exit_status: Option<ExitStatus>,
    /// Whether the child was forcibly terminated.
    pub forced: bool,
}

impl ProcessInfo {
    /// Exit code, if the child exited normally.
    pub fn code(&self) -> Option<i32> {
        self.exit_status.and_then(|s| s.code())
    }

    /// Whether the child exited with status 0.
    pub fn success(&self) -> bool {
        self.exit_status.is_some_and(|s| s.success())
    }
}

/// Mutable slot shared by all callbacks of one delivery.
#[derive(Default)]
pub struct State {
    pub value: Option<Box<dyn Any + Send>>,
}

impl State {
    /// Borrow the value if it holds a `T`.
    pub fn get<T: Any>(&self) -> Option<&T> {
        self.value.as_ref().and_then(|v| v.downcast_ref())
    }

    /// Mutably borrow the value if it holds a `T`.
    pub fn get_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.value.as_mut().and_then(|v| v.downcast_mut())
    }

    /// Replace the value.
    pub fn set<T: Any + Send>(&mut self, value: T) {
        self.value = Some(Box::new(value));
    }

    /// Borrow the value as `T`, inserting `T::default()` if empty or of another type.
    pub fn get_or_default<T: Any + Send + Default>(&mut self) -> &mut T {
        if self.get::<T>().is_none() {
            self.set(T::default());
        }
        self.value
            .as_mut()
            .and_then(|v| v.downcast_mut())
            .unwrap_or_else(|| unreachable!("slot was just filled with this type"))
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("occupied", &self.value.is_some())
            .finish()
    }
}

/// Context handed to every callback.
pub struct CallbackArgs<'a> {
    pub process: &'a ProcessInfo,
    pub result: &'a AsyncResult<Value>,
    pub state: &'a mut State,
}

/// One failed callback.
#[derive(Debug)]
pub struct CallbackFailure {
    pub id: CallbackId,
    pub error: BoxError,
}

/// Every callback failure of one delivery.
#[derive(Debug)]
pub struct CallbackErrors {
    function: String,
    failures: Vec<CallbackFailure>,
}

impl CallbackErrors {
    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn failures(&self) -> &[CallbackFailure] {
        &self.failures
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for CallbackErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] error when run callback", self.function)?;
        for failure in &self.failures {
            write!(f, "\n  {}: {}", failure.id, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for CallbackErrors {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.failures
            .first()
            .map(|f| f.error.as_ref() as &(dyn std::error::Error + 'static))
    }
}

#[derive(Debug)]
struct CallbackPanic(String);

impl fmt::Display for CallbackPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "callback panicked: {}", self.0)
    }
}

impl std::error::Error for CallbackPanic {}

/// Ordered callbacks: template callbacks first, then invocation-level ones.
#[derive(Debug, Clone, Default)]
pub struct CallbackRegistry {
    template: Vec<Callback>,
    callbacks: Vec<Callback>,
    sealed: bool,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose first entries come from an executor-level template.
    pub fn with_template(template: Vec<Callback>) -> Self {
        Self {
            template,
            ..Self::default()
        }
    }

    /// Append a callback.
    pub fn add(&mut self, callback: Callback) -> CallbackId {
        let id = callback.id();
        self.callbacks.push(callback);
        id
    }

    /// Remove a callback. Returns `false` if it was not registered.
    pub fn remove(&mut self, id: CallbackId) -> bool {
        let before = self.template.len() + self.callbacks.len();
        self.template.retain(|c| c.id != id);
        self.callbacks.retain(|c| c.id != id);
        before != self.template.len() + self.callbacks.len()
    }

    /// Ordered snapshot of every registered callback.
    pub fn list(&self) -> Vec<Callback> {
        self.template.iter().chain(&self.callbacks).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.template.len() + self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark delivery as started. Later registrations are refused by the owner.
    pub(crate) fn seal(&mut self) {
        self.sealed = true;
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Run every callback in order, collecting failures.
    pub fn run_all(
        &self,
        process: &ProcessInfo,
        result: &AsyncResult<Value>,
    ) -> Result<(), CallbackErrors> {
        let mut state = State::default();
        let mut failures = Vec::new();

        for callback in self.template.iter().chain(&self.callbacks) {
            let mut args = CallbackArgs {
                process,
                result,
                state: &mut state,
            };
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (callback.func)(&mut args)));
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(error)) => error,
                Err(payload) => Box::new(CallbackPanic(panic_message(payload.as_ref()))) as BoxError,
            };
            tracing::debug!(callback = %callback.id, "callback failed: {}", error);
            failures.push(CallbackFailure {
                id: callback.id,
                error,
            });
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(CallbackErrors {
                function: process.function.clone(),
                failures,
            })
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
