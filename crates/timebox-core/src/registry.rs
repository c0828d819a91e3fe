//! Name-based resolution of target functions inside the child.
//!
//! Functions cannot be shipped between processes, so the worker binary builds a
//! [`Registry`] at startup and the parent refers to targets by name. Any state a
//! target needs travels as [`Arguments`].

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::chain::{LOOKUP_KIND, TaskError};
use crate::ipc::Arguments;

/// What a target function returns.
pub type TaskResult = std::result::Result<Value, TaskError>;

type SyncFn = dyn Fn(&Arguments) -> TaskResult + Send + Sync;
type AsyncFn = dyn Fn(Arguments) -> BoxFuture<'static, TaskResult> + Send + Sync;

/// A registered function.
#[derive(Clone)]
pub enum Target {
    Sync(Arc<SyncFn>),
    Async(Arc<AsyncFn>),
}

impl Target {
    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Target::Sync"),
            Self::Async(_) => f.write_str("Target::Async"),
        }
    }
}

/// Functions callable by name from the parent.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    functions: HashMap<String, Target>,
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a synchronous function. A later registration replaces an earlier one.
    pub fn register<F>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Arguments) -> TaskResult + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Target::Sync(Arc::new(func)));
        self
    }

    /// Register an async function. It is driven on a current-thread runtime in the child.
    pub fn register_async<F, Fut>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: Fn(Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        let boxed = move |args: Arguments| -> BoxFuture<'static, TaskResult> { Box::pin(func(args)) };
        self.functions.insert(name.into(), Target::Async(Arc::new(boxed)));
        self
    }

    /// Look up a function by name.
    pub fn get(&self, name: &str) -> Option<&Target> {
        self.functions.get(name)
    }

    /// Check if a function is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Resolve and invoke `name`, driving async targets to completion.
    ///
    /// An unknown name yields a `LookupError` task error.
    pub fn invoke(&self, name: &str, arguments: Arguments) -> TaskResult {
        let target = self.get(name).ok_or_else(|| {
            TaskError::new(LOOKUP_KIND, format!("no function registered as '{}'", name))
        })?;

        match target {
            Target::Sync(func) => func(&arguments),
            Target::Async(func) => {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| TaskError::from_error(&e))?;
                runtime.block_on(func(arguments))
            }
        }
    }
}
