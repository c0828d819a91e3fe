//! Core engine for timebox deadline execution.
//!
//! This crate provides:
//! - Process-isolated execution of named functions under a wall-clock deadline
//! - File-based call channel with pluggable serializers (JSON, MessagePack)
//! - Watchdog termination and post-exit callbacks
//! - Error chains that survive the process boundary
//! - The child-side runner and function registry for worker binaries

pub mod chain;
pub mod codec;
pub mod config;
pub mod error;
pub mod execute;
pub mod ipc;
pub mod registry;
pub mod runner;

pub use chain::{ErrorLink, SerializedError, TaskError, Traceback};
pub use codec::{JsonSerializer, MessagePackSerializer, Serializer};
pub use config::{ExecutorConfig, StdioMode, Termination};
pub use error::{Error, Result};
pub use execute::{
    AsyncResult, BoxError, Callback, CallbackArgs, CallbackErrors, CallbackId, ProcessInfo, State,
    TimeoutExecutor, WatchdogState,
};
pub use ipc::{Arguments, CallDescription, Initializer, OutcomeEnvelope};
pub use registry::{Registry, TaskResult};
pub use runner::Runner;
