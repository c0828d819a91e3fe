//! Shared setup for worker integration tests.

#![allow(dead_code)]

use std::time::Duration;

use tempfile::TempDir;
use timebox_core::{ExecutorConfig, TimeoutExecutor};

/// Config launching the worker built for this test run, with a private scratch root.
pub fn config(scratch: &TempDir) -> ExecutorConfig {
    ExecutorConfig::new(env!("CARGO_BIN_EXE_timebox-worker")).with_scratch_root(scratch.path())
}

/// Executor plus the scratch directory it writes into.
///
/// Keep the `TempDir` alive for as long as the executor is used.
pub fn executor(timeout: Duration) -> (TempDir, TimeoutExecutor) {
    let scratch = TempDir::new().unwrap();
    let executor = TimeoutExecutor::with_config(timeout, config(&scratch));
    (scratch, executor)
}

/// Number of per-invocation directories still present under the scratch root.
pub fn leftover_dirs(scratch: &TempDir) -> usize {
    std::fs::read_dir(scratch.path()).unwrap().count()
}
