//! Executor configuration.
//!
//! Everything an executor needs is fixed here, once, before the first call:
//! which program to launch, where scratch directories live, which serializer
//! encodes the blobs, and how the child is terminated.

use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::codec::{self, JsonSerializer, Serializer};
use crate::error::{Error, Result};

/// Overrides the worker program.
pub const WORKER_PATH_ENV: &str = "TIMEBOX_WORKER_PATH";
/// Overrides the scratch root.
pub const SCRATCH_DIR_ENV: &str = "TIMEBOX_SCRATCH_DIR";
/// Selects a built-in serializer by name.
pub const SERIALIZER_ENV: &str = "TIMEBOX_SERIALIZER";

/// Binary name looked up when no worker path is configured.
pub const DEFAULT_WORKER_NAME: &str = "timebox-worker";

/// What happens to the child's stdout/stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdioMode {
    /// Discard both streams.
    #[default]
    Null,
    /// Share the parent's streams.
    Inherit,
    /// Pipe both streams; the watchdog forwards them to the parent's streams on close.
    Capture,
}

/// Signal used for forced termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Termination {
    /// SIGTERM on unix. Lets the child run its signal handlers.
    #[default]
    Terminate,
    /// SIGKILL on unix.
    Kill,
}

/// Configuration shared by every call an executor makes.
#[derive(Clone)]
pub struct ExecutorConfig {
    program: PathBuf,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    scratch_root: PathBuf,
    serializer: Arc<dyn Serializer>,
    stdio: StdioMode,
    termination: Termination,
    poll_interval: Duration,
}

impl ExecutorConfig {
    /// Configuration launching `program` with defaults for everything else.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            scratch_root: std::env::temp_dir().join("timebox"),
            serializer: Arc::new(JsonSerializer),
            stdio: StdioMode::default(),
            termination: Termination::default(),
            poll_interval: Duration::from_millis(10),
        }
    }

    /// Configuration that re-executes the current binary as the worker.
    ///
    /// The binary's `main` must hand control to a `Runner` when
    /// `Runner::is_child()` is true.
    pub fn self_exec() -> Result<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    /// Defaults overlaid with `TIMEBOX_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(root) = std::env::var_os(SCRATCH_DIR_ENV) {
            config.scratch_root = PathBuf::from(root);
        }

        if let Ok(name) = std::env::var(SERIALIZER_ENV) {
            config.serializer = codec::by_name(&name).ok_or_else(|| {
                Error::InvalidOperation(format!("unknown serializer '{}' in {}", name, SERIALIZER_ENV))
            })?;
        }

        Ok(config)
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    /// Append an argument passed to the worker program.
    pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Set an extra environment variable for the child.
    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_scratch_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.scratch_root = root.into();
        self
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_stdio(mut self, stdio: StdioMode) -> Self {
        self.stdio = stdio;
        self
    }

    pub fn with_termination(mut self, termination: Termination) -> Self {
        self.termination = termination;
        self
    }

    /// How often the watchdog checks whether the child exited.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    pub fn env(&self) -> &[(OsString, OsString)] {
        &self.env
    }

    pub fn scratch_root(&self) -> &Path {
        &self.scratch_root
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    pub fn stdio(&self) -> StdioMode {
        self.stdio
    }

    pub fn termination(&self) -> Termination {
        self.termination
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let program = locate_worker(DEFAULT_WORKER_NAME)
            .or_else(|| std::env::current_exe().ok())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKER_NAME));
        Self::new(program)
    }
}

impl fmt::Debug for ExecutorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorConfig")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("scratch_root", &self.scratch_root)
            .field("serializer", &self.serializer.name())
            .field("stdio", &self.stdio)
            .field("termination", &self.termination)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

/// Find a worker binary.
///
/// Looks in the following order:
/// 1. `TIMEBOX_WORKER_PATH` environment variable
/// 2. Same directory as the current executable, or its parent
///    (test binaries live in `target/<profile>/deps`)
/// 3. System PATH
pub fn locate_worker(name: &str) -> Option<PathBuf> {
    // 1. Check environment variable
    if let Some(path) = std::env::var_os(WORKER_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
        tracing::warn!("{} points at missing file {}", WORKER_PATH_ENV, path.display());
    }

    let file_name = if cfg!(windows) {
        format!("{}.exe", name)
    } else {
        name.to_string()
    };

    // 2. Look next to current executable
    if let Ok(exe_path) = std::env::current_exe() {
        let candidates = exe_path
            .ancestors()
            .skip(1)
            .take(2)
            .map(|dir| dir.join(&file_name));
        for candidate in candidates {
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }

    // 3. Try system PATH via which
    which::which(&file_name).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MessagePackSerializer;

    #[test]
    fn test_builder() {
        let config = ExecutorConfig::new("/usr/bin/worker")
            .with_arg("--quiet")
            .with_env("K", "V")
            .with_scratch_root("/tmp/tb")
            .with_serializer(Arc::new(MessagePackSerializer))
            .with_stdio(StdioMode::Capture)
            .with_termination(Termination::Kill)
            .with_poll_interval(Duration::from_millis(25));

        assert_eq!(config.program(), Path::new("/usr/bin/worker"));
        assert_eq!(config.args(), &[OsString::from("--quiet")]);
        assert_eq!(config.env(), &[(OsString::from("K"), OsString::from("V"))]);
        assert_eq!(config.scratch_root(), Path::new("/tmp/tb"));
        assert_eq!(config.serializer().name(), "msgpack");
        assert_eq!(config.stdio(), StdioMode::Capture);
        assert_eq!(config.termination(), Termination::Kill);
        assert_eq!(config.poll_interval(), Duration::from_millis(25));
    }

    #[test]
    fn test_defaults() {
        let config = ExecutorConfig::new("worker");
        assert_eq!(config.serializer().name(), "json");
        assert_eq!(config.stdio(), StdioMode::Null);
        assert_eq!(config.termination(), Termination::Terminate);
        assert!(config.scratch_root().ends_with("timebox"));
    }

    #[test]
    fn test_poll_interval_floor() {
        let config = ExecutorConfig::new("worker").with_poll_interval(Duration::ZERO);
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_debug_names_serializer() {
        let rendered = format!("{:?}", ExecutorConfig::new("worker"));
        assert!(rendered.contains("\"json\""));
    }
}
