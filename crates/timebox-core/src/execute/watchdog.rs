//! Deadline enforcement for one child process.
//!
//! Every invocation gets a dedicated watchdog thread. It races the child's
//! exit against the deadline, terminates the child if the deadline wins,
//! forwards captured output, and finally delivers callbacks exactly once.
//!
//! ```text
//! Idle ──launch──▶ Running ──exit──────▶ Completed ──┐
//!                     │                              ├──▶ Closed
//!                     └────deadline────▶ TimedOut ───┘
//! ```

use std::io::{Read, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::Termination;
use crate::error::{Error, Result};

use super::callback::CallbackErrors;
use super::invocation::Invocation;

/// How long the watchdog waits for a signalled child before escalating or giving up.
pub(crate) const REAP_GRACE: Duration = Duration::from_secs(2);

/// How long captured streams may take to drain after the child is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Lifecycle of a watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchdogState {
    /// Created, child not yet supervised.
    Idle,
    /// Racing the child against the deadline.
    Running,
    /// The child exited before the deadline.
    Completed,
    /// The deadline elapsed first and termination was requested.
    TimedOut,
    /// Callbacks delivered. Terminal.
    Closed,
}

impl WatchdogState {
    pub(crate) fn can_transition_to(self, to: WatchdogState) -> bool {
        use WatchdogState::*;
        matches!(
            (self, to),
            (Idle, Running) | (Running, Completed) | (Running, TimedOut) | (Completed, Closed) | (TimedOut, Closed)
        )
    }

    /// Whether the race between exit and deadline has been decided.
    pub fn is_settled(self) -> bool {
        !matches!(self, WatchdogState::Idle | WatchdogState::Running)
    }
}

/// Reader threads draining the child's piped stdout and stderr.
#[derive(Default)]
pub(crate) struct CapturedStreams {
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

impl CapturedStreams {
    pub(crate) fn spawn(
        stdout: Option<impl Read + Send + 'static>,
        stderr: Option<impl Read + Send + 'static>,
    ) -> Result<Self> {
        Ok(Self {
            stdout: stdout.map(|s| spawn_reader("stdout", s)).transpose()?,
            stderr: stderr.map(|s| spawn_reader("stderr", s)).transpose()?,
        })
    }

    /// Forward whatever the child wrote to the parent's own streams.
    fn forward(self, function: &str) {
        if let Some(out) = collect(self.stdout, function, "stdout") {
            write_captured(&mut std::io::stdout().lock(), &out, function, "stdout");
        }
        if let Some(err) = collect(self.stderr, function, "stderr") {
            write_captured(&mut std::io::stderr().lock(), &err, function, "stderr");
        }
    }
}

/// Copy captured bytes to `out`. Failures are logged, never returned.
fn write_captured(out: &mut impl Write, bytes: &[u8], function: &str, stream: &str) -> bool {
    match out.write_all(bytes).and_then(|()| out.flush()) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(function, stream, len = bytes.len(), "failed to forward captured output: {}", e);
            false
        }
    }
}

fn spawn_reader(name: &'static str, mut stream: impl Read + Send + 'static) -> Result<JoinHandle<Vec<u8>>> {
    thread::Builder::new()
        .name(format!("timebox-{}", name))
        .spawn(move || {
            let mut buf = Vec::new();
            // Keep what arrived before the error.
            if let Err(e) = stream.read_to_end(&mut buf) {
                tracing::warn!(stream = name, read = buf.len(), "failed to read captured output: {}", e);
            }
            buf
        })
        .map_err(Error::Io)
}

fn collect(handle: Option<JoinHandle<Vec<u8>>>, function: &str, stream: &str) -> Option<Vec<u8>> {
    let handle = handle?;
    let until = Instant::now() + DRAIN_GRACE;
    while !handle.is_finished() {
        if Instant::now() >= until {
            // A grandchild may still hold the pipe open.
            tracing::warn!(function, stream, "captured stream still open; dropping its output");
            return None;
        }
        thread::sleep(Duration::from_millis(5));
    }
    handle.join().ok().filter(|buf| !buf.is_empty())
}

/// Supervises one invocation on its own thread.
pub(crate) struct Watchdog {
    invocation: Arc<Invocation>,
    poll_interval: Duration,
    termination: Termination,
    captured: Option<CapturedStreams>,
}

impl Watchdog {
    pub(crate) fn new(
        invocation: Arc<Invocation>,
        poll_interval: Duration,
        termination: Termination,
        captured: Option<CapturedStreams>,
    ) -> Self {
        Self {
            invocation,
            poll_interval,
            termination,
            captured,
        }
    }

    /// Start supervising. The state moves `Idle -> Running` before the thread starts.
    pub(crate) fn start(self) -> Result<()> {
        let invocation = Arc::clone(&self.invocation);
        invocation.transition(WatchdogState::Running);

        let handle = thread::Builder::new()
            .name(format!("timebox-watchdog-{}", invocation.pid()))
            .spawn(move || self.run())
            .map_err(Error::Io)?;
        invocation.set_watchdog(handle);
        Ok(())
    }

    fn run(self) -> Option<CallbackErrors> {
        let invocation = &self.invocation;
        invocation.enter_watchdog();
        // A deadline past the end of representable time never elapses.
        let deadline_at = invocation.started().checked_add(invocation.deadline());

        let settled = loop {
            if invocation.poll_exit().is_some() {
                break WatchdogState::Completed;
            }
            let pause = match deadline_at {
                Some(deadline_at) => {
                    let now = Instant::now();
                    if now >= deadline_at {
                        break WatchdogState::TimedOut;
                    }
                    self.poll_interval.min(deadline_at - now)
                }
                None => self.poll_interval,
            };
            thread::sleep(pause);
        };
        invocation.transition(settled);

        if settled == WatchdogState::TimedOut {
            tracing::debug!(
                function = invocation.function(),
                pid = invocation.pid(),
                deadline = ?invocation.deadline(),
                "deadline elapsed; terminating child"
            );
            invocation.terminate(self.termination);
            self.reap();
        }

        if let Some(captured) = self.captured {
            captured.forward(invocation.function());
        }

        let errors = invocation.deliver_callbacks();
        if let Some(ref errors) = errors {
            tracing::error!("{}", errors);
        }
        invocation.transition(WatchdogState::Closed);
        errors
    }

    /// Wait a bounded time for a signalled child, escalating to SIGKILL once.
    fn reap(&self) {
        if self.wait_exit(REAP_GRACE) {
            return;
        }
        if self.termination == Termination::Terminate {
            tracing::warn!(
                function = self.invocation.function(),
                pid = self.invocation.pid(),
                "child ignored termination; killing"
            );
            self.invocation.terminate(Termination::Kill);
            if self.wait_exit(REAP_GRACE) {
                return;
            }
        }
        tracing::warn!(
            function = self.invocation.function(),
            pid = self.invocation.pid(),
            "child did not exit after termination; giving up"
        );
    }

    fn wait_exit(&self, grace: Duration) -> bool {
        let until = Instant::now() + grace;
        loop {
            if self.invocation.poll_exit().is_some() {
                return true;
            }
            if Instant::now() >= until {
                return false;
            }
            thread::sleep(self.poll_interval);
        }
    }
}
