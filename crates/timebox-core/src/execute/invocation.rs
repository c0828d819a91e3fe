//! Shared state of one launched child process.
//!
//! An [`Invocation`] is owned jointly by the caller's result handles and the
//! watchdog thread. The child handle sits behind a mutex so that exit polling
//! and termination never race: a signal is only sent while holding the lock
//! and after `try_wait` confirmed the pid has not been reaped.

use std::path::Path;
use std::process::{Child, ExitStatus};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::watch;

use crate::chain::TaskError;
use crate::codec::Serializer;
use crate::config::Termination;
use crate::error::{Error, Result};
use crate::ipc::CallChannel;

use super::callback::{Callback, CallbackErrors, CallbackId, CallbackRegistry, ProcessInfo};
use super::result::AsyncResult;
use super::watchdog::{REAP_GRACE, WatchdogState};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Decoded outcome, cached after the first read.
#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    Value(Value),
    Failure(TaskError),
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Progress {
    pub state: WatchdogState,
    pub exited: bool,
}

impl Progress {
    /// The child exited or the watchdog gave up on it.
    pub fn finished(&self) -> bool {
        self.exited || self.state == WatchdogState::Closed
    }
}

#[derive(Debug)]
struct Status {
    state: WatchdogState,
    exit: Option<ExitStatus>,
    forced: bool,
}

impl Status {
    fn progress(&self) -> Progress {
        Progress {
            state: self.state,
            exited: self.exit.is_some(),
        }
    }
}

pub(crate) struct Invocation {
    function: String,
    pid: u32,
    deadline: Duration,
    started: Instant,
    channel: CallChannel,
    serializer: Arc<dyn Serializer>,
    child: Mutex<Child>,
    status: Mutex<Status>,
    changed: Condvar,
    progress: watch::Sender<Progress>,
    outcome: OnceLock<Outcome>,
    decoding: Mutex<()>,
    callbacks: Mutex<CallbackRegistry>,
    watchdog: Mutex<Option<JoinHandle<Option<CallbackErrors>>>>,
    watchdog_thread: OnceLock<ThreadId>,
}

impl Invocation {
    pub(crate) fn new(
        function: String,
        deadline: Duration,
        channel: CallChannel,
        serializer: Arc<dyn Serializer>,
        child: Child,
        template: Vec<Callback>,
    ) -> Self {
        let status = Status {
            state: WatchdogState::Idle,
            exit: None,
            forced: false,
        };
        let (progress, _) = watch::channel(status.progress());
        Self {
            function,
            pid: child.id(),
            deadline,
            started: Instant::now(),
            channel,
            serializer,
            child: Mutex::new(child),
            status: Mutex::new(status),
            changed: Condvar::new(),
            progress,
            outcome: OnceLock::new(),
            decoding: Mutex::new(()),
            callbacks: Mutex::new(CallbackRegistry::with_template(template)),
            watchdog: Mutex::new(None),
            watchdog_thread: OnceLock::new(),
        }
    }

    pub(crate) fn function(&self) -> &str {
        &self.function
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid
    }

    pub(crate) fn deadline(&self) -> Duration {
        self.deadline
    }

    pub(crate) fn started(&self) -> Instant {
        self.started
    }

    pub(crate) fn scratch_dir(&self) -> &Path {
        self.channel.dir()
    }

    pub(crate) fn state(&self) -> WatchdogState {
        lock(&self.status).state
    }

    pub(crate) fn exit_status(&self) -> Option<ExitStatus> {
        lock(&self.status).exit
    }

    pub(crate) fn forced(&self) -> bool {
        lock(&self.status).forced
    }

    fn publish(&self, status: &Status) {
        self.progress.send_replace(status.progress());
        self.changed.notify_all();
    }

    /// Move the watchdog state machine forward. Illegal moves are ignored.
    pub(crate) fn transition(&self, to: WatchdogState) -> bool {
        let mut status = lock(&self.status);
        if !status.state.can_transition_to(to) {
            tracing::debug!(function = %self.function, from = ?status.state, to = ?to, "ignoring watchdog transition");
            return false;
        }
        status.state = to;
        self.publish(&status);
        true
    }

    fn record_exit(&self, exit: ExitStatus) {
        let mut status = lock(&self.status);
        if status.exit.is_none() {
            tracing::debug!(function = %self.function, pid = self.pid, %exit, "child exited");
            status.exit = Some(exit);
            self.publish(&status);
        }
    }

    /// Check, without blocking, whether the child exited.
    pub(crate) fn poll_exit(&self) -> Option<ExitStatus> {
        let polled = lock(&self.child).try_wait();
        match polled {
            Ok(Some(exit)) => {
                self.record_exit(exit);
                Some(exit)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(function = %self.function, pid = self.pid, "failed to poll child: {}", e);
                None
            }
        }
    }

    /// Send the termination signal if the child is still running.
    ///
    /// Returns `true` if a signal was sent. Never waits for the child to die.
    pub(crate) fn terminate(&self, how: Termination) -> bool {
        if self.state() == WatchdogState::Closed {
            return false;
        }
        let mut child = lock(&self.child);
        match child.try_wait() {
            Ok(Some(exit)) => {
                drop(child);
                self.record_exit(exit);
                return false;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(function = %self.function, pid = self.pid, "failed to poll child: {}", e);
            }
        }
        let sent = send_signal(&mut child, how);
        drop(child);

        if sent {
            tracing::debug!(function = %self.function, pid = self.pid, ?how, "sent termination signal");
            let mut status = lock(&self.status);
            status.forced = true;
            self.publish(&status);
        }
        sent
    }

    /// Block until the child finished or `timeout` elapsed.
    ///
    /// A timeout too large to represent as an [`Instant`] waits without limit.
    pub(crate) fn wait_finished(&self, timeout: Duration) -> bool {
        let until = Instant::now().checked_add(timeout);
        self.wait_status(until, |status| status.progress().finished())
    }

    fn wait_status(&self, until: Option<Instant>, done: impl Fn(&Status) -> bool) -> bool {
        let mut status = lock(&self.status);
        loop {
            if done(&*status) {
                return true;
            }
            status = match until {
                Some(until) => {
                    let now = Instant::now();
                    if now >= until {
                        return false;
                    }
                    match self.changed.wait_timeout(status, until - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
                None => self.changed.wait(status).unwrap_or_else(PoisonError::into_inner),
            };
        }
    }

    /// Terminate the child if needed and block until the watchdog closed.
    ///
    /// Idempotent. Callback failures surface here if nobody joined before.
    pub(crate) fn close(&self) -> Result<()> {
        self.refuse_on_watchdog()?;
        if self.state() == WatchdogState::Closed {
            return Ok(());
        }
        if self.terminate(Termination::Terminate) && !self.wait_finished(REAP_GRACE) {
            self.terminate(Termination::Kill);
        }
        self.join_watchdog()?;
        self.wait_status(None, |status| status.state == WatchdogState::Closed);
        Ok(())
    }

    /// Async variant of [`Invocation::wait_finished`].
    pub(crate) async fn wait_finished_async(&self, timeout: Duration) -> bool {
        let mut progress = self.progress.subscribe();
        let finished = progress.wait_for(Progress::finished);
        matches!(tokio::time::timeout(timeout, finished).await, Ok(Ok(_)))
    }

    pub(crate) fn has_outcome(&self) -> bool {
        self.outcome.get().is_some()
    }

    /// Read and decode the outcome envelope once; later calls reuse it.
    pub(crate) fn load_outcome(&self) -> Result<&Outcome> {
        if let Some(outcome) = self.outcome.get() {
            return Ok(outcome);
        }
        // One reader at a time: the first one removes the scratch directory.
        let _decoding = lock(&self.decoding);
        if let Some(outcome) = self.outcome.get() {
            return Ok(outcome);
        }
        if !lock(&self.status).progress().finished() {
            return Err(Error::InvalidOperation(format!(
                "[{}] outcome requested while the child is still running",
                self.function
            )));
        }

        let envelope = match self.channel.read_outcome(self.serializer.as_ref())? {
            Some(envelope) => envelope,
            None if self.forced() => {
                return Err(Error::Timeout {
                    timeout: self.deadline,
                });
            }
            None => {
                return Err(Error::MissingOutcome {
                    path: self.channel.output().to_path_buf(),
                });
            }
        };
        let decoded = match envelope.into_result()? {
            Ok(value) => Outcome::Value(value),
            Err(error) => Outcome::Failure(error),
        };

        let outcome = self.outcome.get_or_init(|| decoded);
        self.reclaim();
        Ok(outcome)
    }

    fn reclaim(&self) {
        if let Err(e) = self.channel.cleanup() {
            tracing::warn!(dir = %self.channel.dir().display(), "failed to remove scratch directory: {}", e);
        }
    }

    pub(crate) fn add_callback(&self, callback: Callback) -> Option<CallbackId> {
        let mut callbacks = lock(&self.callbacks);
        if callbacks.is_sealed() {
            tracing::warn!(function = %self.function, "callbacks already delivered; ignoring late registration");
            return None;
        }
        Some(callbacks.add(callback))
    }

    pub(crate) fn remove_callback(&self, id: CallbackId) -> bool {
        lock(&self.callbacks).remove(id)
    }

    pub(crate) fn callbacks(&self) -> Vec<Callback> {
        lock(&self.callbacks).list()
    }

    /// Run every callback once. Called by the watchdog only.
    pub(crate) fn deliver_callbacks(self: &Arc<Self>) -> Option<CallbackErrors> {
        let registry = {
            let mut callbacks = lock(&self.callbacks);
            if callbacks.is_sealed() {
                return None;
            }
            callbacks.seal();
            callbacks.clone()
        };
        if registry.is_empty() {
            return None;
        }

        let info = {
            let status = lock(&self.status);
            ProcessInfo {
                function: self.function.clone(),
                pid: self.pid,
                exit_status: status.exit,
                forced: status.forced,
            }
        };
        let handle = AsyncResult::<Value>::from_invocation(Arc::clone(self));

        tracing::debug!(function = %self.function, count = registry.len(), "running callbacks");
        registry.run_all(&info, &handle).err()
    }

    pub(crate) fn set_watchdog(&self, handle: JoinHandle<Option<CallbackErrors>>) {
        *lock(&self.watchdog) = Some(handle);
    }

    /// Called first thing on the watchdog thread.
    pub(crate) fn enter_watchdog(&self) {
        let _ = self.watchdog_thread.set(thread::current().id());
    }

    fn refuse_on_watchdog(&self) -> Result<()> {
        if self.watchdog_thread.get() == Some(&thread::current().id()) {
            return Err(Error::InvalidOperation(format!(
                "[{}] cannot wait for the watchdog from one of its own callbacks",
                self.function
            )));
        }
        Ok(())
    }

    /// Wait for the watchdog thread and take the callback failures, if any.
    ///
    /// Only the first caller receives the failures.
    pub(crate) fn join_watchdog(&self) -> Result<()> {
        self.refuse_on_watchdog()?;
        let Some(handle) = lock(&self.watchdog).take() else {
            return Ok(());
        };
        match handle.join() {
            Ok(None) => Ok(()),
            Ok(Some(errors)) => Err(Error::Callbacks(errors)),
            Err(_) => Err(Error::InvalidOperation(format!(
                "[{}] watchdog thread panicked",
                self.function
            ))),
        }
    }
}

impl Drop for Invocation {
    fn drop(&mut self) {
        // A child nobody waits for anymore is not left running.
        if lock(&self.status).exit.is_none() {
            self.terminate(Termination::Kill);
            let _ = lock(&self.child).try_wait();
        }
        self.reclaim();
    }
}

#[cfg(unix)]
fn send_signal(child: &mut Child, how: Termination) -> bool {
    let signal = match how {
        Termination::Terminate => libc::SIGTERM,
        Termination::Kill => libc::SIGKILL,
    };
    // SAFETY: the caller holds the child lock and saw it unreaped, so the pid
    // still refers to our child.
    let rc = unsafe { libc::kill(child.id() as libc::pid_t, signal) };
    if rc != 0 {
        tracing::warn!(pid = child.id(), "kill failed: {}", std::io::Error::last_os_error());
        return false;
    }
    true
}

#[cfg(not(unix))]
fn send_signal(child: &mut Child, _how: Termination) -> bool {
    match child.kill() {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(pid = child.id(), "kill failed: {}", e);
            false
        }
    }
}
