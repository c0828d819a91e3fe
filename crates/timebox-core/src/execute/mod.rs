//! Parent-side execution: launching children, enforcing deadlines, and
//! handing outcomes back to the caller.
//!
//! [`TimeoutExecutor`] launches one child per call and returns an
//! [`AsyncResult`]. A watchdog thread per invocation races the child against
//! the deadline and delivers callbacks once the race is decided.

mod callback;
mod executor;
mod invocation;
mod result;
mod watchdog;

pub use callback::{
    BoxError, Callback, CallbackArgs, CallbackErrors, CallbackFailure, CallbackId, CallbackRegistry,
    ProcessInfo, State,
};
pub use executor::TimeoutExecutor;
pub use result::AsyncResult;
pub use watchdog::WatchdogState;
