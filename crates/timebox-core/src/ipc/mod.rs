//! Inter-process communication with timebox child processes.
//!
//! This module provides the blob protocol and the per-invocation scratch
//! directory used to hand a call to the child and read its outcome back.

mod channel;
pub mod protocol;

pub use channel::{CallChannel, INPUT_FILE_ENV, read_input, write_atomic, write_outcome};
pub use protocol::{
    Arguments, CallDescription, Initializer, OutcomeEnvelope, read_blob, read_frame, write_blob,
};
