//! Timebox worker process.
//!
//! Launched by a `TimeoutExecutor` with `TIMEBOX_INPUT_FILE` pointing at the
//! call description. Runs one call and exits.

mod functions;

use std::process::ExitCode;

use timebox_core::Runner;
use timebox_core::ipc::INPUT_FILE_ENV;
use tracing_subscriber::EnvFilter;

/// Log filter for the worker, written to stderr.
const LOG_ENV: &str = "TIMEBOX_LOG";

fn main() -> anyhow::Result<ExitCode> {
    init_logging()?;

    if !Runner::is_child() {
        anyhow::bail!(
            "{} is not set; timebox-worker is launched by a timebox executor",
            INPUT_FILE_ENV
        );
    }

    let registry = functions::registry();
    tracing::debug!(functions = ?registry.names(), "worker starting");
    Ok(Runner::new(registry).main())
}

fn init_logging() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install logger: {}", e))
}
