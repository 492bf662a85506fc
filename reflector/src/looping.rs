//! Poll loop for `reflector run`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{error, info, warn};

use crate::cycle::{Orchestrator, PassOutcome};
use crate::error::is_halting;
use crate::io::registry::Registry;
use crate::io::transform::TextTransform;

/// Granularity at which the idle wait notices a shutdown request.
const SHUTDOWN_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Run a single pass and exit.
    OneShot,
    /// Run passes until shutdown, sleeping `poll_interval` between them.
    Continuous { poll_interval: Duration },
}

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    /// The single pass of a one-shot run finished.
    OneShotComplete,
    /// Shutdown was requested; the in-flight pass finished first.
    Shutdown,
    /// A state-corruption error stopped the loop.
    Halted { reason: String },
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub passes: u64,
    /// Passes that ended in a recoverable error (continuous mode only).
    pub failed_passes: u64,
    pub stop: LoopStop,
}

/// Run passes until the mode, a shutdown request or a halting error ends the loop.
///
/// Halting errors (duplicate key, concurrent writer, revision conflict) stop
/// with [`LoopStop::Halted`]. Other errors end a one-shot run with `Err`; in
/// continuous mode they are logged and the next pass is attempted.
pub fn run_loop<T: TextTransform, R: Registry, F: FnMut(&PassOutcome)>(
    orchestrator: &mut Orchestrator<'_, T, R>,
    mode: RunMode,
    shutdown: &AtomicBool,
    mut on_pass: F,
) -> Result<LoopOutcome> {
    let mut passes = 0u64;
    let mut failed_passes = 0u64;
    loop {
        match orchestrator.run_pass(shutdown) {
            Ok(outcome) => {
                passes += 1;
                on_pass(&outcome);
            }
            Err(err) if is_halting(&err) => {
                let reason = format!("{err:#}");
                error!(reason = %reason, "halting loop");
                return Ok(LoopOutcome {
                    passes,
                    failed_passes,
                    stop: LoopStop::Halted { reason },
                });
            }
            Err(err) => match mode {
                RunMode::OneShot => return Err(err),
                RunMode::Continuous { .. } => {
                    failed_passes += 1;
                    warn!(err = ?err, failed_passes, "pass failed, retrying after poll interval");
                }
            },
        }

        let poll_interval = match mode {
            RunMode::OneShot => {
                return Ok(LoopOutcome {
                    passes,
                    failed_passes,
                    stop: LoopStop::OneShotComplete,
                });
            }
            RunMode::Continuous { poll_interval } => poll_interval,
        };
        if wait_or_shutdown(poll_interval, shutdown) {
            info!(passes, "shutdown requested, stopping");
            return Ok(LoopOutcome {
                passes,
                failed_passes,
                stop: LoopStop::Shutdown,
            });
        }
    }
}

/// Sleep for `interval`, returning early (true) once `shutdown` is set.
fn wait_or_shutdown(interval: Duration, shutdown: &AtomicBool) -> bool {
    let deadline = Instant::now() + interval;
    loop {
        if shutdown.load(Ordering::SeqCst) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep(SHUTDOWN_POLL.min(deadline - now));
    }
}
