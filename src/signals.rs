//! Interrupt handling and child process setup.
//!
//! SIGINT, SIGTERM and SIGHUP are received on a dedicated thread (not inside
//! an async signal handler), so the interrupt path can log, take the rollback
//! claim and run the same cleanup routine as the failure path before exiting.
//!
//! Child processes are started in their own process group. A terminal Ctrl+C
//! therefore reaches only this process, which decides how to unwind. An
//! external operation already in flight is not cancelled and may keep running
//! after the orchestrator exits.

use std::process::Command;
use std::sync::Arc;
use std::thread;

use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{error, info, warn};

use crate::cleanup;
use crate::run_state::RunState;
use crate::toolkit::Toolkit;

/// Exit status after an interrupt
pub const INTERRUPT_EXIT_CODE: i32 = 1;

pub fn signal_name(signal: i32) -> &'static str {
    match signal {
        SIGINT => "SIGINT",
        SIGTERM => "SIGTERM",
        SIGHUP => "SIGHUP",
        _ => "UNKNOWN",
    }
}

/// React to a termination signal; returns the exit status to use.
///
/// Normal execution is halted for good before anything else happens. Rollback
/// then waits for the effect in flight to finish and keeps the effect lock
/// until it is done. If the configuration was never published, there is
/// nothing to roll back. If the rollback was already claimed (by the failure
/// path) or the run settled, this leaves the ledger alone.
pub fn handle_interrupt(signal: i32, state: &RunState, tools: &Toolkit) -> Option<i32> {
    state.halt();
    warn!("Received {} signal. Attempting cleanup...", signal_name(signal));
    let _quiesced = state.quiesce();

    let Some(config) = state.configuration() else {
        info!("Interrupted before configuration was resolved; nothing to clean up");
        return Some(INTERRUPT_EXIT_CODE);
    };

    match cleanup::run_once(&config, state, tools) {
        Some(report) => {
            if !report.is_clean() {
                error!(
                    "Cleanup failed during signal handling ({} action(s))",
                    report.failures.len()
                );
            }
            Some(INTERRUPT_EXIT_CODE)
        }
        // The main flow owns the outcome (rolling back or already settled)
        None => None,
    }
}

/// Start the interrupt thread for this run.
///
/// Call this once, right after the run state exists.
pub fn install_interrupt_handler(state: Arc<RunState>, tools: Toolkit) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM, SIGHUP])?;

    thread::spawn(move || {
        for sig in signals.forever() {
            if let Some(code) = handle_interrupt(sig, &state, &tools) {
                std::process::exit(code);
            }
        }
    });

    Ok(())
}

/// Extension trait for std::process::Command to set up process groups
pub trait CommandProcessGroup {
    /// Run the child as the leader of a new process group
    fn in_new_process_group(&mut self) -> &mut Self;
}

impl CommandProcessGroup for Command {
    fn in_new_process_group(&mut self) -> &mut Self {
        use std::os::unix::process::CommandExt;
        self.process_group(0)
    }
}
