//! LEMP Provisioner Library
//!
//! Installs nginx, MySQL, PHP-FPM and WordPress on a single Debian/Ubuntu host
//! through an ordered pipeline of steps. Every run can be simulated, every
//! configuration write is atomic, and a failure or interrupt rolls back what
//! the run created.

pub mod archive;
pub mod atomic_write;
pub mod cleanup;
pub mod cli;
pub mod command_executor;
pub mod commands;
pub mod config;
pub mod error;
pub mod fetch;
pub mod filesystem;
pub mod host_check;
pub mod mode;
pub mod pipeline;
pub mod run_state;
pub mod signals;
pub mod steps;
pub mod toolkit;

// Re-export main types for convenience
pub use cleanup::{CleanupReport, CompensatingAction};
pub use command_executor::{CommandBackend, CommandExecutor, CommandResult, CommandSpec, RawOutput};
pub use commands::CommandArgs;
pub use config::{Configuration, Layout, OverwritePolicy, Parameters};
pub use error::{ProvisionError, Result};
pub use fetch::{Fetcher, Release, WebClient};
pub use filesystem::{FileOps, FsBackend};
pub use mode::{Admission, EffectGate, EffectGuard, ExecutionMode, Journal};
pub use pipeline::{Pipeline, RunOutcome, Step, StepContext};
pub use run_state::{Ledger, RunPhase, RunState};
pub use signals::{handle_interrupt, install_interrupt_handler, CommandProcessGroup};
pub use toolkit::Toolkit;
