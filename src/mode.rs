//! Execution mode and the effect gate.
//!
//! The mode is resolved once from the command line and copied into every
//! component that can mutate the host. There is no setter: once the pipeline
//! starts, nothing can flip a simulated run into a real one or back.
//!
//! Every effectful operation asks an [`EffectGate`] for admission first. In
//! simulate mode the gate records a human-readable description in the run's
//! [`Journal`] and tells the caller to skip the mutation. After an interrupt
//! the gate refuses all forward effects so normal execution can never resume.
//!
//! Admitted effects run while holding the run's effect lock (see
//! [`EffectGate::hold`]). The interrupt path takes the same lock before rolling
//! back, so rollback starts only once the main flow is parked between effects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use tracing::info;

use crate::error::{ProvisionError, Result};

/// Whether effectful operations are only described or actually performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ExecutionMode {
    /// Describe every effect, perform none (the default)
    #[default]
    Simulate,
    /// Perform effects for real
    Perform,
}

impl ExecutionMode {
    /// Resolve the mode from the mutually exclusive `--execute` flag.
    pub fn from_execute_flag(execute: bool) -> Self {
        if execute { Self::Perform } else { Self::Simulate }
    }

    #[inline]
    pub fn is_simulate(self) -> bool {
        matches!(self, Self::Simulate)
    }

    #[inline]
    pub fn is_perform(self) -> bool {
        matches!(self, Self::Perform)
    }

    /// Banner text used by the plan and summary output
    pub fn banner(self) -> &'static str {
        match self {
            Self::Simulate => "DRY-RUN (no changes)",
            Self::Perform => "EXECUTE",
        }
    }
}

/// Ordered record of effects that a simulated run would have performed.
#[derive(Debug, Default)]
pub struct Journal {
    entries: Mutex<Vec<String>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.into());
    }

    /// Snapshot of all recorded entries in order
    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true if any entry mentions `needle`
    pub fn mentions(&self, needle: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|e| e.contains(needle))
    }
}

/// Decision returned by [`EffectGate::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Go ahead and mutate the host
    Perform,
    /// Mode is simulate; the description was journaled, skip the mutation
    Simulated,
}

impl Admission {
    #[inline]
    pub fn is_simulated(self) -> bool {
        matches!(self, Self::Simulated)
    }
}

/// Held while an admitted effect touches the host.
#[derive(Debug)]
pub struct EffectGuard<'a> {
    _held: Option<MutexGuard<'a, ()>>,
}

/// Mode check shared by the command executor, file operations and downloads.
#[derive(Debug, Clone)]
pub struct EffectGate {
    mode: ExecutionMode,
    journal: Arc<Journal>,
    halt: Option<Arc<AtomicBool>>,
    effects: Option<Arc<Mutex<()>>>,
}

impl EffectGate {
    /// Create a gate that refuses effects once `halt` is raised.
    pub fn new(mode: ExecutionMode, journal: Arc<Journal>, halt: Arc<AtomicBool>) -> Self {
        Self {
            mode,
            journal,
            halt: Some(halt),
            effects: None,
        }
    }

    /// Serialize admitted effects on `lock`, shared with the interrupt path.
    pub fn with_effect_lock(mut self, lock: Arc<Mutex<()>>) -> Self {
        self.effects = Some(lock);
        self
    }

    /// Create a gate that ignores the halt flag (used by rollback).
    pub fn ungated(mode: ExecutionMode, journal: Arc<Journal>) -> Self {
        Self {
            mode,
            journal,
            halt: None,
            effects: None,
        }
    }

    /// Same mode and journal, without the halt check or the effect lock.
    ///
    /// Rollback runs on detached tools while the interrupt path holds the
    /// effect lock.
    pub fn detached(&self) -> Self {
        Self {
            mode: self.mode,
            journal: Arc::clone(&self.journal),
            halt: None,
            effects: None,
        }
    }

    #[inline]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    /// Check whether normal execution has been stopped by an interrupt.
    pub fn ensure_running(&self) -> Result<()> {
        match &self.halt {
            Some(flag) if flag.load(Ordering::SeqCst) => {
                Err(ProvisionError::interrupted("termination signal"))
            }
            _ => Ok(()),
        }
    }

    /// Ask permission for an effect described by `describe`.
    ///
    /// The description is only built when the mode is simulate.
    pub fn admit(&self, describe: impl FnOnce() -> String) -> Result<Admission> {
        self.ensure_running()?;
        match self.mode {
            ExecutionMode::Perform => Ok(Admission::Perform),
            ExecutionMode::Simulate => {
                let description = describe();
                info!("[dry-run] {}", description);
                self.journal.record(description);
                Ok(Admission::Simulated)
            }
        }
    }

    /// Take the effect lock for one admitted host mutation.
    ///
    /// The halt flag is checked again once the lock is held: an interrupt that
    /// arrived while waiting wins, and the effect is refused.
    pub fn hold(&self) -> Result<EffectGuard<'_>> {
        let held = self
            .effects
            .as_ref()
            .map(|lock| lock.lock().unwrap_or_else(PoisonError::into_inner));
        self.ensure_running()?;
        Ok(EffectGuard { _held: held })
    }
}
