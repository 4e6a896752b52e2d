//! Run-scoped registry of resources created by the pipeline.
//!
//! One `RunState` is built at process start and shared by reference with the
//! pipeline, every step and the interrupt path. Steps only ever add entries,
//! and they add them before performing the effect. Entries are removed only by
//! the rollback engine, after it has undone the matching effect.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tracing::debug;

use crate::config::{Configuration, OverwritePolicy};
use crate::error::{ProvisionError, Result};
use crate::mode::ExecutionMode;

/// Lifecycle of a run with respect to rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunPhase {
    /// Steps may still run; rollback has not been claimed
    Active = 0,
    /// The rollback engine owns the ledger
    RollingBack = 1,
    /// The pipeline completed; nothing will be rolled back
    Settled = 2,
}

impl RunPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::RollingBack,
            2 => Self::Settled,
            _ => Self::Active,
        }
    }
}

/// Database and user that the run created (or is about to create).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseIdentity {
    pub name: String,
    pub user: String,
}

/// Recorded side effects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    /// Filesystem trees created by this run (the web root among them)
    pub created_paths: Vec<PathBuf>,
    /// Scratch directories used by downloads
    pub temp_dirs: Vec<PathBuf>,
    pub database_created: bool,
    pub database: Option<DatabaseIdentity>,
    /// Generated site configuration
    pub site_config: Option<PathBuf>,
    /// Backup of the site configuration that was there before this run
    pub site_config_backup: Option<PathBuf>,
    /// Service-enabled symlink
    pub site_link: Option<PathBuf>,
    /// Web root targeted by the content deployment
    pub web_root: Option<PathBuf>,
}

impl Ledger {
    pub fn is_empty(&self) -> bool {
        self.created_paths.is_empty()
            && self.temp_dirs.is_empty()
            && !self.database_created
            && self.database.is_none()
            && self.site_config.is_none()
            && self.site_config_backup.is_none()
            && self.site_link.is_none()
    }
}

/// Shared per-run state.
#[derive(Debug)]
pub struct RunState {
    mode: ExecutionMode,
    overwrite: OverwritePolicy,
    configuration: OnceLock<Arc<Configuration>>,
    halt: Arc<AtomicBool>,
    effects: Arc<Mutex<()>>,
    phase: AtomicU8,
    ledger: Mutex<Ledger>,
}

impl RunState {
    pub fn new(mode: ExecutionMode, overwrite: OverwritePolicy) -> Self {
        Self {
            mode,
            overwrite,
            configuration: OnceLock::new(),
            halt: Arc::new(AtomicBool::new(false)),
            effects: Arc::new(Mutex::new(())),
            phase: AtomicU8::new(RunPhase::Active as u8),
            ledger: Mutex::new(Ledger::default()),
        }
    }

    #[inline]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    #[inline]
    pub fn overwrite(&self) -> OverwritePolicy {
        self.overwrite
    }

    /// Publish the resolved configuration for the interrupt path.
    ///
    /// The configuration can be published once; its mode and overwrite policy
    /// must agree with the state's.
    pub fn activate(&self, configuration: Arc<Configuration>) -> Result<()> {
        if configuration.mode != self.mode || configuration.overwrite != self.overwrite {
            return Err(ProvisionError::config(
                "configuration does not match the run's mode and overwrite policy",
            ));
        }
        self.configuration
            .set(configuration)
            .map_err(|_| ProvisionError::config("run configuration already published"))
    }

    /// Configuration published by [`RunState::activate`], if any
    pub fn configuration(&self) -> Option<Arc<Configuration>> {
        self.configuration.get().cloned()
    }

    /// Flag raised by the interrupt path; shared with every forward effect gate.
    pub fn halt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.halt)
    }

    /// Lock held by forward effect gates around each host mutation.
    pub fn effect_lock(&self) -> Arc<Mutex<()>> {
        Arc::clone(&self.effects)
    }

    /// Wait for the in-flight effect (if any) to finish and keep new ones out.
    ///
    /// Call after [`RunState::halt`]; gates blocked on the lock will see the
    /// halt once it is released.
    pub fn quiesce(&self) -> MutexGuard<'_, ()> {
        self.effects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop normal execution for good.
    pub fn halt(&self) {
        self.halt.store(true, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.halt.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> RunPhase {
        RunPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Take ownership of rollback. Returns false if rollback was already
    /// claimed or the run already settled.
    pub fn claim_rollback(&self) -> bool {
        self.transition(RunPhase::RollingBack)
    }

    /// Mark the run successful. Returns false if rollback got there first.
    pub fn settle(&self) -> bool {
        self.transition(RunPhase::Settled)
    }

    fn transition(&self, to: RunPhase) -> bool {
        let claimed = self
            .phase
            .compare_exchange(
                RunPhase::Active as u8,
                to as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        debug!(to = ?to, claimed, "run phase transition");
        claimed
    }

    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of everything recorded so far
    pub fn ledger(&self) -> Ledger {
        self.lock().clone()
    }

    pub fn record_path(&self, path: &Path) {
        let mut ledger = self.lock();
        if !ledger.created_paths.iter().any(|p| p == path) {
            ledger.created_paths.push(path.to_path_buf());
        }
    }

    pub fn record_temp_dir(&self, path: &Path) {
        let mut ledger = self.lock();
        if !ledger.temp_dirs.iter().any(|p| p == path) {
            ledger.temp_dirs.push(path.to_path_buf());
        }
    }

    /// Remember which database and user this run is working with.
    pub fn record_database_identity(&self, name: &str, user: &str) {
        self.lock().database = Some(DatabaseIdentity {
            name: name.to_string(),
            user: user.to_string(),
        });
    }

    /// Record that the database and user are being created by this run.
    pub fn record_database_created(&self, name: &str, user: &str) {
        let mut ledger = self.lock();
        ledger.database = Some(DatabaseIdentity {
            name: name.to_string(),
            user: user.to_string(),
        });
        ledger.database_created = true;
    }

    pub fn record_web_root(&self, path: &Path) {
        self.lock().web_root = Some(path.to_path_buf());
    }

    pub fn record_site_config(&self, path: &Path) {
        self.lock().site_config = Some(path.to_path_buf());
    }

    pub fn record_site_config_backup(&self, backup: &Path) {
        self.lock().site_config_backup = Some(backup.to_path_buf());
    }

    pub fn record_site_link(&self, path: &Path) {
        self.lock().site_link = Some(path.to_path_buf());
    }

    // Removal is reserved for the rollback engine.

    pub(crate) fn release_path(&self, path: &Path) {
        self.lock().created_paths.retain(|p| p != path);
    }

    pub(crate) fn release_temp_dir(&self, path: &Path) {
        self.lock().temp_dirs.retain(|p| p != path);
    }

    pub(crate) fn release_site_link(&self) {
        self.lock().site_link = None;
    }

    pub(crate) fn release_site_config(&self) {
        let mut ledger = self.lock();
        ledger.site_config = None;
        ledger.site_config_backup = None;
    }

    pub(crate) fn release_database(&self) {
        let mut ledger = self.lock();
        ledger.database_created = false;
        ledger.database = None;
    }
}
