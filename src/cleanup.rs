//! Rollback engine.
//!
//! On the failure and interrupt paths the recorded side effects are turned
//! into an ordered list of independent [`CompensatingAction`]s. Each one is
//! attempted regardless of how the previous ones went; failures are collected
//! in a [`CleanupReport`] and never mask the error that triggered the rollback.
//!
//! Order:
//! 1. created filesystem trees (the web root)
//! 2. enabled-site symlink, then the site configuration (backup restored if any)
//! 3. database and user, when created by this run or when overwriting
//! 4. download scratch directories

use std::fmt;
use std::path::PathBuf;

use tracing::{debug, error, info, warn};

use crate::commands::{sql_literal, CommandArgs, MysqlStatement};
use crate::config::Configuration;
use crate::error::{ProvisionError, Result};
use crate::mode::Admission;
use crate::run_state::{DatabaseIdentity, Ledger, RunState};
use crate::toolkit::Toolkit;

/// One reversible side effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompensatingAction {
    RemovePath(PathBuf),
    RemoveSiteLink(PathBuf),
    RestoreSiteConfig { config: PathBuf, backup: PathBuf },
    RemoveSiteConfig(PathBuf),
    DropDatabase(DatabaseIdentity),
    RemoveTempDir(PathBuf),
}

impl fmt::Display for CompensatingAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemovePath(p) => write!(f, "remove {}", p.display()),
            Self::RemoveSiteLink(p) => write!(f, "remove site link {}", p.display()),
            Self::RestoreSiteConfig { config, backup } => write!(
                f,
                "restore {} from {}",
                config.display(),
                backup.display()
            ),
            Self::RemoveSiteConfig(p) => write!(f, "remove site config {}", p.display()),
            Self::DropDatabase(db) => {
                write!(f, "drop database {} and user {}", db.name, db.user)
            }
            Self::RemoveTempDir(p) => write!(f, "remove temporary directory {}", p.display()),
        }
    }
}

/// SQL that drops the database and its user, tolerating their absence.
pub fn drop_database_sql(db: &DatabaseIdentity) -> String {
    format!(
        "DROP DATABASE IF EXISTS `{}`; DROP USER IF EXISTS {}@'localhost'; FLUSH PRIVILEGES;",
        db.name,
        sql_literal(&db.user)
    )
}

impl CompensatingAction {
    fn undo(&self, tools: &Toolkit) -> Result<Admission> {
        match self {
            Self::RemovePath(path)
            | Self::RemoveSiteLink(path)
            | Self::RemoveSiteConfig(path)
            | Self::RemoveTempDir(path) => tools.files.remove(path),
            Self::RestoreSiteConfig { config, backup } => {
                if !tools.files.exists(backup) {
                    warn!("Backup {} is gone; removing generated config", backup.display());
                    return tools.files.remove(config);
                }
                tools.files.rename(backup, config)
            }
            Self::DropDatabase(db) => {
                let result = tools
                    .commands
                    .run(&MysqlStatement::new(drop_database_sql(db)).to_spec())?;
                Ok(if result.simulated {
                    Admission::Simulated
                } else {
                    Admission::Perform
                })
            }
        }
    }

    /// Forget the ledger entry this action compensated.
    fn release(&self, state: &RunState) {
        match self {
            Self::RemovePath(path) => state.release_path(path),
            Self::RemoveSiteLink(_) => state.release_site_link(),
            Self::RestoreSiteConfig { .. } | Self::RemoveSiteConfig(_) => {
                state.release_site_config()
            }
            Self::DropDatabase(_) => state.release_database(),
            Self::RemoveTempDir(path) => state.release_temp_dir(path),
        }
    }
}

/// Derive the compensating actions for `ledger`, in execution order.
pub fn plan(ledger: &Ledger, config: &Configuration) -> Vec<CompensatingAction> {
    let mut actions: Vec<CompensatingAction> = ledger
        .created_paths
        .iter()
        .cloned()
        .map(CompensatingAction::RemovePath)
        .collect();

    if let Some(link) = &ledger.site_link {
        actions.push(CompensatingAction::RemoveSiteLink(link.clone()));
    }
    match (&ledger.site_config, &ledger.site_config_backup) {
        (Some(config), Some(backup)) => actions.push(CompensatingAction::RestoreSiteConfig {
            config: config.clone(),
            backup: backup.clone(),
        }),
        (Some(config), None) => actions.push(CompensatingAction::RemoveSiteConfig(config.clone())),
        (None, _) => {}
    }

    if ledger.database_created || config.overwrite.is_destructive() {
        let identity = ledger.database.clone().unwrap_or_else(|| DatabaseIdentity {
            name: config.database.name.clone(),
            user: config.database.user.clone(),
        });
        actions.push(CompensatingAction::DropDatabase(identity));
    }

    actions.extend(
        ledger
            .temp_dirs
            .iter()
            .cloned()
            .map(CompensatingAction::RemoveTempDir),
    );
    actions
}

/// Outcome of one rollback.
#[derive(Debug, Default)]
pub struct CleanupReport {
    /// Every action attempted, in order
    pub attempted: Vec<CompensatingAction>,
    /// Actions that failed, with their error
    pub failures: Vec<(CompensatingAction, ProvisionError)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Undo everything recorded in `state`.
///
/// Callers must hold the rollback claim (see [`run_once`]).
pub fn cleanup(config: &Configuration, state: &RunState, tools: &Toolkit) -> CleanupReport {
    let tools = tools.detached();
    let actions = plan(&state.ledger(), config);
    warn!("Running full cleanup ({} action(s))...", actions.len());

    let mut report = CleanupReport::default();
    for action in actions {
        debug!(action = %action, "compensating");
        match action.undo(&tools) {
            Ok(Admission::Perform) => action.release(state),
            Ok(Admission::Simulated) => {}
            Err(e) => {
                error!("Cleanup action '{}' failed: {}", action, e);
                report.failures.push((action.clone(), e));
            }
        }
        report.attempted.push(action);
    }

    if report.is_clean() {
        info!("Cleanup complete");
    } else {
        warn!("Cleanup finished with {} failure(s)", report.failures.len());
    }
    report
}

/// Run the rollback if nobody else has claimed it and the run has not settled.
pub fn run_once(
    config: &Configuration,
    state: &RunState,
    tools: &Toolkit,
) -> Option<CleanupReport> {
    if !state.claim_rollback() {
        debug!(phase = ?state.phase(), "rollback already claimed or run settled");
        return None;
    }
    Some(cleanup(config, state, tools))
}

/// Success-path housekeeping: delete download scratch directories.
///
/// This is not a rollback; the ledger is left as recorded.
pub fn remove_scratch(state: &RunState, tools: &Toolkit) {
    for dir in state.ledger().temp_dirs {
        if let Err(e) = tools.files.remove(&dir) {
            debug!(path = %dir.display(), error = %e, "failed to remove temporary directory");
        }
    }
}
