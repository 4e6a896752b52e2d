//! The provisioning steps.
//!
//! Each step is a unit struct implementing [`Step`](crate::pipeline::Step).
//! Steps keep no state of their own: everything they create is recorded in
//! the run state before it is created.

pub mod content;
pub mod database;
pub mod system;
pub mod tls;
pub mod web_server;

use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, info};

use crate::config::OverwritePolicy;
use crate::error::{ProvisionError, Result};

/// What to do about a target resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Nothing there yet
    Create,
    /// Present and overwrite is enabled
    Replace,
}

/// Apply the overwrite policy to a resource that may already exist.
///
/// Fails with `ResourceConflict` (touching nothing) when the resource exists
/// and overwrite is disabled.
pub fn resolve_conflict(
    exists: bool,
    resource: &str,
    policy: OverwritePolicy,
) -> Result<Disposition> {
    debug!(resource, exists, overwrite = policy.is_destructive(), "checking for existing resource");
    match (exists, policy) {
        (false, _) => Ok(Disposition::Create),
        (true, OverwritePolicy::Replace) => {
            info!("Overwrite enabled: replacing existing {}", resource);
            Ok(Disposition::Replace)
        }
        (true, OverwritePolicy::Preserve) => Err(ProvisionError::conflict(resource)),
    }
}

/// UTC timestamp used in backup names (`YYYYmmddHHMMSS`)
pub fn timestamp() -> String {
    Utc::now().format("%Y%m%d%H%M%S").to_string()
}

/// `<name>.bak-<timestamp>` next to `path`
pub fn backup_path(path: &Path, stamp: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{name}.bak-{stamp}"))
}
