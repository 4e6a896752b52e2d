//! Pre-flight host checks.
//!
//! Everything here is read-only and runs in both modes:
//! - PHP runtime version detection (installed binary, then the package cache)
//! - Root privileges, enforced only when the run will perform effects

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::command_executor::CommandExecutor;
use crate::commands::{AptCachePolicy, AptCacheSearch, CommandArgs, PhpVersionQuery};
use crate::error::{ProvisionError, Result};
use crate::mode::ExecutionMode;

/// Used when neither the binary nor the package cache reveal a version
pub const DEFAULT_PHP_VERSION: &str = "8.1";

static PHP_VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\d+$").unwrap());
static POLICY_CANDIDATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Candidate:.*php(\d+\.\d+)").unwrap()
});
// Debian metapackage versions look like `2:8.1+92ubuntu1`
static POLICY_METAPACKAGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Candidate:\s*(?:\d+:)?(\d+\.\d+)\+").unwrap()
});
static SEARCH_FPM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"php(\d+)\.(\d+)-fpm").unwrap());

/// Detect the PHP major.minor version to configure.
pub fn detect_php_version(commands: &CommandExecutor) -> String {
    debug!("Detecting PHP version");

    if let Some(out) = commands.inspect(&PhpVersionQuery.to_spec()) {
        let version = out.trim();
        if PHP_VERSION.is_match(version) {
            info!("Detected PHP version via php binary: {}", version);
            return version.to_string();
        }
        debug!(output = %version, "php binary printed an unexpected version");
    }

    let policy = AptCachePolicy {
        package: "php-fpm".to_string(),
    };
    if let Some(version) = commands.inspect(&policy.to_spec()).and_then(|o| parse_policy(&o)) {
        info!("Detected PHP version via apt-cache: {}", version);
        return version;
    }

    let search = AptCacheSearch {
        pattern: r"^php[0-9]+\.[0-9]+-fpm$".to_string(),
    };
    if let Some(version) = commands.inspect(&search.to_spec()).and_then(|o| highest_fpm(&o)) {
        info!("Using latest available php-fpm in apt cache: {}", version);
        return version;
    }

    warn!("Falling back to PHP {}", DEFAULT_PHP_VERSION);
    DEFAULT_PHP_VERSION.to_string()
}

/// Candidate version from `apt-cache policy php-fpm` output.
pub fn parse_policy(output: &str) -> Option<String> {
    POLICY_CANDIDATE
        .captures(output)
        .or_else(|| POLICY_METAPACKAGE.captures(output))
        .map(|c| c[1].to_string())
}

/// Highest `phpX.Y-fpm` version in `apt-cache search` output, compared numerically.
pub fn highest_fpm(output: &str) -> Option<String> {
    SEARCH_FPM
        .captures_iter(output)
        .filter_map(|c| Some((c[1].parse::<u32>().ok()?, c[2].parse::<u32>().ok()?)))
        .max()
        .map(|(major, minor)| format!("{major}.{minor}"))
}

/// Root is required to perform; simulation runs unprivileged.
pub fn ensure_root(mode: ExecutionMode) -> Result<()> {
    ensure_privileges(mode, nix::unistd::geteuid().is_root())
}

fn ensure_privileges(mode: ExecutionMode, is_root: bool) -> Result<()> {
    if mode.is_perform() && !is_root {
        return Err(ProvisionError::Privilege(
            "This script must be run as root (sudo) when using --execute".to_string(),
        ));
    }
    Ok(())
}
