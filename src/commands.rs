//! Type-safe external command contracts.
//!
//! Steps never assemble raw argument vectors. Each external operation they
//! need is a struct implementing [`CommandArgs`], which maps its fields to
//! the exact program, flags and environment the tool expects. The executor
//! consumes the resulting [`CommandSpec`].

use std::path::PathBuf;

use strum::{Display, EnumString};

use crate::command_executor::CommandSpec;

/// Typed arguments for one external program.
///
/// # Contract
///
/// - `program()`: the executable name, resolved through `PATH`.
/// - `to_cli_args()`: arguments exactly as the program expects them.
/// - `get_env_vars()`: extra environment for the child.
/// - `is_read_only()`: true for read-only interrogation that may run in both modes.
pub trait CommandArgs {
    fn program(&self) -> &'static str;

    fn to_cli_args(&self) -> Vec<String>;

    fn get_env_vars(&self) -> Vec<(String, String)> {
        vec![]
    }

    fn is_read_only(&self) -> bool {
        false
    }

    /// Build the executor-facing description
    fn to_spec(&self) -> CommandSpec {
        let mut spec = CommandSpec::new(self.program()).args(self.to_cli_args());
        for (key, value) in self.get_env_vars() {
            spec = spec.env(key, value);
        }
        if self.is_read_only() {
            spec = spec.as_read_only();
        }
        spec
    }
}

// ============================================================================
// Package manager
// ============================================================================

const NONINTERACTIVE: (&str, &str) = ("DEBIAN_FRONTEND", "noninteractive");

fn noninteractive() -> Vec<(String, String)> {
    vec![(NONINTERACTIVE.0.to_string(), NONINTERACTIVE.1.to_string())]
}

/// `apt-get update`
#[derive(Debug, Clone, Default)]
pub struct AptUpdate;

impl CommandArgs for AptUpdate {
    fn program(&self) -> &'static str {
        "apt-get"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["update".to_string()]
    }
}

/// `apt-get upgrade -y`, never prompting for configuration files.
#[derive(Debug, Clone, Default)]
pub struct AptUpgrade;

impl CommandArgs for AptUpgrade {
    fn program(&self) -> &'static str {
        "apt-get"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["upgrade".to_string(), "-y".to_string()]
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        noninteractive()
    }
}

/// `apt-get install -y <packages>`
#[derive(Debug, Clone)]
pub struct AptInstall {
    pub packages: Vec<String>,
}

impl AptInstall {
    pub fn new<I, S>(packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            packages: packages.into_iter().map(Into::into).collect(),
        }
    }
}

impl CommandArgs for AptInstall {
    fn program(&self) -> &'static str {
        "apt-get"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec!["install".to_string(), "-y".to_string()];
        args.extend(self.packages.iter().cloned());
        args
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        noninteractive()
    }
}

/// `apt-cache policy <package>` (read-only)
#[derive(Debug, Clone)]
pub struct AptCachePolicy {
    pub package: String,
}

impl CommandArgs for AptCachePolicy {
    fn program(&self) -> &'static str {
        "apt-cache"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["policy".to_string(), self.package.clone()]
    }

    fn is_read_only(&self) -> bool {
        true
    }
}

/// `apt-cache search --names-only <pattern>` (read-only)
#[derive(Debug, Clone)]
pub struct AptCacheSearch {
    pub pattern: String,
}

impl CommandArgs for AptCacheSearch {
    fn program(&self) -> &'static str {
        "apt-cache"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "search".to_string(),
            "--names-only".to_string(),
            self.pattern.clone(),
        ]
    }

    fn is_read_only(&self) -> bool {
        true
    }
}

// ============================================================================
// Services
// ============================================================================

/// systemd unit action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ServiceAction {
    Enable,
    Start,
    Restart,
    Reload,
}

/// `systemctl <action> <service>`
#[derive(Debug, Clone)]
pub struct Systemctl {
    pub action: ServiceAction,
    pub service: String,
}

impl Systemctl {
    pub fn new(action: ServiceAction, service: impl Into<String>) -> Self {
        Self {
            action,
            service: service.into(),
        }
    }
}

impl CommandArgs for Systemctl {
    fn program(&self) -> &'static str {
        "systemctl"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![self.action.to_string(), self.service.clone()]
    }
}

/// `nginx -t`
#[derive(Debug, Clone, Default)]
pub struct NginxConfigTest;

impl CommandArgs for NginxConfigTest {
    fn program(&self) -> &'static str {
        "nginx"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["-t".to_string()]
    }
}

// ============================================================================
// Database
// ============================================================================

/// One SQL statement through the local client, authenticated over the socket.
///
/// | Field      | Flag          |
/// |------------|---------------|
/// | `sql`      | `-e`          |
/// | `batch`    | `-N -B` (no headers, tab separated) |
#[derive(Debug, Clone)]
pub struct MysqlStatement {
    pub sql: String,
    pub batch: bool,
    pub read_only: bool,
}

impl MysqlStatement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            batch: false,
            read_only: false,
        }
    }

    /// A query whose rows are read back; never mutates the server.
    pub fn query(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            batch: true,
            read_only: true,
        }
    }
}

impl CommandArgs for MysqlStatement {
    fn program(&self) -> &'static str {
        "mysql"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec!["-u".to_string(), "root".to_string()];
        if self.batch {
            args.push("-N".to_string());
            args.push("-B".to_string());
        }
        args.push("-e".to_string());
        args.push(self.sql.clone());
        args
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// Quote a string as a SQL literal.
///
/// Backslashes are doubled (MySQL treats them as escapes by default) and
/// single quotes are doubled.
pub fn sql_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("''"),
            other => out.push(other),
        }
    }
    out.push('\'');
    out
}

// ============================================================================
// Filesystem ownership and modes
// ============================================================================

/// `chown -R owner:owner <path>`
#[derive(Debug, Clone)]
pub struct Chown {
    pub owner: String,
    pub path: PathBuf,
}

impl CommandArgs for Chown {
    fn program(&self) -> &'static str {
        "chown"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "-R".to_string(),
            format!("{0}:{0}", self.owner),
            self.path.display().to_string(),
        ]
    }
}

/// Which entries [`ChmodTree`] applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Directories,
    Files,
}

impl EntryKind {
    fn find_type(self) -> &'static str {
        match self {
            Self::Directories => "d",
            Self::Files => "f",
        }
    }
}

/// `find <root> -type d|f -exec chmod <mode> {} +`
#[derive(Debug, Clone)]
pub struct ChmodTree {
    pub root: PathBuf,
    pub kind: EntryKind,
    pub mode: u32,
}

impl CommandArgs for ChmodTree {
    fn program(&self) -> &'static str {
        "find"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            self.root.display().to_string(),
            "-type".to_string(),
            self.kind.find_type().to_string(),
            "-exec".to_string(),
            "chmod".to_string(),
            format!("{:o}", self.mode),
            "{}".to_string(),
            "+".to_string(),
        ]
    }
}

/// `chmod <mode> <path>`
#[derive(Debug, Clone)]
pub struct Chmod {
    pub path: PathBuf,
    pub mode: u32,
}

impl CommandArgs for Chmod {
    fn program(&self) -> &'static str {
        "chmod"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![format!("{:o}", self.mode), self.path.display().to_string()]
    }
}

// ============================================================================
// Archives
// ============================================================================

/// `tar -xzf <archive> -C <dest>`
#[derive(Debug, Clone)]
pub struct TarExtract {
    pub archive: PathBuf,
    pub dest: PathBuf,
}

impl CommandArgs for TarExtract {
    fn program(&self) -> &'static str {
        "tar"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "-xzf".to_string(),
            self.archive.display().to_string(),
            "-C".to_string(),
            self.dest.display().to_string(),
        ]
    }
}

/// `unzip -q -o <archive> -d <dest>`
#[derive(Debug, Clone)]
pub struct UnzipExtract {
    pub archive: PathBuf,
    pub dest: PathBuf,
}

impl CommandArgs for UnzipExtract {
    fn program(&self) -> &'static str {
        "unzip"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "-q".to_string(),
            "-o".to_string(),
            self.archive.display().to_string(),
            "-d".to_string(),
            self.dest.display().to_string(),
        ]
    }
}

// ============================================================================
// Runtime queries and TLS
// ============================================================================

/// `php -r` printing `MAJOR.MINOR` (read-only)
#[derive(Debug, Clone, Default)]
pub struct PhpVersionQuery;

impl CommandArgs for PhpVersionQuery {
    fn program(&self) -> &'static str {
        "php"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "-r".to_string(),
            "echo PHP_MAJOR_VERSION.\".\".PHP_MINOR_VERSION;".to_string(),
        ]
    }

    fn is_read_only(&self) -> bool {
        true
    }
}

/// `certbot --nginx` for the apex and `www.` names, non-interactive.
#[derive(Debug, Clone)]
pub struct CertbotNginx {
    pub domain: String,
    pub email: String,
}

impl CommandArgs for CertbotNginx {
    fn program(&self) -> &'static str {
        "certbot"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "--nginx".to_string(),
            "-d".to_string(),
            self.domain.clone(),
            "-d".to_string(),
            format!("www.{}", self.domain),
            "--non-interactive".to_string(),
            "--agree-tos".to_string(),
            "-m".to_string(),
            self.email.clone(),
            "--redirect".to_string(),
        ]
    }
}
