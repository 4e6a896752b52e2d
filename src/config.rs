//! Run configuration.
//!
//! `Configuration` is resolved once at startup from the command line, the
//! optional layout file and the detected PHP version, validated, and then
//! shared read-only (behind an `Arc`) with every step and with the interrupt
//! path.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{ProvisionError, Result};
use crate::mode::ExecutionMode;

/// What a step does when its target resource already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum OverwritePolicy {
    /// Fail fast with a conflict, touch nothing
    #[default]
    Preserve,
    /// Remove or back up the existing resource and recreate it
    Replace,
}

impl OverwritePolicy {
    pub fn from_flag(overwrite: bool) -> Self {
        if overwrite { Self::Replace } else { Self::Preserve }
    }

    /// Returns true if existing resources may be destroyed (including the
    /// database on rollback)
    #[inline]
    pub fn is_destructive(self) -> bool {
        matches!(self, Self::Replace)
    }
}

/// Filesystem locations used by the steps.
///
/// Defaults match a stock Debian/Ubuntu nginx + PHP-FPM layout. A JSON file
/// with any subset of these fields can override them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Layout {
    /// Parent of per-domain web roots (`/var/www`)
    pub web_root_base: PathBuf,
    pub sites_available: PathBuf,
    pub sites_enabled: PathBuf,
    /// Root of versioned PHP configuration (`/etc/php`)
    pub php_config_root: PathBuf,
    /// Where download scratch directories are created (system temp dir if unset)
    pub scratch_dir: Option<PathBuf>,
    /// Owner of deployed content
    pub web_user: String,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            web_root_base: PathBuf::from("/var/www"),
            sites_available: PathBuf::from("/etc/nginx/sites-available"),
            sites_enabled: PathBuf::from("/etc/nginx/sites-enabled"),
            php_config_root: PathBuf::from("/etc/php"),
            scratch_dir: None,
            web_user: "www-data".to_string(),
        }
    }
}

impl Layout {
    /// Save the layout to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ProvisionError::config(format!("Failed to serialize layout: {e}")))?;
        fs::write(&path, json).map_err(|e| {
            ProvisionError::config(format!(
                "Failed to write layout to {}: {e}",
                path.as_ref().display()
            ))
        })
    }

    /// Load a layout from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).map_err(|e| {
            ProvisionError::config(format!(
                "Failed to read layout from {}: {e}",
                path.as_ref().display()
            ))
        })?;
        let layout: Self = serde_json::from_str(&content)
            .map_err(|e| ProvisionError::config(format!("Failed to parse layout JSON: {e}")))?;
        layout.validate()?;
        Ok(layout)
    }

    /// All directories must be absolute; the web user must be a plain name
    pub fn validate(&self) -> Result<()> {
        let dirs = [
            ("web_root_base", Some(&self.web_root_base)),
            ("sites_available", Some(&self.sites_available)),
            ("sites_enabled", Some(&self.sites_enabled)),
            ("php_config_root", Some(&self.php_config_root)),
            ("scratch_dir", self.scratch_dir.as_ref()),
        ];
        for (name, dir) in dirs {
            if let Some(dir) = dir {
                if !dir.is_absolute() {
                    return Err(ProvisionError::config(format!(
                        "{name} must be an absolute path (got {})",
                        dir.display()
                    )));
                }
            }
        }
        if self.web_user.is_empty()
            || !self
                .web_user
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ProvisionError::config(format!(
                "web_user '{}' is not a valid user name",
                self.web_user
            )));
        }
        Ok(())
    }
}

/// Credentials and identifiers for the application database.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseSettings {
    pub name: String,
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Raw inputs collected from the command line, before validation.
#[derive(Debug, Clone)]
pub struct Parameters {
    pub domain: String,
    pub email: Option<String>,
    pub db_name: String,
    pub db_user: String,
    pub db_pass: String,
    pub certbot: bool,
    pub mode: ExecutionMode,
    pub overwrite: OverwritePolicy,
    pub layout: Layout,
}

/// Immutable per-run parameters.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub domain: String,
    /// Contact address for certificate registration
    pub email: String,
    pub database: DatabaseSettings,
    pub certbot: bool,
    pub mode: ExecutionMode,
    pub overwrite: OverwritePolicy,
    /// Detected PHP major.minor
    pub php_version: String,
    pub layout: Layout,
}

impl Configuration {
    /// Validate `params` and freeze them together with the detected runtime.
    pub fn resolve(params: Parameters, php_version: impl Into<String>) -> Result<Self> {
        let domain = params.domain.trim().trim_end_matches('.').to_ascii_lowercase();
        validate_domain(&domain)?;

        let email = match params.email {
            Some(e) if !e.trim().is_empty() => e.trim().to_string(),
            _ => format!("admin@{domain}"),
        };
        validate_email(&email)?;

        validate_identifier("Database name", &params.db_name, 64)?;
        validate_identifier("Database user", &params.db_user, 32)?;
        validate_password(&params.db_pass)?;

        let php_version = php_version.into();
        if !is_php_version(&php_version) {
            return Err(ProvisionError::config(format!(
                "PHP version '{php_version}' is not of the form MAJOR.MINOR"
            )));
        }

        params.layout.validate()?;

        Ok(Self {
            domain,
            email,
            database: DatabaseSettings {
                name: params.db_name,
                user: params.db_user,
                password: params.db_pass,
            },
            certbot: params.certbot,
            mode: params.mode,
            overwrite: params.overwrite,
            php_version,
            layout: params.layout,
        })
    }

    pub fn web_root(&self) -> PathBuf {
        self.layout.web_root_base.join(&self.domain)
    }

    /// Generated nginx server block
    pub fn site_config_path(&self) -> PathBuf {
        self.layout.sites_available.join(&self.domain)
    }

    /// Service-enabled symlink pointing at the site config
    pub fn site_link_path(&self) -> PathBuf {
        self.layout.sites_enabled.join(&self.domain)
    }

    pub fn php_ini_path(&self) -> PathBuf {
        self.layout
            .php_config_root
            .join(&self.php_version)
            .join("fpm/php.ini")
    }

    pub fn php_fpm_service(&self) -> String {
        format!("php{}-fpm", self.php_version)
    }

    pub fn php_fpm_socket(&self) -> String {
        format!("/run/php/php{}-fpm.sock", self.php_version)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.layout
            .scratch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    /// Human-readable plan shown before anything runs
    pub fn plan_lines(&self) -> Vec<String> {
        vec![
            format!("Mode: {}", self.mode.banner()),
            format!("Domain: {}", self.domain),
            format!("Email: {}", self.email),
            format!("Install SSL (certbot): {}", self.certbot),
            format!("Web root: {}", self.web_root().display()),
            format!("Nginx config: {}", self.site_config_path().display()),
            "MySQL root: Socket authentication (passwordless, local only)".to_string(),
            format!("DB name: {}", self.database.name),
            format!("DB user: {}", self.database.user),
            format!("PHP version (detected): {}", self.php_version),
            format!("Overwrite enabled: {}", self.overwrite.is_destructive()),
        ]
    }
}

/// Domain: dot-separated labels of ASCII alphanumerics and inner hyphens.
pub fn validate_domain(domain: &str) -> Result<()> {
    if domain.is_empty() {
        return Err(ProvisionError::config("Domain must be specified"));
    }
    if domain.len() > 253 {
        return Err(ProvisionError::config("Domain must be at most 253 characters"));
    }
    for label in domain.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(ProvisionError::config(format!(
                "Domain '{domain}' has an empty or overlong label"
            )));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(ProvisionError::config(format!(
                "Domain label '{label}' cannot start or end with a hyphen"
            )));
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(ProvisionError::config(format!(
                "Domain label '{label}' can only contain letters, digits and hyphens"
            )));
        }
    }
    Ok(())
}

pub fn validate_email(email: &str) -> Result<()> {
    let Some((local, host)) = email.split_once('@') else {
        return Err(ProvisionError::config(format!("Email '{email}' is missing '@'")));
    };
    if local.is_empty() || host.is_empty() || host.contains('@') {
        return Err(ProvisionError::config(format!("Email '{email}' is malformed")));
    }
    if email.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(ProvisionError::config("Email cannot contain whitespace"));
    }
    Ok(())
}

/// SQL identifiers are interpolated into statements, so only `[A-Za-z0-9_]`.
pub fn validate_identifier(what: &str, value: &str, max_len: usize) -> Result<()> {
    if value.is_empty() {
        return Err(ProvisionError::config(format!("{what} must be specified")));
    }
    if value.len() > max_len {
        return Err(ProvisionError::config(format!(
            "{what} must be at most {max_len} characters"
        )));
    }
    if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ProvisionError::config(format!(
            "{what} can only contain letters, numbers, and underscores"
        )));
    }
    Ok(())
}

pub fn validate_password(password: &str) -> Result<()> {
    if password.is_empty() {
        return Err(ProvisionError::config("Database password must be specified"));
    }
    if password.chars().any(char::is_control) {
        return Err(ProvisionError::config(
            "Database password cannot contain control characters",
        ));
    }
    Ok(())
}

fn is_php_version(v: &str) -> bool {
    match v.split_once('.') {
        Some((major, minor)) => {
            !major.is_empty()
                && !minor.is_empty()
                && major.chars().all(|c| c.is_ascii_digit())
                && minor.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    }
}
