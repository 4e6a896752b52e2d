//! Package and service steps: system update, nginx, PHP-FPM.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info, warn};

use crate::commands::{AptInstall, AptUpdate, AptUpgrade, CommandArgs, ServiceAction, Systemctl};
use crate::error::Result;
use crate::pipeline::{Step, StepContext};

/// PHP-FPM plus the extensions WordPress needs
pub const PHP_PACKAGES: &[&str] = &[
    "php-fpm",
    "php-mysql",
    "php-curl",
    "php-gd",
    "php-mbstring",
    "php-xml",
    "php-xmlrpc",
    "php-soap",
    "php-intl",
    "php-zip",
];

/// `php.ini` directives rewritten for uploads and long requests
pub const PHP_INI_SETTINGS: &[(&str, &str)] = &[
    ("upload_max_filesize", "64M"),
    ("post_max_size", "64M"),
    ("memory_limit", "256M"),
    ("max_execution_time", "300"),
];

static INI_DIRECTIVES: LazyLock<Vec<(Regex, String)>> = LazyLock::new(|| {
    PHP_INI_SETTINGS
        .iter()
        .map(|(key, value)| {
            let re = Regex::new(&format!(r"(?m)^{key}\s*=.*$")).unwrap();
            (re, format!("{key} = {value}"))
        })
        .collect()
});

/// Apply [`PHP_INI_SETTINGS`] to the content of a `php.ini`.
pub fn tune_php_ini(content: &str) -> String {
    INI_DIRECTIVES
        .iter()
        .fold(content.to_string(), |acc, (re, line)| {
            re.replace_all(&acc, line.as_str()).into_owned()
        })
}

pub struct UpdateSystem;

impl Step for UpdateSystem {
    fn name(&self) -> &'static str {
        "update-system"
    }

    fn description(&self) -> &'static str {
        "Updating system packages"
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<()> {
        let commands = &ctx.tools.commands;
        commands.run(&AptUpdate.to_spec())?;
        commands.run(&AptUpgrade.to_spec())?;
        info!("System packages updated");
        Ok(())
    }
}

pub struct InstallNginx;

impl Step for InstallNginx {
    fn name(&self) -> &'static str {
        "install-nginx"
    }

    fn description(&self) -> &'static str {
        "Install and start Nginx"
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<()> {
        let commands = &ctx.tools.commands;
        commands.run(&AptInstall::new(["nginx"]).to_spec())?;
        commands.run(&Systemctl::new(ServiceAction::Enable, "nginx").to_spec())?;
        commands.run(&Systemctl::new(ServiceAction::Start, "nginx").to_spec())?;
        info!("Nginx installed and started");
        Ok(())
    }
}

pub struct InstallPhp;

impl Step for InstallPhp {
    fn name(&self) -> &'static str {
        "install-php"
    }

    fn description(&self) -> &'static str {
        "Install PHP and extensions"
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<()> {
        let tools = ctx.tools;
        debug!(version = %ctx.config.php_version, "installing PHP and extensions");
        tools.commands.run(&AptInstall::new(PHP_PACKAGES.iter().copied()).to_spec())?;

        let php_ini = ctx.config.php_ini_path();
        if tools.files.exists(&php_ini) {
            let original = tools.files.read_to_string(&php_ini)?;
            let tuned = tune_php_ini(&original);
            debug!(
                original_bytes = original.len(),
                new_bytes = tuned.len(),
                "php.ini modifications complete"
            );
            tools.files.write_atomic(&php_ini, &tuned, 0o644)?;
        } else {
            warn!("{} not found; skipping php.ini edits", php_ini.display());
        }

        tools.commands.run(
            &Systemctl::new(ServiceAction::Restart, ctx.config.php_fpm_service()).to_spec(),
        )?;
        info!("PHP installed and configured");
        Ok(())
    }
}
