//! Content deployment: download the latest release into a fresh web root and
//! generate its configuration.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::Utc;
use regex::{NoExpand, Regex};
use tracing::{debug, info, warn};

use crate::archive::{self, ArchiveFormat};
use crate::commands::{Chmod, ChmodTree, Chown, CommandArgs, EntryKind};
use crate::config::DatabaseSettings;
use crate::error::Result;
use crate::pipeline::{Step, StepContext};
use crate::steps::{resolve_conflict, Disposition};

static SALT_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)define\(\s*'AUTH_KEY'.*?define\(\s*'NONCE_SALT'.*?\);\s*").unwrap()
});

/// Escape a value for a single-quoted PHP string literal.
pub fn php_escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Fill the sample configuration with credentials and, when available, fresh salts.
pub fn render_wp_config(sample: &str, db: &DatabaseSettings, salts: Option<&str>) -> String {
    let conf = sample
        .replace("database_name_here", &php_escape(&db.name))
        .replace("username_here", &php_escape(&db.user))
        .replace("password_here", &php_escape(&db.password));
    match salts {
        Some(salts) => {
            let block = format!("{}\n", salts.trim_end());
            SALT_BLOCK.replace(&conf, NoExpand(&block)).into_owned()
        }
        None => conf,
    }
}

/// Unique, not yet created, scratch directory under `base`.
pub fn scratch_dir_name(base: &Path) -> PathBuf {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    base.join(format!("wpdl_{}_{}", std::process::id(), nanos))
}

pub struct DeployContent;

impl Step for DeployContent {
    fn name(&self) -> &'static str {
        "deploy-content"
    }

    fn description(&self) -> &'static str {
        "Download and install WordPress"
    }

    fn run(&self, ctx: &StepContext<'_>) -> Result<()> {
        let tools = ctx.tools;
        let web_root = ctx.config.web_root();
        ctx.state.record_web_root(&web_root);

        let release = tools.web.latest_release()?;
        info!("Will download WordPress version: {} from {}", release.version, release.download_url);

        let disposition = resolve_conflict(
            tools.files.exists(&web_root),
            &format!("Web root {}", web_root.display()),
            ctx.config.overwrite,
        )?;
        if disposition == Disposition::Replace {
            tools.files.remove(&web_root)?;
        }

        ctx.state.record_path(&web_root);
        tools.files.create_dir_all(&web_root)?;

        let scratch = scratch_dir_name(&ctx.config.scratch_dir());
        ctx.state.record_temp_dir(&scratch);
        tools.files.create_dir_all(&scratch)?;
        debug!(tmpdir = %scratch.display(), "created temporary directory");

        let format = ArchiveFormat::from_name(&release.download_url);
        let archive_path = scratch.join(format!("wp.{}", format.extension()));
        tools.web.download(&release.download_url, &archive_path)?;

        let extracted = scratch.join("extracted");
        let content_root =
            archive::extract(&tools.commands, &tools.files, &archive_path, format, &extracted)?
                .unwrap_or(extracted);
        info!("Copying WordPress files to {} ...", web_root.display());
        let copied = tools.files.copy_contents(&content_root, &web_root)?;
        debug!(file_count = copied, "WordPress files copied");

        let wp_config = write_wp_config(ctx, &web_root)?;

        tools.commands.run(
            &Chown {
                owner: ctx.config.layout.web_user.clone(),
                path: web_root.clone(),
            }
            .to_spec(),
        )?;
        for (kind, mode) in [(EntryKind::Directories, 0o755), (EntryKind::Files, 0o644)] {
            tools.commands.run(
                &ChmodTree {
                    root: web_root.clone(),
                    kind,
                    mode,
                }
                .to_spec(),
            )?;
        }
        // The tree pass widens every file; the credentials file stays group-only
        if let Some(path) = wp_config {
            tools.commands.run(
                &Chmod {
                    path,
                    mode: WP_CONFIG_MODE,
                }
                .to_spec(),
            )?;
        }
        info!("WordPress files installed and permissions set");
        Ok(())
    }
}

/// wp-config.php holds the database password: owner read/write, web group read
pub const WP_CONFIG_MODE: u32 = 0o640;

/// Generate wp-config.php from the sample; returns the path when one was (or
/// in simulate mode would be) written.
fn write_wp_config(ctx: &StepContext<'_>, web_root: &Path) -> Result<Option<PathBuf>> {
    let tools = ctx.tools;
    let sample = web_root.join("wp-config-sample.php");
    let target = web_root.join("wp-config.php");

    if !tools.files.exists(&sample) {
        if ctx.config.mode.is_simulate() {
            let note = format!("create {} from {}", target.display(), sample.display());
            info!("[dry-run] {}", note);
            tools.journal().record(note);
            return Ok(Some(target));
        }
        warn!("{} not found; wp-config.php not generated", sample.display());
        return Ok(None);
    }

    let sample_text = tools.files.read_to_string(&sample)?;
    info!("Fetching WordPress salts from API...");
    let salts = tools.web.salts()?;
    let conf = render_wp_config(&sample_text, &ctx.config.database, salts.as_deref());
    tools.files.write_atomic(&target, &conf, WP_CONFIG_MODE)?;
    Ok(Some(target))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "<?php
define( 'DB_NAME', 'database_name_here' );
define( 'DB_USER', 'username_here' );
define( 'DB_PASSWORD', 'password_here' );

define( 'AUTH_KEY',         'put your unique phrase here' );
define( 'SECURE_AUTH_KEY',  'put your unique phrase here' );
define( 'NONCE_SALT',       'put your unique phrase here' );

$table_prefix = 'wp_';
";

    fn db() -> DatabaseSettings {
        DatabaseSettings {
            name: "wordpress".to_string(),
            user: "wpuser".to_string(),
            password: "it's$1\\x".to_string(),
        }
    }

    #[test]
    fn test_render_substitutes_escaped_credentials() {
        let conf = render_wp_config(SAMPLE, &db(), None);
        assert!(conf.contains("define( 'DB_NAME', 'wordpress' );"));
        assert!(conf.contains("define( 'DB_PASSWORD', 'it\\'s$1\\\\x' );"));
        assert!(conf.contains("put your unique phrase here"), "sample salts kept");
    }

    #[test]
    fn test_render_replaces_salt_block_literally() {
        let salts = "define('AUTH_KEY', 'a$1b');\ndefine('NONCE_SALT', 'z$0');";
        let conf = render_wp_config(SAMPLE, &db(), Some(salts));
        assert!(!conf.contains("put your unique phrase here"));
        assert!(conf.contains("define('AUTH_KEY', 'a$1b');"));
        assert!(conf.contains("define('NONCE_SALT', 'z$0');\n$table_prefix"));
    }

    #[test]
    fn test_scratch_dir_is_under_base() {
        let dir = scratch_dir_name(Path::new("/tmp"));
        assert_eq!(dir.parent(), Some(Path::new("/tmp")));
        assert!(dir.file_name().unwrap().to_string_lossy().starts_with("wpdl_"));
    }
}
