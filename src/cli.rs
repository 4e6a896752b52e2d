use clap::Parser;
use std::path::PathBuf;

use crate::config::{Layout, OverwritePolicy, Parameters};
use crate::error::Result;
use crate::mode::ExecutionMode;

/// LEMP provisioner - nginx, MySQL, PHP-FPM and WordPress on one host
#[derive(Parser, Debug)]
#[command(name = "lemp-provision")]
#[command(about = "Provision an nginx + MySQL + PHP-FPM + WordPress site, with rollback on failure")]
#[command(version)]
pub struct Cli {
    /// Domain name (example.com)
    #[arg(short, long)]
    pub domain: String,

    /// Admin email for certbot (default admin@<domain>)
    #[arg(short, long)]
    pub email: Option<String>,

    /// WordPress database name
    #[arg(short = 'n', long, default_value = "wordpress")]
    pub db_name: String,

    /// WordPress database user
    #[arg(short = 'u', long, default_value = "wpuser")]
    pub db_user: String,

    /// WordPress database password
    #[arg(short = 'p', long)]
    pub db_pass: String,

    /// Install and configure a Let's Encrypt certificate (certbot)
    #[arg(short, long)]
    pub certbot: bool,

    /// Show what would be done without changing anything (default)
    #[arg(long, conflicts_with = "execute")]
    pub dry_run: bool,

    /// Actually perform the installation
    #[arg(long)]
    pub execute: bool,

    /// Replace an existing web root, site config and database.
    ///
    /// Existing site configs are backed up first. On failure the database
    /// named by --db-name is dropped even if this run did not create it.
    #[arg(long)]
    pub overwrite: bool,

    /// Enable verbose debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Do not ask for confirmation before executing
    #[arg(short, long)]
    pub yes: bool,

    /// JSON file overriding filesystem locations (web root base, nginx dirs, ...)
    #[arg(long)]
    pub layout: Option<PathBuf>,

    /// Write the effective layout to a JSON file and exit
    #[arg(long)]
    pub save_layout: Option<PathBuf>,
}

impl Cli {
    /// Simulation unless `--execute` was given.
    pub fn mode(&self) -> ExecutionMode {
        ExecutionMode::from_execute_flag(self.execute)
    }

    pub fn overwrite_policy(&self) -> OverwritePolicy {
        OverwritePolicy::from_flag(self.overwrite)
    }

    /// Load the layout file if one was given, else the defaults.
    pub fn load_layout(&self) -> Result<Layout> {
        match &self.layout {
            Some(path) => Layout::load_from_file(path),
            None => Ok(Layout::default()),
        }
    }

    pub fn parameters(&self, layout: Layout) -> Parameters {
        Parameters {
            domain: self.domain.clone(),
            email: self.email.clone(),
            db_name: self.db_name.clone(),
            db_user: self.db_user.clone(),
            db_pass: self.db_pass.clone(),
            certbot: self.certbot,
            mode: self.mode(),
            overwrite: self.overwrite_policy(),
            layout,
        }
    }
}
