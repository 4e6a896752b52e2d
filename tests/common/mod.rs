//! Shared fixtures for the integration tests: a recording command backend,
//! a canned web fetcher and a throwaway host layout under a temp directory.

#![allow(dead_code)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use signal_hook::consts::signal::SIGINT;

use tempfile::TempDir;
use walkdir::WalkDir;

use lemp_provision::command_executor::{CommandBackend, CommandSpec, RawOutput};
use lemp_provision::config::{Configuration, Layout, OverwritePolicy, Parameters};
use lemp_provision::error::{ProvisionError, Result};
use lemp_provision::fetch::{Fetcher, SALT_API, VERSION_API};
use lemp_provision::filesystem::{FsBackend, LocalFs};
use lemp_provision::mode::ExecutionMode;
use lemp_provision::pipeline::{Pipeline, RunOutcome};
use lemp_provision::run_state::RunState;
use lemp_provision::signals::handle_interrupt;
use lemp_provision::toolkit::Toolkit;

pub const DOMAIN: &str = "example.com";
pub const DOWNLOAD_URL: &str = "https://downloads.example/wordpress-6.5.2.tar.gz";

pub const WP_SAMPLE: &str = "<?php
define( 'DB_NAME', 'database_name_here' );
define( 'DB_USER', 'username_here' );
define( 'DB_PASSWORD', 'password_here' );

define( 'AUTH_KEY',         'put your unique phrase here' );
define( 'NONCE_SALT',       'put your unique phrase here' );

$table_prefix = 'wp_';
";

type Responder = Box<dyn Fn(&CommandSpec) -> RawOutput + Send + Sync>;

/// Command backend that records every spawned spec and answers from rules.
///
/// Rules match on a substring of the rendered command line; the most
/// recently added matching rule wins. Unmatched commands succeed silently.
#[derive(Default)]
pub struct RecordingBackend {
    calls: Mutex<Vec<CommandSpec>>,
    rules: Mutex<Vec<(String, Responder)>>,
}

impl RecordingBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond<F>(&self, needle: &str, responder: F)
    where
        F: Fn(&CommandSpec) -> RawOutput + Send + Sync + 'static,
    {
        self.rules
            .lock()
            .unwrap()
            .push((needle.to_string(), Box::new(responder)));
    }

    pub fn fail_on(&self, needle: &str, code: i32, stderr: &str) {
        let stderr = stderr.to_string();
        self.respond(needle, move |_| RawOutput::failure(code, stderr.clone()));
    }

    /// Make `tar -xzf` lay down a WordPress-shaped tree with one wrapper dir.
    pub fn fake_tar(&self) {
        self.respond("tar -xzf", |spec| {
            let Some(dest) = arg_after(spec, "-C") else {
                return RawOutput::failure(2, "tar: no destination");
            };
            let root = dest.join("wordpress");
            let result = fs::create_dir_all(root.join("wp-includes"))
                .and_then(|_| fs::write(root.join("index.php"), "<?php // index"))
                .and_then(|_| fs::write(root.join("wp-includes/version.php"), "<?php"))
                .and_then(|_| fs::write(root.join("wp-config-sample.php"), WP_SAMPLE));
            match result {
                Ok(()) => RawOutput::success(""),
                Err(e) => RawOutput::failure(2, e.to_string()),
            }
        });
    }

    /// Make the schema lookup report that the database already exists.
    pub fn database_exists(&self, name: &str) {
        let listing = format!("{name}\n");
        self.respond("INFORMATION_SCHEMA.SCHEMATA", move |_| {
            RawOutput::success(listing.clone())
        });
    }

    /// Make the account lookup report that `user`@localhost already exists.
    pub fn user_exists(&self, user: &str) {
        let listing = format!("{user}\n");
        self.respond(&format!("mysql.user WHERE User = '{user}'"), move |_| {
            RawOutput::success(listing.clone())
        });
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls that were not read-only
    pub fn mutating_calls(&self) -> Vec<CommandSpec> {
        self.calls().into_iter().filter(|c| !c.read_only).collect()
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.calls().iter().any(|c| c.display().contains(needle))
    }

    pub fn count(&self, needle: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.display().contains(needle))
            .count()
    }
}

impl CommandBackend for RecordingBackend {
    fn run(&self, spec: &CommandSpec) -> io::Result<RawOutput> {
        self.calls.lock().unwrap().push(spec.clone());
        let rendered = spec.display();
        let rules = self.rules.lock().unwrap();
        let output = rules
            .iter()
            .rev()
            .find(|(needle, _)| rendered.contains(needle.as_str()))
            .map(|(_, respond)| respond(spec))
            .unwrap_or_else(|| RawOutput::success(""));
        Ok(output)
    }
}

fn arg_after(spec: &CommandSpec, flag: &str) -> Option<PathBuf> {
    let pos = spec.args.iter().position(|a| a == flag)?;
    spec.args.get(pos + 1).map(PathBuf::from)
}

/// Fetcher with canned API answers; downloads write a small placeholder file.
#[derive(Default)]
pub struct FakeFetcher {
    pub offline: bool,
    downloads: AtomicUsize,
    lookups: AtomicUsize,
}

impl FakeFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn offline() -> Arc<Self> {
        Arc::new(Self {
            offline: true,
            ..Self::default()
        })
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl Fetcher for FakeFetcher {
    fn get_text(&self, url: &str, _timeout: Duration) -> Result<String> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if self.offline {
            return Err(ProvisionError::unavailable(url, "network unreachable"));
        }
        match url {
            VERSION_API => Ok(format!(
                r#"{{"offers":[{{"response":"upgrade","current":"6.5.2","download":"{DOWNLOAD_URL}"}}]}}"#
            )),
            SALT_API => Ok("define('AUTH_KEY', 'fresh-auth');\ndefine('NONCE_SALT', 'fresh-nonce');\n".to_string()),
            other => Err(ProvisionError::unavailable(other, "unknown endpoint")),
        }
    }

    fn download(&self, _url: &str, dest: &Path, _timeout: Duration) -> Result<u64> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let payload = b"not really gzip";
        fs::write(dest, payload).map_err(|e| ProvisionError::DownloadFailed {
            url: DOWNLOAD_URL.to_string(),
            reason: e.to_string(),
        })?;
        Ok(payload.len() as u64)
    }
}

/// Local filesystem that delivers SIGINT from a second thread while the first
/// entry copy is in flight, the way the signal thread would.
///
/// The in-flight copy keeps writing for a while after the run is halted, and
/// records whether the rollback released the ledger underneath it.
#[derive(Default)]
pub struct InterruptingFs {
    target: OnceLock<(Arc<RunState>, Toolkit)>,
    signal: Mutex<Option<JoinHandle<Option<i32>>>>,
    late_copies: AtomicUsize,
    rolled_back_mid_copy: AtomicBool,
}

impl InterruptingFs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Point the interrupt at a run; its tools must be built over `self`.
    pub fn arm(&self, state: Arc<RunState>, tools: Toolkit) {
        assert!(self.target.set((state, tools)).is_ok(), "armed twice");
    }

    /// Wait for the signal thread and return what it decided.
    pub fn join(&self) -> Option<i32> {
        let handle = self.signal.lock().unwrap().take().expect("signal was sent");
        handle.join().expect("signal thread panicked")
    }

    /// Entry copies that started after the interrupt was delivered
    pub fn late_copies(&self) -> usize {
        self.late_copies.load(Ordering::SeqCst)
    }

    pub fn rolled_back_mid_copy(&self) -> bool {
        self.rolled_back_mid_copy.load(Ordering::SeqCst)
    }
}

impl FsBackend for InterruptingFs {
    fn exists(&self, path: &Path) -> bool {
        LocalFs.exists(path)
    }

    fn is_dir(&self, path: &Path) -> bool {
        LocalFs.is_dir(path)
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        LocalFs.read_to_string(path)
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        LocalFs.list_dir(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        LocalFs.create_dir_all(path)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        LocalFs.remove_dir_all(path)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        LocalFs.remove_file(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        LocalFs.rename(from, to)
    }

    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        LocalFs.symlink(target, link)
    }

    fn copy_entry(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut signal = self.signal.lock().unwrap();
        if signal.is_some() {
            self.late_copies.fetch_add(1, Ordering::SeqCst);
            drop(signal);
            return LocalFs.copy_entry(from, to);
        }
        let (state, tools) = self.target.get().expect("armed before the run");
        let (signal_state, signal_tools) = (Arc::clone(state), tools.clone());
        *signal = Some(thread::spawn(move || {
            handle_interrupt(SIGINT, &signal_state, &signal_tools)
        }));
        drop(signal);

        while !state.is_halted() {
            thread::sleep(Duration::from_millis(1));
        }
        // Give the signal thread every chance to start its rollback
        thread::sleep(Duration::from_millis(100));
        if state.ledger().created_paths.is_empty() {
            self.rolled_back_mid_copy.store(true, Ordering::SeqCst);
        }
        LocalFs.copy_entry(from, to)
    }

    fn write_atomic(&self, path: &Path, content: &[u8], mode: u32) -> Result<()> {
        LocalFs.write_atomic(path, content, mode)
    }
}

/// A host layout rooted in a temp directory.
pub struct Host {
    pub temp: TempDir,
    pub layout: Layout,
}

impl Host {
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let root = temp.path();
        let layout = Layout {
            web_root_base: root.join("www"),
            sites_available: root.join("nginx/sites-available"),
            sites_enabled: root.join("nginx/sites-enabled"),
            php_config_root: root.join("php"),
            scratch_dir: Some(root.join("scratch")),
            ..Layout::default()
        };
        for dir in [
            &layout.web_root_base,
            &layout.sites_available,
            &layout.sites_enabled,
            &root.join("scratch"),
            &root.join("php/8.1/fpm"),
        ] {
            fs::create_dir_all(dir).expect("create fixture dir");
        }
        fs::write(layout.sites_enabled.join("default"), "server {}\n").expect("default site");
        fs::write(
            root.join("php/8.1/fpm/php.ini"),
            "[PHP]\nmemory_limit = 128M\nupload_max_filesize = 2M\npost_max_size = 8M\nmax_execution_time = 30\n",
        )
        .expect("php.ini");
        Self { temp, layout }
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn web_root(&self) -> PathBuf {
        self.layout.web_root_base.join(DOMAIN)
    }

    pub fn site_config(&self) -> PathBuf {
        self.layout.sites_available.join(DOMAIN)
    }

    pub fn site_link(&self) -> PathBuf {
        self.layout.sites_enabled.join(DOMAIN)
    }

    pub fn php_ini(&self) -> PathBuf {
        self.root().join("php/8.1/fpm/php.ini")
    }

    pub fn scratch(&self) -> PathBuf {
        self.root().join("scratch")
    }

    pub fn scratch_entries(&self) -> usize {
        fs::read_dir(self.scratch()).map(|d| d.count()).unwrap_or(0)
    }

    /// Every path under the host root with its file content (empty for dirs)
    pub fn snapshot(&self) -> Vec<(PathBuf, String)> {
        WalkDir::new(self.root())
            .sort_by_file_name()
            .into_iter()
            .filter_map(|e| e.ok())
            .map(|e| {
                let content = if e.file_type().is_file() {
                    fs::read_to_string(e.path()).unwrap_or_default()
                } else {
                    String::new()
                };
                (e.path().to_path_buf(), content)
            })
            .collect()
    }

    pub fn configuration(&self, mode: ExecutionMode, overwrite: OverwritePolicy) -> Configuration {
        Configuration::resolve(
            Parameters {
                domain: DOMAIN.to_string(),
                email: None,
                db_name: "wordpress".to_string(),
                db_user: "wpuser".to_string(),
                db_pass: "s3cret'pw".to_string(),
                certbot: false,
                mode,
                overwrite,
                layout: self.layout.clone(),
            },
            "8.1",
        )
        .expect("valid configuration")
    }
}

/// Everything one pipeline run needs, wired to fakes.
pub struct Harness {
    pub host: Host,
    pub state: Arc<RunState>,
    pub tools: Toolkit,
    pub commands: Arc<RecordingBackend>,
    pub fetcher: Arc<FakeFetcher>,
    pub config: Arc<Configuration>,
}

impl Harness {
    pub fn new(mode: ExecutionMode, overwrite: OverwritePolicy) -> Self {
        Self::with_fetcher(mode, overwrite, FakeFetcher::new())
    }

    pub fn with_fetcher(
        mode: ExecutionMode,
        overwrite: OverwritePolicy,
        fetcher: Arc<FakeFetcher>,
    ) -> Self {
        Self::build(mode, overwrite, fetcher, Arc::new(LocalFs))
    }

    pub fn with_files(
        mode: ExecutionMode,
        overwrite: OverwritePolicy,
        files: Arc<dyn FsBackend>,
    ) -> Self {
        Self::build(mode, overwrite, FakeFetcher::new(), files)
    }

    fn build(
        mode: ExecutionMode,
        overwrite: OverwritePolicy,
        fetcher: Arc<FakeFetcher>,
        files: Arc<dyn FsBackend>,
    ) -> Self {
        let host = Host::new();
        let state = Arc::new(RunState::new(mode, overwrite));
        let commands = RecordingBackend::new();
        commands.fake_tar();
        let tools = Toolkit::with_backends(&state, commands.clone(), files, fetcher.clone());
        let config = Arc::new(host.configuration(mode, overwrite));
        state.activate(Arc::clone(&config)).expect("activate");
        Self {
            host,
            state,
            tools,
            commands,
            fetcher,
            config,
        }
    }

    pub fn run(&self, pipeline: &Pipeline) -> RunOutcome {
        pipeline.run(&self.config, &self.state, &self.tools)
    }
}
