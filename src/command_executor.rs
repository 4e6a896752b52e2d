//! command_executor.rs - Runs one blocking external operation at a time.
//!
//! The executor is the only way steps reach the package manager, service
//! manager, database client and archive tools. It consults the execution mode
//! before spawning anything: in simulate mode it journals the command line and
//! returns a synthetic zero-status result immediately.
//!
//! Spawning itself lives behind [`CommandBackend`] so tests can substitute a
//! recording fake while keeping the mode logic in place.

use std::fmt;
use std::io;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::error::{ProvisionError, Result};
use crate::mode::{Admission, EffectGate, ExecutionMode};
use crate::signals::CommandProcessGroup;

/// Longest slice of stdout/stderr copied into log lines.
const LOG_PREVIEW: usize = 500;

/// A fully described external operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Read-only interrogation (version queries, existence checks).
    /// These run in both modes and never mutate the host.
    pub read_only: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            read_only: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Mark this command as read-only.
    pub fn as_read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Shell-like rendering for logs and dry-run output
    pub fn display(&self) -> String {
        let mut rendered = self.program.clone();
        for arg in &self.args {
            rendered.push(' ');
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                rendered.push('"');
                rendered.push_str(arg);
                rendered.push('"');
            } else {
                rendered.push_str(arg);
            }
        }
        rendered
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display())
    }
}

/// Raw output of a spawned process, before mode/policy is applied.
#[derive(Debug, Clone, Default)]
pub struct RawOutput {
    /// Exit code (None if terminated by signal)
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RawOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Uniform result of one executor invocation.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    /// True when the command was only described (simulate mode)
    pub simulated: bool,
}

impl CommandResult {
    fn synthetic() -> Self {
        Self {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::ZERO,
            simulated: true,
        }
    }

    #[inline]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Something that can spawn a process and wait for it.
pub trait CommandBackend: Send + Sync {
    /// Run `spec` to completion, always capturing stdout and stderr.
    fn run(&self, spec: &CommandSpec) -> io::Result<RawOutput>;
}

/// Backend that spawns real processes.
///
/// Children run in their own process group so a terminal Ctrl+C reaches only
/// the orchestrator, which then decides how to roll back.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBackend;

impl CommandBackend for SystemBackend {
    fn run(&self, spec: &CommandSpec) -> io::Result<RawOutput> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .in_new_process_group();

        let output = cmd.output()?;
        Ok(RawOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Mode-aware front for a [`CommandBackend`].
#[derive(Clone)]
pub struct CommandExecutor {
    gate: EffectGate,
    backend: Arc<dyn CommandBackend>,
}

impl fmt::Debug for CommandExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandExecutor")
            .field("mode", &self.gate.mode())
            .finish_non_exhaustive()
    }
}

impl CommandExecutor {
    pub fn new(gate: EffectGate, backend: Arc<dyn CommandBackend>) -> Self {
        Self { gate, backend }
    }

    #[inline]
    pub fn mode(&self) -> ExecutionMode {
        self.gate.mode()
    }

    /// Executor sharing the backend but ignoring the interrupt halt flag.
    pub fn detached(&self) -> Self {
        Self {
            gate: self.gate.detached(),
            backend: Arc::clone(&self.backend),
        }
    }

    /// Run one operation.
    ///
    /// With `capture_output` false the stdout is logged and dropped from the
    /// result; stderr is always kept so failures carry diagnostics. With
    /// `check_failure` a non-zero status becomes `CommandFailed`.
    pub fn execute(
        &self,
        spec: &CommandSpec,
        capture_output: bool,
        check_failure: bool,
    ) -> Result<CommandResult> {
        let command = spec.display();
        debug!(
            command = %truncate(&command, 100),
            capture_output,
            check_failure,
            "execute called"
        );

        if !spec.read_only {
            if let Admission::Simulated = self.gate.admit(|| format!("run: {command}"))? {
                return Ok(CommandResult::synthetic());
            }
        } else {
            self.gate.ensure_running()?;
        }

        let _held = if spec.read_only {
            None
        } else {
            Some(self.gate.hold()?)
        };
        info!("Executing command: {}", truncate(&command, 120));
        let start = Instant::now();
        let raw = self
            .backend
            .run(spec)
            .map_err(|source| ProvisionError::CommandSpawn {
                command: command.clone(),
                source,
            })?;
        let duration = start.elapsed();

        let ok = raw.exit_code == Some(0);
        if ok {
            debug!(
                exit_code = ?raw.exit_code,
                duration_sec = format!("{:.2}", duration.as_secs_f64()),
                "command completed"
            );
            if !raw.stderr.trim().is_empty() {
                warn!("Command stderr: {}", truncate(&raw.stderr, LOG_PREVIEW));
            }
        } else {
            error!(
                exit_code = ?raw.exit_code,
                duration_sec = format!("{:.2}", duration.as_secs_f64()),
                command = %truncate(&command, 120),
                "command failed"
            );
            if !raw.stderr.trim().is_empty() {
                error!("Failed command stderr: {}", truncate(&raw.stderr, LOG_PREVIEW));
            }
        }
        if !capture_output && !raw.stdout.trim().is_empty() {
            debug!("Command stdout: {}", truncate(&raw.stdout, LOG_PREVIEW));
        }

        if check_failure && !ok {
            return Err(ProvisionError::CommandFailed {
                command,
                exit_code: raw.exit_code,
                stderr: raw.stderr,
            });
        }

        Ok(CommandResult {
            exit_code: raw.exit_code,
            stdout: if capture_output { raw.stdout } else { String::new() },
            stderr: raw.stderr,
            duration,
            simulated: false,
        })
    }

    /// Run and require success, discarding stdout.
    pub fn run(&self, spec: &CommandSpec) -> Result<CommandResult> {
        self.execute(spec, false, true)
    }

    /// Run a read-only command; any failure (including spawn) yields `None`.
    pub fn inspect(&self, spec: &CommandSpec) -> Option<String> {
        let spec = spec.clone().as_read_only();
        match self.execute(&spec, true, true) {
            Ok(result) => Some(result.stdout),
            Err(e) => {
                debug!(command = %spec.display(), error = %e, "read-only command failed");
                None
            }
        }
    }
}

/// Truncate on a char boundary for log output
pub(crate) fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
