//! Error handling module for the provisioner
//!
//! Provides the single error type used by every step, the executor, the
//! atomic writer and the rollback engine. Steps surface these upward unchanged;
//! the pipeline decides what a failure means for the run.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the provisioner
#[derive(Error, Debug)]
pub enum ProvisionError {
    /// An external operation exited with a non-zero status
    #[error("Command `{command}` failed (exit code {}): {}", exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string()), stderr.trim())]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// The external operation could not be started at all
    #[error("Failed to spawn `{command}`: {source}")]
    CommandSpawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Atomic replacement of a file failed; the destination is untouched
    #[error("Failed to write {}: {source}", path.display())]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Target resource already exists and overwrite is disabled
    #[error("{resource} already exists. Use --overwrite to replace.")]
    ResourceConflict { resource: String },

    /// A non-critical network lookup failed (callers fall back to a default)
    #[error("External service unavailable: {service}: {reason}")]
    ExternalServiceUnavailable { service: String, reason: String },

    /// A required download could not be completed
    #[error("Download of {url} failed: {reason}")]
    DownloadFailed { url: String, reason: String },

    /// Filesystem primitive failed (remove, rename, symlink, copy)
    #[error("{operation} {} failed: {source}", path.display())]
    Filesystem {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The run received an external termination signal
    #[error("Interrupted by {signal}")]
    Interrupted { signal: String },

    /// Configuration errors (validation, settings file)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Missing privileges for perform mode
    #[error("Privilege error: {0}")]
    Privilege(String),
}

/// Result type alias for provisioning operations
pub type Result<T> = std::result::Result<T, ProvisionError>;

// Convenient error constructors
impl ProvisionError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a conflict error for an existing resource
    pub fn conflict(resource: impl Into<String>) -> Self {
        Self::ResourceConflict {
            resource: resource.into(),
        }
    }

    /// Create an unavailable-service error
    pub fn unavailable(service: impl Into<String>, reason: impl ToString) -> Self {
        Self::ExternalServiceUnavailable {
            service: service.into(),
            reason: reason.to_string(),
        }
    }

    /// Create a filesystem error for `operation` on `path`
    pub fn filesystem(
        operation: &'static str,
        path: impl Into<PathBuf>,
        source: std::io::Error,
    ) -> Self {
        Self::Filesystem {
            operation,
            path: path.into(),
            source,
        }
    }

    /// Create an interruption error
    pub fn interrupted(signal: impl Into<String>) -> Self {
        Self::Interrupted {
            signal: signal.into(),
        }
    }

    /// Returns true if the run was stopped by a signal rather than a step failure
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }

    /// Captured diagnostic output attached to the failure, if any
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::CommandFailed { stderr, .. } if !stderr.trim().is_empty() => Some(stderr),
            _ => None,
        }
    }
}
