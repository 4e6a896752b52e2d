//! Filesystem primitives used by steps and by rollback.
//!
//! [`FsBackend`] is the raw host interface. [`FileOps`] wraps it with the
//! execution-mode check: reads always go through, mutations are journaled and
//! skipped in simulate mode and refused after an interrupt. Each admitted
//! backend mutation runs under the gate's effect lock.

use std::fmt;
use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};
use walkdir::WalkDir;

use crate::atomic_write;
use crate::error::{ProvisionError, Result};
use crate::mode::{Admission, EffectGate, ExecutionMode};

/// Raw filesystem operations.
pub trait FsBackend: Send + Sync {
    /// True if anything (file, dir, symlink, even dangling) exists at `path`
    fn exists(&self, path: &Path) -> bool;
    /// True for a real directory; symlinks are not followed
    fn is_dir(&self, path: &Path) -> bool;
    fn read_to_string(&self, path: &Path) -> io::Result<String>;
    /// Direct children of `path`
    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;
    fn remove_file(&self, path: &Path) -> io::Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()>;
    /// Copy one file or directory tree to `to`, replacing an existing
    /// directory of the same name
    fn copy_entry(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn write_atomic(&self, path: &Path, content: &[u8], mode: u32) -> Result<()>;
}

/// Backend over the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFs;

impl FsBackend for LocalFs {
    fn exists(&self, path: &Path) -> bool {
        fs::symlink_metadata(path).is_ok()
    }

    fn is_dir(&self, path: &Path) -> bool {
        fs::symlink_metadata(path)
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let mut entries = fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<io::Result<Vec<_>>>()?;
        entries.sort();
        Ok(entries)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir_all(path)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn symlink(&self, target: &Path, link: &Path) -> io::Result<()> {
        symlink(target, link)
    }

    fn copy_entry(&self, from: &Path, to: &Path) -> io::Result<()> {
        if from.is_dir() {
            if to.exists() {
                fs::remove_dir_all(to)?;
            }
            copy_tree(from, to)
        } else {
            fs::copy(from, to).map(|_| ())
        }
    }

    fn write_atomic(&self, path: &Path, content: &[u8], mode: u32) -> Result<()> {
        atomic_write::write_atomic(path, content, mode)
    }
}

fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    for entry in WalkDir::new(from) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(io::Error::other)?;
        let dest = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)?;
        } else {
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

/// Mode-aware front for an [`FsBackend`].
#[derive(Clone)]
pub struct FileOps {
    gate: EffectGate,
    backend: Arc<dyn FsBackend>,
}

impl fmt::Debug for FileOps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileOps")
            .field("mode", &self.gate.mode())
            .finish_non_exhaustive()
    }
}

impl FileOps {
    pub fn new(gate: EffectGate, backend: Arc<dyn FsBackend>) -> Self {
        Self { gate, backend }
    }

    #[inline]
    pub fn mode(&self) -> ExecutionMode {
        self.gate.mode()
    }

    /// File operations ignoring the interrupt halt flag.
    pub fn detached(&self) -> Self {
        Self {
            gate: self.gate.detached(),
            backend: Arc::clone(&self.backend),
        }
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.backend.exists(path)
    }

    pub fn is_dir(&self, path: &Path) -> bool {
        self.backend.is_dir(path)
    }

    pub fn read_to_string(&self, path: &Path) -> Result<String> {
        self.backend
            .read_to_string(path)
            .map_err(|e| ProvisionError::filesystem("read", path, e))
    }

    pub fn list_dir(&self, path: &Path) -> Result<Vec<PathBuf>> {
        self.backend
            .list_dir(path)
            .map_err(|e| ProvisionError::filesystem("list", path, e))
    }

    /// Replace `path` atomically; simulate mode reports path and byte count.
    pub fn write_atomic(&self, path: &Path, content: &str, mode: u32) -> Result<Admission> {
        let admission = self
            .gate
            .admit(|| format!("write file {} ({} bytes)", path.display(), content.len()))?;
        if admission == Admission::Perform {
            let _held = self.gate.hold()?;
            self.backend.write_atomic(path, content.as_bytes(), mode)?;
        }
        Ok(admission)
    }

    pub fn create_dir_all(&self, path: &Path) -> Result<Admission> {
        let admission = self
            .gate
            .admit(|| format!("create directory {}", path.display()))?;
        if admission == Admission::Perform {
            let _held = self.gate.hold()?;
            debug!(path = %path.display(), "creating directory");
            self.backend
                .create_dir_all(path)
                .map_err(|e| ProvisionError::filesystem("create directory", path, e))?;
        }
        Ok(admission)
    }

    /// Remove a file, symlink or directory tree; a missing path is not an error.
    pub fn remove(&self, path: &Path) -> Result<Admission> {
        let admission = self.gate.admit(|| format!("remove {}", path.display()))?;
        if admission.is_simulated() {
            return Ok(admission);
        }
        let _held = self.gate.hold()?;
        if !self.backend.exists(path) {
            debug!(path = %path.display(), "path does not exist, skipping removal");
            return Ok(admission);
        }
        if self.backend.is_dir(path) {
            self.backend
                .remove_dir_all(path)
                .map_err(|e| ProvisionError::filesystem("remove directory", path, e))?;
            info!("Removed directory {}", path.display());
        } else {
            self.backend
                .remove_file(path)
                .map_err(|e| ProvisionError::filesystem("remove file", path, e))?;
            info!("Removed file {}", path.display());
        }
        Ok(admission)
    }

    pub fn rename(&self, from: &Path, to: &Path) -> Result<Admission> {
        let admission = self
            .gate
            .admit(|| format!("move {} -> {}", from.display(), to.display()))?;
        if admission == Admission::Perform {
            let _held = self.gate.hold()?;
            self.backend
                .rename(from, to)
                .map_err(|e| ProvisionError::filesystem("rename", from, e))?;
            info!("Moved {} -> {}", from.display(), to.display());
        }
        Ok(admission)
    }

    pub fn symlink(&self, target: &Path, link: &Path) -> Result<Admission> {
        let admission = self
            .gate
            .admit(|| format!("link {} -> {}", link.display(), target.display()))?;
        if admission == Admission::Perform {
            let _held = self.gate.hold()?;
            self.backend
                .symlink(target, link)
                .map_err(|e| ProvisionError::filesystem("symlink", link, e))?;
        }
        Ok(admission)
    }

    /// Copy the entries of `from` into `to`, replacing same-named entries.
    ///
    /// Returns the number of top-level entries copied. Each entry is a
    /// separate effect, so an interrupt stops the copy at the next entry.
    pub fn copy_contents(&self, from: &Path, to: &Path) -> Result<usize> {
        if self
            .gate
            .admit(|| format!("copy contents of {} into {}", from.display(), to.display()))?
            .is_simulated()
        {
            return Ok(0);
        }
        let entries = self.list_dir(from)?;
        {
            let _held = self.gate.hold()?;
            self.backend
                .create_dir_all(to)
                .map_err(|e| ProvisionError::filesystem("create directory", to, e))?;
        }

        let mut copied = 0;
        for item in entries {
            let Some(name) = item.file_name() else {
                continue;
            };
            let _held = self.gate.hold()?;
            self.backend
                .copy_entry(&item, &to.join(name))
                .map_err(|e| ProvisionError::filesystem("copy", &item, e))?;
            copied += 1;
        }
        debug!(from = %from.display(), to = %to.display(), copied, "contents copied");
        Ok(copied)
    }
}
