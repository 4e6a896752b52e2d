//! Atomic file replacement.
//!
//! Content is staged in a uniquely named temporary file next to the
//! destination (same directory, so the final rename never crosses a
//! filesystem), permissions are applied to the temporary file, and only then
//! is it renamed over the destination. Readers observe either the previous
//! content or the complete new content.
//!
//! A [`StagedWrite`] that is dropped without [`StagedWrite::commit`] deletes
//! its temporary file, so neither a failed write nor an abandoned one leaves
//! debris behind.

use std::fs::{self, Permissions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::error::{ProvisionError, Result};

/// Temporary file holding the full new content, not yet visible at `target`.
#[derive(Debug)]
pub struct StagedWrite {
    target: PathBuf,
    temp: NamedTempFile,
    len: usize,
}

impl StagedWrite {
    /// Stage `content` for `path` with the given Unix permission bits.
    ///
    /// Missing parent directories are created first.
    pub fn stage(path: &Path, content: &[u8], mode: u32) -> Result<Self> {
        let fail = |source| ProvisionError::WriteFailed {
            path: path.to_path_buf(),
            source,
        };

        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(fail)?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut temp = tempfile::Builder::new()
            .prefix(&format!(".tmp.{file_name}."))
            .tempfile_in(parent)
            .map_err(fail)?;
        debug!(tmp_path = %temp.path().display(), "created temporary file");

        temp.write_all(content).map_err(fail)?;
        temp.as_file().sync_all().map_err(fail)?;
        fs::set_permissions(temp.path(), Permissions::from_mode(mode)).map_err(fail)?;

        Ok(Self {
            target: path.to_path_buf(),
            temp,
            len: content.len(),
        })
    }

    /// Path of the staged temporary file
    pub fn temp_path(&self) -> &Path {
        self.temp.path()
    }

    /// Rename the staged file over the destination.
    pub fn commit(self) -> Result<()> {
        let target = self.target;
        let len = self.len;
        self.temp
            .persist(&target)
            .map_err(|e| ProvisionError::WriteFailed {
                path: target.clone(),
                source: e.error,
            })?;
        info!("Wrote {} ({} bytes)", target.display(), len);
        Ok(())
    }
}

/// Replace `path` with `content` atomically.
pub fn write_atomic(path: &Path, content: &[u8], mode: u32) -> Result<()> {
    debug!(
        path = %path.display(),
        size_bytes = content.len(),
        mode = format!("{mode:o}"),
        "atomic_write called"
    );
    StagedWrite::stage(path, content, mode)?.commit()
}
