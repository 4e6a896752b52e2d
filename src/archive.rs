//! Archive extraction.
//!
//! Archives are expanded by the system `tar`/`unzip` tools through the command
//! executor. Release archives usually wrap everything in one top-level
//! directory (`wordpress/`); that wrapper is detected and returned as the
//! content root so callers copy its children, not the wrapper itself.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::command_executor::CommandExecutor;
use crate::commands::{CommandArgs, TarExtract, UnzipExtract};
use crate::error::Result;
use crate::filesystem::FileOps;

/// Supported archive formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    TarGz,
    Zip,
}

impl ArchiveFormat {
    /// Guess the format from a URL or file name; anything not `.zip` is tar.gz.
    pub fn from_name(name: &str) -> Self {
        if name.to_ascii_lowercase().ends_with(".zip") {
            Self::Zip
        } else {
            Self::TarGz
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::TarGz => "tar.gz",
            Self::Zip => "zip",
        }
    }
}

/// The single wrapper directory among `entries`, if there is exactly one
/// entry and it is a directory.
pub fn wrapper_dir<'a>(entries: &'a [PathBuf], is_dir: impl Fn(&Path) -> bool) -> Option<&'a Path> {
    match entries {
        [only] if is_dir(only) => Some(only.as_path()),
        _ => None,
    }
}

/// Expand `archive` into `dest` and return the directory holding the content.
///
/// Returns `None` in simulate mode, where nothing is extracted.
pub fn extract(
    commands: &CommandExecutor,
    files: &FileOps,
    archive: &Path,
    format: ArchiveFormat,
    dest: &Path,
) -> Result<Option<PathBuf>> {
    debug!(
        archive = %archive.display(),
        dest = %dest.display(),
        format = format.extension(),
        "extracting archive"
    );
    let spec = match format {
        ArchiveFormat::TarGz => TarExtract {
            archive: archive.to_path_buf(),
            dest: dest.to_path_buf(),
        }
        .to_spec(),
        ArchiveFormat::Zip => UnzipExtract {
            archive: archive.to_path_buf(),
            dest: dest.to_path_buf(),
        }
        .to_spec(),
    };
    let simulated = files.create_dir_all(dest)?.is_simulated();
    commands.run(&spec)?;
    if simulated {
        return Ok(None);
    }

    let entries = files.list_dir(dest)?;
    let root = match wrapper_dir(&entries, |p| files.is_dir(p)) {
        Some(wrapper) => {
            debug!(path = %wrapper.display(), "stripping single top-level directory");
            wrapper.to_path_buf()
        }
        None => dest.to_path_buf(),
    };
    info!("Extraction complete ({} top-level entries)", entries.len());
    Ok(Some(root))
}
