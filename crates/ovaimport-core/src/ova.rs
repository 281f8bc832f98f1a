//! OVA archive extraction.
//!
//! An OVA is a TAR file holding an OVF descriptor, an optional manifest and
//! the disk images. This module unpacks it into a working directory that is
//! cleared first, so a rerun never merges with leftovers of an earlier one.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;

use crate::error::{Error, Result};

/// Magic bytes at the start of a gzip stream.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// A working directory that is removed when dropped.
///
/// Every exit path of an import, including failures and panics, releases
/// the directory unless it was explicitly kept.
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
    keep: bool,
}

impl WorkDir {
    /// Take ownership of `path` as a scoped working directory.
    pub fn new(path: impl Into<PathBuf>, keep: bool) -> Self {
        Self {
            path: path.into(),
            keep,
        }
    }

    /// The directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the directory survives the guard.
    pub fn is_kept(&self) -> bool {
        self.keep
    }
}

impl Drop for WorkDir {
    fn drop(&mut self) {
        if self.keep || !self.path.exists() {
            return;
        }
        match fs::remove_dir_all(&self.path) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "removed working directory"),
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "failed to remove working directory; clean it up manually"
            ),
        }
    }
}

/// Extract an OVA archive into `dest`.
///
/// If `dest` already exists it is removed and recreated; a directory that
/// cannot be removed (or a non-directory in its place) is a
/// [`Error::PathConflict`]. Plain and gzip-compressed TAR streams are
/// accepted. Only regular files and directories are materialised; other
/// entry kinds are skipped.
///
/// # Returns
///
/// The relative paths of the extracted files, in archive order.
///
/// # Errors
///
/// - [`Error::ArchiveRead`] if the archive is missing, unreadable as TAR,
///   or has a member that would land outside `dest`.
/// - [`Error::PathConflict`] if `dest` cannot be cleared.
/// - [`Error::Io`] for other filesystem failures.
pub fn extract_ova(archive_path: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
    let reader = open_archive(archive_path)?;
    prepare_work_dir(dest)?;

    tracing::info!(
        archive = %archive_path.display(),
        dest = %dest.display(),
        "extracting archive"
    );

    let mut archive = Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| Error::archive(format!("failed to read archive: {e}")))?;

    let mut extracted = Vec::new();
    for entry in entries {
        let mut entry = entry.map_err(|e| Error::archive(format!("bad archive entry: {e}")))?;
        let raw_path = entry
            .path()
            .map_err(|e| Error::archive(format!("bad member path: {e}")))?
            .into_owned();

        let Some(relative) = member_path(&raw_path)? else {
            continue;
        };
        let target = dest.join(&relative);
        let entry_type = entry.header().entry_type();

        if entry_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| Error::io(e, &target))?;
        } else if entry_type.is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::io(e, parent))?;
            }
            entry
                .unpack(&target)
                .map_err(|e| unpack_error(e, &target))?;
            tracing::debug!(member = %relative.display(), "extracted member");
            extracted.push(relative);
        } else {
            tracing::warn!(
                member = %raw_path.display(),
                kind = ?entry_type,
                "skipping unsupported archive member"
            );
        }
    }

    tracing::info!(files = extracted.len(), "archive extracted");
    Ok(extracted)
}

/// Clear and recreate the working directory.
///
/// A pre-existing empty directory is fine; leftovers from an earlier run are
/// removed rather than merged with.
pub fn prepare_work_dir(dest: &Path) -> Result<()> {
    match fs::symlink_metadata(dest) {
        Ok(meta) if meta.is_dir() => {
            tracing::info!(path = %dest.display(), "removing existing working directory");
            fs::remove_dir_all(dest).map_err(|e| {
                Error::path_conflict(dest, format!("cannot clear existing directory: {e}"))
            })?;
        }
        Ok(_) => {
            return Err(Error::path_conflict(dest, "exists and is not a directory"));
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(Error::io(e, dest)),
    }

    fs::create_dir_all(dest).map_err(|e| Error::io(e, dest))
}

/// Open the archive, transparently decoding gzip.
fn open_archive(archive_path: &Path) -> Result<Box<dyn Read>> {
    let file = File::open(archive_path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => {
            Error::archive(format!("archive '{}' not found", archive_path.display()))
        }
        _ => Error::io(e, archive_path),
    })?;

    let mut reader = BufReader::new(file);
    let head = reader.fill_buf().map_err(|e| Error::io(e, archive_path))?;
    if head.starts_with(&GZIP_MAGIC) {
        tracing::debug!("archive is gzip-compressed");
        Ok(Box::new(GzDecoder::new(reader)))
    } else {
        Ok(Box::new(reader))
    }
}

/// Normalise a member path, rejecting anything that escapes the target.
///
/// Returns `None` for members that resolve to the target itself (`./`).
pub(crate) fn member_path(raw: &Path) -> Result<Option<PathBuf>> {
    let mut relative = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(Error::archive(format!(
                    "member '{}' escapes the working directory",
                    raw.display()
                )));
            }
        }
    }

    if relative.as_os_str().is_empty() {
        Ok(None)
    } else {
        Ok(Some(relative))
    }
}

fn unpack_error(e: io::Error, target: &Path) -> Error {
    match e.kind() {
        io::ErrorKind::PermissionDenied => Error::io(e, target),
        // Truncated or corrupt member data surfaces as a generic I/O error
        _ => Error::archive(format!("failed to unpack '{}': {e}", target.display())),
    }
}
