//! Error types for the OVA import library.

use std::path::PathBuf;
use std::time::Duration;

use crate::import::ImportStage;

/// The main error type for import operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// The archive is missing, corrupt, or contains an unsafe member.
    #[error("archive read error: {message}")]
    ArchiveRead { message: String },

    /// The working directory exists and could not be cleared.
    #[error("path conflict at '{}': {message}", path.display())]
    PathConflict { path: PathBuf, message: String },

    /// No hardware descriptor was found in the extracted archive.
    #[error("no OVF descriptor found under '{}'", dir.display())]
    DescriptorNotFound { dir: PathBuf },

    /// More than one hardware descriptor was found.
    #[error("ambiguous OVF descriptor: {} candidates found", candidates.len())]
    AmbiguousDescriptor { candidates: Vec<PathBuf> },

    /// The hardware descriptor is not well-formed XML.
    #[error("OVF parse error: {message}")]
    DescriptorParse { message: String },

    /// A file's digest does not match the archive manifest.
    #[error("manifest mismatch for '{file}': expected {expected}, got {actual}")]
    ManifestMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    /// The remote side reported a task in the `ERROR` state.
    #[error("remote task '{tag}' failed: {message}")]
    RemoteTask { tag: String, message: String },

    /// No terminal task state was observed before the deadline.
    #[error("remote task '{tag}' did not finish within {}s", waited.as_secs())]
    TimeoutExceeded { tag: String, waited: Duration },

    /// Network or management API failure.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// A pipeline stage failed; wraps the underlying cause.
    #[error("import failed during {stage}{}: {source}", disk.as_ref().map(|d| format!(" (disk '{d}')")).unwrap_or_default())]
    Stage {
        stage: ImportStage,
        disk: Option<String>,
        source: Box<Error>,
    },
}

/// A specialized Result type for import operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create an archive read error.
    pub fn archive(message: impl Into<String>) -> Self {
        Self::ArchiveRead {
            message: message.into(),
        }
    }

    /// Create a path conflict error.
    pub fn path_conflict(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::PathConflict {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a descriptor parse error.
    pub fn descriptor_parse(message: impl Into<String>) -> Self {
        Self::DescriptorParse {
            message: message.into(),
        }
    }

    /// Create a remote task error.
    pub fn remote_task(tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RemoteTask {
            tag: tag.into(),
            message: message.into(),
        }
    }

    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Wrap an error with the stage (and disk) it occurred in.
    pub fn stage(stage: ImportStage, disk: Option<String>, source: Error) -> Self {
        Self::Stage {
            stage,
            disk,
            source: Box::new(source),
        }
    }

    /// The stage that failed, if this is a consolidated stage error.
    pub fn failed_stage(&self) -> Option<ImportStage> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}

impl From<reqwest::Error> for Error {
    fn from(source: reqwest::Error) -> Self {
        Self::transport(source.to_string())
    }
}
