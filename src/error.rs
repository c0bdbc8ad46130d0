//! Error types for raw copy operations.
//!
//! Every failure aborts the copy in progress. Cleanup (handle closes and
//! snapshot release) has already run by the time an [`Error`] reaches the
//! caller, and partially written destinations are left on disk.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the copy engine and its platform backends.
#[derive(Error, Debug)]
pub enum Error {
    /// The destination exists and overwriting was not requested.
    #[error("destination already exists: {0}")]
    DestinationExists(PathBuf),

    /// The shadow copy request failed or returned a non-zero status.
    #[error("snapshot creation failed for '{volume}': {message}")]
    SnapshotCreationFailed {
        volume: PathBuf,
        /// Status code reported by the snapshot service, when there is one.
        code: Option<u32>,
        message: String,
    },

    /// Removing a snapshot failed. Only logged by the copy engine.
    #[error("failed to release snapshot {id}: {message}")]
    SnapshotReleaseFailed { id: String, message: String },

    /// The volume driver rejected the extent query, or the file's data
    /// cannot be reproduced from its clusters.
    #[error("unsupported file system at '{path}': {message}")]
    UnsupportedFileSystem { path: PathBuf, message: String },

    /// The extent query failed or returned a malformed response.
    #[error("extent query failed: {message}")]
    ExtentQueryFailed {
        message: String,
        #[source]
        source: Option<io::Error>,
    },

    /// The raw volume (or snapshot) device could not be opened.
    #[error("failed to open volume device '{path}': {source}")]
    VolumeOpenFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A device access was not a multiple of the sector size.
    #[error(
        "unaligned device access at offset {offset} with length {length} (alignment {alignment})"
    )]
    AlignmentViolation {
        offset: u64,
        length: u64,
        alignment: u64,
    },

    /// Reading the device failed, came up short, or timed out.
    #[error("read failed at device offset {offset}: {source}")]
    ReadFailed {
        offset: u64,
        #[source]
        source: io::Error,
    },

    /// Writing the destination failed.
    #[error("write failed at '{path}': {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The copy observed a cancellation request.
    #[error("copy cancelled")]
    Cancelled,

    /// The copy options were rejected before any work started.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Any other I/O failure tied to a path (opening the source, looking up
    /// the volume).
    #[error("I/O error at '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Fieldless mirror of [`Error`], for callers that branch on the failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    DestinationExists,
    SnapshotCreationFailed,
    SnapshotReleaseFailed,
    UnsupportedFileSystem,
    ExtentQueryFailed,
    VolumeOpenFailed,
    AlignmentViolation,
    ReadFailed,
    WriteFailed,
    Cancelled,
    InvalidConfig,
    Io,
}

impl Error {
    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::DestinationExists(_) => ErrorKind::DestinationExists,
            Error::SnapshotCreationFailed { .. } => ErrorKind::SnapshotCreationFailed,
            Error::SnapshotReleaseFailed { .. } => ErrorKind::SnapshotReleaseFailed,
            Error::UnsupportedFileSystem { .. } => ErrorKind::UnsupportedFileSystem,
            Error::ExtentQueryFailed { .. } => ErrorKind::ExtentQueryFailed,
            Error::VolumeOpenFailed { .. } => ErrorKind::VolumeOpenFailed,
            Error::AlignmentViolation { .. } => ErrorKind::AlignmentViolation,
            Error::ReadFailed { .. } => ErrorKind::ReadFailed,
            Error::WriteFailed { .. } => ErrorKind::WriteFailed,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Error::Io { .. } => ErrorKind::Io,
        }
    }

    /// Create an I/O error with path context.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create an extent query error without an underlying OS error.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::ExtentQueryFailed {
            message: message.into(),
            source: None,
        }
    }

    /// Create an extent query error wrapping the OS error that caused it.
    pub fn extent_query(message: impl Into<String>, source: io::Error) -> Self {
        Self::ExtentQueryFailed {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create an unsupported file system error.
    pub fn unsupported(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::UnsupportedFileSystem {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a write error for the destination.
    pub fn write(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::WriteFailed {
            path: path.into(),
            source,
        }
    }
}
