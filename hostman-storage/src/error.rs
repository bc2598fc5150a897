//! Error types for the local storage engine.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during storage operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Disk, snapshot or pool does not exist (yet).
    #[error("Not found: {0}")]
    NotFound(String),

    /// Pool root exists but cannot be written.
    #[error("Directory {} is not writable", .0.display())]
    NotWritable(PathBuf),

    /// Pool root exists but is not a directory.
    #[error("Path {} is not a directory", .0.display())]
    NotADirectory(PathBuf),

    /// Health probe did not complete before its deadline.
    ///
    /// The pool state is unknown, not broken.
    #[error("Storage probe of {} timed out", .0.display())]
    Timeout(PathBuf),

    /// Remote transfer of a disk or snapshot failed.
    #[error("Failed to fetch {url}: {reason}")]
    FetchFailed { url: String, reason: String },

    /// Backing-file chain could not be updated.
    #[error("Failed to rebase {} onto {}: {reason}", .disk.display(), .backing.display())]
    RebaseFailed {
        disk: PathBuf,
        backing: PathBuf,
        reason: String,
    },

    /// Disk format change failed.
    #[error("Image conversion failed: {0}")]
    ConversionFailed(String),

    /// Image registry rejected or lost an upload.
    #[error("Image upload failed: {0}")]
    UploadFailed(String),

    /// Disk-from-snapshot transfer mode is not recognized.
    #[error("Unsupported protocol {0} for local storage")]
    UnsupportedProtocol(String),

    /// External tool (qemu-img, mkfs, fetcherfs) exited unsuccessfully.
    #[error("{tool} failed: {stderr}")]
    ToolFailed { tool: String, stderr: String },

    /// Request or configuration is invalid.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Control plane rejected a request.
    #[error("Control plane request failed: {0}")]
    ControlPlane(String),

    /// Filesystem error.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Wrap an I/O error with the path it occurred on.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error means the object is absent rather than unreachable.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
