//! Error types for coursebuild-fs.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// All errors raised by locking, renaming, mirroring and containment checks.
#[derive(Debug, Error)]
pub enum FsError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The lock could not be acquired within the allowed time.
    #[error("timed out after {timeout:?} waiting for lock on {path}")]
    LockTimeout { path: PathBuf, timeout: Duration },

    /// A rename failed; any displaced destination was restored.
    #[error("failed to rename {src} to {dst}: {source}")]
    RenameFailed {
        src: PathBuf,
        dst: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A file or symlink escapes the tree being checked.
    #[error("{path}: {reason}")]
    Containment { path: PathBuf, reason: String },

    /// Walking a directory tree failed.
    #[error("failed to walk {path}: {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },
}

/// Convenience constructor for [`FsError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> FsError {
    FsError::Io {
        path: path.into(),
        source,
    }
}
