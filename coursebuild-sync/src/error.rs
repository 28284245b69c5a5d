//! Error types for coursebuild-sync.

use std::path::PathBuf;

use thiserror::Error;

use coursebuild_config::ConfigError;
use coursebuild_core::CourseKey;
use coursebuild_fs::FsError;
use coursebuild_git::GitError;

/// Faults raised by the store/publish pipeline, the ledger and the
/// orchestrator.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger JSON error at {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// STORE was overwritten by a newer build since the caller looked.
    #[error("Config version doesn't match the given version. Expected {expected}, found {found}")]
    VersionMismatch { expected: String, found: String },

    #[error("Publishing from the build directory is not allowed")]
    PublishFromBuild,

    #[error("Course directory not found for {0} - the course probably has not been built")]
    NotBuilt(CourseKey),

    #[error("ledger has no record {id} for course {course}")]
    UnknownRecord { course: CourseKey, id: u64 },

    #[error("{0}")]
    Build(String),
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
