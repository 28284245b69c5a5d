//! Error types for coursebuild-git.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitError {
    /// The `git` binary could not be started.
    #[error("failed to run git in {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// git ran and exited non-zero. `output` holds stdout and stderr.
    #[error("git {what} failed with {code}:\n{output}")]
    Command {
        what: String,
        code: String,
        output: String,
    },

    /// Removing a clone with the wrong origin failed.
    #[error(transparent)]
    Fs(#[from] coursebuild_fs::FsError),
}
