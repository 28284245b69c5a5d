//! GitSync: cloning and updating course repositories and working out which
//! files changed since the last successful build.
//!
//! - [`sync`]: `git` invocation and the clone / checkout / clean step chains
//! - [`changes`]: changed-file detection over the update ledger
//! - [`error`]: [`GitError`]

pub mod changes;
pub mod error;
pub mod sync;

pub use changes::{changed_files_since_last_success, DiffSource, RepoDiff};
pub use error::GitError;
pub use sync::{GitOutcome, GitSync};
