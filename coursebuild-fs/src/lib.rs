//! coursebuild filesystem layer.
//!
//! - [`lock`]: advisory `flock` locks on `<path>.lock` siblings
//! - [`transaction`]: atomic rename and all-or-nothing rename batches
//! - [`tree`]: rsync-style mirroring and plain copy/remove helpers
//! - [`containment`]: self-containment check for built trees
//! - [`background`]: fire-and-forget job queue with retry budgets

pub mod background;
pub mod containment;
pub mod error;
pub mod lock;
pub mod transaction;
pub mod tree;

pub use background::{BackgroundQueue, Job};
pub use containment::check_self_contained;
pub use error::FsError;
pub use lock::{FileLock, LockMode};
pub use transaction::{atomic_rename, atomic_rename_all};
pub use tree::{copy_file, copy_tree, remove_except, remove_path, sync_tree};
