//! coursebuild-sync: update ledger, store/publish promotion and the
//! per-course orchestrator.
//!
//! - [`ledger`]: per-course history of update attempts
//! - [`stage`]: BUILD → STORE → PUBLISH promotion under stage locks
//! - [`pipeline`]: the [`Orchestrator`] state machine
//! - [`backend`]: build backends (`docker run`, no-op)
//! - [`notify`]: frontend notification and downstream consumers
//! - [`log`]: the per-attempt build log

pub mod backend;
pub mod error;
pub mod ledger;
pub mod log;
pub mod notify;
pub mod pipeline;
pub mod stage;

pub use backend::{resolve_backend, BuildBackend, BuildRequest, DockerBackend, NoopBackend};
pub use error::SyncError;
pub use ledger::{sort_records, FileLedger, Ledger};
pub use log::{BuildLog, StepTimer, PROGRESS_MARKER};
pub use notify::{Downstream, HttpDownstream, HttpNotifier, NotifyResponse, Notifier};
pub use pipeline::{build_env, resolve_build, Orchestrator, RunOutcome};
pub use stage::{StagePaths, StorePublishPipeline};
