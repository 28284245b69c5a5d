//! coursebuild core library: domain types, service settings, course registry.
//!
//! - [`types`]: newtypes, ledger records, stages and version ids
//! - [`settings`]: service-wide settings loaded from `settings.yaml`
//! - [`courses`]: per-course source configuration (load / save / list)
//! - [`error`]: [`CoreError`]

pub mod courses;
pub mod error;
pub mod settings;
pub mod types;

pub use error::CoreError;
pub use settings::{BuildBackendSettings, Settings};
pub use types::{
    CourseKey, CourseSource, Stage, TriggerRequest, UpdateRecord, UpdateStatus, VersionId,
};
