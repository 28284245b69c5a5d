//! Course configuration loading and caching.
//!
//! - [`parser`]: index file lookup and parsing into the [`model`] tree
//! - [`exercise`]: exercise config files (includes, language variants)
//! - [`validate`]: cross-field checks; fatal errors and attached warnings
//! - [`course`]: [`CourseConfig`], a loaded course with freshness tracking
//! - [`cache`]: [`ConfigCache`], keyed by stage and course
//! - [`defaults`]: the exercise-defaults artifact and store file list
//! - [`meta`]: the `course.meta` build metadata file

pub mod cache;
pub mod course;
pub mod defaults;
pub mod error;
pub mod exercise;
pub mod meta;
pub mod model;
pub mod parser;
pub mod validate;

pub use cache::ConfigCache;
pub use course::CourseConfig;
pub use defaults::{exercise_defaults, referenced_files};
pub use error::ConfigError;
pub use exercise::ExerciseConfig;
pub use meta::{split_words, CourseMeta, META_FILE};
pub use model::{CourseData, Item, ItemKind, Localized, Module};
