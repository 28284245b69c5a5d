//! Domain types shared by every coursebuild crate.
//!
//! All path fields use `PathBuf`. All types serialize through serde so they
//! can be persisted in YAML (course sources) or JSON (the update ledger).

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Unique identifier of a course.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CourseKey(pub String);

impl CourseKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Keys double as file and directory names inside every stage root.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self.0 != "."
            && self.0 != ".."
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    }
}

impl fmt::Display for CourseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for CourseKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CourseKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Opaque token proving which BUILD snapshot a STORE or PUBLISH tree came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(pub String);

impl VersionId {
    pub const LEN: usize = 30;

    /// Fresh random alphanumeric token.
    pub fn generate() -> Self {
        let token: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(Self::LEN)
            .map(char::from)
            .collect();
        Self(token)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for VersionId {
    fn from(s: &str) -> Self {
        Self(s.trim().to_owned())
    }
}

impl From<String> for VersionId {
    fn from(s: String) -> Self {
        Self(s.trim().to_owned())
    }
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// The three staged directory trees of a course, in promotion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Unvalidated working copy.
    Build,
    /// Validated candidate.
    Store,
    /// What is served.
    Publish,
}

impl Stage {
    pub fn all() -> [Stage; 3] {
        [Stage::Build, Stage::Store, Stage::Publish]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Build => "build",
            Stage::Store => "store",
            Stage::Publish => "publish",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Course source
// ---------------------------------------------------------------------------

fn default_branch() -> String {
    "master".to_string()
}

/// Where a course's sources come from and how its builds behave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseSource {
    pub key: CourseKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_origin: Option<String>,
    #[serde(default = "default_branch")]
    pub git_branch: String,
    /// Identity of the course on the downstream frontend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<u64>,
    /// Overrides `<local_course_source_path>/<key>` from the settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_source: Option<PathBuf>,
    #[serde(default)]
    pub skip_git: bool,
    #[serde(default)]
    pub skip_build: bool,
    /// Build straight into PUBLISH and never store.
    #[serde(default)]
    pub skip_build_failsafes: bool,
    #[serde(default)]
    pub update_automatically: bool,
    #[serde(default)]
    pub email_on_error: bool,
}

impl CourseSource {
    pub fn new(key: impl Into<CourseKey>) -> Self {
        Self {
            key: key.into(),
            git_origin: None,
            git_branch: default_branch(),
            remote_id: None,
            local_source: None,
            skip_git: false,
            skip_build: false,
            skip_build_failsafes: false,
            update_automatically: false,
            email_on_error: false,
        }
    }

    /// Origin URL, ignoring blank values left in hand-edited files.
    pub fn origin(&self) -> Option<&str> {
        self.git_origin
            .as_deref()
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Ledger records
// ---------------------------------------------------------------------------

/// Lifecycle of one update attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum UpdateStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl UpdateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UpdateStatus::Pending => "PENDING",
            UpdateStatus::Running => "RUNNING",
            UpdateStatus::Success => "SUCCESS",
            UpdateStatus::Failed => "FAILED",
            UpdateStatus::Skipped => "SKIPPED",
        }
    }

    /// Whether the record has left the state machine.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            UpdateStatus::Success | UpdateStatus::Failed | UpdateStatus::Skipped
        )
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options carried by a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TriggerRequest {
    #[serde(default)]
    pub skip_git: bool,
    #[serde(default)]
    pub skip_build: bool,
    #[serde(default)]
    pub skip_notify: bool,
    #[serde(default)]
    pub rebuild_all: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

/// One update attempt in a course's ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub id: u64,
    pub course: CourseKey,
    pub request_time: DateTime<Utc>,
    pub status: UpdateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    #[serde(default)]
    pub log: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub request: TriggerRequest,
}

impl UpdateRecord {
    /// A new PENDING record; the ledger assigns the final id on append.
    pub fn pending(course: CourseKey, request: TriggerRequest) -> Self {
        Self {
            id: 0,
            course,
            request_time: Utc::now(),
            status: UpdateStatus::Pending,
            commit_hash: None,
            log: String::new(),
            started_time: None,
            updated_time: None,
            request,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
