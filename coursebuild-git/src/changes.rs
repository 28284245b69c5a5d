//! Changed-file detection over the update ledger.
//!
//! A FAILED build may have changed files that a later checkout reverted, so
//! the diff of every attempt back to the last SUCCESS counts, not just the
//! diff against that SUCCESS.

use std::collections::BTreeSet;
use std::path::Path;

use coursebuild_core::{UpdateRecord, UpdateStatus};

use crate::error::GitError;
use crate::sync::GitSync;

/// Anything that can list the files changed between two commits.
pub trait DiffSource {
    /// Files changed between `from` and `to` (`HEAD` when `None`).
    fn diff_names(&self, from: &str, to: Option<&str>) -> Result<Vec<String>, GitError>;
}

/// [`DiffSource`] backed by a work tree on disk.
pub struct RepoDiff<'a> {
    git: &'a GitSync,
    path: &'a Path,
}

impl<'a> RepoDiff<'a> {
    pub fn new(git: &'a GitSync, path: &'a Path) -> Self {
        Self { git, path }
    }
}

impl DiffSource for RepoDiff<'_> {
    fn diff_names(&self, from: &str, to: Option<&str>) -> Result<Vec<String>, GitError> {
        self.git.diff_names(self.path, from, to)
    }
}

/// Union of the files changed by every finished attempt back to and
/// including the newest SUCCESS.
///
/// Returns `None` ("unknown") when a visited record has no commit hash, a
/// diff fails, or no SUCCESS exists. `records` may be in any order.
pub fn changed_files_since_last_success(
    source: &dyn DiffSource,
    records: &[UpdateRecord],
) -> Option<BTreeSet<String>> {
    let mut finished: Vec<&UpdateRecord> = records
        .iter()
        .filter(|r| matches!(r.status, UpdateStatus::Success | UpdateStatus::Failed))
        .collect();
    finished.sort_by(|a, b| {
        b.request_time
            .cmp(&a.request_time)
            .then_with(|| b.id.cmp(&a.id))
    });

    let mut changed = BTreeSet::new();
    let mut newer: Option<&str> = None;
    for record in finished {
        let Some(hash) = record.commit_hash.as_deref() else {
            tracing::info!(record = record.id, "record without commit hash; changed files unknown");
            return None;
        };
        match source.diff_names(hash, newer) {
            Ok(files) => changed.extend(files),
            Err(e) => {
                tracing::warn!(record = record.id, error = %e, "diff failed; changed files unknown");
                return None;
            }
        }
        if record.status == UpdateStatus::Success {
            return Some(changed);
        }
        newer = Some(hash);
    }
    None
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use coursebuild_core::{CourseKey, TriggerRequest};
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// Diffs keyed by `(from, to)`; `to = None` is stored as `"HEAD"`.
    #[derive(Default)]
    struct FakeDiff {
        diffs: HashMap<(String, String), Vec<String>>,
        calls: RefCell<Vec<(String, String)>>,
    }

    impl FakeDiff {
        fn with(mut self, from: &str, to: &str, files: &[&str]) -> Self {
            self.diffs.insert(
                (from.to_string(), to.to_string()),
                files.iter().map(|f| f.to_string()).collect(),
            );
            self
        }
    }

    impl DiffSource for FakeDiff {
        fn diff_names(&self, from: &str, to: Option<&str>) -> Result<Vec<String>, GitError> {
            let key = (from.to_string(), to.unwrap_or("HEAD").to_string());
            self.calls.borrow_mut().push(key.clone());
            self.diffs.get(&key).cloned().ok_or_else(|| GitError::Command {
                what: "diff".to_string(),
                code: "128".to_string(),
                output: "bad revision".to_string(),
            })
        }
    }

    fn record(id: u64, minutes: i64, status: UpdateStatus, hash: Option<&str>) -> UpdateRecord {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).single().expect("time");
        let mut r = UpdateRecord::pending(CourseKey::from("c"), TriggerRequest::default());
        r.id = id;
        r.request_time = base + Duration::minutes(minutes);
        r.status = status;
        r.commit_hash = hash.map(str::to_string);
        r
    }

    #[test]
    fn unions_diffs_back_through_last_success() {
        let records = vec![
            record(1, 0, UpdateStatus::Success, Some("a")),
            record(2, 1, UpdateStatus::Success, Some("b")),
            record(3, 2, UpdateStatus::Failed, Some("c")),
            record(4, 3, UpdateStatus::Skipped, None),
            record(5, 4, UpdateStatus::Failed, Some("d")),
            record(6, 5, UpdateStatus::Running, None),
        ];
        let diff = FakeDiff::default()
            .with("d", "HEAD", &["x.rst"])
            .with("c", "d", &["y.rst"])
            .with("b", "c", &["x.rst", "z.yaml"]);

        let changed = changed_files_since_last_success(&diff, &records).expect("known");
        let expected: BTreeSet<String> = ["x.rst", "y.rst", "z.yaml"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(changed, expected);
        // Stops at the newest SUCCESS; record 1 is never diffed.
        assert_eq!(diff.calls.borrow().len(), 3);
    }

    #[test]
    fn missing_hash_in_range_is_unknown() {
        let records = vec![
            record(1, 0, UpdateStatus::Success, Some("a")),
            record(2, 1, UpdateStatus::Failed, None),
            record(3, 2, UpdateStatus::Failed, Some("c")),
        ];
        let diff = FakeDiff::default().with("c", "HEAD", &["f"]);
        assert_eq!(changed_files_since_last_success(&diff, &records), None);
    }

    #[test]
    fn failing_diff_is_unknown() {
        let records = vec![record(1, 0, UpdateStatus::Success, Some("gone"))];
        assert_eq!(
            changed_files_since_last_success(&FakeDiff::default(), &records),
            None
        );
    }

    #[test]
    fn no_success_is_unknown() {
        let records = vec![record(1, 0, UpdateStatus::Failed, Some("a"))];
        let diff = FakeDiff::default().with("a", "HEAD", &["f"]);
        assert_eq!(changed_files_since_last_success(&diff, &records), None);
    }

    #[test]
    fn newest_success_alone_diffs_against_head() {
        let records = vec![record(1, 0, UpdateStatus::Success, Some("a"))];
        let diff = FakeDiff::default().with("a", "HEAD", &[]);
        assert_eq!(
            changed_files_since_last_success(&diff, &records),
            Some(BTreeSet::new())
        );
    }
}
