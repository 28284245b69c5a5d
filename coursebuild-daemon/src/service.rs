//! Wiring shared by the daemon and the CLI's foreground mode.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use coursebuild_core::courses::list_courses_at;
use coursebuild_core::settings::{self, ledger_dir_at};
use coursebuild_core::{CourseKey, UpdateRecord, UpdateStatus};
use coursebuild_fs::BackgroundQueue;
use coursebuild_sync::{
    resolve_backend, FileLedger, HttpDownstream, HttpNotifier, Ledger, Notifier, Orchestrator,
};

use crate::error::DaemonError;

/// Orchestrator over the settings, ledger and backends configured under
/// `home`.
pub fn open_orchestrator(home: &Path, queue: BackgroundQueue) -> Result<Orchestrator, DaemonError> {
    let settings = Arc::new(settings::load_at(home)?);
    let ledger: Arc<dyn Ledger> = Arc::new(FileLedger::new(ledger_dir_at(home)));
    let backend = resolve_backend(&settings);
    let notifier = HttpNotifier::from_settings(&settings)
        .map(|notifier| Arc::new(notifier) as Arc<dyn Notifier>);
    if notifier.is_none() {
        tracing::info!("no frontend_url configured; frontend notifications disabled");
    }
    Ok(Orchestrator::new(
        settings,
        ledger,
        backend,
        notifier,
        Arc::new(HttpDownstream::default()),
        queue,
    ))
}

/// Latest ledger state of one course.
#[derive(Debug, Clone, Serialize)]
pub struct CourseStatus {
    pub course: String,
    pub pending: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest: Option<UpdateRecord>,
}

pub fn course_status(ledger: &dyn Ledger, key: &CourseKey) -> Result<CourseStatus, DaemonError> {
    let records = ledger.records(key)?;
    Ok(CourseStatus {
        course: key.to_string(),
        pending: records
            .iter()
            .filter(|r| r.status == UpdateStatus::Pending)
            .count(),
        latest: records.last().cloned(),
    })
}

/// Status of every registered course, sorted by key.
pub fn all_course_status(
    home: &Path,
    ledger: &dyn Ledger,
) -> Result<Vec<CourseStatus>, DaemonError> {
    let mut out = Vec::new();
    for course in list_courses_at(home)? {
        out.push(course_status(ledger, &course.key)?);
    }
    out.sort_by(|a, b| a.course.cmp(&b.course));
    Ok(out)
}

/// Registered courses with at least one PENDING record.
pub fn courses_with_pending(
    home: &Path,
    ledger: &dyn Ledger,
) -> Result<Vec<CourseKey>, DaemonError> {
    Ok(all_course_status(home, ledger)?
        .into_iter()
        .filter(|status| status.pending > 0)
        .map(|status| CourseKey::from(status.course))
        .collect())
}
