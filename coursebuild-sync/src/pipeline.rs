//! The per-course update state machine.
//!
//! ```text
//! PENDING ──► RUNNING ──► SUCCESS
//!    │            └─────► FAILED
//!    └──► SKIPPED   (superseded by a newer PENDING record)
//! ```
//!
//! One [`Orchestrator::run`] drives at most one record per course. The
//! per-course task claim is a non-blocking exclusive [`FileLock`] on
//! `<build_root>/<key>.task`; a caller that cannot take it gets
//! [`RunOutcome::Locked`] and is expected to requeue.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};

use coursebuild_config::{split_words, ConfigCache, CourseMeta};
use coursebuild_core::{
    CourseSource, Settings, Stage, TriggerRequest, UpdateRecord, UpdateStatus, VersionId,
};
use coursebuild_fs::{
    check_self_contained, copy_tree, remove_path, BackgroundQueue, FileLock, FsError, LockMode,
};
use coursebuild_git::{changed_files_since_last_success, GitSync, RepoDiff};

use crate::backend::{BuildBackend, BuildRequest};
use crate::error::SyncError;
use crate::ledger::{sort_records, Ledger};
use crate::log::{BuildLog, StepTimer};
use crate::notify::{Downstream, Notifier};
use crate::stage::{write_replacing, StorePublishPipeline};

/// More changed files than this are summarised instead of listed.
const CHANGED_FILES_LOG_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Another task holds the course's claim.
    Locked,
    /// No PENDING record was left after housekeeping.
    NothingPending,
    /// The chosen record, in its final state.
    Finished(UpdateRecord),
}

pub struct Orchestrator {
    settings: Arc<Settings>,
    ledger: Arc<dyn Ledger>,
    backend: Arc<dyn BuildBackend>,
    notifier: Option<Arc<dyn Notifier>>,
    cache: Arc<ConfigCache>,
    stages: StorePublishPipeline,
    git: GitSync,
}

impl Orchestrator {
    pub fn new(
        settings: Arc<Settings>,
        ledger: Arc<dyn Ledger>,
        backend: Arc<dyn BuildBackend>,
        notifier: Option<Arc<dyn Notifier>>,
        downstream: Arc<dyn Downstream>,
        queue: BackgroundQueue,
    ) -> Self {
        let cache = Arc::new(ConfigCache::new(&settings));
        let stages = StorePublishPipeline::new(
            Arc::clone(&settings),
            Arc::clone(&cache),
            queue,
            downstream,
        );
        let git = GitSync::from_settings(&settings);
        Self {
            settings,
            ledger,
            backend,
            notifier,
            cache,
            stages,
            git,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn cache(&self) -> &Arc<ConfigCache> {
        &self.cache
    }

    pub fn stages(&self) -> &StorePublishPipeline {
        &self.stages
    }

    /// Append a PENDING record for `course`.
    pub fn trigger(
        &self,
        course: &CourseSource,
        request: TriggerRequest,
    ) -> Result<UpdateRecord, SyncError> {
        let record = self
            .ledger
            .append(UpdateRecord::pending(course.key.clone(), request))?;
        tracing::info!(course = %course.key, record = record.id, "update queued");
        Ok(record)
    }

    /// `<build_root>/<key>.task`
    pub fn task_claim_path(&self, course: &CourseSource) -> PathBuf {
        self.settings
            .build_path
            .join(format!("{}.task", course.key.as_str()))
    }

    /// Process the newest PENDING record of `course`.
    pub fn run(&self, course: &CourseSource) -> Result<RunOutcome, SyncError> {
        let claim_path = self.task_claim_path(course);
        let Some(_claim) = FileLock::try_acquire(&claim_path, LockMode::Exclusive)? else {
            tracing::debug!(course = %course.key, "task claim held elsewhere");
            return Ok(RunOutcome::Locked);
        };

        let Some(mut record) = self.select_pending(course)? else {
            return Ok(RunOutcome::NothingPending);
        };

        record.status = UpdateStatus::Running;
        record.started_time = Some(Utc::now());
        record.updated_time = None;
        record.log.clear();
        self.ledger.save(&record)?;

        let mut attempt = Attempt {
            record,
            log: BuildLog::new(course.key.as_str()),
            timer: StepTimer::default(),
        };
        attempt.log.info(format!(
            "Updating course {} (record {})",
            course.key, attempt.record.id
        ));

        let succeeded = match self.execute(course, &mut attempt) {
            Ok(succeeded) => succeeded,
            Err(e) => {
                attempt.log.error(format!("Build failed: {e}"));
                false
            }
        };
        attempt.timer.finish();
        self.finish(course, &mut attempt, succeeded)?;
        Ok(RunOutcome::Finished(attempt.record))
    }

    // -----------------------------------------------------------------------
    // Housekeeping
    // -----------------------------------------------------------------------

    /// Prune, reclaim abandoned RUNNING records and skip superseded PENDING
    /// ones. Returns the record to run, if any.
    fn select_pending(&self, course: &CourseSource) -> Result<Option<UpdateRecord>, SyncError> {
        let key = &course.key;
        let pruned = self.ledger.prune(key, self.settings.ledger_keep)?;
        if pruned > 0 {
            tracing::debug!(course = %key, pruned, "old ledger records removed");
        }

        let lease = ChronoDuration::from_std(self.settings.running_lease())
            .unwrap_or_else(|_| ChronoDuration::hours(2));
        let now = Utc::now();
        let mut records = self.ledger.records(key)?;
        for record in records.iter_mut() {
            let abandoned = record.status == UpdateStatus::Running
                && record
                    .started_time
                    .map_or(true, |started| now - started > lease);
            if abandoned {
                tracing::warn!(course = %key, record = record.id, "reclaiming abandoned RUNNING record");
                record.status = UpdateStatus::Pending;
                record.log.push_str("\nRun abandoned; requeued.\n");
                self.ledger.save(record)?;
            }
        }

        let mut pending: Vec<UpdateRecord> = records
            .into_iter()
            .filter(|r| r.status == UpdateStatus::Pending)
            .collect();
        sort_records(&mut pending);
        let Some(newest) = pending.pop() else {
            return Ok(None);
        };
        for mut superseded in pending {
            superseded.status = UpdateStatus::Skipped;
            superseded.updated_time = Some(now);
            self.ledger.save(&superseded)?;
            tracing::info!(course = %key, record = superseded.id, "superseded update skipped");
        }
        Ok(Some(newest))
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    fn build_dir(&self, course: &CourseSource) -> PathBuf {
        self.settings.course_dir(self.build_stage(course), &course.key)
    }

    /// PUBLISH when building in place, BUILD otherwise.
    fn build_stage(&self, course: &CourseSource) -> Stage {
        if course.skip_build_failsafes {
            Stage::Publish
        } else {
            Stage::Build
        }
    }

    /// Persist the log so far, marked as still running.
    fn checkpoint(&self, attempt: &mut Attempt) -> Result<(), SyncError> {
        attempt.record.log = attempt.log.in_progress();
        self.ledger.save(&attempt.record)
    }

    /// Steps from source sync to store. `Ok(false)` is a failure already
    /// explained in the log.
    fn execute(&self, course: &CourseSource, attempt: &mut Attempt) -> Result<bool, SyncError> {
        let key = &course.key;
        let request = attempt.record.request.clone();
        let stage = self.build_stage(course);
        let dir = self.build_dir(course);
        if course.skip_build_failsafes {
            attempt
                .log
                .warn("Build failsafes are disabled; building directly in the publish directory");
        }

        // Source
        attempt.timer.start("source");
        let changed = if request.skip_git || course.skip_git {
            attempt.log.info("Skipping git update");
            None
        } else if let Some(origin) = course.origin() {
            let existed = self.git.repo_exists(&dir);
            let outcome = self.git.sync(&dir, origin, &course.git_branch);
            attempt.log.output(&outcome.log);
            attempt.record.commit_hash = self.git.commit_hash(&dir);
            self.checkpoint(attempt)?;
            if !outcome.success {
                attempt.log.error("Failed to update the git repository");
                return Ok(false);
            }
            match self.git.commit_metadata(&dir) {
                Ok(metadata) => attempt.log.output(&metadata),
                Err(e) => attempt.log.warn(format!("Could not read commit metadata: {e}")),
            }
            if existed && !outcome.cloned && !request.rebuild_all {
                let records = self.ledger.records(key)?;
                changed_files_since_last_success(&RepoDiff::new(&self.git, &dir), &records)
            } else {
                None
            }
        } else {
            let source = course
                .local_source
                .clone()
                .unwrap_or_else(|| self.settings.local_course_source_path.join(key.as_str()));
            if source.is_dir() {
                attempt
                    .log
                    .info(format!("Copying local source from {}", source.display()));
                remove_path(&dir)?;
                copy_tree(&source, &dir)?;
            } else {
                attempt.log.warn(format!(
                    "No git origin configured and no local source at {}; building {} as is",
                    source.display(),
                    dir.display()
                ));
            }
            None
        };
        attempt.record.commit_hash = self.git.commit_hash(&dir);
        self.checkpoint(attempt)?;

        // Build
        attempt.timer.start("build");
        if request.skip_build || course.skip_build {
            attempt.log.info("Skipping build");
        } else if !self.run_build(course, &dir, &request, changed.as_ref(), &mut attempt.log)? {
            return Ok(false);
        }
        self.checkpoint(attempt)?;

        // Containment
        attempt.timer.start("containment");
        match check_self_contained(&dir) {
            Ok(()) => {}
            Err(e @ FsError::Containment { .. }) => {
                attempt.log.error(e.to_string());
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }

        // Version and configuration
        attempt.timer.start("config");
        let version = VersionId::generate();
        let version_file = self.settings.version_file(stage, key);
        write_replacing(&version_file, version.as_str().as_bytes())?;
        attempt.log.info(format!("Version id: {version}"));

        let config = match self.cache.refresh(stage, key) {
            Ok(Some(config)) => config,
            Ok(None) => {
                attempt
                    .log
                    .error(format!("Course directory {} does not exist", dir.display()));
                return Ok(false);
            }
            Err(e) => {
                attempt
                    .log
                    .error(format!("Failed to load the course configuration: {e}"));
                return Ok(false);
            }
        };
        for warning in config.warnings() {
            attempt.log.warn(warning);
        }
        self.checkpoint(attempt)?;

        // Store
        attempt.timer.start("store");
        if course.skip_build_failsafes {
            self.stages.write_defaults(Stage::Publish, &config)?;
            attempt.log.info("Built in place; nothing to store");
        } else if !self.stages.store(&config, &mut attempt.log)? {
            return Ok(false);
        }
        self.checkpoint(attempt)?;
        Ok(true)
    }

    fn run_build(
        &self,
        course: &CourseSource,
        dir: &Path,
        request: &TriggerRequest,
        changed: Option<&BTreeSet<String>>,
        log: &mut BuildLog,
    ) -> Result<bool, SyncError> {
        let meta = CourseMeta::read(dir)?;
        let (image, command) = resolve_build(&self.settings, meta.as_ref(), request);
        if image.is_empty() {
            log.info("No build image configured; nothing to build");
            return Ok(true);
        }
        let command = match command.as_deref().map(split_words) {
            None => None,
            Some(Some(words)) => Some(words),
            Some(None) => {
                log.error(format!("Malformed build command: {}", command.unwrap_or_default()));
                return Ok(false);
            }
        };

        let mut env = build_env(&self.settings, course);
        env.insert(
            "CHANGED_FILES".to_string(),
            changed_files_value(changed, request.rebuild_all, log),
        );
        log.info(format!("Building with image {image}"));
        let build = BuildRequest {
            course: &course.key,
            path: dir,
            image: &image,
            command: command.as_deref(),
            env: &env,
        };
        if self.backend.build(&build, log) {
            Ok(true)
        } else {
            log.error("Build failed");
            Ok(false)
        }
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    fn finish(
        &self,
        course: &CourseSource,
        attempt: &mut Attempt,
        succeeded: bool,
    ) -> Result<(), SyncError> {
        let key = &course.key;
        attempt.record.status = if succeeded {
            UpdateStatus::Success
        } else {
            UpdateStatus::Failed
        };
        attempt.log.info(format!("Update {}", attempt.record.status));

        if !succeeded && course.email_on_error {
            let message = attempt.log.as_str().to_string();
            self.mail_staff(
                course,
                &format!("Course {key} build failed"),
                &message,
                &mut attempt.log,
            );
        }
        self.persist(attempt)?;

        let dir = self.build_dir(course);
        if self.git.repo_exists(&dir) {
            let patterns = match CourseMeta::read(&dir) {
                Ok(meta) => meta
                    .map(|m| m.exclude_patterns())
                    .transpose()
                    .unwrap_or_else(|e| {
                        attempt.log.warn(format!("Ignoring exclude patterns: {e}"));
                        None
                    })
                    .unwrap_or_default(),
                Err(e) => {
                    attempt.log.warn(format!("Ignoring course meta: {e}"));
                    Vec::new()
                }
            };
            let outcome = self.git.clean(&dir, &patterns);
            attempt.log.output(&outcome.log);
            if !outcome.success {
                attempt.log.warn("git clean failed");
            }
        }

        if succeeded && !attempt.record.request.skip_notify {
            self.notify(course, &mut attempt.log);
        }

        attempt.log.output(&attempt.timer.table());
        self.persist(attempt)
    }

    fn persist(&self, attempt: &mut Attempt) -> Result<(), SyncError> {
        attempt.record.log = attempt.log.as_str().to_string();
        attempt.record.updated_time = Some(Utc::now());
        self.ledger.save(&attempt.record)
    }

    /// Tell the frontend about a successful update. Failures are logged and
    /// mailed; they never change the record's status.
    fn notify(&self, course: &CourseSource, log: &mut BuildLog) {
        if !course.update_automatically {
            return;
        }
        let (Some(notifier), Some(remote_id)) = (&self.notifier, course.remote_id) else {
            return;
        };
        log.info("Notifying the frontend");
        let failure = match notifier.notify_update(remote_id, course.email_on_error) {
            Ok(response) if response.success => {
                for error in &response.errors {
                    tracing::warn!(course = %course.key, "frontend reported: {error}");
                    log.warn(format!("Frontend reported: {error}"));
                }
                None
            }
            Ok(response) => Some(response.errors.join("\n")),
            Err(e) => Some(e),
        };
        if let Some(error) = failure {
            log.error(format!("Frontend notification failed: {error}"));
            if course.email_on_error {
                self.mail_staff(
                    course,
                    &format!("Course {} notify update failed", course.key),
                    &error,
                    log,
                );
            }
        }
    }

    fn mail_staff(&self, course: &CourseSource, subject: &str, message: &str, log: &mut BuildLog) {
        let (Some(notifier), Some(remote_id)) = (&self.notifier, course.remote_id) else {
            log.warn("Cannot send the error email: no frontend or remote id configured");
            return;
        };
        if let Err(e) = notifier.send_error_mail(remote_id, subject, message) {
            log.error(format!("Failed to send the error email: {e}"));
        }
    }
}

/// State of the attempt being driven.
struct Attempt {
    record: UpdateRecord,
    log: BuildLog,
    timer: StepTimer,
}

// ---------------------------------------------------------------------------
// Build inputs
// ---------------------------------------------------------------------------

/// Image and command for a build. An empty image means nothing to build.
///
/// An explicit image on the request wins together with the request's
/// command. Otherwise the course meta file overrides the default image, and
/// the command comes from the meta file, then the request, then (only when
/// the meta file does not pick its own image) the default command.
pub fn resolve_build(
    settings: &Settings,
    meta: Option<&CourseMeta>,
    request: &TriggerRequest,
) -> (String, Option<String>) {
    if let Some(image) = &request.image {
        return (image.clone(), request.command.clone());
    }
    let Some(meta) = meta else {
        return (
            settings.default_image.clone().unwrap_or_default(),
            request.command.clone(),
        );
    };
    let image = meta
        .build_image()
        .map(str::to_string)
        .or_else(|| settings.default_image.clone())
        .unwrap_or_default();
    let command = meta
        .build_command()
        .map(str::to_string)
        .or_else(|| request.command.clone())
        .or_else(|| {
            if meta.build_image().is_none() {
                settings.default_cmd.clone()
            } else {
                None
            }
        });
    (image, command)
}

/// Fixed build environment, without `CHANGED_FILES`.
pub fn build_env(settings: &Settings, course: &CourseSource) -> BTreeMap<String, String> {
    let static_path = format!(
        "{}/{}",
        settings.static_url.trim_end_matches('/'),
        course.key.as_str()
    );
    let static_host = settings
        .static_content_host
        .as_deref()
        .map(|host| format!("{}{static_path}", host.trim_end_matches('/')))
        .unwrap_or_default();
    BTreeMap::from([
        ("COURSE_KEY".to_string(), course.key.as_str().to_string()),
        (
            "COURSE_ID".to_string(),
            course.remote_id.map(|id| id.to_string()).unwrap_or_default(),
        ),
        ("STATIC_URL_PATH".to_string(), static_path),
        ("STATIC_CONTENT_HOST".to_string(), static_host),
    ])
}

/// Newline-separated changed files, or `*` when everything must rebuild.
fn changed_files_value(
    changed: Option<&BTreeSet<String>>,
    rebuild_all: bool,
    log: &mut BuildLog,
) -> String {
    match changed {
        _ if rebuild_all => {
            log.info("Rebuilding all files");
            "*".to_string()
        }
        None => {
            log.info("Changed files unknown; rebuilding all files");
            "*".to_string()
        }
        Some(files) => {
            if files.len() > CHANGED_FILES_LOG_LIMIT {
                log.info(format!("Detected over {CHANGED_FILES_LOG_LIMIT} changed files"));
            } else {
                log.info(format!(
                    "Changed files: {}",
                    files.iter().cloned().collect::<Vec<_>>().join(", ")
                ));
            }
            files.iter().cloned().collect::<Vec<_>>().join("\n")
        }
    }
}
