use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use chrono::{Duration, Utc};
use coursebuild_core::{
    CourseKey, CourseSource, Settings, Stage, TriggerRequest, UpdateRecord, UpdateStatus,
    VersionId,
};
use coursebuild_fs::{BackgroundQueue, FileLock, LockMode};
use coursebuild_sync::{
    BuildBackend, BuildLog, BuildRequest, Downstream, FileLedger, Ledger, NoopBackend,
    NotifyResponse, Notifier, Orchestrator, RunOutcome, SyncError,
};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingNotifier {
    notified: Mutex<Vec<(u64, bool)>>,
    mails: Mutex<Vec<String>>,
}

impl Notifier for RecordingNotifier {
    fn notify_update(
        &self,
        remote_id: u64,
        email_on_error: bool,
    ) -> Result<NotifyResponse, String> {
        self.notified
            .lock()
            .expect("notified")
            .push((remote_id, email_on_error));
        Ok(NotifyResponse {
            success: true,
            errors: Vec::new(),
        })
    }

    fn send_error_mail(&self, _remote_id: u64, subject: &str, _message: &str) -> Result<(), String> {
        self.mails.lock().expect("mails").push(subject.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingDownstream {
    calls: Mutex<Vec<(String, String)>>,
}

impl Downstream for RecordingDownstream {
    fn publish(&self, url: &str, _course: &CourseKey, version: &VersionId) -> Result<(), String> {
        self.calls
            .lock()
            .expect("calls")
            .push((url.to_string(), version.to_string()));
        Ok(())
    }
}

/// Records the environment of every build and answers with `result`.
struct FakeBackend {
    result: bool,
    envs: Mutex<Vec<BTreeMap<String, String>>>,
}

impl FakeBackend {
    fn new(result: bool) -> Self {
        Self {
            result,
            envs: Mutex::new(Vec::new()),
        }
    }
}

impl BuildBackend for FakeBackend {
    fn build(&self, request: &BuildRequest<'_>, log: &mut BuildLog) -> bool {
        log.info(format!("fake build of {}", request.image));
        self.envs.lock().expect("envs").push(request.env.clone());
        self.result
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Fixture {
    _root: TempDir,
    settings: Arc<Settings>,
    ledger: Arc<FileLedger>,
    notifier: Arc<RecordingNotifier>,
    downstream: Arc<RecordingDownstream>,
    queue: BackgroundQueue,
}

impl Fixture {
    fn new() -> Self {
        Self::with_settings(|_| {})
    }

    fn with_settings(edit: impl FnOnce(&mut Settings)) -> Self {
        let root = TempDir::new().expect("root");
        let mut settings = Settings::rooted_at(root.path());
        edit(&mut settings);
        let ledger = Arc::new(FileLedger::new(root.path().join("ledger")));
        Self {
            _root: root,
            settings: Arc::new(settings),
            ledger,
            notifier: Arc::new(RecordingNotifier::default()),
            downstream: Arc::new(RecordingDownstream::default()),
            queue: BackgroundQueue::standalone().expect("queue"),
        }
    }

    fn orchestrator(&self, backend: Arc<dyn BuildBackend>) -> Orchestrator {
        Orchestrator::new(
            Arc::clone(&self.settings),
            self.ledger.clone(),
            backend,
            Some(self.notifier.clone()),
            self.downstream.clone(),
            self.queue.clone(),
        )
    }

    fn build_dir(&self, key: &str) -> PathBuf {
        self.settings.course_dir(Stage::Build, &CourseKey::from(key))
    }

    fn records(&self, key: &str) -> Vec<UpdateRecord> {
        self.ledger.records(&CourseKey::from(key)).expect("records")
    }
}

fn write_course(dir: &Path) {
    std::fs::create_dir_all(dir.join("exercises")).expect("mkdir");
    std::fs::create_dir_all(dir.join("_build/html/_static")).expect("mkdir");
    std::fs::write(
        dir.join("index.yaml"),
        "name: Course\n\
         static_dir: _build/html\n\
         configures:\n  - {url: 'http://grader.example.org/configure'}\n\
         categories: {ex: {}}\n\
         modules:\n  - key: m1\n    name: Round 1\n    children:\n      \
         - {key: ex1, category: ex, config: exercises/ex1.yaml, max_points: 10}\n",
    )
    .expect("write index");
    std::fs::write(
        dir.join("exercises/ex1.yaml"),
        "title: First\nview_type: access.types.stdasync.acceptFiles\n",
    )
    .expect("write exercise");
    std::fs::write(dir.join("_build/html/index.html"), "<h1>Course</h1>").expect("write html");
    std::fs::write(dir.join("_build/html/_static/app.css"), "body {}").expect("write css");
}

fn skip_all() -> TriggerRequest {
    TriggerRequest {
        skip_git: true,
        skip_build: true,
        ..TriggerRequest::default()
    }
}

fn finished(outcome: RunOutcome) -> UpdateRecord {
    match outcome {
        RunOutcome::Finished(record) => record,
        other => panic!("expected a finished run, got {other:?}"),
    }
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_else(|e| panic!("read {}: {e}", path.display()))
}

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .env("GIT_AUTHOR_NAME", "Course Staff")
        .env("GIT_AUTHOR_EMAIL", "staff@example.org")
        .env("GIT_COMMITTER_NAME", "Course Staff")
        .env("GIT_COMMITTER_EMAIL", "staff@example.org")
        .output()
        .expect("git runs");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Commit the course in `dir` and return `HEAD`.
fn commit_course(dir: &Path, origin: &str) -> String {
    write_course(dir);
    git(dir, &["init", "-q"]);
    git(dir, &["remote", "add", "origin", origin]);
    git(dir, &["add", "."]);
    git(dir, &["commit", "-q", "-m", "initial"]);
    git(dir, &["rev-parse", "HEAD"])
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[test]
fn skipped_git_and_build_still_stores() {
    let fx = Fixture::new();
    let course = CourseSource::new("c");
    write_course(&fx.build_dir("c"));
    let orchestrator = fx.orchestrator(Arc::new(NoopBackend));

    orchestrator.trigger(&course, skip_all()).expect("trigger");
    let record = finished(orchestrator.run(&course).expect("run"));

    assert_eq!(record.status, UpdateStatus::Success, "log:\n{}", record.log);
    assert_eq!(record.commit_hash, None);
    assert!(record.updated_time.is_some());
    assert!(record.log.contains("Time taken for each step in seconds:"));

    let store = fx.settings.course_dir(Stage::Store, &course.key);
    assert_eq!(
        read(&store.join("_build/html/index.html")),
        read(&fx.build_dir("c").join("_build/html/index.html"))
    );
    assert_eq!(
        read(&store.join("_build/html/_static/app.css")),
        "body {}"
    );
    assert!(store.join("index.yaml").is_file());
    assert!(store.join("exercises/ex1.yaml").is_file());
    assert_eq!(
        read(&fx.settings.version_file(Stage::Store, &course.key)),
        read(&fx.settings.version_file(Stage::Build, &course.key))
    );

    let defaults: serde_json::Value =
        serde_json::from_str(&read(&fx.settings.defaults_file(Stage::Store, &course.key)))
            .expect("defaults json");
    assert_eq!(defaults["ex1"]["max_points"], 10);
}

#[test]
fn skipped_git_still_records_head_and_cleans() {
    if !git_available() {
        return;
    }
    let fx = Fixture::new();
    let mut course = CourseSource::new("c");
    course.git_origin = Some("https://git.example.org/course.git".to_string());
    let head = commit_course(&fx.build_dir("c"), "https://git.example.org/course.git");
    std::fs::write(fx.build_dir("c").join("junk.txt"), "scratch").expect("write junk");

    let orchestrator = fx.orchestrator(Arc::new(NoopBackend));
    orchestrator.trigger(&course, skip_all()).expect("trigger");
    let record = finished(orchestrator.run(&course).expect("run"));

    assert_eq!(record.status, UpdateStatus::Success, "log:\n{}", record.log);
    assert_eq!(record.commit_hash.as_deref(), Some(head.as_str()));
    assert!(!fx.build_dir("c").join("junk.txt").exists());
    assert!(fx.build_dir("c").join("index.yaml").is_file());
    assert_eq!(fx.records("c")[0].commit_hash.as_deref(), Some(head.as_str()));
}

#[test]
fn store_without_static_dir_mirrors_whole_tree() {
    let fx = Fixture::new();
    let course = CourseSource::new("c");
    let build = fx.build_dir("c");
    std::fs::create_dir_all(build.join("content")).expect("mkdir");
    std::fs::write(
        build.join("index.yaml"),
        "name: Course\n\
         categories: {ch: {}}\n\
         modules:\n  - key: m1\n    name: Round 1\n    children:\n      \
         - {key: page, category: ch, name: Page, static_content: content/page.html}\n",
    )
    .expect("write index");
    std::fs::write(build.join("content/page.html"), "<p>page</p>").expect("write page");
    std::fs::write(build.join("content/figure.svg"), "<svg/>").expect("write figure");

    let store = fx.settings.course_dir(Stage::Store, &course.key);
    std::fs::create_dir_all(&store).expect("mkdir store");
    std::fs::write(store.join("stale.html"), "old").expect("write stale");

    let orchestrator = fx.orchestrator(Arc::new(NoopBackend));
    orchestrator.trigger(&course, skip_all()).expect("trigger");
    let record = finished(orchestrator.run(&course).expect("run"));

    assert_eq!(record.status, UpdateStatus::Success, "log:\n{}", record.log);
    assert_eq!(read(&store.join("content/page.html")), "<p>page</p>");
    assert_eq!(read(&store.join("content/figure.svg")), "<svg/>");
    assert!(store.join("index.yaml").is_file());
    assert!(!store.join("stale.html").exists());
}

#[test]
fn missing_static_dir_fails_the_build() {
    let fx = Fixture::new();
    let course = CourseSource::new("c");
    write_course(&fx.build_dir("c"));
    std::fs::remove_dir_all(fx.build_dir("c").join("_build/html")).expect("remove html");

    let orchestrator = fx.orchestrator(Arc::new(NoopBackend));
    orchestrator.trigger(&course, skip_all()).expect("trigger");
    let record = finished(orchestrator.run(&course).expect("run"));

    assert_eq!(record.status, UpdateStatus::Failed, "log:\n{}", record.log);
    assert!(record.log.contains("Static directory '_build/html' does not exist"));
    assert!(!fx.settings.version_file(Stage::Store, &course.key).exists());
}

#[test]
fn older_pending_records_are_skipped_without_running() {
    let fx = Fixture::new();
    let course = CourseSource::new("c");
    write_course(&fx.build_dir("c"));
    let base = Utc::now() - Duration::minutes(5);
    for offset in [0, 1] {
        let mut record = UpdateRecord::pending(course.key.clone(), skip_all());
        record.request_time = base + Duration::seconds(offset);
        fx.ledger.append(record).expect("append");
    }

    let orchestrator = fx.orchestrator(Arc::new(NoopBackend));
    let ran = finished(orchestrator.run(&course).expect("run"));
    assert_eq!(ran.id, 2);

    let records = fx.records("c");
    assert_eq!(records[0].status, UpdateStatus::Skipped);
    assert_eq!(records[0].started_time, None);
    assert_eq!(records[1].status, UpdateStatus::Success);

    assert_eq!(
        orchestrator.run(&course).expect("second run"),
        RunOutcome::NothingPending
    );
}

#[test]
fn held_task_claim_reports_locked() {
    let fx = Fixture::new();
    let course = CourseSource::new("c");
    let orchestrator = fx.orchestrator(Arc::new(NoopBackend));
    orchestrator.trigger(&course, skip_all()).expect("trigger");

    let claim = FileLock::try_acquire(&orchestrator.task_claim_path(&course), LockMode::Exclusive)
        .expect("claim")
        .expect("free");
    assert_eq!(orchestrator.run(&course).expect("run"), RunOutcome::Locked);
    assert_eq!(fx.records("c")[0].status, UpdateStatus::Pending);
    drop(claim);

    let record = finished(orchestrator.run(&course).expect("run"));
    assert_eq!(record.status, UpdateStatus::Failed, "course dir is missing");
}

#[test]
fn abandoned_running_record_is_reclaimed() {
    let fx = Fixture::with_settings(|s| s.running_lease_secs = 60);
    let course = CourseSource::new("c");
    write_course(&fx.build_dir("c"));
    let mut record = UpdateRecord::pending(course.key.clone(), skip_all());
    record.status = UpdateStatus::Running;
    record.started_time = Some(Utc::now() - Duration::minutes(10));
    fx.ledger.append(record).expect("append");

    let orchestrator = fx.orchestrator(Arc::new(NoopBackend));
    let record = finished(orchestrator.run(&course).expect("run"));
    assert_eq!(record.status, UpdateStatus::Success);
}

#[test]
fn local_source_replaces_build_tree() {
    let fx = Fixture::new();
    let mut course = CourseSource::new("c");
    let source = fx.settings.local_course_source_path.join("c");
    write_course(&source);
    std::fs::create_dir_all(fx.build_dir("c")).expect("mkdir");
    std::fs::write(fx.build_dir("c").join("stale.txt"), "old").expect("write");
    course.local_source = Some(source);

    let orchestrator = fx.orchestrator(Arc::new(NoopBackend));
    orchestrator
        .trigger(
            &course,
            TriggerRequest {
                skip_build: true,
                ..TriggerRequest::default()
            },
        )
        .expect("trigger");
    let record = finished(orchestrator.run(&course).expect("run"));

    assert_eq!(record.status, UpdateStatus::Success, "log:\n{}", record.log);
    assert!(fx.build_dir("c").join("index.yaml").is_file());
    assert!(!fx.build_dir("c").join("stale.txt").exists());
}

#[test]
fn build_receives_fixed_environment() {
    let fx = Fixture::with_settings(|s| s.default_image = Some("compile-rst:1.6".to_string()));
    let mut course = CourseSource::new("c");
    course.remote_id = Some(42);
    write_course(&fx.build_dir("c"));
    let backend = Arc::new(FakeBackend::new(true));

    let orchestrator = fx.orchestrator(backend.clone());
    orchestrator
        .trigger(
            &course,
            TriggerRequest {
                skip_git: true,
                ..TriggerRequest::default()
            },
        )
        .expect("trigger");
    let record = finished(orchestrator.run(&course).expect("run"));
    assert_eq!(record.status, UpdateStatus::Success, "log:\n{}", record.log);

    let envs = backend.envs.lock().expect("envs");
    assert_eq!(envs.len(), 1);
    assert_eq!(envs[0]["COURSE_KEY"], "c");
    assert_eq!(envs[0]["COURSE_ID"], "42");
    assert_eq!(envs[0]["STATIC_URL_PATH"], "/static/c");
    assert_eq!(envs[0]["CHANGED_FILES"], "*");
}

#[test]
fn failed_build_mails_staff() {
    let fx = Fixture::with_settings(|s| s.default_image = Some("compile-rst:1.6".to_string()));
    let mut course = CourseSource::new("c");
    course.remote_id = Some(7);
    course.email_on_error = true;
    write_course(&fx.build_dir("c"));

    let orchestrator = fx.orchestrator(Arc::new(FakeBackend::new(false)));
    orchestrator
        .trigger(
            &course,
            TriggerRequest {
                skip_git: true,
                ..TriggerRequest::default()
            },
        )
        .expect("trigger");
    let record = finished(orchestrator.run(&course).expect("run"));

    assert_eq!(record.status, UpdateStatus::Failed);
    assert!(record.log.contains("Build failed"));
    assert!(!record.log.ends_with(coursebuild_sync::PROGRESS_MARKER));
    assert_eq!(
        *fx.notifier.mails.lock().expect("mails"),
        vec!["Course c build failed".to_string()]
    );
    assert!(!fx.settings.course_dir(Stage::Store, &course.key).exists());
}

#[cfg(unix)]
#[test]
fn absolute_symlink_fails_containment() {
    let fx = Fixture::new();
    let course = CourseSource::new("c");
    write_course(&fx.build_dir("c"));
    let target = fx.build_dir("c").join("index.yaml");
    std::os::unix::fs::symlink(&target, fx.build_dir("c").join("index-link.yaml"))
        .expect("symlink");

    let orchestrator = fx.orchestrator(Arc::new(NoopBackend));
    orchestrator.trigger(&course, skip_all()).expect("trigger");
    let record = finished(orchestrator.run(&course).expect("run"));

    assert_eq!(record.status, UpdateStatus::Failed);
    assert!(record.log.contains("absolute symlink"), "log:\n{}", record.log);
}

#[test]
fn success_notifies_frontend_when_automatic() {
    let fx = Fixture::new();
    let mut course = CourseSource::new("c");
    course.remote_id = Some(3);
    course.update_automatically = true;
    write_course(&fx.build_dir("c"));

    let orchestrator = fx.orchestrator(Arc::new(NoopBackend));
    orchestrator.trigger(&course, skip_all()).expect("trigger");
    finished(orchestrator.run(&course).expect("run"));
    assert_eq!(*fx.notifier.notified.lock().expect("notified"), vec![(3, false)]);

    let mut quiet = skip_all();
    quiet.skip_notify = true;
    orchestrator.trigger(&course, quiet).expect("trigger");
    finished(orchestrator.run(&course).expect("run"));
    assert_eq!(fx.notifier.notified.lock().expect("notified").len(), 1);
}

#[test]
fn failsafes_disabled_builds_in_publish() {
    let fx = Fixture::new();
    let mut course = CourseSource::new("c");
    course.skip_build_failsafes = true;
    let publish = fx.settings.course_dir(Stage::Publish, &course.key);
    write_course(&publish);

    let orchestrator = fx.orchestrator(Arc::new(NoopBackend));
    orchestrator.trigger(&course, skip_all()).expect("trigger");
    let record = finished(orchestrator.run(&course).expect("run"));

    assert_eq!(record.status, UpdateStatus::Success, "log:\n{}", record.log);
    assert!(fx.settings.version_file(Stage::Publish, &course.key).is_file());
    assert!(fx.settings.defaults_file(Stage::Publish, &course.key).is_file());
    assert!(!fx.settings.course_dir(Stage::Store, &course.key).exists());
}

// ---------------------------------------------------------------------------
// Store and publish
// ---------------------------------------------------------------------------

fn build_and_store(fx: &Fixture, orchestrator: &Orchestrator, course: &CourseSource) -> VersionId {
    orchestrator.trigger(course, skip_all()).expect("trigger");
    let record = finished(orchestrator.run(course).expect("run"));
    assert_eq!(record.status, UpdateStatus::Success, "log:\n{}", record.log);
    VersionId::from(read(&fx.settings.version_file(Stage::Store, &course.key)))
}

#[test]
fn publish_moves_store_and_backfills() {
    let fx = Fixture::new();
    let course = CourseSource::new("c");
    write_course(&fx.build_dir("c"));
    let orchestrator = fx.orchestrator(Arc::new(NoopBackend));
    let version = build_and_store(&fx, &orchestrator, &course);
    let stored_defaults = read(&fx.settings.defaults_file(Stage::Store, &course.key));

    let errors = orchestrator
        .stages()
        .publish(&course.key, Stage::Store, &version)
        .expect("publish");
    assert!(errors.is_empty());

    let publish = fx.settings.course_dir(Stage::Publish, &course.key);
    assert!(publish.join("index.yaml").is_file());
    assert!(publish.join("_build/html/index.html").is_file());
    assert_eq!(
        read(&fx.settings.version_file(Stage::Publish, &course.key)),
        version.as_str()
    );
    assert_eq!(
        read(&fx.settings.defaults_file(Stage::Publish, &course.key)),
        stored_defaults
    );
    assert_eq!(
        *fx.downstream.calls.lock().expect("calls"),
        vec![(
            "http://grader.example.org/configure".to_string(),
            version.to_string()
        )]
    );

    fx.queue.flush_blocking();
    let store = fx.settings.course_dir(Stage::Store, &course.key);
    assert!(store.join("index.yaml").is_file());
    assert_eq!(
        read(&fx.settings.version_file(Stage::Store, &course.key)),
        version.as_str()
    );
    assert_eq!(
        read(&fx.settings.defaults_file(Stage::Store, &course.key)),
        stored_defaults
    );
}

#[test]
fn version_mismatch_leaves_publish_untouched() {
    let fx = Fixture::new();
    let course = CourseSource::new("c");
    write_course(&fx.build_dir("c"));
    let orchestrator = fx.orchestrator(Arc::new(NoopBackend));
    let first = build_and_store(&fx, &orchestrator, &course);
    orchestrator
        .stages()
        .publish(&course.key, Stage::Store, &first)
        .expect("publish");
    fx.queue.flush_blocking();

    std::fs::write(fx.build_dir("c").join("_build/html/index.html"), "<h1>v2</h1>")
        .expect("edit");
    let second = build_and_store(&fx, &orchestrator, &course);
    assert_ne!(first, second);

    let publish_index = fx
        .settings
        .course_dir(Stage::Publish, &course.key)
        .join("_build/html/index.html");
    let before = read(&publish_index);
    match orchestrator
        .stages()
        .publish(&course.key, Stage::Store, &first)
    {
        Err(SyncError::VersionMismatch { expected, found }) => {
            assert_eq!(expected, first.to_string());
            assert_eq!(found, second.to_string());
        }
        other => panic!("expected version mismatch, got {other:?}"),
    }
    assert_eq!(read(&publish_index), before);
    assert_eq!(
        read(&fx.settings.version_file(Stage::Publish, &course.key)),
        first.as_str()
    );

    orchestrator
        .stages()
        .publish(&course.key, Stage::Publish, &first)
        .expect("re-announce live version");
}

#[test]
fn publishing_from_build_is_rejected() {
    let fx = Fixture::new();
    let orchestrator = fx.orchestrator(Arc::new(NoopBackend));
    match orchestrator
        .stages()
        .publish(&CourseKey::from("c"), Stage::Build, &VersionId::generate())
    {
        Err(SyncError::PublishFromBuild) => {}
        other => panic!("expected rejection, got {other:?}"),
    }
}

#[test]
fn publish_without_store_reports_not_built() {
    let fx = Fixture::new();
    let orchestrator = fx.orchestrator(Arc::new(NoopBackend));
    match orchestrator
        .stages()
        .publish(&CourseKey::from("c"), Stage::Store, &VersionId::generate())
    {
        Err(SyncError::NotBuilt(key)) => assert_eq!(key, CourseKey::from("c")),
        other => panic!("expected not built, got {other:?}"),
    }
}
