//! Promotion of built material BUILD → STORE → PUBLISH.
//!
//! STORE and PUBLISH are each guarded by a shared/exclusive [`FileLock`] on
//! the course directory. Publishing moves the three STORE artifacts (course
//! tree, defaults, version) into PUBLISH as one all-or-nothing rename batch,
//! then repopulates STORE from PUBLISH in the background.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use coursebuild_config::{exercise_defaults, referenced_files, ConfigCache, CourseConfig};
use coursebuild_core::{CourseKey, Settings, Stage, VersionId};
use coursebuild_fs::{
    atomic_rename_all, copy_file, remove_except, sync_tree, BackgroundQueue, FileLock, Job,
    LockMode,
};

use crate::error::{io_err, SyncError};
use crate::log::BuildLog;
use crate::notify::Downstream;

/// The artifacts of one course in one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePaths {
    /// `<root>/<key>/`
    pub dir: PathBuf,
    /// `<root>/<key>.defaults.json`
    pub defaults: PathBuf,
    /// `<root>/<key>.version`
    pub version: PathBuf,
}

impl StagePaths {
    pub fn new(settings: &Settings, stage: Stage, key: &CourseKey) -> Self {
        Self {
            dir: settings.course_dir(stage, key),
            defaults: settings.defaults_file(stage, key),
            version: settings.version_file(stage, key),
        }
    }

    fn pairs_into(&self, other: &StagePaths) -> Vec<(PathBuf, PathBuf)> {
        vec![
            (self.dir.clone(), other.dir.clone()),
            (self.defaults.clone(), other.defaults.clone()),
            (self.version.clone(), other.version.clone()),
        ]
    }
}

pub struct StorePublishPipeline {
    settings: Arc<Settings>,
    cache: Arc<ConfigCache>,
    queue: BackgroundQueue,
    downstream: Arc<dyn Downstream>,
}

impl StorePublishPipeline {
    pub fn new(
        settings: Arc<Settings>,
        cache: Arc<ConfigCache>,
        queue: BackgroundQueue,
        downstream: Arc<dyn Downstream>,
    ) -> Self {
        Self {
            settings,
            cache,
            queue,
            downstream,
        }
    }

    pub fn paths(&self, stage: Stage, key: &CourseKey) -> StagePaths {
        StagePaths::new(&self.settings, stage, key)
    }

    // -----------------------------------------------------------------------
    // Store
    // -----------------------------------------------------------------------

    /// Copy a validated BUILD into STORE.
    ///
    /// A lock timeout is raised; every other failure is logged and reported
    /// as `Ok(false)`.
    pub fn store(&self, config: &CourseConfig, log: &mut BuildLog) -> Result<bool, SyncError> {
        let key = &config.key;
        let Some(version) = config.version_id.clone() else {
            log.error("The build has no version id; refusing to store it");
            return Ok(false);
        };
        let defaults = exercise_defaults(config);
        let store = self.paths(Stage::Store, key);

        let _lock = FileLock::acquire(
            &store.dir,
            LockMode::Exclusive,
            self.settings.build_lock_timeout(),
        )?;
        match self.store_locked(config, &store, &version, &defaults, log) {
            Ok(()) => Ok(true),
            Err(e) => {
                log.error(format!("Storing failed: {e}"));
                Ok(false)
            }
        }
    }

    fn store_locked(
        &self,
        config: &CourseConfig,
        store: &StagePaths,
        version: &VersionId,
        defaults: &serde_json::Map<String, serde_json::Value>,
        log: &mut BuildLog,
    ) -> Result<(), SyncError> {
        let build_dir = &config.dir;
        match &config.data.static_dir {
            Some(static_dir) => {
                let build_static = build_dir.join(static_dir);
                if !build_static.is_dir() {
                    return Err(SyncError::Build(format!(
                        "Static directory '{}' does not exist",
                        static_dir.display()
                    )));
                }
                let store_static = store.dir.join(static_dir);
                remove_except(&store.dir, &store_static)?;
                let changed = sync_tree(&build_static, &store_static)?;
                log.info(format!(
                    "Rsync: {changed} files in {} changed",
                    static_dir.display()
                ));
            }
            // Without a static dir the whole course tree is served.
            None => {
                let changed = sync_tree(build_dir, &store.dir)?;
                log.info(format!("Rsync: {changed} files changed"));
            }
        }
        std::fs::create_dir_all(&store.dir).map_err(|e| io_err(&store.dir, e))?;

        let mut files = vec![config.index_name().to_path_buf()];
        files.extend(referenced_files(config));
        for file in files {
            let src = build_dir.join(&file);
            if !src.is_file() {
                log.warn(format!("Couldn't find file '{}'", file.display()));
                continue;
            }
            copy_file(&src, &store.dir.join(&file))?;
        }

        let json = serde_json::to_string(defaults).map_err(|source| SyncError::Json {
            path: store.defaults.clone(),
            source,
        })?;
        write_replacing(&store.defaults, json.as_bytes())?;
        write_replacing(&store.version, version.as_str().as_bytes())?;

        self.cache.refresh(Stage::Store, &config.key)?;
        Ok(())
    }

    /// Write the defaults artifact next to a tree built in place (the
    /// skip-failsafes mode, which never stores).
    pub fn write_defaults(&self, stage: Stage, config: &CourseConfig) -> Result<(), SyncError> {
        let path = self.paths(stage, &config.key).defaults;
        let json = serde_json::to_string(&exercise_defaults(config)).map_err(|source| {
            SyncError::Json {
                path: path.clone(),
                source,
            }
        })?;
        write_replacing(&path, json.as_bytes())
    }

    // -----------------------------------------------------------------------
    // Publish
    // -----------------------------------------------------------------------

    /// Make `expected` the served version of `key`.
    ///
    /// From STORE the artifacts are moved into PUBLISH; from PUBLISH the live
    /// version is only re-checked. Downstream consumers are then told to
    /// adopt the version; their failures are returned, not raised.
    pub fn publish(
        &self,
        key: &CourseKey,
        source: Stage,
        expected: &VersionId,
    ) -> Result<Vec<String>, SyncError> {
        let config = match source {
            Stage::Build => return Err(SyncError::PublishFromBuild),
            Stage::Store => self.promote(key, expected)?,
            Stage::Publish => {
                let publish = self.paths(Stage::Publish, key);
                let _lock = FileLock::acquire(
                    &publish.dir,
                    LockMode::Shared,
                    self.settings.publish_lock_timeout(),
                )?;
                let config = self
                    .cache
                    .load(Stage::Publish, key)?
                    .ok_or_else(|| SyncError::NotBuilt(key.clone()))?;
                check_version(&config, expected)?;
                config
            }
        };

        let mut errors = Vec::new();
        for consumer in &config.data.configures {
            if let Err(e) = self.downstream.publish(&consumer.url, key, expected) {
                tracing::warn!(course = %key, url = %consumer.url, error = %e, "downstream publish failed");
                errors.push(format!("{}: {e}", consumer.url));
            }
        }
        Ok(errors)
    }

    fn promote(&self, key: &CourseKey, expected: &VersionId) -> Result<Arc<CourseConfig>, SyncError> {
        let store = self.paths(Stage::Store, key);
        let publish = self.paths(Stage::Publish, key);
        let timeout = self.settings.publish_lock_timeout();

        let store_lock = FileLock::acquire(&store.dir, LockMode::Shared, timeout)?;
        let config = self
            .cache
            .load(Stage::Store, key)?
            .ok_or_else(|| SyncError::NotBuilt(key.clone()))?;
        check_version(&config, expected)?;

        let publish_lock = FileLock::acquire(&publish.dir, LockMode::Exclusive, timeout)?;
        atomic_rename_all(&store.pairs_into(&publish), &self.queue)?;
        self.cache.invalidate(Stage::Store, key);
        let published = self
            .cache
            .refresh(Stage::Publish, key)?
            .ok_or_else(|| SyncError::NotBuilt(key.clone()))?;
        drop(publish_lock);
        drop(store_lock);

        tracing::info!(course = %key, version = %expected, "published from store");
        self.queue.submit(backfill_job(
            key.clone(),
            publish,
            store,
            self.settings.build_lock_timeout(),
        ));
        Ok(published)
    }
}

fn check_version(config: &CourseConfig, expected: &VersionId) -> Result<(), SyncError> {
    match &config.version_id {
        Some(found) if found == expected => Ok(()),
        found => Err(SyncError::VersionMismatch {
            expected: expected.to_string(),
            found: found
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "none".to_string()),
        }),
    }
}

/// Copy PUBLISH back into STORE so the next store has a baseline to sync the
/// static directory against. Skipped when STORE has been written again in
/// the meantime.
fn backfill_job(
    key: CourseKey,
    publish: StagePaths,
    store: StagePaths,
    timeout: std::time::Duration,
) -> Job {
    Job::new(format!("backfill store for {key}"), move || {
        let _store_lock = FileLock::acquire(&store.dir, LockMode::Exclusive, timeout)?;
        let _publish_lock = FileLock::acquire(&publish.dir, LockMode::Shared, timeout)?;
        if store.version.exists() {
            tracing::info!(course = %key, "store was rewritten since publish; backfill skipped");
            return Ok(());
        }
        sync_tree(&publish.dir, &store.dir)?;
        for (src, dst) in [
            (&publish.defaults, &store.defaults),
            (&publish.version, &store.version),
        ] {
            if src.exists() {
                copy_file(src, dst)?;
            }
        }
        tracing::debug!(course = %key, "store backfilled from publish");
        Ok(())
    })
}

/// Write `bytes` to a temporary sibling and rename it over `path`.
pub(crate) fn write_replacing(path: &Path, bytes: &[u8]) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))
}
