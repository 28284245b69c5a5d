//! Process-wide cache of loaded courses, one entry per (stage, course).
//!
//! Entries are `Arc`s and are only ever replaced whole, so a reader holding
//! an entry keeps a consistent tree even while a newer one is being parsed.

use std::path::PathBuf;
use std::sync::Arc;

use coursebuild_core::{CourseKey, Settings, Stage};
use dashmap::DashMap;

use crate::course::CourseConfig;
use crate::error::ConfigError;

pub struct ConfigCache {
    roots: [PathBuf; 3],
    entries: DashMap<(Stage, CourseKey), Arc<CourseConfig>>,
}

impl ConfigCache {
    pub fn new(settings: &Settings) -> Self {
        Self {
            roots: Stage::all().map(|stage| settings.stage_root(stage).to_path_buf()),
            entries: DashMap::new(),
        }
    }

    fn root(&self, stage: Stage) -> &PathBuf {
        match stage {
            Stage::Build => &self.roots[0],
            Stage::Store => &self.roots[1],
            Stage::Publish => &self.roots[2],
        }
    }

    /// `<root>/<key>/`
    pub fn course_dir(&self, stage: Stage, key: &CourseKey) -> PathBuf {
        self.root(stage).join(key.as_str())
    }

    /// `<root>/<key>.version`
    pub fn version_file(&self, stage: Stage, key: &CourseKey) -> PathBuf {
        self.root(stage).join(format!("{}.version", key.as_str()))
    }

    /// The course as it currently is on disk in `stage`.
    ///
    /// Reuses the cached entry while it is fresh. Returns `None` when the
    /// stage has no directory for the course.
    pub fn load(
        &self,
        stage: Stage,
        key: &CourseKey,
    ) -> Result<Option<Arc<CourseConfig>>, ConfigError> {
        let cache_key = (stage, key.clone());
        if let Some(entry) = self.entries.get(&cache_key) {
            if entry.is_fresh() {
                return Ok(Some(Arc::clone(entry.value())));
            }
        }
        self.refresh(stage, key)
    }

    /// Reparse unconditionally and replace the entry.
    pub fn refresh(
        &self,
        stage: Stage,
        key: &CourseKey,
    ) -> Result<Option<Arc<CourseConfig>>, ConfigError> {
        let cache_key = (stage, key.clone());
        let dir = self.course_dir(stage, key);
        if !dir.is_dir() {
            self.entries.remove(&cache_key);
            return Ok(None);
        }
        tracing::debug!(course = %key, stage = %stage, "parsing course configuration");
        let config = match CourseConfig::load(key, &dir, &self.version_file(stage, key)) {
            Ok(config) => Arc::new(config),
            Err(e) => {
                self.entries.remove(&cache_key);
                return Err(e);
            }
        };
        self.entries.insert(cache_key, Arc::clone(&config));
        Ok(Some(config))
    }

    pub fn invalidate(&self, stage: Stage, key: &CourseKey) {
        self.entries.remove(&(stage, key.clone()));
    }
}
