//! A loaded course: the parsed tree plus everything needed to tell whether it
//! is still current.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use coursebuild_core::{CourseKey, VersionId};

use crate::error::{io_err, ConfigError};
use crate::exercise::mtime_of;
use crate::model::{CourseData, Item, PostprocessContext};
use crate::parser::{find_index, parse_course, parse_file};
use crate::validate::validate;

#[derive(Debug, Clone)]
pub struct CourseConfig {
    pub key: CourseKey,
    /// Course directory the tree was loaded from.
    pub dir: PathBuf,
    /// Index file inside `dir`.
    pub file: PathBuf,
    pub data: CourseData,
    /// Contents of the stage's version file, if it has one.
    pub version_id: Option<VersionId>,
    /// Latest mtime across every tracked file.
    pub mtime: SystemTime,
    pub ptime: SystemTime,
    /// Exercise configs and their includes, as absolute paths.
    exercise_files: Vec<PathBuf>,
    tracked: Vec<Tracked>,
}

/// A file whose mtime decides validity. `None` records that the file was
/// absent; it turning up later invalidates the entry too.
#[derive(Debug, Clone, PartialEq)]
struct Tracked {
    path: PathBuf,
    mtime: Option<SystemTime>,
}

impl CourseConfig {
    /// Parse and validate the course in `dir`. `version_file` is read if
    /// present.
    pub fn load(key: &CourseKey, dir: &Path, version_file: &Path) -> Result<Self, ConfigError> {
        let file = find_index(dir)?;
        let (index_mtime, value) = parse_file(&file)?;
        let mut data = parse_course(value, &file)?;
        let ctx = PostprocessContext {
            course_dir: dir.to_path_buf(),
            default_lang: data.default_lang().to_string(),
        };
        data.postprocess(&ctx)?;
        validate(&mut data, &file)?;

        let mut tracked = vec![Tracked {
            path: file.clone(),
            mtime: Some(index_mtime),
        }];
        let mut exercise_files = Vec::new();
        for item in data.exercises() {
            if let Some(loaded) = item.exercise().and_then(|e| e.loaded.as_ref()) {
                for (path, mtime) in &loaded.sources {
                    exercise_files.push(path.clone());
                    tracked.push(Tracked {
                        path: path.clone(),
                        mtime: Some(*mtime),
                    });
                }
            }
        }
        let (version_mtime, version_id) = read_version(version_file)?;
        tracked.push(Tracked {
            path: version_file.to_path_buf(),
            mtime: version_mtime,
        });

        let mtime = tracked
            .iter()
            .filter_map(|t| t.mtime)
            .max()
            .unwrap_or(index_mtime);

        let config = Self {
            key: key.clone(),
            dir: dir.to_path_buf(),
            file,
            data,
            version_id,
            mtime,
            ptime: next_ptime(mtime),
            exercise_files,
            tracked,
        };
        for warning in config.warnings() {
            tracing::warn!(course = %key, "{warning}");
        }
        Ok(config)
    }

    /// True while every tracked file still has the mtime recorded at parse
    /// time.
    pub fn is_fresh(&self) -> bool {
        self.tracked.iter().all(|t| current_mtime(&t.path) == t.mtime)
    }

    /// Every warning in the tree, prefixed with the module or item it
    /// belongs to.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        for module in &self.data.modules {
            out.extend(
                module
                    .warnings
                    .iter()
                    .map(|w| format!("module '{}': {w}", module.key)),
            );
        }
        for item in self.data.items() {
            out.extend(item_warnings(item));
        }
        out
    }

    /// Index file path relative to the course directory.
    pub fn index_name(&self) -> &Path {
        self.file.strip_prefix(&self.dir).unwrap_or(&self.file)
    }

    /// Exercise configs and includes inside the course directory, relative
    /// to it.
    pub fn exercise_files(&self) -> impl Iterator<Item = &Path> {
        self.exercise_files
            .iter()
            .filter_map(|p| p.strip_prefix(&self.dir).ok())
    }
}

fn item_warnings(item: &Item) -> impl Iterator<Item = String> + '_ {
    item.warnings
        .iter()
        .map(move |w| format!("item '{}': {w}", item.key))
}

fn current_mtime(path: &Path) -> Option<SystemTime> {
    mtime_of(path).ok()
}

fn read_version(path: &Path) -> Result<(Option<SystemTime>, Option<VersionId>), ConfigError> {
    if !path.is_file() {
        return Ok((None, None));
    }
    let mtime = mtime_of(path)?;
    let raw = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    let version = VersionId::from(raw.as_str());
    if version.as_str().is_empty() {
        return Ok((Some(mtime), None));
    }
    Ok((Some(mtime), Some(version)))
}

static LAST_PTIME_NANOS: AtomicU64 = AtomicU64::new(0);

/// Parse time for a tree whose content time is `mtime`: never earlier than
/// `mtime`, and strictly later than any parse time handed out before.
pub(crate) fn next_ptime(mtime: SystemTime) -> SystemTime {
    let nanos = |t: SystemTime| {
        t.duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    };
    let floor = nanos(SystemTime::now()).max(nanos(mtime));
    let previous = LAST_PTIME_NANOS
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(floor.max(last.saturating_add(1)))
        })
        .unwrap_or(floor);
    UNIX_EPOCH + Duration::from_nanos(floor.max(previous.saturating_add(1)))
}
