//! The update ledger: per-course history of update attempts.
//!
//! [`FileLedger`] keeps one JSON document per course at
//! `<dir>/<key>.json`. Every operation holds an exclusive [`FileLock`] on
//! that file for its read-modify-write, and writes go through the usual
//! `.tmp` + rename.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use coursebuild_core::{CourseKey, UpdateRecord};
use coursebuild_fs::{FileLock, LockMode};

use crate::error::{io_err, SyncError};

/// Storage for update records. The orchestrator is the only writer of
/// existing records; triggers only append.
pub trait Ledger: Send + Sync {
    /// Store a new record, assigning it the next id for its course.
    fn append(&self, record: UpdateRecord) -> Result<UpdateRecord, SyncError>;

    /// Every record for `key`, oldest first.
    fn records(&self, key: &CourseKey) -> Result<Vec<UpdateRecord>, SyncError>;

    /// Replace the stored record with the same course and id.
    fn save(&self, record: &UpdateRecord) -> Result<(), SyncError>;

    /// Keep only the `keep` newest records for `key`. Returns how many were
    /// removed.
    fn prune(&self, key: &CourseKey, keep: usize) -> Result<usize, SyncError>;
}

/// Newest last: by request time, then id.
pub fn sort_records(records: &mut [UpdateRecord]) {
    records.sort_by(|a, b| {
        a.request_time
            .cmp(&b.request_time)
            .then_with(|| a.id.cmp(&b.id))
    });
}

// ---------------------------------------------------------------------------
// File-backed ledger
// ---------------------------------------------------------------------------

const LEDGER_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    next_id: u64,
    records: Vec<UpdateRecord>,
}

#[derive(Debug, Clone)]
pub struct FileLedger {
    dir: PathBuf,
}

impl FileLedger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<dir>/<key>.json`
    pub fn path_for(&self, key: &CourseKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.as_str()))
    }

    /// Courses with a ledger file, sorted.
    pub fn courses(&self) -> Result<Vec<CourseKey>, SyncError> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&self.dir).map_err(|e| io_err(&self.dir, e))?;
        let mut keys = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| io_err(&self.dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(CourseKey::from(stem));
            }
        }
        keys.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(keys)
    }

    /// Run `f` on the course's ledger under its lock, writing the result
    /// back when `f` reports a change.
    fn update<T>(
        &self,
        key: &CourseKey,
        f: impl FnOnce(&mut LedgerFile) -> Result<(T, bool), SyncError>,
    ) -> Result<T, SyncError> {
        let path = self.path_for(key);
        let _lock = FileLock::acquire(&path, LockMode::Exclusive, LEDGER_LOCK_TIMEOUT)?;
        let mut file = read_file(&path)?;
        let (value, changed) = f(&mut file)?;
        if changed {
            write_file(&path, &file)?;
        }
        Ok(value)
    }
}

fn read_file(path: &Path) -> Result<LedgerFile, SyncError> {
    if !path.exists() {
        return Ok(LedgerFile::default());
    }
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    if contents.trim().is_empty() {
        return Ok(LedgerFile::default());
    }
    serde_json::from_str(&contents).map_err(|source| SyncError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn write_file(path: &Path, file: &LedgerFile) -> Result<(), SyncError> {
    let json = serde_json::to_string_pretty(file).map_err(|source| SyncError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))
}

impl Ledger for FileLedger {
    fn append(&self, mut record: UpdateRecord) -> Result<UpdateRecord, SyncError> {
        let key = record.course.clone();
        self.update(&key, |file| {
            file.next_id = file
                .next_id
                .max(file.records.iter().map(|r| r.id).max().unwrap_or(0))
                + 1;
            record.id = file.next_id;
            file.records.push(record.clone());
            Ok((record, true))
        })
    }

    fn records(&self, key: &CourseKey) -> Result<Vec<UpdateRecord>, SyncError> {
        self.update(key, |file| {
            let mut records = file.records.clone();
            sort_records(&mut records);
            Ok((records, false))
        })
    }

    fn save(&self, record: &UpdateRecord) -> Result<(), SyncError> {
        self.update(&record.course, |file| {
            let slot = file
                .records
                .iter_mut()
                .find(|r| r.id == record.id)
                .ok_or_else(|| SyncError::UnknownRecord {
                    course: record.course.clone(),
                    id: record.id,
                })?;
            *slot = record.clone();
            Ok(((), true))
        })
    }

    fn prune(&self, key: &CourseKey, keep: usize) -> Result<usize, SyncError> {
        self.update(key, |file| {
            if file.records.len() <= keep {
                return Ok((0, false));
            }
            sort_records(&mut file.records);
            let removed = file.records.len() - keep;
            file.records.drain(..removed);
            Ok((removed, true))
        })
    }
}
