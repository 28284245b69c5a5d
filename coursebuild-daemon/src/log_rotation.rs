//! Size-based rotation of the daemon's stdout/stderr logs.
//!
//! `daemon.log` → `daemon.log.1` → … → `daemon.log.<keep>`; the oldest copy
//! is dropped.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Rotation thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub max_bytes: u64,
    pub keep: usize,
}

impl Default for RotationPolicy {
    /// 10 MiB, five rotated copies.
    fn default() -> Self {
        Self {
            max_bytes: 10 * 1024 * 1024,
            keep: 5,
        }
    }
}

impl RotationPolicy {
    /// Rotate `log` when it has reached `max_bytes`. A missing file is not
    /// an error. Returns whether a rotation happened.
    pub fn rotate(&self, log: &Path) -> io::Result<bool> {
        let size = match fs::metadata(log) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        };
        if size < self.max_bytes || self.keep == 0 {
            return Ok(false);
        }

        match fs::remove_file(rotated(log, self.keep)) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        for n in (1..self.keep).rev() {
            let from = rotated(log, n);
            if from.exists() {
                fs::rename(&from, rotated(log, n + 1))?;
            }
        }
        fs::rename(log, rotated(log, 1))?;
        fs::File::create(log)?;
        Ok(true)
    }
}

/// Rotate both daemon logs under `home`. Failures are logged per file.
pub fn rotate_logs(home: &Path) {
    let policy = RotationPolicy::default();
    for log in [
        crate::paths::stdout_log_path(home),
        crate::paths::stderr_log_path(home),
    ] {
        match policy.rotate(&log) {
            Ok(true) => tracing::info!(path = %log.display(), "log file rotated"),
            Ok(false) => {}
            Err(err) => tracing::warn!(path = %log.display(), error = %err, "log rotation failed"),
        }
    }
}

/// `<log>.<n>`
fn rotated(log: &Path, n: usize) -> PathBuf {
    let mut name = log.as_os_str().to_os_string();
    name.push(format!(".{n}"));
    PathBuf::from(name)
}
