//! Atomic renames.
//!
//! A displaced destination is parked in a unique sibling named after it and
//! only removed once the new content is in place. Batches are all-or-nothing:
//! a failure part-way through moves every finished pair back.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::background::{BackgroundQueue, Job};
use crate::error::{io_err, FsError};
use crate::tree::remove_path;

/// Rename `src` to `dst`, replacing whatever `dst` was.
///
/// With `keep_tmp`, the displaced destination is left at the returned path
/// instead of being deleted. `None` means nothing was displaced.
pub fn atomic_rename(src: &Path, dst: &Path, keep_tmp: bool) -> Result<Option<PathBuf>, FsError> {
    let dst_meta = fs::symlink_metadata(dst).ok();
    let src_is_file = fs::symlink_metadata(src)
        .map(|m| m.is_file())
        .unwrap_or(false);

    let direct = match &dst_meta {
        None => true,
        Some(meta) => meta.is_file() && src_is_file && !keep_tmp,
    };
    if direct {
        return fs::rename(src, dst)
            .map(|()| None)
            .map_err(|e| rename_failed(src, dst, e));
    }

    let dst_is_dir = dst_meta.map(|m| m.is_dir()).unwrap_or(false);
    let tmp = reserve_sibling(dst)?;
    if dst_is_dir {
        // A directory cannot replace the placeholder file.
        fs::remove_file(&tmp).map_err(|e| io_err(&tmp, e))?;
    }
    if let Err(e) = fs::rename(dst, &tmp) {
        let _ = fs::remove_file(&tmp);
        return Err(rename_failed(dst, &tmp, e));
    }

    if let Err(e) = fs::rename(src, dst) {
        if let Err(restore) = fs::rename(&tmp, dst) {
            tracing::error!(
                dst = %dst.display(),
                tmp = %tmp.display(),
                error = %restore,
                "failed to restore displaced destination"
            );
        }
        return Err(rename_failed(src, dst, e));
    }

    if keep_tmp {
        Ok(Some(tmp))
    } else {
        remove_path(&tmp)?;
        Ok(None)
    }
}

/// Rename every `(src, dst)` pair, or none of them.
///
/// Displaced destinations are handed to `queue` for deletion once the whole
/// batch has succeeded.
pub fn atomic_rename_all(
    pairs: &[(PathBuf, PathBuf)],
    queue: &BackgroundQueue,
) -> Result<(), FsError> {
    let mut done: Vec<(&Path, &Path, Option<PathBuf>)> = Vec::with_capacity(pairs.len());
    for (src, dst) in pairs {
        match atomic_rename(src, dst, true) {
            Ok(tmp) => done.push((src, dst, tmp)),
            Err(e) => {
                tracing::warn!(
                    src = %src.display(),
                    dst = %dst.display(),
                    error = %e,
                    rolled_back = done.len(),
                    "rename batch failed; rolling back"
                );
                roll_back(done);
                return Err(e);
            }
        }
    }

    let leftovers: Vec<PathBuf> = done.into_iter().filter_map(|(_, _, tmp)| tmp).collect();
    if !leftovers.is_empty() {
        queue.submit(Job::remove_paths(leftovers));
    }
    Ok(())
}

fn roll_back(done: Vec<(&Path, &Path, Option<PathBuf>)>) {
    for (src, dst, tmp) in done.into_iter().rev() {
        if let Err(e) = atomic_rename(dst, src, false) {
            tracing::error!(src = %src.display(), dst = %dst.display(), error = %e, "rollback failed");
            continue;
        }
        if let Some(tmp) = tmp {
            if let Err(e) = atomic_rename(&tmp, dst, false) {
                tracing::error!(tmp = %tmp.display(), dst = %dst.display(), error = %e, "restore failed");
            }
        }
    }
}

/// Create an empty placeholder file next to `path` whose name starts with
/// `path`'s name, and return its path.
fn reserve_sibling(path: &Path) -> Result<PathBuf, FsError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut prefix = path.file_name().unwrap_or_default().to_os_string();
    prefix.push(".");
    tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".old")
        .tempfile_in(dir)
        .map_err(|e| io_err(dir, e))?
        .into_temp_path()
        .keep()
        .map_err(|e| io_err(dir, e.error))
}

fn rename_failed(src: &Path, dst: &Path, source: io::Error) -> FsError {
    FsError::RenameFailed {
        src: src.to_path_buf(),
        dst: dst.to_path_buf(),
        source,
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
