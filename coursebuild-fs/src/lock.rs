//! Advisory locks guarding stage trees.
//!
//! A lock on `path` is an `flock` on the sibling file `<path>.lock`. Only the
//! OS-level lock is authoritative; the lock file itself may be deleted at any
//! time. On release the holder deletes the file only after upgrading to an
//! exclusive lock, and every acquirer re-checks that the inode it locked is
//! still the one at `<path>.lock`, so a concurrent deletion can never let two
//! writers in.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::{io_err, FsError};

/// Delay between non-blocking lock attempts.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Any number of readers.
    Shared,
    /// A single writer.
    Exclusive,
}

/// A held lock. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    lock_path: PathBuf,
    mode: LockMode,
}

impl FileLock {
    /// `<path>.lock`
    pub fn lock_path_for(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Poll for the lock every [`POLL_INTERVAL`] until `timeout` elapses.
    pub fn acquire(path: &Path, mode: LockMode, timeout: Duration) -> Result<Self, FsError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(lock) = Self::try_acquire(path, mode)? {
                return Ok(lock);
            }
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(path = %path.display(), ?mode, "lock timeout");
                return Err(FsError::LockTimeout {
                    path: path.to_path_buf(),
                    timeout,
                });
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }

    /// One attempt; `None` when another holder conflicts.
    pub fn try_acquire(path: &Path, mode: LockMode) -> Result<Option<Self>, FsError> {
        let lock_path = Self::lock_path_for(path);
        if let Some(parent) = lock_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            }
        }
        loop {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&lock_path)
                .map_err(|e| io_err(&lock_path, e))?;

            match try_flock(&file, mode) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) => return Err(io_err(&lock_path, e)),
            }

            // The previous holder may have unlinked the file between our open
            // and our flock; that inode no longer guards anything.
            if is_current(&file, &lock_path).map_err(|e| io_err(&lock_path, e))? {
                tracing::trace!(path = %lock_path.display(), ?mode, "lock acquired");
                return Ok(Some(FileLock {
                    file,
                    lock_path,
                    mode,
                }));
            }
        }
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        // Delete only while nobody else holds the inode.
        if try_flock(&self.file, LockMode::Exclusive).is_ok() {
            if let Err(e) = std::fs::remove_file(&self.lock_path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::debug!(path = %self.lock_path.display(), error = %e, "lock file not removed");
                }
            }
        }
        if let Err(e) = unlock(&self.file) {
            tracing::debug!(path = %self.lock_path.display(), error = %e, "unlock failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn try_flock(file: &File, mode: LockMode) -> io::Result<()> {
    use rustix::fs::{flock, FlockOperation};
    use std::os::unix::io::AsFd;

    let operation = match mode {
        LockMode::Shared => FlockOperation::NonBlockingLockShared,
        LockMode::Exclusive => FlockOperation::NonBlockingLockExclusive,
    };
    flock(file.as_fd(), operation).map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(unix)]
fn unlock(file: &File) -> io::Result<()> {
    use rustix::fs::{flock, FlockOperation};
    use std::os::unix::io::AsFd;

    flock(file.as_fd(), FlockOperation::Unlock)
        .map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(unix)]
fn is_current(file: &File, lock_path: &Path) -> io::Result<bool> {
    use std::os::unix::fs::MetadataExt;

    let held = file.metadata()?;
    match std::fs::metadata(lock_path) {
        Ok(live) => Ok(live.dev() == held.dev() && live.ino() == held.ino()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(not(unix))]
fn try_flock(_file: &File, _mode: LockMode) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "advisory locks require a unix platform",
    ))
}

#[cfg(not(unix))]
fn unlock(_file: &File) -> io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn is_current(_file: &File, _lock_path: &Path) -> io::Result<bool> {
    Ok(true)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
