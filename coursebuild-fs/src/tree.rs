//! Tree mirroring and copy/remove helpers.
//!
//! [`sync_tree`] behaves like `rsync -crlH --delete src/ dst/`: files are
//! compared by SHA-256 content, symlinks are recreated with their raw
//! targets, hard links inside `src` stay hard links in `dst`, and anything in
//! `dst` that `src` lacks is deleted. Modes and mtimes are carried over.

use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{io_err, FsError};

// ---------------------------------------------------------------------------
// Removal
// ---------------------------------------------------------------------------

/// Remove a file, symlink or directory tree. Missing paths are fine.
pub fn remove_path(path: &Path) -> Result<(), FsError> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(io_err(path, e)),
    };
    let result = if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_err(path, e)),
    }
}

/// Empty `dir` except for `keep` (a path inside `dir`) and the directories
/// leading to it.
pub fn remove_except(dir: &Path, keep: &Path) -> Result<(), FsError> {
    if !dir.exists() {
        return Ok(());
    }
    let keep_parents: BTreeSet<&Path> = keep.ancestors().skip(1).collect();
    remove_except_inner(dir, keep, &keep_parents)
}

fn remove_except_inner(
    dir: &Path,
    keep: &Path,
    keep_parents: &BTreeSet<&Path>,
) -> Result<(), FsError> {
    for entry in fs::read_dir(dir).map_err(|e| io_err(dir, e))? {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        let path = entry.path();
        if path == keep {
            continue;
        }
        let is_real_dir = entry
            .file_type()
            .map(|t| t.is_dir())
            .map_err(|e| io_err(&path, e))?;
        if is_real_dir && keep_parents.contains(path.as_path()) {
            remove_except_inner(&path, keep, keep_parents)?;
        } else {
            remove_path(&path)?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Copying
// ---------------------------------------------------------------------------

/// Copy a single file's content, mode and mtime. Parent directories of `dst`
/// are created as needed.
pub fn copy_file(src: &Path, dst: &Path) -> Result<(), FsError> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    fs::copy(src, dst).map_err(|e| io_err(src, e))?;
    copy_times(src, dst)
}

/// Fresh copy of a whole tree, like `cp -a src dst`. `dst` must not exist.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<(), FsError> {
    if fs::symlink_metadata(dst).is_ok() {
        return Err(io_err(
            dst,
            io::Error::new(io::ErrorKind::AlreadyExists, "copy destination exists"),
        ));
    }
    sync_tree(src, dst).map(|_| ())
}

fn copy_times(src: &Path, dst: &Path) -> Result<(), FsError> {
    let meta = fs::metadata(src).map_err(|e| io_err(src, e))?;
    filetime::set_file_times(
        dst,
        FileTime::from_last_access_time(&meta),
        FileTime::from_last_modification_time(&meta),
    )
    .map_err(|e| io_err(dst, e))
}

// ---------------------------------------------------------------------------
// Mirroring
// ---------------------------------------------------------------------------

/// Mirror `src` into `dst` and return how many entries were created,
/// rewritten or deleted.
pub fn sync_tree(src: &Path, dst: &Path) -> Result<usize, FsError> {
    let src_meta = fs::metadata(src).map_err(|e| io_err(src, e))?;
    if !src_meta.is_dir() {
        return Err(io_err(
            src,
            io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
        ));
    }
    match fs::symlink_metadata(dst) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            remove_path(dst)?;
            fs::create_dir_all(dst).map_err(|e| io_err(dst, e))?;
        }
        Err(_) => fs::create_dir_all(dst).map_err(|e| io_err(dst, e))?,
    }

    let wanted = relative_entries(src)?;
    let mut changed = delete_extraneous(src, dst, &wanted)?;

    // First destination path seen for each multiply-linked source inode.
    let mut linked: HashMap<(u64, u64), PathBuf> = HashMap::new();

    for entry in WalkDir::new(src)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| FsError::Walk {
            path: src.to_path_buf(),
            source: e,
        })?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            if mirror_symlink(entry.path(), &target)? {
                changed += 1;
            }
        } else if file_type.is_dir() {
            if ensure_dir(&target)? {
                changed += 1;
            }
            let perms = entry.metadata().map_err(|e| walk_meta_err(src, e))?.permissions();
            fs::set_permissions(&target, perms).map_err(|e| io_err(&target, e))?;
        } else {
            let meta = entry.metadata().map_err(|e| walk_meta_err(src, e))?;
            if let Some(id) = link_id(&meta) {
                if let Some(first) = linked.get(&id) {
                    if mirror_hard_link(first, &target)? {
                        changed += 1;
                    }
                    continue;
                }
                linked.insert(id, target.clone());
            }
            if mirror_file(entry.path(), &target)? {
                changed += 1;
            }
        }
    }

    tracing::debug!(src = %src.display(), dst = %dst.display(), changed, "tree synced");
    Ok(changed)
}

fn walk_meta_err(root: &Path, e: walkdir::Error) -> FsError {
    FsError::Walk {
        path: root.to_path_buf(),
        source: e,
    }
}

/// Relative paths of every entry under `root`.
fn relative_entries(root: &Path) -> Result<BTreeSet<PathBuf>, FsError> {
    let mut entries = BTreeSet::new();
    for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| FsError::Walk {
            path: root.to_path_buf(),
            source: e,
        })?;
        if let Ok(rel) = entry.path().strip_prefix(root) {
            entries.insert(rel.to_path_buf());
        }
    }
    Ok(entries)
}

/// Delete entries of `dst` that `src` lacks, or whose kind differs.
fn delete_extraneous(
    src: &Path,
    dst: &Path,
    wanted: &BTreeSet<PathBuf>,
) -> Result<usize, FsError> {
    let mut deleted = 0;
    let mut walker = WalkDir::new(dst).min_depth(1).follow_links(false).into_iter();
    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| FsError::Walk {
            path: dst.to_path_buf(),
            source: e,
        })?;
        let rel = match entry.path().strip_prefix(dst) {
            Ok(rel) => rel.to_path_buf(),
            Err(_) => continue,
        };
        let keep = wanted.contains(&rel) && same_kind(&src.join(&rel), entry.file_type());
        if !keep {
            let is_dir = entry.file_type().is_dir();
            remove_path(entry.path())?;
            deleted += 1;
            if is_dir {
                walker.skip_current_dir();
            }
        }
    }
    Ok(deleted)
}

fn same_kind(src: &Path, dst_type: fs::FileType) -> bool {
    match fs::symlink_metadata(src) {
        Ok(meta) => {
            let t = meta.file_type();
            (t.is_dir() && dst_type.is_dir())
                || (t.is_symlink() && dst_type.is_symlink())
                || (t.is_file() && dst_type.is_file())
        }
        Err(_) => false,
    }
}

fn ensure_dir(target: &Path) -> Result<bool, FsError> {
    if target.is_dir() && !is_symlink(target) {
        return Ok(false);
    }
    remove_path(target)?;
    fs::create_dir_all(target).map_err(|e| io_err(target, e))?;
    Ok(true)
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|m| m.file_type().is_symlink())
        .unwrap_or(false)
}

fn mirror_symlink(src: &Path, target: &Path) -> Result<bool, FsError> {
    let link = fs::read_link(src).map_err(|e| io_err(src, e))?;
    if is_symlink(target) {
        if let Ok(existing) = fs::read_link(target) {
            if existing == link {
                return Ok(false);
            }
        }
    }
    remove_path(target)?;
    make_symlink(&link, target)?;
    Ok(true)
}

#[cfg(unix)]
fn make_symlink(link: &Path, target: &Path) -> Result<(), FsError> {
    std::os::unix::fs::symlink(link, target).map_err(|e| io_err(target, e))
}

#[cfg(not(unix))]
fn make_symlink(link: &Path, target: &Path) -> Result<(), FsError> {
    Err(io_err(
        target,
        io::Error::new(
            io::ErrorKind::Unsupported,
            format!("cannot recreate symlink to {}", link.display()),
        ),
    ))
}

/// Copy when content differs. Returns whether anything was written.
fn mirror_file(src: &Path, target: &Path) -> Result<bool, FsError> {
    let unchanged = match fs::symlink_metadata(target) {
        Ok(meta) if meta.is_file() => {
            let src_len = fs::metadata(src).map_err(|e| io_err(src, e))?.len();
            src_len == meta.len() && digest(src)? == digest(target)?
        }
        _ => false,
    };
    if unchanged {
        let perms = fs::metadata(src).map_err(|e| io_err(src, e))?.permissions();
        fs::set_permissions(target, perms).map_err(|e| io_err(target, e))?;
        copy_times(src, target)?;
        return Ok(false);
    }

    // Replace through a sibling so existing hard links to the old file keep
    // their content.
    let mut tmp_name = target.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".sync-tmp");
    let tmp = target.with_file_name(tmp_name);
    copy_file(src, &tmp)?;
    remove_path(target)?;
    fs::rename(&tmp, target).map_err(|e| io_err(target, e))?;
    Ok(true)
}

fn mirror_hard_link(first: &Path, target: &Path) -> Result<bool, FsError> {
    if let (Ok(a), Ok(b)) = (fs::symlink_metadata(first), fs::symlink_metadata(target)) {
        if link_id(&a).is_some() && link_id(&a) == inode(&b) {
            return Ok(false);
        }
    }
    remove_path(target)?;
    fs::hard_link(first, target).map_err(|e| io_err(target, e))?;
    Ok(true)
}

fn digest(path: &Path) -> Result<String, FsError> {
    let mut file = fs::File::open(path).map_err(|e| io_err(path, e))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(|e| io_err(path, e))?;
    Ok(hex::encode(hasher.finalize()))
}

/// `(dev, ino)` for files with more than one link.
#[cfg(unix)]
fn link_id(meta: &fs::Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    (meta.nlink() > 1).then(|| (meta.dev(), meta.ino()))
}

#[cfg(unix)]
fn inode(meta: &fs::Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn link_id(_meta: &fs::Metadata) -> Option<(u64, u64)> {
    None
}

#[cfg(not(unix))]
fn inode(_meta: &fs::Metadata) -> Option<(u64, u64)> {
    None
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, contents).expect("write");
    }

    #[test]
    fn sync_copies_then_reports_nothing_changed() {
        let dir = TempDir::new().expect("dir");
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        write(&src.join("a.txt"), "a");
        write(&src.join("sub/b.txt"), "b");

        let first = sync_tree(&src, &dst).expect("sync");
        assert!(first >= 3);
        assert_eq!(fs::read_to_string(dst.join("sub/b.txt")).expect("read"), "b");

        let second = sync_tree(&src, &dst).expect("sync");
        assert_eq!(second, 0);
    }

    #[test]
    fn sync_deletes_extraneous_and_rewrites_changed() {
        let dir = TempDir::new().expect("dir");
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        write(&src.join("keep.txt"), "new");
        write(&dst.join("keep.txt"), "old");
        write(&dst.join("stale/deep.txt"), "x");

        let changed = sync_tree(&src, &dst).expect("sync");
        assert_eq!(changed, 2);
        assert!(!dst.join("stale").exists());
        assert_eq!(fs::read_to_string(dst.join("keep.txt")).expect("read"), "new");
    }

    #[cfg(unix)]
    #[test]
    fn sync_preserves_symlinks_and_hard_links() {
        use std::os::unix::fs::MetadataExt;

        let dir = TempDir::new().expect("dir");
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        write(&src.join("data/file.txt"), "payload");
        std::os::unix::fs::symlink("data/file.txt", src.join("link")).expect("symlink");
        fs::hard_link(src.join("data/file.txt"), src.join("hard.txt")).expect("hard link");

        sync_tree(&src, &dst).expect("sync");

        assert_eq!(
            fs::read_link(dst.join("link")).expect("readlink"),
            PathBuf::from("data/file.txt")
        );
        let a = fs::metadata(dst.join("data/file.txt")).expect("meta");
        let b = fs::metadata(dst.join("hard.txt")).expect("meta");
        assert_eq!(a.ino(), b.ino());
    }

    #[test]
    fn copy_tree_refuses_existing_destination() {
        let dir = TempDir::new().expect("dir");
        let src = dir.path().join("src");
        write(&src.join("a"), "a");
        let dst = dir.path().join("dst");
        copy_tree(&src, &dst).expect("copy");
        assert!(copy_tree(&src, &dst).is_err());
    }

    #[test]
    fn remove_except_keeps_nested_subtree() {
        let dir = TempDir::new().expect("dir");
        let root = dir.path().join("course");
        write(&root.join("index.yaml"), "x");
        write(&root.join("_build/html/index.html"), "x");
        write(&root.join("_build/other.txt"), "x");
        write(&root.join("exercises/a.yaml"), "x");

        remove_except(&root, &root.join("_build/html")).expect("remove");

        assert!(root.join("_build/html/index.html").exists());
        assert!(!root.join("_build/other.txt").exists());
        assert!(!root.join("index.yaml").exists());
        assert!(!root.join("exercises").exists());
    }

    #[test]
    fn copy_file_keeps_mtime() {
        let dir = TempDir::new().expect("dir");
        let src = dir.path().join("a");
        write(&src, "a");
        let past = FileTime::from_unix_time(1_600_000_000, 0);
        filetime::set_file_mtime(&src, past).expect("mtime");

        let dst = dir.path().join("nested/b");
        copy_file(&src, &dst).expect("copy");
        let meta = fs::metadata(&dst).expect("meta");
        assert_eq!(FileTime::from_last_modification_time(&meta), past);
    }

    #[test]
    fn remove_path_tolerates_missing() {
        let dir = TempDir::new().expect("dir");
        remove_path(&dir.path().join("nothing")).expect("missing is fine");
    }
}
