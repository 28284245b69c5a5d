//! Self-containment check for built course trees.
//!
//! A tree is self-contained when it can be moved elsewhere without breaking:
//! no entry resolves outside the root, and no symlink has an absolute target.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{io_err, FsError};

/// Walk `root` without following symlinks and return the first violation.
pub fn check_self_contained(root: &Path) -> Result<(), FsError> {
    let real_root = fs::canonicalize(root).map_err(|e| io_err(root, e))?;

    for entry in WalkDir::new(root).min_depth(1).follow_links(false) {
        let entry = entry.map_err(|e| FsError::Walk {
            path: root.to_path_buf(),
            source: e,
        })?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        let path = entry.path();

        let resolved = resolve(path).map_err(|e| io_err(path, e))?;
        if !resolved.starts_with(&real_root) {
            return Err(FsError::Containment {
                path: path.to_path_buf(),
                reason: "links to a path outside the course directory".to_string(),
            });
        }

        if file_type.is_symlink() {
            let target = fs::read_link(path).map_err(|e| io_err(path, e))?;
            if target.is_absolute() {
                return Err(FsError::Containment {
                    path: path.to_path_buf(),
                    reason: format!(
                        "is an absolute symlink to {}: this will break the course",
                        target.display()
                    ),
                });
            }
        }
    }
    Ok(())
}

/// Real path of `path`. Dangling symlinks are resolved lexically from their
/// parent's real path.
fn resolve(path: &Path) -> io::Result<PathBuf> {
    match fs::canonicalize(path) {
        Ok(real) => Ok(real),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let parent = path.parent().unwrap_or(Path::new("."));
            let real_parent = fs::canonicalize(parent)?;
            let target = fs::read_link(path)?;
            Ok(normalize(&real_parent.join(target)))
        }
        Err(e) => Err(e),
    }
}

fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn course(dir: &TempDir) -> PathBuf {
        let root = dir.path().join("course");
        fs::create_dir_all(root.join("exercises/week1")).expect("mkdir");
        fs::write(root.join("index.yaml"), "name: c").expect("write");
        fs::write(root.join("exercises/week1/config.yaml"), "title: t").expect("write");
        root
    }

    #[test]
    fn accepts_nested_tree_with_relative_links() {
        let dir = TempDir::new().expect("dir");
        let root = course(&dir);
        symlink("../index.yaml", root.join("exercises/index-link.yaml")).expect("symlink");
        symlink("exercises/week1", root.join("current")).expect("symlink");
        check_self_contained(&root).expect("contained");
    }

    #[test]
    fn rejects_absolute_symlink_even_inside_root() {
        let dir = TempDir::new().expect("dir");
        let root = course(&dir);
        let absolute = fs::canonicalize(root.join("index.yaml")).expect("canonical");
        symlink(&absolute, root.join("abs.yaml")).expect("symlink");

        match check_self_contained(&root) {
            Err(FsError::Containment { path, reason }) => {
                assert!(path.ends_with("abs.yaml"));
                assert!(reason.contains("absolute"));
            }
            other => panic!("expected containment violation, got {other:?}"),
        }
    }

    #[test]
    fn rejects_directory_link_escaping_root() {
        let dir = TempDir::new().expect("dir");
        let root = course(&dir);
        fs::create_dir_all(dir.path().join("secrets")).expect("mkdir");
        fs::write(dir.path().join("secrets/key"), "k").expect("write");
        symlink("../secrets", root.join("exercises/shared")).expect("symlink");

        match check_self_contained(&root) {
            Err(FsError::Containment { path, reason }) => {
                assert!(path.ends_with("shared"));
                assert!(reason.contains("outside"));
            }
            other => panic!("expected containment violation, got {other:?}"),
        }
    }

    #[test]
    fn rejects_dangling_link_pointing_outside() {
        let dir = TempDir::new().expect("dir");
        let root = course(&dir);
        symlink("../../nowhere", root.join("exercises/ghost")).expect("symlink");
        assert!(matches!(
            check_self_contained(&root),
            Err(FsError::Containment { .. })
        ));
    }
}
