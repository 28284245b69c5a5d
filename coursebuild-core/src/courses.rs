//! Per-course source configuration.
//!
//! One YAML file per course at `<home>/.coursebuild/courses/<key>.yaml`.
//! Files are written atomically with mode `0600`. Tests must use the `_at`
//! forms with a `TempDir` home.

use std::path::{Path, PathBuf};

use crate::error::{io_err, CoreError};
use crate::settings::{data_dir_at, home, write_private};
use crate::types::{CourseKey, CourseSource};

/// `<home>/.coursebuild/courses/`
pub fn courses_dir_at(home: &Path) -> PathBuf {
    data_dir_at(home).join("courses")
}

/// `<home>/.coursebuild/courses/<key>.yaml`: pure, no I/O.
pub fn course_path_at(home: &Path, key: &CourseKey) -> PathBuf {
    courses_dir_at(home).join(format!("{}.yaml", key.as_str()))
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Returns `CoreError::CourseNotFound` if absent and `CoreError::Parse` if
/// the YAML is malformed. The key stored in the file is overridden by the
/// file name.
pub fn load_course_at(home: &Path, key: &CourseKey) -> Result<CourseSource, CoreError> {
    if !key.is_valid() {
        return Err(CoreError::InvalidKey(key.to_string()));
    }
    let path = course_path_at(home, key);
    if !path.exists() {
        return Err(CoreError::CourseNotFound { path });
    }
    let mut course = read_course(&path)?;
    course.key = key.clone();
    Ok(course)
}

/// `load_course_at` convenience wrapper.
pub fn load_course(key: &CourseKey) -> Result<CourseSource, CoreError> {
    load_course_at(&home()?, key)
}

/// All registered courses, sorted by key.
pub fn list_courses_at(home: &Path) -> Result<Vec<CourseSource>, CoreError> {
    let dir = courses_dir_at(home);
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut entries: Vec<_> = std::fs::read_dir(&dir)
        .map_err(|e| io_err(&dir, e))?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .collect();
    entries.sort_by_key(|e| e.file_name());

    let mut courses = Vec::new();
    for entry in entries {
        let path = entry.path();
        let Some(stem) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_suffix(".yaml"))
        else {
            continue;
        };
        let mut course = read_course(&path)?;
        course.key = CourseKey::from(stem);
        courses.push(course);
    }
    Ok(courses)
}

/// `list_courses_at` convenience wrapper.
pub fn list_courses() -> Result<Vec<CourseSource>, CoreError> {
    list_courses_at(&home()?)
}

fn read_course(path: &Path) -> Result<CourseSource, CoreError> {
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    serde_yaml::from_str(&contents).map_err(|e| CoreError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

// ---------------------------------------------------------------------------
// Save
// ---------------------------------------------------------------------------

/// Write flow: serialize → `<key>.yaml.tmp` → `chmod 0600` → `rename`.
pub fn save_course_at(home: &Path, course: &CourseSource) -> Result<(), CoreError> {
    if !course.key.is_valid() {
        return Err(CoreError::InvalidKey(course.key.to_string()));
    }
    let yaml = serde_yaml::to_string(course)?;
    write_private(&course_path_at(home, &course.key), yaml.as_bytes())
}

/// `save_course_at` convenience wrapper.
pub fn save_course(course: &CourseSource) -> Result<(), CoreError> {
    save_course_at(&home()?, course)
}

/// Remove a course file. Ledger and stage trees are left alone.
pub fn remove_course_at(home: &Path, key: &CourseKey) -> Result<(), CoreError> {
    let path = course_path_at(home, key);
    if !path.exists() {
        return Err(CoreError::CourseNotFound { path });
    }
    std::fs::remove_file(&path).map_err(|e| io_err(&path, e))
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn course_path_is_correct() {
        let home = TempDir::new().expect("home");
        let path = course_path_at(home.path(), &CourseKey::from("prog1"));
        assert!(path.ends_with(".coursebuild/courses/prog1.yaml"));
    }

    #[test]
    fn save_sets_private_mode() {
        let home = TempDir::new().expect("home");
        let course = CourseSource::new("prog1");
        save_course_at(home.path(), &course).expect("save");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let path = course_path_at(home.path(), &course.key);
            let mode = std::fs::metadata(&path).expect("meta").permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
    }

    #[test]
    fn file_name_wins_over_stored_key() {
        let home = TempDir::new().expect("home");
        let dir = courses_dir_at(home.path());
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(dir.join("real.yaml"), "key: stale\ngit_branch: main\n").expect("write");

        let course = load_course_at(home.path(), &CourseKey::from("real")).expect("load");
        assert_eq!(course.key, CourseKey::from("real"));
        assert_eq!(course.git_branch, "main");
    }

    #[test]
    fn invalid_key_is_rejected_before_io() {
        let home = TempDir::new().expect("home");
        let err = load_course_at(home.path(), &CourseKey::from("../x")).unwrap_err();
        assert!(matches!(err, CoreError::InvalidKey(_)), "got: {err}");
    }
}
