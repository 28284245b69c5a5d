//! Artifacts derived from a loaded course for the store step.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde_json::{Map, Value};

use crate::course::CourseConfig;
use crate::exercise::strip_root;
use crate::meta::META_FILE;
use crate::model::Exercise;

/// Grading fields copied from exercise configs into the defaults artifact.
const GRADING_FIELDS: [&str; 7] = [
    "max_points",
    "max_submissions",
    "points_to_pass",
    "difficulty",
    "min_group_size",
    "max_group_size",
    "confirm_the_level",
];

/// Exercise key → default grading configuration, taken from the exercise's
/// config file in the course's default language and overridden by values
/// given in the index.
pub fn exercise_defaults(config: &CourseConfig) -> Map<String, Value> {
    let lang = config.data.default_lang();
    let mut out = Map::new();
    for item in config.data.exercises() {
        let Some(exercise) = item.exercise() else {
            continue;
        };
        let mut entry = Map::new();
        if let Some((_, data)) = exercise
            .loaded
            .as_ref()
            .and_then(|loaded| loaded.data_for_language(Some(lang)))
        {
            for field in GRADING_FIELDS {
                if let Some(value) = data.get(field) {
                    entry.insert(field.to_string(), value.clone());
                }
            }
        }
        apply_index_values(exercise, &mut entry);
        out.insert(item.key.clone(), Value::Object(entry));
    }
    out
}

fn apply_index_values(exercise: &Exercise, entry: &mut Map<String, Value>) {
    if exercise.max_submissions > 0 || !entry.contains_key("max_submissions") {
        entry.insert("max_submissions".to_string(), exercise.max_submissions.into());
    }
    if let Some(points) = exercise.max_points {
        entry.insert("max_points".to_string(), points.into());
    }
    if let Some(points) = exercise.points_to_pass {
        entry.insert("points_to_pass".to_string(), points.into());
    }
}

/// Course-relative paths the store step copies individually: the meta file,
/// every exercise config and include, and the files exercise configs
/// reference. The index file is not included.
pub fn referenced_files(config: &CourseConfig) -> BTreeSet<PathBuf> {
    let mut files = BTreeSet::new();
    if config.dir.join(META_FILE).is_file() {
        files.insert(PathBuf::from(META_FILE));
    }
    files.extend(config.exercise_files().map(|path| path.to_path_buf()));
    for item in config.data.exercises() {
        if let Some(loaded) = item.exercise().and_then(|e| e.loaded.as_ref()) {
            files.extend(
                loaded
                    .referenced_files()
                    .iter()
                    .map(|f| strip_root(std::path::Path::new(f)).to_path_buf()),
            );
        }
    }
    files
}
