//! Per-exercise configuration files.
//!
//! A config may pull in base templates with `include: [{file, force}]` and
//! may tag keys with a language, either as `key|i18n: {fi: …, en: …}` or as
//! `key|fi: …`. Loading expands the tags into one variant per language; every
//! variant inherits the untagged keys.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};

use crate::error::{io_err, ConfigError};
use crate::parser::parse_file;

#[derive(Debug, Clone, PartialEq)]
pub struct ExerciseConfig {
    /// Absolute path of the config file.
    pub file: PathBuf,
    /// Latest modification time across the file and its includes.
    pub mtime: SystemTime,
    pub ptime: SystemTime,
    pub default_lang: String,
    /// Language → resolved data.
    pub data: BTreeMap<String, Value>,
    /// Every file read, with the mtime seen when it was read.
    pub sources: Vec<(PathBuf, SystemTime)>,
}

impl ExerciseConfig {
    /// Load `<course_dir>/<config>` (a leading `/` is relative to the course
    /// directory too).
    pub fn load(
        exercise_key: &str,
        config: &Path,
        course_dir: &Path,
        default_lang: &str,
    ) -> Result<Self, ConfigError> {
        let file = course_dir.join(strip_root(config));
        let (mtime, value) = parse_file(&file)?;
        let mut sources = vec![(file.clone(), mtime)];
        let mut mtime = mtime;

        let Value::Object(mut data) = value else {
            return Err(crate::error::invalid(&file, "exercise config must be a mapping"));
        };

        for include in include_entries(&data, &file)? {
            let path = course_dir.join(strip_root(Path::new(&include.file)));
            let (include_mtime, included) = parse_file(&path)?;
            let Value::Object(included) = included else {
                return Err(crate::error::invalid(&path, "included config must be a mapping"));
            };
            for (key, value) in included {
                if include.force || !data.contains_key(&key) {
                    data.insert(key, value);
                }
            }
            mtime = mtime.max(include_mtime);
            sources.push((path, include_mtime));
        }

        let mtime_secs = mtime
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        let mut versions = process_tags(&Value::Object(data), default_lang);
        for version in versions.values_mut() {
            for field in ["title", "view_type"] {
                if version.get(field).is_none() {
                    return Err(ConfigError::MissingField {
                        path: file.clone(),
                        field: field.to_string(),
                    });
                }
            }
            if let Value::Object(map) = version {
                map.insert("key".to_string(), Value::String(exercise_key.to_string()));
                if let Some(number) = serde_json::Number::from_f64(mtime_secs) {
                    map.insert("mtime".to_string(), Value::Number(number));
                }
            }
        }

        Ok(Self {
            file,
            mtime,
            ptime: SystemTime::now().max(mtime),
            default_lang: default_lang.to_string(),
            data: versions,
            sources,
        })
    }

    /// Data for `lang`, else for the default language, else any language.
    /// Returns the language actually chosen.
    pub fn data_for_language(&self, lang: Option<&str>) -> Option<(&str, &Value)> {
        lang.into_iter()
            .chain(std::iter::once(self.default_lang.as_str()))
            .find_map(|l| self.data.get_key_value(l))
            .or_else(|| self.data.iter().next())
            .map(|(l, v)| (l.as_str(), v))
    }

    /// Course-relative paths of every file this exercise needs at serve
    /// time: its included templates plus `template_files` and `model_files`.
    pub fn referenced_files(&self) -> BTreeSet<String> {
        let mut files = BTreeSet::new();
        for version in self.data.values() {
            for field in ["template_files", "model_files"] {
                if let Some(Value::Array(list)) = version.get(field) {
                    files.extend(list.iter().filter_map(Value::as_str).map(str::to_string));
                }
            }
            if let Some(Value::Array(includes)) = version.get("include") {
                files.extend(
                    includes
                        .iter()
                        .filter_map(|i| i.get("file").and_then(Value::as_str))
                        .map(str::to_string),
                );
            }
        }
        files
            .into_iter()
            .map(|f| f.trim_start_matches('/').to_string())
            .collect()
    }
}

pub(crate) fn strip_root(path: &Path) -> &Path {
    path.strip_prefix("/").unwrap_or(path)
}

struct Include {
    file: String,
    force: bool,
}

fn include_entries(data: &Map<String, Value>, file: &Path) -> Result<Vec<Include>, ConfigError> {
    let Some(raw) = data.get("include") else {
        return Ok(Vec::new());
    };
    let Value::Array(list) = raw else {
        return Err(crate::error::invalid(file, "'include' must be a list"));
    };
    list.iter()
        .map(|entry| match entry {
            Value::String(s) => Ok(Include {
                file: s.clone(),
                force: false,
            }),
            Value::Object(map) => {
                let file_name = map.get("file").and_then(Value::as_str).ok_or_else(|| {
                    crate::error::invalid(file, "include entry is missing 'file'")
                })?;
                Ok(Include {
                    file: file_name.to_string(),
                    force: map.get("force").and_then(Value::as_bool).unwrap_or(false),
                })
            }
            _ => Err(crate::error::invalid(file, "malformed include entry")),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Language tags
// ---------------------------------------------------------------------------

/// Split `data` into one variant per language tag found anywhere in it.
/// Untagged data becomes a single `default_lang` variant.
pub fn process_tags(data: &Value, default_lang: &str) -> BTreeMap<String, Value> {
    let mut langs = BTreeSet::new();
    collect_langs(data, &mut langs);
    if langs.is_empty() {
        langs.insert(default_lang.to_string());
    }
    langs
        .into_iter()
        .map(|lang| {
            let resolved = resolve_lang(data, &lang);
            (lang, resolved)
        })
        .collect()
}

fn collect_langs(value: &Value, langs: &mut BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                match key.rsplit_once('|') {
                    Some((_, "i18n")) => {
                        if let Value::Object(per_lang) = child {
                            langs.extend(per_lang.keys().cloned());
                            for inner in per_lang.values() {
                                collect_langs(inner, langs);
                            }
                        }
                    }
                    Some((_, lang)) => {
                        langs.insert(lang.to_string());
                        collect_langs(child, langs);
                    }
                    None => collect_langs(child, langs),
                }
            }
        }
        Value::Array(list) => list.iter().for_each(|v| collect_langs(v, langs)),
        _ => {}
    }
}

fn resolve_lang(value: &Value, lang: &str) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            // Plain keys first so tagged keys override them.
            for (key, child) in map.iter().filter(|(k, _)| !k.contains('|')) {
                out.insert(key.clone(), resolve_lang(child, lang));
            }
            for (key, child) in map {
                match key.rsplit_once('|') {
                    Some((base, "i18n")) => {
                        if let Some(inner) = child.get(lang) {
                            out.insert(base.to_string(), resolve_lang(inner, lang));
                        }
                    }
                    Some((base, tag)) if tag == lang => {
                        out.insert(base.to_string(), resolve_lang(child, lang));
                    }
                    _ => {}
                }
            }
            Value::Object(out)
        }
        Value::Array(list) => Value::Array(list.iter().map(|v| resolve_lang(v, lang)).collect()),
        other => other.clone(),
    }
}

/// Modification time of `path`.
pub(crate) fn mtime_of(path: &Path) -> Result<SystemTime, ConfigError> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| io_err(path, e))
}
