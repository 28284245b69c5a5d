//! Index file parsing: raw YAML/JSON into the [`CourseData`] tree.
//!
//! Type and format problems (a missing key, a malformed date) are fatal and
//! name the offending file. Cross-field rules live in [`crate::validate`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{invalid, io_err, ConfigError};
use crate::exercise::mtime_of;
use crate::model::{
    ConfigureOptions, CourseData, Exercise, Item, ItemKind, Localized, Module, SimpleDuration,
    DEFAULT_LANG,
};

/// Index file names, in lookup order.
pub const INDEX_FILES: [&str; 3] = ["index.yaml", "index.yml", "index.json"];

/// Paths always served without authentication.
const ALWAYS_UNPROTECTED: [&str; 3] = ["_downloads", "_static", "_images"];

const DURATION_FORMAT: &str = "Format: <integer>(y|m|d|h|w) e.g. 3d";

/// First existing index file in `dir`.
pub fn find_index(dir: &Path) -> Result<PathBuf, ConfigError> {
    INDEX_FILES
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.is_file())
        .ok_or_else(|| ConfigError::IndexNotFound {
            dir: dir.to_path_buf(),
        })
}

/// Read and parse a YAML (or JSON) file, returning its mtime as seen before
/// the read.
pub fn parse_file(path: &Path) -> Result<(SystemTime, Value), ConfigError> {
    if !path.is_file() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }
    let mtime = mtime_of(path)?;
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    let value = serde_yaml::from_str::<Value>(&contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    Ok((mtime, value))
}

// ---------------------------------------------------------------------------
// Field access
// ---------------------------------------------------------------------------

/// A mapping being consumed field by field, with the context needed to
/// produce readable errors.
struct Fields<'a> {
    file: &'a Path,
    what: String,
    map: Map<String, Value>,
}

impl<'a> Fields<'a> {
    fn new(file: &'a Path, what: String, value: Value) -> Result<Self, ConfigError> {
        let Value::Object(map) = value else {
            return Err(invalid(file, format!("{what} must be a mapping")));
        };
        Ok(Self { file, what, map })
    }

    /// Drop `_private` keys and fold `title` into `name`.
    fn normalize_item(mut self) -> Result<Self, ConfigError> {
        self.map.retain(|k, _| !k.starts_with('_'));
        self.map.remove("scale_points");
        if let Some(title) = self.map.remove("title") {
            if self.map.contains_key("name") {
                return Err(self.error("Only one of name and title should be specified"));
            }
            self.map.insert("name".to_string(), title);
        }
        Ok(self)
    }

    fn error(&self, message: impl std::fmt::Display) -> ConfigError {
        invalid(self.file, format!("{}: {message}", self.what))
    }

    fn take(&mut self, key: &str) -> Option<Value> {
        self.map.remove(key).filter(|v| !v.is_null())
    }

    fn require(&mut self, key: &str) -> Result<Value, ConfigError> {
        self.take(key)
            .ok_or_else(|| self.error(format_args!("missing required field '{key}'")))
    }

    fn typed<T: DeserializeOwned>(&self, key: &str, value: Value) -> Result<T, ConfigError> {
        serde_json::from_value(value).map_err(|e| self.error(format_args!("'{key}': {e}")))
    }

    fn opt<T: DeserializeOwned>(&mut self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.take(key) {
            None => Ok(None),
            Some(v) => self.typed(key, v).map(Some),
        }
    }

    fn req<T: DeserializeOwned>(&mut self, key: &str) -> Result<T, ConfigError> {
        let value = self.require(key)?;
        self.typed(key, value)
    }

    /// Scalar keys such as `key` may be written as numbers in YAML.
    fn req_string(&mut self, key: &str) -> Result<String, ConfigError> {
        match self.require(key)? {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            other => Err(self.error(format_args!("'{key}' must be a string, got {other}"))),
        }
    }

    fn date(&mut self, key: &str) -> Result<Option<NaiveDateTime>, ConfigError> {
        match self.take(key) {
            None => Ok(None),
            Some(Value::String(raw)) => parse_date(&raw)
                .map(Some)
                .ok_or_else(|| self.error(format_args!("'{key}': unrecognised date '{raw}'"))),
            Some(other) => Err(self.error(format_args!("'{key}': unrecognised date {other}"))),
        }
    }

    fn duration(&mut self, key: &str) -> Result<Option<SimpleDuration>, ConfigError> {
        match self.take(key) {
            None => Ok(None),
            Some(Value::Number(n)) => n
                .as_i64()
                .map(|secs| Some(SimpleDuration::Seconds(secs)))
                .ok_or_else(|| self.error(format_args!("'{key}': {DURATION_FORMAT}"))),
            Some(Value::String(raw)) => SimpleDuration::parse(&raw)
                .map(Some)
                .ok_or_else(|| self.error(format_args!("'{key}': {DURATION_FORMAT}"))),
            Some(_) => Err(self.error(format_args!("'{key}': A duration must be a string"))),
        }
    }

    fn rest(self) -> BTreeMap<String, Value> {
        self.map.into_iter().collect()
    }
}

/// Accepted date formats. A date without a time means the end of that day.
pub fn parse_date(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    const FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ];
    FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(raw, f).ok())
        .or_else(|| {
            let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
            let end_of_day = NaiveTime::from_hms_opt(23, 59, 59)?;
            Some(date.and_time(end_of_day))
        })
}

// ---------------------------------------------------------------------------
// Tree construction
// ---------------------------------------------------------------------------

/// Build the course tree from a parsed index file.
pub fn parse_course(value: Value, file: &Path) -> Result<CourseData, ConfigError> {
    let mut fields = Fields::new(file, "course".to_string(), value)?;
    fields.map.retain(|k, _| !k.starts_with('_'));

    let name = fields.req::<Localized<String>>("name")?;
    let lang = match fields.take("lang") {
        None => vec![DEFAULT_LANG.to_string()],
        Some(Value::String(l)) => vec![l],
        Some(other) => fields.typed::<Vec<String>>("lang", other)?,
    };
    let categories = fields.opt::<BTreeMap<String, Value>>("categories")?.unwrap_or_default();
    let start = fields.date("start")?;
    let end = fields.date("end")?;
    let static_dir = fields.opt::<PathBuf>("static_dir")?;
    let mut unprotected_paths = fields
        .opt::<BTreeSet<PathBuf>>("unprotected_paths")?
        .unwrap_or_default();
    unprotected_paths.extend(ALWAYS_UNPROTECTED.iter().map(PathBuf::from));
    let configures = fields
        .opt::<Vec<ConfigureOptions>>("configures")?
        .unwrap_or_default();

    let raw_modules = fields.req::<Vec<Value>>("modules")?;
    let modules = raw_modules
        .into_iter()
        .enumerate()
        .map(|(i, m)| parse_module(m, i, file))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(CourseData {
        name,
        lang,
        categories,
        start,
        end,
        static_dir,
        unprotected_paths,
        configures,
        modules,
        extra: fields.rest(),
    })
}

fn parse_module(value: Value, index: usize, file: &Path) -> Result<Module, ConfigError> {
    let fields = Fields::new(file, format!("module #{}", index + 1), value)?;
    let mut fields = fields.normalize_item()?;
    let key = fields.req_string("key")?;
    fields.what = format!("module '{key}'");

    let late_penalty = fields.opt::<f64>("late_penalty")?;
    if let Some(p) = late_penalty {
        if !(0.0..=1.0).contains(&p) {
            return Err(fields.error("'late_penalty' must be between 0 and 1"));
        }
    }
    // Both spellings appear in the wild.
    let read_open = match fields.date("read-open")? {
        Some(d) => Some(d),
        None => fields.date("read_open")?,
    };

    let name = fields.req::<Localized<String>>("name")?;
    let open = fields.date("open")?;
    let close = fields.date("close")?;
    let late_close = fields.date("late_close")?;
    let duration = fields.duration("duration")?;
    let late_duration = fields.duration("late_duration")?;
    let points_to_pass = fields.opt::<u64>("points_to_pass")?;
    let children = parse_children(&mut fields)?;

    Ok(Module {
        key,
        name,
        open,
        close,
        late_close,
        read_open,
        duration,
        late_duration,
        late_penalty,
        points_to_pass,
        children,
        warnings: Vec::new(),
        extra: fields.rest(),
    })
}

fn parse_children(parent: &mut Fields<'_>) -> Result<Vec<Item>, ConfigError> {
    let raw = parent.opt::<Vec<Value>>("children")?.unwrap_or_default();
    let file = parent.file;
    let what = parent.what.clone();
    raw.into_iter()
        .enumerate()
        .map(|(i, child)| parse_item(child, format!("{what} child #{}", i + 1), file))
        .collect()
}

fn parse_item(value: Value, what: String, file: &Path) -> Result<Item, ConfigError> {
    let mut fields = Fields::new(file, what, value)?.normalize_item()?;
    let key = fields.req_string("key")?;
    fields.what = format!("item '{key}'");
    let category = fields.req_string("category")?;
    let name = fields.opt::<Localized<String>>("name")?;

    let kind = if fields.map.contains_key("static_content") {
        ItemKind::Chapter {
            static_content: fields.req("static_content")?,
        }
    } else if fields.map.contains_key("target_category") {
        let max_points = fields.req::<u64>("max_points")?;
        if max_points == 0 {
            return Err(fields.error("'max_points' must be positive"));
        }
        ItemKind::Collection {
            target_category: fields.req_string("target_category")?,
            target_url: fields.req_string("target_url")?,
            max_points,
        }
    } else if fields.map.contains_key("lti") {
        ItemKind::Lti {
            lti: fields.req_string("lti")?,
            exercise: parse_exercise(&mut fields)?,
        }
    } else {
        ItemKind::Exercise(parse_exercise(&mut fields)?)
    };

    let children = parse_children(&mut fields)?;
    Ok(Item {
        key,
        category,
        name,
        kind,
        children,
        warnings: Vec::new(),
        extra: fields.rest(),
    })
}

fn parse_exercise(fields: &mut Fields<'_>) -> Result<Exercise, ConfigError> {
    Ok(Exercise {
        config: fields.opt::<PathBuf>("config")?,
        max_submissions: fields.opt::<u64>("max_submissions")?.unwrap_or(0),
        max_points: fields.opt::<u64>("max_points")?,
        points_to_pass: fields.opt::<u64>("points_to_pass")?,
        allow_assistant_viewing: fields.opt::<bool>("allow_assistant_viewing")?,
        allow_assistant_grading: fields.opt::<bool>("allow_assistant_grading")?,
        configure: fields.opt::<ConfigureOptions>("configure")?,
        loaded: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parse(yaml: &str) -> Result<CourseData, ConfigError> {
        let value: Value = serde_yaml::from_str(yaml).expect("yaml");
        parse_course(value, Path::new("/course/index.yaml"))
    }

    const COURSE: &str = r#"
name: Programming 1
lang: [fi, en]
categories:
  exercise: {name: Exercises}
  chapter: {name: Material}
end: 2024-12-31
_private: dropped
modules:
  - key: m1
    title: Round 1
    close: "2024-11-01 12:00"
    late_close: "2024-11-08T12:00:00"
    late_penalty: 0.5
    children:
      - key: ch1
        category: chapter
        name: {fi: Luku, en: Chapter}
        static_content: m1/ch1.html
        children:
          - key: ex1
            category: exercise
            config: /exercises/ex1.yaml
            max_submissions: 5
      - key: lti1
        category: exercise
        lti: service
        max_points: 10
      - key: coll
        category: exercise
        target_category: bonus
        target_url: https://example.org/course
        max_points: 20
"#;

    #[test]
    fn builds_tagged_tree() {
        let course = parse(COURSE).expect("parse");
        assert_eq!(course.default_lang(), "fi");
        assert!(!course.extra.contains_key("_private"));
        assert!(course.unprotected_paths.contains(Path::new("_static")));
        assert_eq!(
            course.end.map(|d| d.to_string()).as_deref(),
            Some("2024-12-31 23:59:59")
        );

        let module = &course.modules[0];
        assert_eq!(module.name, Localized::Plain("Round 1".to_string()));
        assert_eq!(module.late_penalty, Some(0.5));

        let keys: Vec<&str> = course.items().iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["ch1", "ex1", "lti1", "coll"]);
        assert!(matches!(course.items()[0].kind, ItemKind::Chapter { .. }));
        match &course.items()[1].kind {
            ItemKind::Exercise(ex) => {
                assert_eq!(ex.config.as_deref(), Some(Path::new("/exercises/ex1.yaml")));
                assert_eq!(ex.max_submissions, 5);
            }
            other => panic!("expected exercise, got {other:?}"),
        }
        assert!(matches!(course.items()[2].kind, ItemKind::Lti { .. }));
        assert!(matches!(course.items()[3].kind, ItemKind::Collection { max_points: 20, .. }));
        assert_eq!(course.exercises().len(), 2);
    }

    #[rstest]
    #[case("2024-01-02", "2024-01-02 23:59:59")]
    #[case("2024-01-02 08:30", "2024-01-02 08:30:00")]
    #[case("2024-01-02T08:30:15", "2024-01-02 08:30:15")]
    fn accepted_dates(#[case] raw: &str, #[case] expected: &str) {
        assert_eq!(parse_date(raw).map(|d| d.to_string()).as_deref(), Some(expected));
    }

    #[rstest]
    #[case::name_and_title(
        "name: C\nmodules:\n  - {key: m, name: A, title: B}\n",
        "Only one of name and title should be specified"
    )]
    #[case::bad_duration(
        "name: C\nmodules:\n  - {key: m, name: A, duration: 3x}\n",
        "Format: <integer>(y|m|d|h|w) e.g. 3d"
    )]
    #[case::bad_date(
        "name: C\nmodules:\n  - {key: m, name: A, open: tomorrow}\n",
        "unrecognised date 'tomorrow'"
    )]
    #[case::missing_category(
        "name: C\nmodules:\n  - {key: m, name: A, children: [{key: e}]}\n",
        "missing required field 'category'"
    )]
    #[case::penalty_range(
        "name: C\nmodules:\n  - {key: m, name: A, late_penalty: 2}\n",
        "'late_penalty' must be between 0 and 1"
    )]
    fn malformed_fields_are_fatal(#[case] yaml: &str, #[case] message: &str) {
        match parse(yaml) {
            Err(ConfigError::Invalid { path, message: got }) => {
                assert_eq!(path, Path::new("/course/index.yaml"));
                assert!(got.contains(message), "{got}");
            }
            other => panic!("expected invalid config, got {other:?}"),
        }
    }

    #[test]
    fn index_lookup_order() {
        let dir = tempfile::TempDir::new().expect("dir");
        assert!(matches!(
            find_index(dir.path()),
            Err(ConfigError::IndexNotFound { .. })
        ));
        std::fs::write(dir.path().join("index.json"), "{}").expect("write");
        std::fs::write(dir.path().join("index.yml"), "").expect("write");
        assert_eq!(find_index(dir.path()).expect("found"), dir.path().join("index.yml"));
    }

    #[test]
    fn syntax_error_names_file() {
        let dir = tempfile::TempDir::new().expect("dir");
        let path = dir.path().join("index.yaml");
        std::fs::write(&path, "name: [unclosed\n").expect("write");
        match parse_file(&path) {
            Err(ConfigError::Parse { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected parse error, got {other:?}"),
        }
    }
}
