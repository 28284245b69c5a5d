//! Parsed course configuration tree.
//!
//! course → modules → items. Items are a tagged variant over chapters,
//! exercises, LTI exercises and exercise collections, and every item may have
//! children of any kind. Tree-wide operations go through the capability
//! methods `postprocess`, `collect_categories` and `collect_keys` instead of
//! matching on kinds at every call site.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;
use crate::exercise::ExerciseConfig;

// ---------------------------------------------------------------------------
// Field types
// ---------------------------------------------------------------------------

/// A value given either once for every language or per language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Localized<T> {
    Plain(T),
    PerLanguage(BTreeMap<String, T>),
}

impl<T> Localized<T> {
    /// The value for `lang`, else for `default_lang`, else any value.
    pub fn get(&self, lang: &str, default_lang: &str) -> Option<&T> {
        match self {
            Localized::Plain(value) => Some(value),
            Localized::PerLanguage(map) => map
                .get(lang)
                .or_else(|| map.get(default_lang))
                .or_else(|| map.values().next()),
        }
    }

    pub fn values(&self) -> Vec<&T> {
        match self {
            Localized::Plain(value) => vec![value],
            Localized::PerLanguage(map) => map.values().collect(),
        }
    }
}

/// `<integer>(y|m|w|d|h)`, or a plain number of seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SimpleDuration {
    Seconds(i64),
    Unit { amount: i64, unit: char },
}

impl SimpleDuration {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let unit = raw.chars().last()?;
        if !matches!(unit, 'y' | 'm' | 'w' | 'd' | 'h') {
            return None;
        }
        let amount = raw[..raw.len() - unit.len_utf8()].parse().ok()?;
        Some(SimpleDuration::Unit { amount, unit })
    }
}

/// A downstream service that receives the course configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigureOptions {
    pub url: String,
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct CourseData {
    pub name: Localized<String>,
    /// Course languages; the first is the default.
    pub lang: Vec<String>,
    pub categories: BTreeMap<String, Value>,
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
    pub static_dir: Option<PathBuf>,
    pub unprotected_paths: BTreeSet<PathBuf>,
    pub configures: Vec<ConfigureOptions>,
    pub modules: Vec<Module>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl CourseData {
    pub fn default_lang(&self) -> &str {
        self.lang.first().map(String::as_str).unwrap_or(DEFAULT_LANG)
    }

    pub fn postprocess(&mut self, ctx: &PostprocessContext) -> Result<(), ConfigError> {
        for module in &mut self.modules {
            module.postprocess(ctx)?;
        }
        Ok(())
    }

    /// Every item in the tree, depth first.
    pub fn items(&self) -> Vec<&Item> {
        let mut out = Vec::new();
        for module in &self.modules {
            for child in &module.children {
                child.walk(&mut out);
            }
        }
        out
    }

    /// Exercises and LTI exercises, depth first.
    pub fn exercises(&self) -> Vec<&Item> {
        self.items()
            .into_iter()
            .filter(|item| item.exercise().is_some())
            .collect()
    }
}

pub const DEFAULT_LANG: &str = "en";

#[derive(Debug, Clone, Serialize)]
pub struct Module {
    pub key: String,
    pub name: Localized<String>,
    pub open: Option<NaiveDateTime>,
    pub close: Option<NaiveDateTime>,
    pub late_close: Option<NaiveDateTime>,
    pub read_open: Option<NaiveDateTime>,
    pub duration: Option<SimpleDuration>,
    pub late_duration: Option<SimpleDuration>,
    pub late_penalty: Option<f64>,
    pub points_to_pass: Option<u64>,
    pub children: Vec<Item>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Module {
    pub fn postprocess(&mut self, ctx: &PostprocessContext) -> Result<(), ConfigError> {
        for child in &mut self.children {
            child.postprocess(ctx)?;
        }
        Ok(())
    }

    pub fn collect_categories(&self, out: &mut BTreeSet<String>) {
        for child in &self.children {
            child.collect_categories(out);
        }
    }

    pub fn collect_keys<'a>(&'a self, out: &mut Vec<&'a str>) {
        for child in &self.children {
            child.collect_keys(out);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Item {
    pub key: String,
    pub category: String,
    pub name: Option<Localized<String>>,
    #[serde(flatten)]
    pub kind: ItemKind,
    pub children: Vec<Item>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ItemKind {
    Chapter {
        static_content: Localized<PathBuf>,
    },
    Exercise(Exercise),
    Lti {
        lti: String,
        #[serde(flatten)]
        exercise: Exercise,
    },
    Collection {
        target_category: String,
        target_url: String,
        max_points: u64,
    },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Exercise {
    pub config: Option<PathBuf>,
    pub max_submissions: u64,
    pub max_points: Option<u64>,
    pub points_to_pass: Option<u64>,
    pub allow_assistant_viewing: Option<bool>,
    pub allow_assistant_grading: Option<bool>,
    pub configure: Option<ConfigureOptions>,
    /// The parsed `config` file, filled in by `postprocess`.
    #[serde(skip)]
    pub loaded: Option<Arc<ExerciseConfig>>,
}

/// What exercise config loading needs to know about the course.
#[derive(Debug, Clone)]
pub struct PostprocessContext {
    pub course_dir: PathBuf,
    pub default_lang: String,
}

impl Item {
    pub fn exercise(&self) -> Option<&Exercise> {
        match &self.kind {
            ItemKind::Exercise(exercise) | ItemKind::Lti { exercise, .. } => Some(exercise),
            _ => None,
        }
    }

    fn exercise_mut(&mut self) -> Option<&mut Exercise> {
        match &mut self.kind {
            ItemKind::Exercise(exercise) | ItemKind::Lti { exercise, .. } => Some(exercise),
            _ => None,
        }
    }

    /// Load referenced exercise configs, depth first.
    pub fn postprocess(&mut self, ctx: &PostprocessContext) -> Result<(), ConfigError> {
        for child in &mut self.children {
            child.postprocess(ctx)?;
        }
        let key = self.key.clone();
        if let Some(exercise) = self.exercise_mut() {
            if let Some(config) = &exercise.config {
                tracing::debug!(exercise = %key, config = %config.display(), "loading exercise config");
                let loaded =
                    ExerciseConfig::load(&key, config, &ctx.course_dir, &ctx.default_lang)?;
                exercise.loaded = Some(Arc::new(loaded));
            }
        }
        Ok(())
    }

    pub fn collect_categories(&self, out: &mut BTreeSet<String>) {
        out.insert(self.category.clone());
        for child in &self.children {
            child.collect_categories(out);
        }
    }

    pub fn collect_keys<'a>(&'a self, out: &mut Vec<&'a str>) {
        out.push(&self.key);
        for child in &self.children {
            child.collect_keys(out);
        }
    }

    fn walk<'a>(&'a self, out: &mut Vec<&'a Item>) {
        out.push(self);
        for child in &self.children {
            child.walk(out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn localized_falls_back_to_default_then_any() {
        let value: Localized<String> =
            serde_yaml::from_str("fi: Tehtävä\nsv: Uppgift\n").expect("parse");
        assert_eq!(value.get("fi", "en").map(String::as_str), Some("Tehtävä"));
        assert_eq!(value.get("de", "sv").map(String::as_str), Some("Uppgift"));
        assert_eq!(value.get("de", "en").map(String::as_str), Some("Tehtävä"));

        let plain: Localized<String> = serde_yaml::from_str("Exercise").expect("parse");
        assert_eq!(plain.get("fi", "en").map(String::as_str), Some("Exercise"));
    }

    #[test]
    fn durations() {
        assert_eq!(
            SimpleDuration::parse("3d"),
            Some(SimpleDuration::Unit { amount: 3, unit: 'd' })
        );
        assert_eq!(SimpleDuration::parse("12"), None);
        assert_eq!(SimpleDuration::parse("d"), None);
        assert_eq!(SimpleDuration::parse("2x"), None);
    }
}
