//! Cross-field checks over a parsed course.
//!
//! Violations of key uniqueness, category declarations and item-kind rules
//! are fatal. Date ordering and assistant permission mismatches become
//! warnings attached to the module or item they concern.

use std::collections::BTreeSet;
use std::path::Path;

use crate::error::{invalid, ConfigError};
use crate::model::{CourseData, Item, ItemKind};

pub fn validate(course: &mut CourseData, file: &Path) -> Result<(), ConfigError> {
    check_unique(
        course.modules.iter().map(|m| m.key.as_str()),
        |key| invalid(file, format!("Duplicate module key: {key}")),
    )?;
    check_unique(course.configures.iter().map(|c| c.url.as_str()), |url| {
        invalid(file, format!("Duplicate configure URL: {url}"))
    })?;

    let mut keys = Vec::new();
    for module in &course.modules {
        module.collect_keys(&mut keys);
    }
    let duplicates = duplicates(keys.iter().copied());
    if !duplicates.is_empty() {
        let list: Vec<&str> = duplicates.into_iter().collect();
        return Err(invalid(
            file,
            format!(
                "Duplicate learning object (chapter, exercise) keys: {}",
                list.join(", ")
            ),
        ));
    }

    let mut categories = BTreeSet::new();
    for module in &course.modules {
        module.collect_categories(&mut categories);
    }
    if let Some(missing) = categories
        .iter()
        .find(|c| !course.categories.contains_key(c.as_str()))
    {
        return Err(invalid(
            file,
            format!("Category not found in categories: {missing}"),
        ));
    }

    for item in course.items() {
        check_item(item, file)?;
    }

    add_date_warnings(course);
    for module in &mut course.modules {
        for child in &mut module.children {
            add_assistant_warnings(child);
        }
    }
    Ok(())
}

fn check_unique<'a>(
    keys: impl Iterator<Item = &'a str>,
    error: impl Fn(&str) -> ConfigError,
) -> Result<(), ConfigError> {
    match duplicates(keys).into_iter().next() {
        Some(key) => Err(error(key)),
        None => Ok(()),
    }
}

fn duplicates<'a>(keys: impl Iterator<Item = &'a str>) -> BTreeSet<&'a str> {
    let mut seen = BTreeSet::new();
    keys.filter(|k| !seen.insert(*k)).collect()
}

fn check_item(item: &Item, file: &Path) -> Result<(), ConfigError> {
    match &item.kind {
        ItemKind::Collection {
            target_category, ..
        } if *target_category == item.category => Err(invalid(
            file,
            format!(
                "item '{}': Exercise collection's category and target category cannot be the same",
                item.key
            ),
        )),
        ItemKind::Chapter { static_content }
            if static_content.values().iter().any(|p| p.is_absolute()) =>
        {
            Err(invalid(
                file,
                format!("item '{}': static_content: Path must be relative", item.key),
            ))
        }
        _ => Ok(()),
    }
}

fn add_date_warnings(course: &mut CourseData) {
    let end = course.end;
    for module in &mut course.modules {
        if let (Some(close), Some(end)) = (module.close, end) {
            if close > end {
                module.warnings.push("Course ends before module closes".to_string());
            }
        }
        let Some(late_close) = module.late_close else {
            continue;
        };
        match (module.close, end) {
            (Some(close), _) if late_close < close => {
                module.warnings.push("'late_close' is before 'close'".to_string());
            }
            (None, Some(end)) if late_close < end => {
                module.warnings.push(
                    "'late_close' is before module close (which defaults to course 'end')"
                        .to_string(),
                );
            }
            _ => {}
        }
    }
}

fn add_assistant_warnings(item: &mut Item) {
    let grading_without_viewing = item.exercise().is_some_and(|e| {
        e.allow_assistant_grading == Some(true) && e.allow_assistant_viewing != Some(true)
    });
    if grading_without_viewing {
        item.warnings
            .push("Assistant grading is allowed but viewing is not".to_string());
    }
    for child in &mut item.children {
        add_assistant_warnings(child);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_course;
    use rstest::rstest;

    const FILE: &str = "/course/index.yaml";

    fn load(yaml: &str) -> Result<CourseData, ConfigError> {
        let value = serde_yaml::from_str(yaml).expect("yaml");
        let mut course = parse_course(value, Path::new(FILE))?;
        validate(&mut course, Path::new(FILE))?;
        Ok(course)
    }

    #[rstest]
    #[case::module_keys(
        "modules:\n  - {key: m, name: A}\n  - {key: m, name: B}\n",
        "Duplicate module key: m"
    )]
    #[case::item_keys_across_modules(
        "modules:\n  - {key: m1, name: A, children: [{key: e, category: ex}]}\n  - {key: m2, name: B, children: [{key: e, category: ex}]}\n",
        "Duplicate learning object (chapter, exercise) keys: e"
    )]
    #[case::undeclared_category(
        "modules:\n  - {key: m, name: A, children: [{key: e, category: quiz}]}\n",
        "Category not found in categories: quiz"
    )]
    #[case::collection_targets_itself(
        "modules:\n  - {key: m, name: A, children: [{key: c, category: ex, target_category: ex, target_url: u, max_points: 1}]}\n",
        "category and target category cannot be the same"
    )]
    #[case::absolute_static_content(
        "modules:\n  - {key: m, name: A, children: [{key: c, category: ex, static_content: /etc/passwd}]}\n",
        "Path must be relative"
    )]
    #[case::configure_urls(
        "configures: [{url: 'http://g'}, {url: 'http://g'}]\nmodules: []\n",
        "Duplicate configure URL: http://g"
    )]
    fn fatal_inconsistencies(#[case] body: &str, #[case] message: &str) {
        let yaml = format!("name: C\ncategories: {{ex: {{}}}}\n{body}");
        match load(&yaml) {
            Err(ConfigError::Invalid { message: got, .. }) => {
                assert!(got.contains(message), "{got}")
            }
            other => panic!("expected invalid config, got {other:?}"),
        }
    }

    #[test]
    fn date_and_permission_problems_are_warnings() {
        let course = load(
            r#"
name: C
end: 2024-06-01
categories: {ex: {}}
modules:
  - key: late
    name: A
    close: 2024-07-01
  - key: inverted
    name: B
    close: 2024-05-10
    late_close: 2024-05-01
  - key: before_end
    name: C
    late_close: 2024-05-20
    children:
      - {key: e, category: ex, allow_assistant_grading: true}
      - {key: ok, category: ex, allow_assistant_grading: true, allow_assistant_viewing: true}
"#,
        )
        .expect("warnings are not fatal");

        assert_eq!(course.modules[0].warnings, vec!["Course ends before module closes"]);
        assert_eq!(course.modules[1].warnings, vec!["'late_close' is before 'close'"]);
        assert_eq!(
            course.modules[2].warnings,
            vec!["'late_close' is before module close (which defaults to course 'end')"]
        );
        let items = course.items();
        assert_eq!(items[0].warnings, vec!["Assistant grading is allowed but viewing is not"]);
        assert!(items[1].warnings.is_empty());
    }
}
