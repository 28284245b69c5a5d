//! The per-course meta file: `key = value` lines in `course.meta`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{invalid, io_err, ConfigError};

/// File name of the meta file inside a course directory.
pub const META_FILE: &str = "course.meta";

/// Parsed meta file. Unknown keys are kept in `values`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CourseMeta {
    pub path: PathBuf,
    pub values: BTreeMap<String, String>,
}

impl CourseMeta {
    /// Read `<dir>/course.meta`. A missing file gives `None`.
    pub fn read(dir: &Path) -> Result<Option<Self>, ConfigError> {
        let path = dir.join(META_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        let values = contents
            .lines()
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();
        Ok(Some(Self { path, values }))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn build_image(&self) -> Option<&str> {
        self.get("build_image")
    }

    pub fn build_command(&self) -> Option<&str> {
        self.get("build_command")
    }

    /// `exclude_patterns`, split like a shell would.
    pub fn exclude_patterns(&self) -> Result<Vec<String>, ConfigError> {
        match self.get("exclude_patterns") {
            None => Ok(Vec::new()),
            Some(raw) => split_words(raw)
                .ok_or_else(|| invalid(&self.path, "unterminated quote in exclude_patterns")),
        }
    }
}

/// POSIX-shell word splitting without expansion. `None` on an unterminated
/// quote.
pub fn split_words(input: &str) -> Option<Vec<String>> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next()? {
                        '\'' => break,
                        c => word.push(c),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next()? {
                        '"' => break,
                        '\\' => match chars.next()? {
                            c @ ('"' | '\\' | '$' | '`') => word.push(c),
                            '\n' => {}
                            c => {
                                word.push('\\');
                                word.push(c);
                            }
                        },
                        c => word.push(c),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some('\n') | None => {}
                    Some(c) => word.push(c),
                }
            }
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }
    if in_word {
        words.push(word);
    }
    Some(words)
}
