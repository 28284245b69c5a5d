//! `coursebuild config`: show a course's parsed configuration.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use coursebuild_config::{ConfigCache, CourseConfig, Item, ItemKind};
use coursebuild_core::{settings, CourseKey, Stage};

use super::super::StageArg;

/// Arguments for `coursebuild config`.
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Key of the course.
    pub course: String,

    /// Stage to read: build | store | publish.
    #[arg(long, default_value = "publish")]
    pub stage: StageArg,

    /// Language to resolve localized fields in. Defaults to the course's
    /// first language.
    #[arg(long)]
    pub lang: Option<String>,

    /// Emit the parsed tree as JSON.
    #[arg(long)]
    pub json: bool,
}

impl ConfigArgs {
    pub fn run(self) -> Result<()> {
        let home: PathBuf = dirs::home_dir().context("could not determine home directory")?;
        let settings = settings::load_at(&home).context("failed to load service settings")?;
        let key = CourseKey::from(self.course.as_str());
        let stage = Stage::from(self.stage);

        let cache = ConfigCache::new(&settings);
        let config = cache
            .load(stage, &key)
            .with_context(|| format!("failed to load configuration of '{key}' in {stage}"))?
            .with_context(|| {
                format!(
                    "'{key}' has no {stage} directory at {}",
                    cache.course_dir(stage, &key).display()
                )
            })?;

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&config.data)
                    .context("failed to render configuration JSON")?
            );
            return Ok(());
        }

        let lang = self
            .lang
            .clone()
            .unwrap_or_else(|| config.data.default_lang().to_string());
        print_summary(&config, stage, &lang);
        Ok(())
    }
}

fn print_summary(config: &CourseConfig, stage: Stage, lang: &str) {
    let data = &config.data;
    let default_lang = data.default_lang();
    let name = data
        .name
        .get(lang, default_lang)
        .map(String::as_str)
        .unwrap_or("");

    println!("{} ({}, {stage})", name.bold(), config.key);
    println!("  index:     {}", config.index_name().display());
    println!(
        "  version:   {}",
        config
            .version_id
            .as_ref()
            .map(|v| v.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    println!("  languages: {}", data.lang.join(", "));

    for module in &data.modules {
        let title = module.name.get(lang, default_lang).map(String::as_str).unwrap_or("");
        println!("\n{} {title}", module.key.bold());
        for child in &module.children {
            print_item(child, lang, default_lang, 1);
        }
    }

    let exercises = data.exercises();
    println!("\n{} exercises", exercises.len());

    let warnings = config.warnings();
    if !warnings.is_empty() {
        println!("\n{}", "warnings:".yellow());
        for warning in warnings {
            println!("  - {warning}");
        }
    }
}

fn print_item(item: &Item, lang: &str, default_lang: &str, depth: usize) {
    let indent = "  ".repeat(depth);
    let title = item
        .name
        .as_ref()
        .and_then(|name| name.get(lang, default_lang))
        .map(String::as_str)
        .unwrap_or("");
    println!("{indent}{} [{}] {title}", item.key, kind_label(item));
    for child in &item.children {
        print_item(child, lang, default_lang, depth + 1);
    }
}

fn kind_label(item: &Item) -> &'static str {
    match item.kind {
        ItemKind::Chapter { .. } => "chapter",
        ItemKind::Exercise(_) => "exercise",
        ItemKind::Lti { .. } => "lti",
        ItemKind::Collection { .. } => "collection",
    }
}
