//! `coursebuild course list` and `coursebuild course add <key>`

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Args, Subcommand};

use coursebuild_core::courses::{course_path_at, list_courses_at, save_course_at};
use coursebuild_core::{CourseKey, CourseSource};

/// Manage registered courses.
#[derive(Subcommand, Debug)]
pub enum CourseCommand {
    /// List registered courses and where their sources come from.
    List,

    /// Register a new course.
    Add(AddArgs),
}

#[derive(Args, Debug)]
pub struct AddArgs {
    /// Course key (letters, digits, `_`, `-` and `.`).
    pub key: String,

    /// Git origin URL to clone the course from.
    #[arg(long)]
    pub origin: Option<String>,

    /// Branch to check out.
    #[arg(long, default_value = "master")]
    pub branch: String,

    /// Id of the course on the frontend.
    #[arg(long)]
    pub remote_id: Option<u64>,

    /// Directory to copy sources from when there is no git origin.
    #[arg(long)]
    pub local_source: Option<PathBuf>,

    #[arg(long)]
    pub skip_git: bool,

    #[arg(long)]
    pub skip_build: bool,

    /// Build straight into the published tree.
    #[arg(long)]
    pub skip_build_failsafes: bool,

    #[arg(long)]
    pub update_automatically: bool,

    /// Mail course staff when an update fails.
    #[arg(long)]
    pub email_on_error: bool,
}

pub fn run(cmd: CourseCommand) -> Result<()> {
    let home: PathBuf = dirs::home_dir().context("could not determine home directory")?;
    match cmd {
        CourseCommand::List => list(&home),
        CourseCommand::Add(args) => add(&home, args),
    }
}

fn list(home: &std::path::Path) -> Result<()> {
    let courses = list_courses_at(home).context("failed to read course registry")?;
    if courses.is_empty() {
        println!("No courses registered.");
        println!("Run: coursebuild course add <key> --origin <url>");
        return Ok(());
    }

    for course in &courses {
        let source = match (course.origin(), &course.local_source) {
            (Some(origin), _) => format!("{origin} ({})", course.git_branch),
            (None, Some(local)) => local.display().to_string(),
            (None, None) => "local default".to_string(),
        };
        let mut flags = Vec::new();
        if course.skip_git {
            flags.push("skip-git");
        }
        if course.skip_build {
            flags.push("skip-build");
        }
        if course.skip_build_failsafes {
            flags.push("failsafes");
        }
        if course.update_automatically {
            flags.push("auto");
        }
        if flags.is_empty() {
            println!("{}  {source}", course.key);
        } else {
            println!("{}  {source}  [{}]", course.key, flags.join(", "));
        }
    }
    Ok(())
}

fn add(home: &std::path::Path, args: AddArgs) -> Result<()> {
    let key = CourseKey::from(args.key.as_str());
    if !key.is_valid() {
        bail!("invalid course key '{key}'; use letters, digits, '_', '-' and '.'");
    }
    let path = course_path_at(home, &key);
    if path.exists() {
        bail!("course '{key}' is already registered at {}", path.display());
    }

    let course = CourseSource {
        git_origin: args.origin,
        git_branch: args.branch,
        remote_id: args.remote_id,
        local_source: args.local_source,
        skip_git: args.skip_git,
        skip_build: args.skip_build,
        skip_build_failsafes: args.skip_build_failsafes,
        update_automatically: args.update_automatically,
        email_on_error: args.email_on_error,
        ..CourseSource::new(key.clone())
    };
    save_course_at(home, &course).with_context(|| format!("failed to save course '{key}'"))?;

    println!("✓ course '{key}' registered at {}", path.display());
    Ok(())
}
