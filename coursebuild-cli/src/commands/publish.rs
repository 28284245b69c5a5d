//! `coursebuild publish`: promote a stored version to the published tree.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;

use coursebuild_core::{CourseKey, Stage, VersionId};
use coursebuild_daemon::open_orchestrator;
use coursebuild_fs::BackgroundQueue;

use super::super::StageArg;

/// Arguments for `coursebuild publish`.
#[derive(Args, Debug)]
pub struct PublishArgs {
    /// Key of the course to publish.
    pub course: String,

    /// Version id the caller expects to find in the source stage.
    #[arg(long)]
    pub version: String,

    /// Stage to publish from: store | publish.
    #[arg(long, default_value = "store")]
    pub from: StageArg,
}

impl PublishArgs {
    pub fn run(self) -> Result<()> {
        let home: PathBuf = dirs::home_dir().context("could not determine home directory")?;
        let key = CourseKey::from(self.course.as_str());
        let source = Stage::from(self.from);
        if source == Stage::Build {
            bail!("publishing from the build directory is not allowed");
        }

        let queue = BackgroundQueue::standalone().context("failed to start background queue")?;
        let orchestrator =
            open_orchestrator(&home, queue.clone()).context("failed to load service settings")?;
        let result = orchestrator
            .stages()
            .publish(&key, source, &VersionId::from(self.version.as_str()));
        // Old published files are removed in the background.
        queue.flush_blocking();

        let errors = result.with_context(|| format!("publish failed for '{key}'"))?;
        println!("✓ '{key}' version {} published from {source}", self.version.trim());
        if !errors.is_empty() {
            eprintln!("downstream services reported errors:");
            for error in &errors {
                eprintln!("  - {error}");
            }
        }
        Ok(())
    }
}
