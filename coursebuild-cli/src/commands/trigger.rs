//! `coursebuild trigger`: queue an update through the daemon, or run it here.

use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;

use coursebuild_core::courses::load_course_at;
use coursebuild_core::{CourseKey, TriggerRequest, UpdateStatus};
use coursebuild_daemon::{init_tracing, open_orchestrator, request_trigger, DaemonError};
use coursebuild_fs::BackgroundQueue;
use coursebuild_sync::RunOutcome;

/// Arguments for `coursebuild trigger`.
#[derive(Args, Debug)]
pub struct TriggerArgs {
    /// Key of the course to update.
    pub course: String,

    /// Build from the current working copy without pulling.
    #[arg(long)]
    pub skip_git: bool,

    /// Skip the build command and store the working copy as is.
    #[arg(long)]
    pub skip_build: bool,

    /// Do not tell the frontend about a successful update.
    #[arg(long)]
    pub skip_notify: bool,

    /// Treat every file as changed.
    #[arg(long)]
    pub rebuild_all: bool,

    /// Build image, overriding `course.meta` and the settings default.
    #[arg(long)]
    pub image: Option<String>,

    /// Build command, overriding `course.meta` and the settings default.
    #[arg(long)]
    pub command: Option<String>,

    /// Run the update in this process instead of handing it to the daemon.
    #[arg(long)]
    pub foreground: bool,
}

impl TriggerArgs {
    pub fn run(self) -> Result<()> {
        let home: PathBuf = dirs::home_dir().context("could not determine home directory")?;
        let key = CourseKey::from(self.course.as_str());
        let request = TriggerRequest {
            skip_git: self.skip_git,
            skip_build: self.skip_build,
            skip_notify: self.skip_notify,
            rebuild_all: self.rebuild_all,
            image: self.image,
            command: self.command,
        };

        if self.foreground {
            return run_foreground(&home, &key, request);
        }

        match request_trigger(&home, key.as_str(), request) {
            Ok(data) => {
                let id = data
                    .get("record")
                    .and_then(|record| record.get("id"))
                    .and_then(|id| id.as_u64())
                    .unwrap_or_default();
                println!("✓ update #{id} queued for '{key}'");
                Ok(())
            }
            Err(DaemonError::DaemonNotRunning { .. }) => {
                bail!("daemon is not running; start it with `coursebuild daemon start` or pass --foreground")
            }
            Err(err) => Err(err).with_context(|| format!("trigger failed for '{key}'")),
        }
    }
}

fn run_foreground(home: &Path, key: &CourseKey, request: TriggerRequest) -> Result<()> {
    init_tracing();
    let course = load_course_at(home, key)
        .with_context(|| format!("course '{key}' is not registered; see `coursebuild course add`"))?;
    let queue = BackgroundQueue::standalone().context("failed to start background queue")?;
    let orchestrator =
        open_orchestrator(home, queue.clone()).context("failed to load service settings")?;
    let retry_delay = Duration::from_secs(orchestrator.settings().retry_delay_secs);

    let queued = orchestrator
        .trigger(&course, request)
        .with_context(|| format!("failed to queue update for '{key}'"))?;
    println!("update #{} queued for '{key}'", queued.id);

    let outcome = loop {
        match orchestrator
            .run(&course)
            .with_context(|| format!("update failed for '{key}'"))?
        {
            RunOutcome::Locked => {
                println!(
                    "course '{key}' is being updated elsewhere; retrying in {}s",
                    retry_delay.as_secs()
                );
                sleep(retry_delay);
            }
            other => break other,
        }
    };
    queue.flush_blocking();

    match outcome {
        RunOutcome::Finished(record) => {
            println!("{}", record.log);
            match record.status {
                UpdateStatus::Success => {
                    println!("{} update #{} of '{key}' succeeded", "✓".green(), record.id);
                    Ok(())
                }
                status => bail!("update #{} of '{key}' ended {status}", record.id),
            }
        }
        RunOutcome::NothingPending => {
            println!("update for '{key}' was taken by another worker");
            Ok(())
        }
        RunOutcome::Locked => Ok(()),
    }
}
