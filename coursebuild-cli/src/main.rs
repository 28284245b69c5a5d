//! coursebuild: course build orchestration CLI.
//!
//! # Usage
//!
//! ```text
//! coursebuild trigger <course> [--skip-git] [--skip-build] [--skip-notify] [--rebuild-all]
//!                              [--image <image>] [--command <cmd>] [--foreground]
//! coursebuild status [<course>] [--json]
//! coursebuild publish <course> --version <id> [--from store|publish]
//! coursebuild check <path>
//! coursebuild config <course> [--stage build|store|publish] [--lang <code>]
//! coursebuild course list
//! coursebuild course add <key> [--origin <url>] [--branch <name>] ...
//! coursebuild daemon start|stop|status|logs
//! ```

mod commands;

use std::fmt;
use std::str::FromStr;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    check::CheckArgs, config::ConfigArgs, course::CourseCommand, daemon::DaemonCommand,
    publish::PublishArgs, status::StatusArgs, trigger::TriggerArgs,
};
use coursebuild_core::Stage;

// ---------------------------------------------------------------------------
// CLI entry point
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "coursebuild",
    version,
    about = "Build, store and publish course material from version control",
    long_about = None,
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Queue an update for a course, or run it in this process.
    Trigger(TriggerArgs),

    /// Show the latest update of each course.
    Status(StatusArgs),

    /// Promote a stored build to the published tree.
    Publish(PublishArgs),

    /// Check that a built tree is self-contained.
    Check(CheckArgs),

    /// Show a course's parsed configuration in one stage.
    Config(ConfigArgs),

    /// Manage registered courses.
    Course {
        #[command(subcommand)]
        command: CourseCommand,
    },

    /// Manage the background build daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },
}

// ---------------------------------------------------------------------------
// Shared Stage argument
// ---------------------------------------------------------------------------

/// Thin wrapper so clap can parse `Stage` from CLI args.
#[derive(Debug, Clone, Copy)]
pub struct StageArg(pub Stage);

impl FromStr for StageArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "build" => Ok(Self(Stage::Build)),
            "store" => Ok(Self(Stage::Store)),
            "publish" => Ok(Self(Stage::Publish)),
            other => Err(format!(
                "unknown stage '{other}'; expected: build, store, publish"
            )),
        }
    }
}

impl fmt::Display for StageArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<StageArg> for Stage {
    fn from(s: StageArg) -> Self {
        s.0
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Trigger(args) => args.run(),
        Commands::Status(args) => args.run(),
        Commands::Publish(args) => args.run(),
        Commands::Check(args) => args.run(),
        Commands::Config(args) => args.run(),
        Commands::Course { command } => commands::course::run(command),
        Commands::Daemon { command } => commands::daemon::run(command),
    }
}
