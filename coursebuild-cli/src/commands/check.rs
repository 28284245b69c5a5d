//! `coursebuild check`: self-containment check of a built tree.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;

use coursebuild_fs::{check_self_contained, FsError};

/// Arguments for `coursebuild check`.
#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Root of the tree to check.
    pub path: PathBuf,
}

impl CheckArgs {
    pub fn run(self) -> Result<()> {
        match check_self_contained(&self.path) {
            Ok(()) => {
                println!("{} {} is self-contained", "✓".green(), self.path.display());
                Ok(())
            }
            Err(err @ FsError::Containment { .. }) => {
                Err(err).context(format!("{} is not self-contained", self.path.display()))
            }
            Err(err) => Err(err).with_context(|| format!("could not check {}", self.path.display())),
        }
    }
}
