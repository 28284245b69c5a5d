//! `coursebuild status`: latest update per course, read from the ledger.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use coursebuild_core::courses::load_course_at;
use coursebuild_core::settings::ledger_dir_at;
use coursebuild_core::{CourseKey, UpdateStatus};
use coursebuild_daemon::{all_course_status, course_status, CourseStatus};
use coursebuild_sync::FileLedger;

/// Arguments for `coursebuild status`.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Show one course, including the log of its latest update.
    pub course: Option<String>,

    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct StatusTableRow {
    #[tabled(rename = "course")]
    course: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "update")]
    update: String,
    #[tabled(rename = "requested")]
    requested: String,
    #[tabled(rename = "commit")]
    commit: String,
    #[tabled(rename = "pending")]
    pending: usize,
}

impl StatusArgs {
    pub fn run(self) -> Result<()> {
        let home: PathBuf = dirs::home_dir().context("could not determine home directory")?;
        let ledger = FileLedger::new(ledger_dir_at(&home));

        let report = match self.course.as_deref() {
            Some(course) => {
                let key = CourseKey::from(course);
                load_course_at(&home, &key)
                    .with_context(|| format!("course '{key}' is not registered"))?;
                vec![course_status(&ledger, &key).context("failed to read update ledger")?]
            }
            None => all_course_status(&home, &ledger).context("failed to read update ledger")?,
        };

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&report).context("failed to render status JSON")?
            );
            return Ok(());
        }

        if report.is_empty() {
            println!("No courses registered.");
            println!("Run: coursebuild course add <key> --origin <url>");
            return Ok(());
        }

        print_table(&report);
        if self.course.is_some() {
            if let Some(latest) = report.first().and_then(|status| status.latest.as_ref()) {
                if !latest.log.is_empty() {
                    println!("\n{}", latest.log);
                }
            }
        }
        Ok(())
    }
}

fn print_table(report: &[CourseStatus]) {
    let rows: Vec<StatusTableRow> = report
        .iter()
        .map(|status| match &status.latest {
            Some(record) => StatusTableRow {
                course: status.course.clone(),
                status: colored_status(record.status),
                update: format!("#{}", record.id),
                requested: record.request_time.format("%Y-%m-%d %H:%M").to_string(),
                commit: record.commit_hash.clone().unwrap_or_else(|| "-".to_string()),
                pending: status.pending,
            },
            None => StatusTableRow {
                course: status.course.clone(),
                status: "never".dimmed().to_string(),
                update: "-".to_string(),
                requested: "-".to_string(),
                commit: "-".to_string(),
                pending: status.pending,
            },
        })
        .collect();

    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");
}

fn colored_status(status: UpdateStatus) -> String {
    let label = status.as_str();
    match status {
        UpdateStatus::Success => format!("{} {label}", "✓".green()),
        UpdateStatus::Failed => format!("{} {label}", "✗".red()),
        UpdateStatus::Running => format!("{} {label}", "●".cyan()),
        UpdateStatus::Pending => format!("{} {label}", "○".yellow()),
        UpdateStatus::Skipped => format!("{} {label}", "-".dimmed()),
    }
}
