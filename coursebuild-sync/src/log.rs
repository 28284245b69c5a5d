//! Per-attempt build log and step timing.

use std::time::{Duration, Instant};

/// Trailing marker on logs persisted while the attempt is still running.
pub const PROGRESS_MARKER: &str = "\n\n...";

/// Human-readable log of one update attempt. Every line is also emitted
/// through `tracing`.
#[derive(Debug, Default, Clone)]
pub struct BuildLog {
    course: String,
    buf: String,
}

impl BuildLog {
    pub fn new(course: impl Into<String>) -> Self {
        Self {
            course: course.into(),
            buf: String::new(),
        }
    }

    pub fn info(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::info!(course = %self.course, "{message}");
        self.push_line(message);
    }

    pub fn warn(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::warn!(course = %self.course, "{message}");
        self.push_line(message);
    }

    pub fn error(&mut self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::error!(course = %self.course, "{message}");
        self.push_line(message);
    }

    /// Verbatim command output; logged at debug level only.
    pub fn output(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        tracing::debug!(course = %self.course, "{text}");
        self.buf.push_str(text);
        if !text.ends_with('\n') {
            self.buf.push('\n');
        }
    }

    fn push_line(&mut self, message: &str) {
        self.buf.push_str(message);
        self.buf.push('\n');
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    /// The log as persisted between steps.
    pub fn in_progress(&self) -> String {
        format!("{}{PROGRESS_MARKER}", self.buf)
    }
}

/// Wall-clock duration of each orchestrator step.
#[derive(Debug, Default)]
pub struct StepTimer {
    steps: Vec<(&'static str, Duration)>,
    current: Option<(&'static str, Instant)>,
}

impl StepTimer {
    /// Finish the running step, if any, and start `name`.
    pub fn start(&mut self, name: &'static str) {
        self.finish();
        self.current = Some((name, Instant::now()));
    }

    pub fn finish(&mut self) {
        if let Some((name, started)) = self.current.take() {
            self.steps.push((name, started.elapsed()));
        }
    }

    pub fn steps(&self) -> &[(&'static str, Duration)] {
        &self.steps
    }

    pub fn table(&self) -> String {
        let width = self.steps.iter().map(|(n, _)| n.len()).max().unwrap_or(0);
        let mut out = String::from("Time taken for each step in seconds:\n");
        for (name, took) in &self.steps {
            out.push_str(&format!("{name:<width$}  {:>8.3}\n", took.as_secs_f64()));
        }
        out
    }
}
