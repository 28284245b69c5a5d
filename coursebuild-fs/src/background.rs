//! Fire-and-forget background jobs.
//!
//! Jobs are closures run on tokio's blocking pool, one after another, each
//! with its own retry budget. Callers never learn whether a job succeeded;
//! failures are logged once the budget is exhausted. `flush` waits for every
//! job queued before it and exists for tests and orderly shutdown.

use std::path::PathBuf;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

use crate::error::FsError;
use crate::tree::remove_path;

type Work = Box<dyn FnMut() -> Result<(), FsError> + Send + 'static>;

/// One unit of background work.
pub struct Job {
    name: String,
    retries: u32,
    delay: Duration,
    work: Work,
}

impl Job {
    /// A job attempted exactly once.
    pub fn new(
        name: impl Into<String>,
        work: impl FnMut() -> Result<(), FsError> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            retries: 0,
            delay: Duration::ZERO,
            work: Box::new(work),
        }
    }

    /// Retry up to `retries` more times, waiting `delay` before each retry.
    pub fn with_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.retries = retries;
        self.delay = delay;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Delete `paths` (files, symlinks or whole trees): 2 retries, 3 s apart.
    pub fn remove_paths(paths: Vec<PathBuf>) -> Self {
        Job::new(format!("remove {} path(s)", paths.len()), move || {
            for path in &paths {
                remove_path(path)?;
            }
            Ok(())
        })
        .with_retries(2, Duration::from_secs(3))
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.name)
            .field("retries", &self.retries)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

enum Message {
    Run(Job),
    Flush(oneshot::Sender<()>),
}

/// Handle to the background worker. Cheap to clone.
#[derive(Clone, Debug)]
pub struct BackgroundQueue {
    tx: mpsc::UnboundedSender<Message>,
}

impl BackgroundQueue {
    /// Start the worker as a task on an existing runtime.
    pub fn spawn_on(handle: &Handle) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        handle.spawn(worker(rx));
        Self { tx }
    }

    /// Start the worker on its own thread with a private runtime, for
    /// callers that are not inside tokio (the CLI's foreground mode).
    pub fn standalone() -> Result<Self, FsError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| crate::error::io_err("<background runtime>", e))?;
        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("coursebuild-background".to_string())
            .spawn(move || runtime.block_on(worker(rx)))
            .map_err(|e| crate::error::io_err("<background thread>", e))?;
        Ok(Self { tx })
    }

    /// Queue a job. Never blocks; a stopped worker drops the job with a warning.
    pub fn submit(&self, job: Job) {
        tracing::debug!(job = %job.name, "background job queued");
        if let Err(mpsc::error::SendError(Message::Run(job))) = self.tx.send(Message::Run(job)) {
            tracing::warn!(job = %job.name, "background worker stopped; job dropped");
        }
    }

    /// Wait until every job submitted before this call has finished.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Message::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// [`flush`](Self::flush) for synchronous callers outside the runtime.
    pub fn flush_blocking(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Message::Flush(tx)).is_ok() {
            let _ = rx.blocking_recv();
        }
    }
}

async fn worker(mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = rx.recv().await {
        match message {
            Message::Run(job) => run_job(job).await,
            Message::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("background worker stopped");
}

async fn run_job(mut job: Job) {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let outcome = tokio::task::spawn_blocking(move || {
            let result = (job.work)();
            (job, result)
        })
        .await;

        let (returned, result) = match outcome {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(error = %e, "background job panicked");
                return;
            }
        };
        job = returned;

        match result {
            Ok(()) => {
                tracing::debug!(job = %job.name, attempt, "background job done");
                return;
            }
            Err(e) if attempt <= job.retries => {
                tracing::warn!(job = %job.name, attempt, error = %e, "background job failed; retrying");
                tokio::time::sleep(job.delay).await;
            }
            Err(e) => {
                tracing::error!(job = %job.name, attempt, error = %e, "background job failed");
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
