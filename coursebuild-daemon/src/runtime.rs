use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::JoinSet;

use coursebuild_core::courses::load_course_at;
use coursebuild_core::{CourseKey, Stage, VersionId};
use coursebuild_fs::BackgroundQueue;
use coursebuild_sync::{Orchestrator, RunOutcome};

use crate::error::{io_err, DaemonError};
use crate::paths::{logs_dir, run_dir, socket_path};
use crate::protocol::{DaemonRequest, DaemonResponse};
use crate::service::{all_course_status, course_status, courses_with_pending, open_orchestrator};

/// One course waiting for a dispatcher slot.
#[derive(Debug, Clone)]
struct BuildJob {
    course: CourseKey,
}

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(home: &Path) -> Result<(), DaemonError> {
    init_tracing();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(home.to_path_buf()))
}

/// Run the daemon runtime.
pub async fn run(home: PathBuf) -> Result<(), DaemonError> {
    ensure_runtime_dirs(&home)?;

    let queue = BackgroundQueue::spawn_on(&tokio::runtime::Handle::current());
    let orchestrator = Arc::new(open_orchestrator(&home, queue.clone())?);
    let started_at_unix = unix_seconds_now();
    tracing::info!(
        workers = orchestrator.settings().workers,
        build = %orchestrator.settings().build_path.display(),
        "coursebuild daemon starting",
    );

    let (job_tx, job_rx) = mpsc::channel::<BuildJob>(256);
    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let dispatcher_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let orchestrator = orchestrator.clone();
        let job_tx = job_tx.clone();
        tokio::spawn(async move {
            let result =
                dispatcher_task(home, orchestrator, job_tx, job_rx, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        let orchestrator = orchestrator.clone();
        let job_tx = job_tx.clone();
        tokio::spawn(async move {
            let result = socket_server_task(
                home,
                orchestrator,
                job_tx,
                shutdown.clone(),
                shutdown.subscribe(),
                started_at_unix,
            )
            .await;
            let _ = shutdown.send(());
            result
        })
    };
    drop(job_tx);

    let rotation_handle = {
        let shutdown = shutdown_tx.clone();
        let home = home.clone();
        tokio::spawn(async move {
            let result = log_rotation_task(home, shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            let mut shutdown_rx = shutdown.subscribe();
            tokio::select! {
                _ = shutdown_rx.recv() => Ok(()),
                signal = tokio::signal::ctrl_c() => {
                    match signal {
                        Ok(()) => {
                            tracing::info!("received ctrl-c, shutting down daemon");
                            let _ = shutdown.send(());
                            Ok(())
                        }
                        Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
                    }
                }
            }
        })
    };

    let (dispatcher_result, socket_result, rotation_result, signal_result) = tokio::join!(
        dispatcher_handle,
        socket_handle,
        rotation_handle,
        signal_handle
    );

    queue.flush().await;
    handle_join("dispatcher", dispatcher_result)?;
    handle_join("socket_server", socket_result)?;
    handle_join("log_rotation", rotation_result)?;
    handle_join("signal_handler", signal_result)?;
    tracing::info!("coursebuild daemon stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

async fn dispatcher_task(
    home: PathBuf,
    orchestrator: Arc<Orchestrator>,
    job_tx: mpsc::Sender<BuildJob>,
    mut job_rx: mpsc::Receiver<BuildJob>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let permits = Arc::new(Semaphore::new(orchestrator.settings().workers.max(1)));
    let retry_delay = Duration::from_secs(orchestrator.settings().retry_delay_secs);
    let mut running = JoinSet::new();

    // Updates left PENDING by a previous daemon.
    let recovered = {
        let home = home.clone();
        let orchestrator = orchestrator.clone();
        blocking(move || courses_with_pending(&home, orchestrator.ledger().as_ref())).await?
    };
    for course in recovered {
        tracing::info!(course = %course, "resuming pending update");
        running.spawn(run_job(
            home.clone(),
            orchestrator.clone(),
            permits.clone(),
            job_tx.clone(),
            retry_delay,
            course,
        ));
    }

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            maybe_job = job_rx.recv() => {
                let Some(job) = maybe_job else { break };
                running.spawn(run_job(
                    home.clone(),
                    orchestrator.clone(),
                    permits.clone(),
                    job_tx.clone(),
                    retry_delay,
                    job.course,
                ));
            }
            Some(joined) = running.join_next(), if !running.is_empty() => {
                if let Err(err) = joined {
                    tracing::error!(error = %err, "build job panicked");
                }
            }
        }
    }

    // Builds cannot be interrupted; requeues from here on are dropped and
    // picked up again from the ledger on the next start.
    drop(job_rx);
    if !running.is_empty() {
        tracing::info!(jobs = running.len(), "waiting for running builds to finish");
    }
    while let Some(joined) = running.join_next().await {
        if let Err(err) = joined {
            tracing::error!(error = %err, "build job panicked");
        }
    }
    Ok(())
}

async fn run_job(
    home: PathBuf,
    orchestrator: Arc<Orchestrator>,
    permits: Arc<Semaphore>,
    job_tx: mpsc::Sender<BuildJob>,
    retry_delay: Duration,
    course: CourseKey,
) {
    let Ok(permit) = permits.acquire_owned().await else {
        return;
    };
    let key = course.clone();
    let result = blocking(move || {
        let source = load_course_at(&home, &key)?;
        Ok(orchestrator.run(&source)?)
    })
    .await;
    drop(permit);

    match result {
        Ok(RunOutcome::Finished(record)) => tracing::info!(
            course = %course,
            record = record.id,
            status = %record.status,
            "update finished",
        ),
        Ok(RunOutcome::NothingPending) => {
            tracing::debug!(course = %course, "no pending update");
        }
        Ok(RunOutcome::Locked) => {
            tracing::info!(course = %course, delay_secs = retry_delay.as_secs(), "course busy; requeueing");
            tokio::time::sleep(retry_delay).await;
            if job_tx.send(BuildJob { course: course.clone() }).await.is_err() {
                tracing::warn!(course = %course, "dispatcher stopped; requeue dropped");
            }
        }
        Err(err) => tracing::error!(course = %course, error = %err, "update run failed"),
    }
}

// ---------------------------------------------------------------------------
// Socket server
// ---------------------------------------------------------------------------

async fn socket_server_task(
    home: PathBuf,
    orchestrator: Arc<Orchestrator>,
    job_tx: mpsc::Sender<BuildJob>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
    started_at_unix: u64,
) -> Result<(), DaemonError> {
    let socket = socket_path(&home);
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let home = home.clone();
                let orchestrator = orchestrator.clone();
                let job_tx = job_tx.clone();
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(
                        stream,
                        home,
                        orchestrator,
                        job_tx,
                        shutdown_tx,
                        started_at_unix,
                    ).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    home: PathBuf,
    orchestrator: Arc<Orchestrator>,
    job_tx: mpsc::Sender<BuildJob>,
    shutdown_tx: broadcast::Sender<()>,
    started_at_unix: u64,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        let cmd = request.cmd.clone();
        let response = match cmd.as_str() {
            "status" => {
                into_response(status_payload(&home, &orchestrator, request.course, started_at_unix).await)
            }
            "trigger" => into_response(handle_trigger(&home, &orchestrator, &job_tx, request).await),
            "publish" => into_response(handle_publish(&orchestrator, request).await),
            "stop" => {
                let _ = shutdown_tx.send(());
                DaemonResponse::ok(json!({ "stopping": true }))
            }
            other => DaemonResponse::error(format!("unknown command '{other}'")),
        };

        write_response(&mut writer, &response).await?;
        if cmd == "stop" {
            break;
        }
    }

    Ok(())
}

fn into_response(result: Result<Value, DaemonError>) -> DaemonResponse {
    match result {
        Ok(data) => DaemonResponse::ok(data),
        Err(err) => DaemonResponse::error(err.to_string()),
    }
}

fn required(value: Option<String>, field: &str) -> Result<String, DaemonError> {
    value.ok_or_else(|| DaemonError::Protocol(format!("missing field '{field}'")))
}

async fn handle_trigger(
    home: &Path,
    orchestrator: &Arc<Orchestrator>,
    job_tx: &mpsc::Sender<BuildJob>,
    request: DaemonRequest,
) -> Result<Value, DaemonError> {
    let key = CourseKey::from(required(request.course, "course")?);
    let trigger = request.trigger.unwrap_or_default();
    let record = {
        let home = home.to_path_buf();
        let orchestrator = orchestrator.clone();
        let key = key.clone();
        blocking(move || {
            let source = load_course_at(&home, &key)?;
            Ok(orchestrator.trigger(&source, trigger)?)
        })
        .await?
    };
    job_tx
        .send(BuildJob {
            course: key.clone(),
        })
        .await
        .map_err(|_| DaemonError::ChannelClosed("build queue"))?;
    Ok(json!({
        "course": key.as_str(),
        "record": record.id,
        "status": record.status,
    }))
}

async fn handle_publish(
    orchestrator: &Arc<Orchestrator>,
    request: DaemonRequest,
) -> Result<Value, DaemonError> {
    let key = CourseKey::from(required(request.course, "course")?);
    let version = VersionId::from(required(request.version, "version")?);
    let from = request.from.unwrap_or(Stage::Store);
    let orchestrator = orchestrator.clone();
    blocking(move || {
        let errors = orchestrator.stages().publish(&key, from, &version)?;
        Ok(json!({
            "course": key.as_str(),
            "version": version.as_str(),
            "from": from,
            "errors": errors,
        }))
    })
    .await
}

async fn status_payload(
    home: &Path,
    orchestrator: &Arc<Orchestrator>,
    course: Option<String>,
    started_at_unix: u64,
) -> Result<Value, DaemonError> {
    let courses = {
        let home = home.to_path_buf();
        let orchestrator = orchestrator.clone();
        blocking(move || match course {
            Some(course) => Ok(vec![course_status(
                orchestrator.ledger().as_ref(),
                &CourseKey::from(course),
            )?]),
            None => all_course_status(&home, orchestrator.ledger().as_ref()),
        })
        .await?
    };
    Ok(json!({
        "running": true,
        "started_at_unix": started_at_unix,
        "workers": orchestrator.settings().workers,
        "socket": socket_path(home).display().to_string(),
        "courses": courses,
    }))
}

// ---------------------------------------------------------------------------
// Housekeeping
// ---------------------------------------------------------------------------

async fn log_rotation_task(
    home: PathBuf,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                let home = home.clone();
                tokio::task::spawn_blocking(move || {
                    crate::log_rotation::rotate_logs(&home);
                })
                .await
                .ok();
            }
        }
    }
    Ok(())
}

/// Run `f` on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, DaemonError>
where
    F: FnOnce() -> Result<T, DaemonError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| DaemonError::Protocol(format!("blocking task join error: {err}")))?
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

fn ensure_runtime_dirs(home: &Path) -> Result<(), DaemonError> {
    for dir in [run_dir(home), logs_dir(home)] {
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
    }
    Ok(())
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

fn unix_seconds_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Human-readable logs on stderr; `RUST_LOG` overrides the `info` default.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<(), DaemonError> {
    Ok(())
}
