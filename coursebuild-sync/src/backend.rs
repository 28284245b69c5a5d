//! Build backends: the strategy that turns a course source tree into built
//! material. Chosen once from settings and handed to the orchestrator.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use coursebuild_core::{BuildBackendSettings, CourseKey, Settings};

use crate::log::BuildLog;

/// Everything a backend needs for one build.
#[derive(Debug, Clone)]
pub struct BuildRequest<'a> {
    pub course: &'a CourseKey,
    /// Tree to build in place.
    pub path: &'a Path,
    pub image: &'a str,
    /// `None` runs the image's default command.
    pub command: Option<&'a [String]>,
    pub env: &'a BTreeMap<String, String>,
}

pub trait BuildBackend: Send + Sync {
    /// Build in place. Output goes to `log`; failure is reported, not raised.
    fn build(&self, request: &BuildRequest<'_>, log: &mut BuildLog) -> bool;
}

/// Backend for `settings.build_backend`.
pub fn resolve_backend(settings: &Settings) -> Arc<dyn BuildBackend> {
    match &settings.build_backend {
        BuildBackendSettings::Docker {
            host_build_path,
            docker_bin,
        } => Arc::new(DockerBackend {
            docker_bin: docker_bin.clone(),
            build_root: settings.build_path.clone(),
            host_build_path: host_build_path.clone(),
        }),
        BuildBackendSettings::Noop => Arc::new(NoopBackend),
    }
}

// ---------------------------------------------------------------------------
// Docker
// ---------------------------------------------------------------------------

/// `docker run -e K=V… -v <tree>:/content --workdir /content <image> [cmd…]`
#[derive(Debug, Clone)]
pub struct DockerBackend {
    pub docker_bin: String,
    pub build_root: PathBuf,
    /// Where `build_root` is visible to the docker daemon, when this process
    /// itself runs in a container.
    pub host_build_path: Option<PathBuf>,
}

impl DockerBackend {
    fn mount_source(&self, path: &Path) -> PathBuf {
        match (&self.host_build_path, path.strip_prefix(&self.build_root)) {
            (Some(host), Ok(rel)) => host.join(rel),
            _ => path.to_path_buf(),
        }
    }

    pub fn args(&self, request: &BuildRequest<'_>) -> Vec<String> {
        let mut args = vec!["run".to_string()];
        for (key, value) in request.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push("-v".to_string());
        args.push(format!("{}:/content", self.mount_source(request.path).display()));
        args.push("--workdir".to_string());
        args.push("/content".to_string());
        args.push(request.image.to_string());
        if let Some(command) = request.command {
            args.extend(command.iter().cloned());
        }
        args
    }
}

impl BuildBackend for DockerBackend {
    fn build(&self, request: &BuildRequest<'_>, log: &mut BuildLog) -> bool {
        let args = self.args(request);
        log.info(format!("{} {}", self.docker_bin, args.join(" ")));
        match Command::new(&self.docker_bin).args(&args).output() {
            Ok(output) => {
                log.output(&String::from_utf8_lossy(&output.stdout));
                log.output(&String::from_utf8_lossy(&output.stderr));
                output.status.success()
            }
            Err(e) => {
                log.error(format!("failed to run {}: {e}", self.docker_bin));
                false
            }
        }
    }
}

/// Accepts every build without doing anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBackend;

impl BuildBackend for NoopBackend {
    fn build(&self, request: &BuildRequest<'_>, log: &mut BuildLog) -> bool {
        log.info(format!(
            "No build backend configured; leaving {} as is",
            request.path.display()
        ));
        true
    }
}
