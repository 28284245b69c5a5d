//! Service-wide settings.
//!
//! # Storage layout
//!
//! ```text
//! ~/.coursebuild/
//!   settings.yaml         (mode 0600; every field optional)
//!   courses/<key>.yaml    (see [`crate::courses`])
//!   ledger/<key>.json     (update ledger, owned by coursebuild-sync)
//!   build/ store/ publish/ sources/   (default stage roots)
//! ```
//!
//! Like the course registry, every function taking a home directory has an
//! `_at` form; the plain form derives home from `dirs::home_dir()`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, CoreError};
use crate::types::{CourseKey, Stage};

// ---------------------------------------------------------------------------
// 1. Backend selection
// ---------------------------------------------------------------------------

/// Which build backend runs the per-course build step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BuildBackendSettings {
    /// `docker run` with the course mounted at `/content`.
    Docker {
        /// Path of the build root as seen by the docker host, when the
        /// service itself runs in a container.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        host_build_path: Option<PathBuf>,
        #[serde(default = "default_docker_bin")]
        docker_bin: String,
    },
    /// Builds always succeed without running anything.
    #[serde(rename = "none")]
    Noop,
}

impl Default for BuildBackendSettings {
    fn default() -> Self {
        BuildBackendSettings::Docker {
            host_build_path: None,
            docker_bin: default_docker_bin(),
        }
    }
}

fn default_docker_bin() -> String {
    "docker".to_string()
}

// ---------------------------------------------------------------------------
// 2. Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub build_path: PathBuf,
    pub store_path: PathBuf,
    pub publish_path: PathBuf,
    /// Fallback sources for courses without a git origin.
    pub local_course_source_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_key_path: Option<PathBuf>,
    /// Extra options placed between `git -C <path>` and the subcommand.
    pub git_options: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_cmd: Option<String>,
    pub build_backend: BuildBackendSettings,
    pub build_filelock_timeout_secs: u64,
    pub publish_filelock_timeout_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frontend_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frontend_token: Option<String>,
    pub static_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub static_content_host: Option<String>,
    /// RUNNING records older than this are considered abandoned.
    pub running_lease_secs: u64,
    pub retry_delay_secs: u64,
    pub workers: usize,
    pub ledger_keep: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            build_path: PathBuf::new(),
            store_path: PathBuf::new(),
            publish_path: PathBuf::new(),
            local_course_source_path: PathBuf::new(),
            ssh_key_path: None,
            git_options: Vec::new(),
            default_image: None,
            default_cmd: None,
            build_backend: BuildBackendSettings::default(),
            build_filelock_timeout_secs: 300,
            publish_filelock_timeout_secs: 30,
            frontend_url: None,
            frontend_token: None,
            static_url: "/static/".to_string(),
            static_content_host: None,
            running_lease_secs: 7200,
            retry_delay_secs: 5,
            workers: 2,
            ledger_keep: 10,
        }
    }
}

impl Settings {
    /// Settings whose stage roots all live under `root`. Used by tests and
    /// by `load_at` to fill roots left empty in `settings.yaml`.
    pub fn rooted_at(root: &Path) -> Self {
        let mut settings = Settings::default();
        settings.fill_roots(root);
        settings
    }

    fn fill_roots(&mut self, root: &Path) {
        for (field, name) in [
            (&mut self.build_path, "build"),
            (&mut self.store_path, "store"),
            (&mut self.publish_path, "publish"),
            (&mut self.local_course_source_path, "sources"),
        ] {
            if field.as_os_str().is_empty() {
                *field = root.join(name);
            }
        }
    }

    pub fn stage_root(&self, stage: Stage) -> &Path {
        match stage {
            Stage::Build => &self.build_path,
            Stage::Store => &self.store_path,
            Stage::Publish => &self.publish_path,
        }
    }

    /// `<stage_root>/<key>/`
    pub fn course_dir(&self, stage: Stage, key: &CourseKey) -> PathBuf {
        self.stage_root(stage).join(key.as_str())
    }

    /// `<stage_root>/<key>.defaults.json`
    pub fn defaults_file(&self, stage: Stage, key: &CourseKey) -> PathBuf {
        self.stage_root(stage)
            .join(format!("{}.defaults.json", key.as_str()))
    }

    /// `<stage_root>/<key>.version`
    pub fn version_file(&self, stage: Stage, key: &CourseKey) -> PathBuf {
        self.stage_root(stage).join(format!("{}.version", key.as_str()))
    }

    pub fn build_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.build_filelock_timeout_secs)
    }

    pub fn publish_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_filelock_timeout_secs)
    }

    pub fn running_lease(&self) -> Duration {
        Duration::from_secs(self.running_lease_secs)
    }
}

// ---------------------------------------------------------------------------
// 3. Paths
// ---------------------------------------------------------------------------

/// `<home>/.coursebuild/`
pub fn data_dir_at(home: &Path) -> PathBuf {
    home.join(".coursebuild")
}

/// `<home>/.coursebuild/settings.yaml`
pub fn settings_path_at(home: &Path) -> PathBuf {
    data_dir_at(home).join("settings.yaml")
}

/// `<home>/.coursebuild/ledger/`
pub fn ledger_dir_at(home: &Path) -> PathBuf {
    data_dir_at(home).join("ledger")
}

/// `ledger_dir_at` convenience wrapper.
pub fn ledger_dir() -> Result<PathBuf, CoreError> {
    Ok(ledger_dir_at(&home()?))
}

// ---------------------------------------------------------------------------
// 4. Load / save
// ---------------------------------------------------------------------------

/// Load settings; a missing file yields the defaults. Empty stage roots are
/// placed under `<home>/.coursebuild/`.
pub fn load_at(home: &Path) -> Result<Settings, CoreError> {
    let path = settings_path_at(home);
    let mut settings = if path.exists() {
        let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        if contents.trim().is_empty() {
            Settings::default()
        } else {
            serde_yaml::from_str(&contents).map_err(|e| CoreError::Parse { path, source: e })?
        }
    } else {
        Settings::default()
    };
    settings.fill_roots(&data_dir_at(home));
    Ok(settings)
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<Settings, CoreError> {
    load_at(&home()?)
}

/// Atomically write `settings.yaml` (tmp sibling, `chmod 0600`, rename).
pub fn save_at(home: &Path, settings: &Settings) -> Result<(), CoreError> {
    let yaml = serde_yaml::to_string(settings)?;
    write_private(&settings_path_at(home), yaml.as_bytes())
}

// ---------------------------------------------------------------------------
// Crate helpers
// ---------------------------------------------------------------------------

pub(crate) fn home() -> Result<PathBuf, CoreError> {
    dirs::home_dir().ok_or(CoreError::HomeNotFound)
}

/// Write `contents` to `path` through a `.tmp` sibling in the same directory.
pub(crate) fn write_private(path: &Path, contents: &[u8]) -> Result<(), CoreError> {
    if let Some(dir) = path.parent() {
        if !dir.exists() {
            std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
            set_mode(dir, 0o700)?;
        }
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    std::fs::write(&tmp, contents).map_err(|e| io_err(&tmp, e))?;
    set_mode(&tmp, 0o600)?;
    std::fs::rename(&tmp, path).map_err(|e| io_err(path, e))?;
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<(), CoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<(), CoreError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults_under_home() {
        let home = TempDir::new().expect("home");
        let settings = load_at(home.path()).expect("load");
        assert_eq!(settings.build_filelock_timeout_secs, 300);
        assert_eq!(settings.publish_filelock_timeout_secs, 30);
        assert_eq!(settings.ledger_keep, 10);
        assert_eq!(settings.static_url, "/static/");
        assert!(settings.store_path.ends_with(".coursebuild/store"));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let home = TempDir::new().expect("home");
        let dir = data_dir_at(home.path());
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(
            dir.join("settings.yaml"),
            "publish_path: /srv/courses\nworkers: 4\nbuild_backend:\n  kind: none\n",
        )
        .expect("write");

        let settings = load_at(home.path()).expect("load");
        assert_eq!(settings.publish_path, PathBuf::from("/srv/courses"));
        assert_eq!(settings.workers, 4);
        assert_eq!(settings.build_backend, BuildBackendSettings::Noop);
        assert!(settings.build_path.ends_with(".coursebuild/build"));
    }

    #[test]
    fn stage_artifacts_sit_beside_course_dir() {
        let settings = Settings::rooted_at(Path::new("/srv/cb"));
        let key = CourseKey::from("prog1");
        assert_eq!(
            settings.course_dir(Stage::Store, &key),
            PathBuf::from("/srv/cb/store/prog1")
        );
        assert_eq!(
            settings.defaults_file(Stage::Publish, &key),
            PathBuf::from("/srv/cb/publish/prog1.defaults.json")
        );
        assert_eq!(
            settings.version_file(Stage::Build, &key),
            PathBuf::from("/srv/cb/build/prog1.version")
        );
    }

    #[test]
    fn docker_backend_defaults_binary() {
        let backend: BuildBackendSettings =
            serde_yaml::from_str("kind: docker\nhost_build_path: /host/build\n").expect("parse");
        match backend {
            BuildBackendSettings::Docker {
                host_build_path,
                docker_bin,
            } => {
                assert_eq!(host_build_path, Some(PathBuf::from("/host/build")));
                assert_eq!(docker_bin, "docker");
            }
            other => panic!("expected docker backend, got {other:?}"),
        }
    }

    #[test]
    fn save_then_load_preserves_fields() {
        let home = TempDir::new().expect("home");
        let mut settings = Settings::rooted_at(home.path());
        settings.frontend_url = Some("https://plus.example.org".to_string());
        settings.git_options = vec!["-c".to_string(), "core.quotepath=off".to_string()];
        save_at(home.path(), &settings).expect("save");

        let loaded = load_at(home.path()).expect("load");
        assert_eq!(loaded, settings);
        assert!(!settings_path_at(home.path())
            .with_file_name("settings.yaml.tmp")
            .exists());
    }

    #[test]
    fn course_dir_is_key_under_stage_root() {
        let settings = Settings::rooted_at(Path::new("/data"));
        let key = CourseKey::from("prog1");
        assert_eq!(
            settings.course_dir(Stage::Publish, &key),
            PathBuf::from("/data/publish/prog1")
        );
    }
}
