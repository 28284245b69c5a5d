//! `git` invocation and the multi-step sync chains.
//!
//! Every call runs `git -C <path> <git_options…> <args…>` with
//! `GIT_SSH_COMMAND` pointing at the configured identity. Clone, checkout
//! and clean are ordered lists of steps; a step runs only if every earlier
//! step of the same chain succeeded, and the text of every attempted step is
//! returned to the caller in [`GitOutcome::log`].

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use coursebuild_core::Settings;

use crate::error::GitError;

/// Result of a step chain. Failures are reported here, never raised.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitOutcome {
    pub success: bool,
    /// Output of every attempted step, in order.
    pub log: String,
    /// The work tree was (re)cloned rather than updated in place.
    pub cloned: bool,
}

/// One `git` invocation within a chain.
struct Step {
    what: &'static str,
    args: Vec<OsString>,
}

impl Step {
    fn new<I, S>(what: &'static str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Self {
            what,
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GitSync {
    ssh_key_path: Option<PathBuf>,
    git_options: Vec<String>,
}

impl GitSync {
    pub fn new(ssh_key_path: Option<PathBuf>, git_options: Vec<String>) -> Self {
        Self {
            ssh_key_path,
            git_options,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.ssh_key_path.clone(), settings.git_options.clone())
    }

    // -----------------------------------------------------------------------
    // Raw calls
    // -----------------------------------------------------------------------

    /// Run one git command in `path`, returning its combined output.
    pub fn call<S: AsRef<std::ffi::OsStr>>(
        &self,
        path: &Path,
        what: &str,
        args: &[S],
    ) -> Result<String, GitError> {
        let mut command = Command::new("git");
        command.arg("-C").arg(path).args(&self.git_options).args(args);
        if let Some(key) = &self.ssh_key_path {
            command.env("GIT_SSH_COMMAND", format!("ssh -i {}", key.display()));
        }
        tracing::debug!(path = %path.display(), what, "git");

        let output = command.output().map_err(|e| GitError::Spawn {
            path: path.to_path_buf(),
            source: e,
        })?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            Ok(text)
        } else {
            Err(GitError::Command {
                what: what.to_string(),
                code: output
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "a signal".to_string()),
                output: text,
            })
        }
    }

    fn run_steps(&self, path: &Path, steps: Vec<Step>) -> GitOutcome {
        let mut outcome = GitOutcome {
            success: true,
            ..GitOutcome::default()
        };
        for step in steps {
            let shown = std::iter::once("git".to_string())
                .chain(step.args.iter().map(|a| a.to_string_lossy().into_owned()))
                .collect::<Vec<_>>()
                .join(" ");
            outcome.log.push_str(&shown);
            outcome.log.push('\n');
            match self.call(path, step.what, &step.args) {
                Ok(output) => outcome.log.push_str(&output),
                Err(e) => {
                    tracing::warn!(path = %path.display(), step = step.what, error = %e, "git step failed");
                    outcome.log.push_str(&e.to_string());
                    outcome.log.push('\n');
                    outcome.success = false;
                    break;
                }
            }
        }
        outcome
    }

    // -----------------------------------------------------------------------
    // Chains
    // -----------------------------------------------------------------------

    /// Clone `origin` into `path` if no clone with that origin exists there,
    /// otherwise fetch and hard-reset to `origin/<branch>` and bring the
    /// submodules along.
    pub fn sync(&self, path: &Path, origin: &str, branch: &str) -> GitOutcome {
        let mut outcome = GitOutcome::default();
        if self.repo_exists(path) {
            if self.remote_url(path).as_deref() == Some(origin) {
                return self.checkout(path, branch);
            }
            tracing::info!(path = %path.display(), origin, "wrong origin in repo; recloning");
            outcome.log.push_str("Wrong origin in repo, recloning\n\n");
        }
        if let Err(e) = coursebuild_fs::remove_path(path) {
            outcome.log.push_str(&format!("{e}\n"));
            return outcome;
        }
        let mut cloned = self.clone_repo(path, origin, branch);
        cloned.log.insert_str(0, &outcome.log);
        cloned
    }

    /// `git clone -b <branch> --recursive <origin> <path>`
    pub fn clone_repo(&self, path: &Path, origin: &str, branch: &str) -> GitOutcome {
        if let Err(e) = std::fs::create_dir_all(path) {
            return GitOutcome {
                success: false,
                log: format!("failed to create {}: {e}\n", path.display()),
                cloned: true,
            };
        }
        let steps = vec![Step::new(
            "clone",
            [
                OsString::from("clone"),
                OsString::from("-b"),
                OsString::from(branch),
                OsString::from("--recursive"),
                OsString::from(origin),
                path.as_os_str().to_os_string(),
            ],
        )];
        let mut outcome = self.run_steps(Path::new("."), steps);
        outcome.cloned = true;
        outcome.success = outcome.success && path.join(".git").exists();
        outcome
    }

    /// Fetch and hard-reset an existing clone, including submodules.
    pub fn checkout(&self, path: &Path, branch: &str) -> GitOutcome {
        let upstream = format!("origin/{branch}");
        let steps = vec![
            Step::new("fetch", ["fetch", "origin", branch]),
            Step::new("reset", ["reset", "-q", "--hard", upstream.as_str()]),
            Step::new("submodule sync", ["submodule", "sync", "--recursive"]),
            Step::new(
                "submodule reset",
                ["submodule", "foreach", "--recursive", "git", "reset", "-q", "--hard"],
            ),
            Step::new("submodule update", ["submodule", "update", "--init", "--recursive"]),
        ];
        self.run_steps(path, steps)
    }

    /// Remove untracked and ignored files, keeping `exclude_patterns`.
    pub fn clean(&self, path: &Path, exclude_patterns: &[String]) -> GitOutcome {
        let mut clean = vec!["clean".to_string(), "-xfd".to_string()];
        for pattern in exclude_patterns {
            clean.push("-e".to_string());
            clean.push(pattern.clone());
        }
        let steps = vec![
            Step::new("clean", clean),
            Step::new(
                "submodule clean",
                ["submodule", "foreach", "--recursive", "git", "clean", "-xfd"],
            ),
        ];
        self.run_steps(path, steps)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn repo_exists(&self, path: &Path) -> bool {
        path.join(".git").exists()
            && self
                .call(path, "rev-parse", &["rev-parse", "--is-inside-work-tree"])
                .map(|out| out.trim() == "true")
                .unwrap_or(false)
    }

    pub fn remote_url(&self, path: &Path) -> Option<String> {
        self.call(path, "remote", &["remote", "get-url", "origin"])
            .ok()
            .map(|url| url.trim().to_string())
    }

    /// `HEAD` of the work tree at `path`, if it is a repository.
    pub fn commit_hash(&self, path: &Path) -> Option<String> {
        if !path.is_dir() {
            return None;
        }
        self.call(path, "rev-parse", &["rev-parse", "HEAD"])
            .ok()
            .map(|hash| hash.trim().to_string())
            .filter(|hash| !hash.is_empty())
    }

    /// Human-readable summary of the `HEAD` commit for the build log.
    pub fn commit_metadata(&self, path: &Path) -> Result<String, GitError> {
        self.call(
            path,
            "log",
            &[
                "--no-pager",
                "log",
                "--pretty=format:------------\nCommit metadata\n\nHash:\n%H\nSubject:\n%s\nBody:\n%b\nCommitter:\n%ci\n%cn\n%ce\nAuthor:\n%ai\n%an\n%ae\n------------\n",
                "-1",
            ],
        )
    }

    /// Files that differ between `from` and `to` (`HEAD` when `None`).
    pub fn diff_names(
        &self,
        path: &Path,
        from: &str,
        to: Option<&str>,
    ) -> Result<Vec<String>, GitError> {
        let to = to.unwrap_or("HEAD");
        let output = self.call(path, "diff", &["diff", "--name-only", from, to])?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn commit_hash_of_missing_path_is_none() {
        let git = GitSync::default();
        assert_eq!(git.commit_hash(Path::new("/definitely/not/here")), None);
    }

    #[test]
    fn plain_directory_is_not_a_repo() {
        let dir = TempDir::new().expect("dir");
        let git = GitSync::default();
        assert!(!git.repo_exists(dir.path()));
    }

    #[test]
    fn failed_step_stops_the_chain() {
        let dir = TempDir::new().expect("dir");
        let git = GitSync::default();
        let outcome = git.checkout(dir.path(), "master");
        assert!(!outcome.success);
        assert!(outcome.log.contains("git fetch origin master"));
        assert!(!outcome.log.contains("git reset"));
    }
}
