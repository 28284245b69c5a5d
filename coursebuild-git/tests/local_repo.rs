//! GitSync against real repositories on the local filesystem.
//!
//! Every test returns early when no `git` binary is available.

use std::fs;
use std::path::Path;
use std::process::Command;

use coursebuild_git::{GitSync, RepoDiff, DiffSource};
use tempfile::TempDir;

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .env("GIT_AUTHOR_NAME", "Course Staff")
        .env("GIT_AUTHOR_EMAIL", "staff@example.org")
        .env("GIT_COMMITTER_NAME", "Course Staff")
        .env("GIT_COMMITTER_EMAIL", "staff@example.org")
        .output()
        .expect("git runs");
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// An origin repository on branch `master` with one commit.
fn origin(dir: &TempDir) -> std::path::PathBuf {
    let origin = dir.path().join("origin");
    fs::create_dir_all(&origin).expect("mkdir");
    git(&origin, &["init", "-q"]);
    git(&origin, &["symbolic-ref", "HEAD", "refs/heads/master"]);
    fs::write(origin.join("index.yaml"), "name: Course\n").expect("write");
    git(&origin, &["add", "."]);
    git(&origin, &["commit", "-q", "-m", "initial"]);
    origin
}

fn commit_file(repo: &Path, name: &str, contents: &str) -> String {
    fs::write(repo.join(name), contents).expect("write");
    git(repo, &["add", "."]);
    git(repo, &["commit", "-q", "-m", name]);
    git(repo, &["rev-parse", "HEAD"])
}

#[test]
fn sync_clones_then_checks_out_new_commits() {
    if !git_available() {
        return;
    }
    let dir = TempDir::new().expect("dir");
    let origin = origin(&dir);
    let url = origin.to_string_lossy().into_owned();
    let work = dir.path().join("build/course");
    let sync = GitSync::default();

    let first = sync.sync(&work, &url, "master");
    assert!(first.success, "clone failed: {}", first.log);
    assert!(first.cloned);
    let before = sync.commit_hash(&work).expect("hash");

    let after_hash = commit_file(&origin, "chapter.rst", "text");
    let second = sync.sync(&work, &url, "master");
    assert!(second.success, "checkout failed: {}", second.log);
    assert!(!second.cloned);
    assert!(second.log.contains("git fetch origin master"));
    assert_eq!(sync.commit_hash(&work).as_deref(), Some(after_hash.as_str()));

    let diff = RepoDiff::new(&sync, &work);
    assert_eq!(
        diff.diff_names(&before, None).expect("diff"),
        vec!["chapter.rst".to_string()]
    );
    assert!(sync
        .commit_metadata(&work)
        .expect("metadata")
        .contains(&after_hash));
}

#[test]
fn sync_reclones_on_origin_change() {
    if !git_available() {
        return;
    }
    let dir = TempDir::new().expect("dir");
    let first_origin = origin(&dir);
    let second_origin = dir.path().join("fork");
    git(
        dir.path(),
        &["clone", "-q", first_origin.to_str().expect("utf8"), "fork"],
    );
    let work = dir.path().join("course");
    let sync = GitSync::default();

    assert!(sync.sync(&work, first_origin.to_str().expect("utf8"), "master").success);
    let outcome = sync.sync(&work, second_origin.to_str().expect("utf8"), "master");
    assert!(outcome.success, "reclone failed: {}", outcome.log);
    assert!(outcome.cloned);
    assert!(outcome.log.contains("recloning"));
    assert_eq!(
        sync.remote_url(&work).as_deref(),
        second_origin.to_str()
    );
}

#[test]
fn clean_keeps_excluded_patterns() {
    if !git_available() {
        return;
    }
    let dir = TempDir::new().expect("dir");
    let origin = origin(&dir);
    let work = dir.path().join("course");
    let sync = GitSync::default();
    assert!(sync.sync(&work, origin.to_str().expect("utf8"), "master").success);

    fs::create_dir_all(work.join("_build")).expect("mkdir");
    fs::write(work.join("_build/page.html"), "built").expect("write");
    fs::write(work.join("scratch.tmp"), "junk").expect("write");

    let outcome = sync.clean(&work, &["_build".to_string()]);
    assert!(outcome.success, "clean failed: {}", outcome.log);
    assert!(work.join("_build/page.html").exists());
    assert!(!work.join("scratch.tmp").exists());
    assert!(work.join("index.yaml").exists());
}
