//! Shared fixtures for unit tests.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Creates a throwaway git repo with one commit on `main`.
pub fn init_repo(dir: &Path) {
    let run = |args: &[&str]| {
        let status = Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_NAME", "test")
            .env("GIT_AUTHOR_EMAIL", "test@test")
            .env("GIT_COMMITTER_NAME", "test")
            .env("GIT_COMMITTER_EMAIL", "test@test")
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?} failed");
    };
    run(&["init", "-b", "main"]);
    std::fs::write(dir.join("README.md"), "hive test repo\n").unwrap();
    run(&["add", "."]);
    run(&["commit", "-m", "init"]);
}

/// Writes a fake probe binary that just stays alive, and returns its path.
pub fn fake_probe(dir: &Path) -> PathBuf {
    let path = dir.join("fake-probe");
    std::fs::write(&path, "#!/bin/sh\nsleep 300\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
