//! Shared fixture for hub integration tests.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use hive::agent::client::{MockWorkerClient, WorkerClient, WorkerStatus};
use hive::config::PORT_RANGE;
use hive::{Config, Hub};
use tempfile::TempDir;

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

/// Writes a fake probe binary that just stays alive.
pub fn fake_probe(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("fake-probe");
    std::fs::write(&path, "#!/bin/sh\nsleep 300\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A hub wired to a mock drone client, plus the tempdirs keeping it alive.
pub struct TestHub {
    pub hub: Arc<Hub>,
    pub mock: Arc<MockWorkerClient>,
    pub base_url: String,
    pub repo: TempDir,
    pub _trees: TempDir,
    pub _bin: TempDir,
}

/// Builds a hub over throwaway directories and serves it on an ephemeral
/// port. `base_port` must be unique per test to keep port scans disjoint.
pub async fn start_hub(base_port: u16) -> TestHub {
    let repo = TempDir::new().unwrap();
    let trees = TempDir::new().unwrap();
    let bin = TempDir::new().unwrap();
    init_repo(repo.path());

    let mut config = Config::new(repo.path().to_path_buf());
    config.worktrees_dir = trees.path().to_path_buf();
    config.base_port = base_port;
    config.probe_bin = fake_probe(bin.path()).to_string_lossy().to_string();
    config.readiness_timeout = std::time::Duration::from_secs(5);

    let mock = Arc::new(MockWorkerClient::new());
    for port in base_port..base_port + PORT_RANGE {
        mock.set_status(port, WorkerStatus::Ready);
    }

    let hub = Arc::new(
        Hub::with_client(config, Arc::clone(&mock) as Arc<dyn WorkerClient>).unwrap(),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serve_hub = Arc::clone(&hub);
    tokio::spawn(async move {
        let _ = serve_hub.serve(listener).await;
    });

    TestHub {
        hub,
        mock,
        base_url: format!("http://{addr}"),
        repo,
        _trees: trees,
        _bin: bin,
    }
}
