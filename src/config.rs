//! Hub configuration.
//!
//! Configuration comes from the environment with sensible defaults; there is
//! no config file. The hub needs a host repository, a directory to keep
//! worktrees in, and the two port settings (its own listen port and the base
//! of the drone port range).

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Default port the hub HTTP server listens on.
pub const DEFAULT_HUB_PORT: u16 = 7433;

/// Default base of the drone port range.
pub const DEFAULT_BASE_PORT: u16 = 7440;

/// Width of the drone port scan range.
pub const PORT_RANGE: u16 = 100;

/// Default window the spawner waits for a drone to report ready.
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(60);

/// Grace period between SIGTERM and SIGKILL when stopping a drone.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Configuration for the hive hub.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the host git repository agents branch from.
    pub repo_path: PathBuf,
    /// Base directory for agent worktrees.
    pub worktrees_dir: PathBuf,
    /// First port probed when allocating a drone port.
    pub base_port: u16,
    /// Port the hub HTTP server binds.
    pub hub_port: u16,
    /// Whether drones run under the sandbox wrapper.
    pub sandbox: bool,
    /// Name of the worker binary resolved at spawn time.
    pub worker_bin: String,
    /// Name of the readiness-probe server binary.
    pub probe_bin: String,
    /// How long the spawner waits for a drone to report ready.
    pub readiness_timeout: Duration,
}

impl Config {
    /// Builds a config for `repo_path` with defaults for everything else.
    pub fn new(repo_path: PathBuf) -> Self {
        let worktrees_dir = dirs::home_dir()
            .map(|h| h.join("hive-worktrees"))
            .unwrap_or_else(|| repo_path.join(".hive/worktrees"));
        Self {
            repo_path,
            worktrees_dir,
            base_port: DEFAULT_BASE_PORT,
            hub_port: DEFAULT_HUB_PORT,
            sandbox: false,
            worker_bin: "hive-worker".to_string(),
            probe_bin: "hive-probe".to_string(),
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
        }
    }

    /// Loads configuration from the environment.
    ///
    /// `HIVE_REPO` is required unless `repo` is given; the rest fall back to
    /// defaults. Invalid port values are an error rather than a silent
    /// fallback.
    pub fn from_env(repo: Option<PathBuf>) -> Result<Self> {
        let repo_path = match repo {
            Some(p) => p,
            None => std::env::var("HIVE_REPO")
                .map(PathBuf::from)
                .context("HIVE_REPO is not set and no repo path was given")?,
        };

        let mut config = Self::new(repo_path);

        if let Ok(dir) = std::env::var("HIVE_WORKTREES_DIR") {
            config.worktrees_dir = PathBuf::from(dir);
        }
        if let Ok(port) = std::env::var("HIVE_BASE_PORT") {
            config.base_port = port
                .parse()
                .with_context(|| format!("invalid HIVE_BASE_PORT: {port}"))?;
        }
        if let Ok(port) = std::env::var("HIVE_HUB_PORT") {
            config.hub_port = port
                .parse()
                .with_context(|| format!("invalid HIVE_HUB_PORT: {port}"))?;
        }
        if let Ok(sandbox) = std::env::var("HIVE_SANDBOX") {
            config.sandbox = matches!(sandbox.as_str(), "1" | "true" | "yes");
        }
        if let Ok(bin) = std::env::var("HIVE_WORKER_BIN") {
            config.worker_bin = bin;
        }
        if let Ok(bin) = std::env::var("HIVE_PROBE_BIN") {
            config.probe_bin = bin;
        }

        Ok(config)
    }

    /// URL agents use to reach the hub.
    pub fn hub_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.hub_port)
    }

    /// Path of the persisted hub snapshot.
    pub fn state_path(&self) -> PathBuf {
        self.repo_path.join(".hive/hub-state.json")
    }

    /// Directory the task store writes task documents into.
    pub fn tasks_dir(&self) -> PathBuf {
        self.repo_path.join(".hive/tasks")
    }
}
