//! Agent spawning and teardown.
//!
//! Spawn assembles isolation in order: worktree, sandbox assets, port,
//! resolved binaries, child process in its own process group, readiness
//! probe. Teardown reverses it: signal the group, wait out the grace
//! period, force-kill, release the port, and (for destroy) remove the
//! worktree.
//!
//! Failure cleanup is ordered the same way — a child that was started gets
//! killed before the port is released, so the lease never outlives a live
//! process and a dead process never squats on a lease.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use chrono::Utc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::agent::client::{WorkerClient, WorkerStatus};
use crate::agent::{new_agent_id, Agent, AgentStatus};
use crate::config::{Config, PORT_RANGE, STOP_GRACE};
use crate::error::{HiveError, Result};
use crate::ports::{AcquireOutcome, AcquireRequest, PortRegistry};
use crate::worktree::WorktreeManager;

/// Options for [`AgentSpawner::spawn`].
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Agent name; also the worktree name.
    pub name: String,
    /// Branch to check out; defaults to `hive/<name>`.
    pub branch: Option<String>,
    /// Branch to create the agent branch from; defaults to `main`.
    pub base_branch: Option<String>,
    /// Role tag rendered into the system prompt.
    pub specialty: Option<String>,
    /// Override the configured sandbox toggle.
    pub sandbox: Option<bool>,
    /// First instruction handed to the drone; also seeds the internal task.
    pub initial_prompt: Option<String>,
}

/// Spawns, stops, and destroys drone processes.
pub struct AgentSpawner {
    config: Config,
    worktrees: Arc<WorktreeManager>,
    ports: Arc<PortRegistry>,
    client: Arc<dyn WorkerClient>,
}

impl std::fmt::Debug for AgentSpawner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSpawner")
            .field("base_port", &self.config.base_port)
            .finish_non_exhaustive()
    }
}

impl AgentSpawner {
    /// Creates a spawner over the shared worktree manager and port registry.
    pub fn new(
        config: Config,
        worktrees: Arc<WorktreeManager>,
        ports: Arc<PortRegistry>,
        client: Arc<dyn WorkerClient>,
    ) -> Self {
        Self {
            config,
            worktrees,
            ports,
            client,
        }
    }

    /// Spawns a new drone.
    ///
    /// On any failure after the child started, the child is killed first and
    /// the port released before the error propagates. The worktree is left
    /// in place — only Destroy removes worktrees.
    pub async fn spawn(&self, opts: SpawnOptions, cancel: &CancellationToken) -> Result<Agent> {
        let id = new_agent_id();
        let branch = opts
            .branch
            .clone()
            .unwrap_or_else(|| format!("hive/{}", opts.name));
        let base_branch = opts.base_branch.clone().unwrap_or_else(|| "main".to_string());

        let worktree = self
            .worktrees
            .create_with_branch(&opts.name, &branch, &base_branch)?;

        self.write_sandbox_assets(&worktree.path, &id, &opts, &branch)?;

        let port = self.allocate_port(&id, &opts.name)?;

        // Anything that fails from here on must give the port back.
        let ports = Arc::clone(&self.ports);
        let release_port = scopeguard::guard((), |()| {
            let _ = ports.release(&id, port);
        });

        let sandbox = opts.sandbox.unwrap_or(self.config.sandbox);
        let mut command = self.build_command(&worktree.path, &id, &opts.name, port, sandbox)?;

        let mut child = command
            .spawn()
            .map_err(|e| HiveError::ChildFailed(format!("failed to start drone: {e}")))?;
        let pid = child.id().map(|p| p as i32);
        if let Some(pid) = pid {
            self.ports.record_pid(port, pid);
        }

        log::info!(
            "[spawner] started {} (pid {:?}) on port {port} in {}",
            opts.name,
            pid,
            worktree.path.display()
        );

        let probe = self
            .client
            .wait_ready(port, self.config.readiness_timeout, cancel)
            .await;

        let status = match probe {
            Ok(WorkerStatus::Busy) => AgentStatus::Busy,
            Ok(_) => AgentStatus::Ready,
            Err(err) => {
                log::warn!("[spawner] {} never became ready: {err}", opts.name);
                kill_group(pid, libc::SIGKILL);
                let _ = child.wait().await;
                // The scopeguard releases the port on the way out.
                return Err(match err {
                    HiveError::Cancelled => HiveError::Cancelled,
                    _ => HiveError::NotReady(opts.name.clone()),
                });
            }
        };

        // Success: the lease now belongs to the live agent.
        scopeguard::ScopeGuard::into_inner(release_port);

        let now = Utc::now();
        Ok(Agent {
            id,
            name: opts.name,
            worktree_path: worktree.path,
            branch,
            port,
            pid,
            status,
            specialty: opts.specialty,
            created_at: now,
            status_changed_at: now,
            last_error: None,
            child: Some(child),
        })
    }

    /// Stops a drone: SIGTERM to the process group, up to 5 s of grace,
    /// then SIGKILL. Releases the port and marks the agent stopped.
    ///
    /// Idempotent — a drone that already exited is not an error, and a
    /// second stop finds nothing to signal or release.
    pub async fn stop(&self, agent: &mut Agent, cancel: &CancellationToken) -> Result<()> {
        kill_group(agent.pid, libc::SIGTERM);

        if let Some(child) = agent.child.as_mut() {
            let graceful = tokio::select! {
                result = tokio::time::timeout(STOP_GRACE, child.wait()) => result.is_ok(),
                () = cancel.cancelled() => false,
            };
            if !graceful {
                log::warn!("[spawner] {} ignored SIGTERM, force-killing", agent.name);
                kill_group(agent.pid, libc::SIGKILL);
                let _ = child.wait().await;
            }
            agent.child = None;
        } else if let Some(pid) = agent.pid {
            // Snapshot-recovered agent: no handle, wait on the pid directly.
            let deadline = tokio::time::Instant::now() + STOP_GRACE;
            while pid_alive(pid) {
                if tokio::time::Instant::now() >= deadline || cancel.is_cancelled() {
                    log::warn!("[spawner] pid {pid} ignored SIGTERM, force-killing");
                    kill_group(Some(pid), libc::SIGKILL);
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }

        let _ = self.ports.release(&agent.id, agent.port);
        agent.set_status(AgentStatus::Stopped);
        log::info!("[spawner] stopped {}", agent.name);
        Ok(())
    }

    /// Stops the drone and removes its worktree.
    ///
    /// The stop is best-effort; a worktree deletion error is what propagates.
    pub async fn destroy(&self, agent: &mut Agent, cancel: &CancellationToken) -> Result<()> {
        self.stop(agent, cancel).await?;
        let name = agent
            .worktree_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| agent.name.clone());
        self.worktrees.delete(&name)?;
        log::info!("[spawner] destroyed {}", agent.name);
        Ok(())
    }

    // ─── Spawn internals ───────────────────────────────────────────────────

    /// Linear scan from the configured base: skip leased ports, verify the
    /// OS will actually let us bind, then take the lease.
    fn allocate_port(&self, agent_id: &str, agent_name: &str) -> Result<u16> {
        let base = self.config.base_port;
        let limit = base.saturating_add(PORT_RANGE);
        for port in base..limit {
            if self.ports.is_leased(port) {
                continue;
            }
            // Transient listen probe; dropping the listener frees the port
            // for the child we are about to start.
            if std::net::TcpListener::bind(("127.0.0.1", port)).is_err() {
                continue;
            }
            let req = AcquireRequest::immediate(port, agent_id, agent_name, "drone");
            if let AcquireOutcome::Acquired(_) = self.ports.try_acquire(&req) {
                return Ok(port);
            }
        }
        Err(HiveError::NoPorts { base, limit })
    }

    /// Materializes the drone's sandbox assets inside the worktree:
    /// command-helper script (0755), rendered system prompt, and skill
    /// documents (0644).
    fn write_sandbox_assets(
        &self,
        worktree: &Path,
        id: &str,
        opts: &SpawnOptions,
        branch: &str,
    ) -> Result<()> {
        let hive_dir = worktree.join(".hive");
        std::fs::create_dir_all(hive_dir.join("skills"))?;

        let commands = render_commands(&self.config.hub_url(), id);
        write_with_mode(&hive_dir.join("commands.sh"), &commands, 0o755)?;

        let prompt = render_system_prompt(
            id,
            &opts.name,
            worktree,
            branch,
            opts.specialty.as_deref().unwrap_or("generalist"),
            &self.config.hub_url(),
        );
        write_with_mode(&hive_dir.join("system-prompt.md"), &prompt, 0o644)?;

        write_with_mode(&hive_dir.join("skills/tasks.md"), SKILL_TASKS, 0o644)?;
        write_with_mode(
            &hive_dir.join("skills/solicitations.md"),
            SKILL_SOLICITATIONS,
            0o644,
        )?;
        Ok(())
    }

    /// Builds the child command per the sandbox flag: direct probe-server
    /// invocation, or the sandbox wrapper pointed at a rendered config.
    fn build_command(
        &self,
        worktree: &Path,
        id: &str,
        name: &str,
        port: u16,
        sandbox: bool,
    ) -> Result<Command> {
        let probe = resolve_binary(&self.config.probe_bin)?;

        let mut command = if sandbox {
            let wrapper = resolve_binary(&self.config.worker_bin)?;
            let sandbox_config = serde_json::json!({
                "port": port,
                "worktree": worktree,
                "probe": probe,
            });
            let config_path = worktree.join(".hive/sandbox.json");
            write_with_mode(
                &config_path,
                &serde_json::to_string_pretty(&sandbox_config)?,
                0o644,
            )?;
            let mut c = Command::new(wrapper);
            c.arg("--config").arg(config_path);
            c
        } else {
            let mut c = Command::new(probe);
            c.arg("--port").arg(port.to_string());
            c
        };

        command
            .current_dir(worktree)
            .env("HIVE_HUB_URL", self.config.hub_url())
            .env("HIVE_AGENT_ID", id)
            .env("HIVE_AGENT_NAME", name)
            .env("HIVE_WORKTREE", worktree)
            .env("HIVE_COMMANDS", worktree.join(".hive/commands.sh"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            // Own process group so stop/destroy signals reach the whole tree.
            .process_group(0)
            .kill_on_drop(true);

        Ok(command)
    }
}

/// Sends `signal` to the process group led by `pid`. ESRCH is fine — the
/// group may already be gone.
fn kill_group(pid: Option<i32>, signal: i32) {
    let Some(pid) = pid else { return };
    // SAFETY: kill(2) with a negative pid signals the process group; stale
    // pids fail with ESRCH which we deliberately ignore.
    unsafe {
        libc::kill(-pid, signal);
        libc::kill(pid, signal);
    }
}

/// Whether `pid` still exists, via the `kill(pid, 0)` probe.
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs error checking only; no signal is sent.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Resolves a binary by name: absolute/relative paths verbatim, then the
/// PATH entries, then well-known install locations.
fn resolve_binary(name: &str) -> Result<PathBuf> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        if candidate.exists() {
            return Ok(candidate.to_path_buf());
        }
        return Err(HiveError::not_found(format!("binary {name}")));
    }

    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            let full = dir.join(name);
            if full.is_file() {
                return Ok(full);
            }
        }
    }

    let mut fallbacks = vec![PathBuf::from("/usr/local/bin"), PathBuf::from("/usr/bin")];
    if let Some(home) = dirs::home_dir() {
        fallbacks.push(home.join(".local/bin"));
        fallbacks.push(home.join(".hive/bin"));
    }
    for dir in fallbacks {
        let full = dir.join(name);
        if full.is_file() {
            return Ok(full);
        }
    }

    Err(HiveError::not_found(format!("binary {name}")))
}

fn write_with_mode(path: &Path, contents: &str, mode: u32) -> Result<()> {
    std::fs::write(path, contents)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

fn render_commands(hub_url: &str, agent_id: &str) -> String {
    format!(
        r#"#!/bin/sh
# Hive command helpers. Sourced by the drone's shell.
HIVE_HUB_URL="${{HIVE_HUB_URL:-{hub_url}}}"
HIVE_AGENT_ID="${{HIVE_AGENT_ID:-{agent_id}}}"

hive_tasks() {{
    curl -sf "$HIVE_HUB_URL/tasks?agent_id=$HIVE_AGENT_ID"
}}

hive_task_start() {{
    curl -sf -X POST "$HIVE_HUB_URL/tasks/$1/start"
}}

hive_task_complete() {{
    curl -sf -X POST "$HIVE_HUB_URL/tasks/$1/complete" \
        -H 'Content-Type: application/json' -d "${{2:-{{}}}}"
}}

hive_solicit() {{
    curl -sf -X POST "$HIVE_HUB_URL/solicitations" \
        -H 'Content-Type: application/json' -d "$1"
}}
"#
    )
}

fn render_system_prompt(
    id: &str,
    name: &str,
    worktree: &Path,
    branch: &str,
    specialty: &str,
    hub_url: &str,
) -> String {
    format!(
        r"# Hive drone briefing

You are **{name}** (id `{id}`), a {specialty} drone in a hive of
coordinated coding agents.

- Worktree: `{worktree}` — all of your work happens here.
- Branch: `{branch}` — never switch branches or touch other worktrees.
- Hub: `{hub_url}` — claim tasks, report progress, raise solicitations.

Work the task queue via the hub API (see `.hive/commands.sh`). When you are
blocked or need a decision, raise a solicitation instead of guessing; a
supervisor responds asynchronously. Skill documents live in `.hive/skills/`.
",
        worktree = worktree.display(),
    )
}

const SKILL_TASKS: &str = r"# Working the task queue

Claim the lowest unblocked pending task, move it to in-progress before
touching code, and record step progress as you go. Complete with a result
payload; never complete a task whose tests you have not run.
";

const SKILL_SOLICITATIONS: &str = r"# Raising solicitations

Use `blocker` when you cannot proceed, `decision` when options need a human
pick, and `validation` when finished work needs review. One solicitation per
question; responses arrive asynchronously on your conversation.
";

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::client::MockWorkerClient;
    use crate::events::EventPublisher;
    use crate::testutil::{fake_probe, init_repo};
    use tempfile::TempDir;

    struct Fixture {
        _repo: TempDir,
        _trees: TempDir,
        _bin: TempDir,
        spawner: AgentSpawner,
        ports: Arc<PortRegistry>,
        base_port: u16,
    }

    fn fixture(base_port: u16) -> Fixture {
        let repo = TempDir::new().unwrap();
        let trees = TempDir::new().unwrap();
        let bin = TempDir::new().unwrap();
        init_repo(repo.path());

        let mut config = Config::new(repo.path().to_path_buf());
        config.worktrees_dir = trees.path().to_path_buf();
        config.base_port = base_port;
        config.probe_bin = fake_probe(bin.path()).to_string_lossy().to_string();
        config.readiness_timeout = std::time::Duration::from_secs(5);

        let worktrees = Arc::new(WorktreeManager::new(
            repo.path().to_path_buf(),
            trees.path().to_path_buf(),
        ));
        let ports = Arc::new(PortRegistry::new(EventPublisher::disconnected()));
        let mock = Arc::new(MockWorkerClient::new());
        // Every port in the scan range answers ready once something listens.
        for port in base_port..base_port + PORT_RANGE {
            mock.set_status(port, WorkerStatus::Ready);
        }

        let spawner = AgentSpawner::new(
            config,
            worktrees,
            Arc::clone(&ports),
            Arc::clone(&mock) as Arc<dyn WorkerClient>,
        );
        drop(mock);
        Fixture {
            _repo: repo,
            _trees: trees,
            _bin: bin,
            spawner,
            ports,
            base_port,
        }
    }

    #[tokio::test]
    async fn spawn_stop_roundtrip_frees_the_port() {
        let fx = fixture(17440);
        let cancel = CancellationToken::new();

        let mut agent = fx
            .spawner
            .spawn(
                SpawnOptions {
                    name: "alpha".into(),
                    branch: Some("feat/a".into()),
                    ..SpawnOptions::default()
                },
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(agent.status, AgentStatus::Ready);
        assert_eq!(agent.branch, "feat/a");
        assert!(agent.pid.is_some());
        assert!(fx.ports.is_leased(agent.port));
        assert!(agent.worktree_path.join(".hive/commands.sh").exists());
        assert!(agent.worktree_path.join(".hive/system-prompt.md").exists());

        // The helper script is executable, the prompt is not.
        let mode = std::fs::metadata(agent.worktree_path.join(".hive/commands.sh"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o755);

        let port = agent.port;
        let pid = agent.pid.unwrap();
        fx.spawner.stop(&mut agent, &cancel).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Stopped);
        assert!(!fx.ports.is_leased(port));
        assert!(!pid_alive(pid));

        // Stop is idempotent.
        fx.spawner.stop(&mut agent, &cancel).await.unwrap();
        assert_eq!(agent.status, AgentStatus::Stopped);
    }

    #[tokio::test]
    async fn spawned_agents_get_distinct_ports() {
        let fx = fixture(17560);
        let cancel = CancellationToken::new();

        let mut a = fx
            .spawner
            .spawn(SpawnOptions { name: "a".into(), ..SpawnOptions::default() }, &cancel)
            .await
            .unwrap();
        let mut b = fx
            .spawner
            .spawn(SpawnOptions { name: "b".into(), ..SpawnOptions::default() }, &cancel)
            .await
            .unwrap();

        assert_ne!(a.port, b.port);
        assert_eq!(a.port, fx.base_port);
        assert_eq!(b.port, fx.base_port + 1);

        fx.spawner.stop(&mut a, &cancel).await.unwrap();
        fx.spawner.stop(&mut b, &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn readiness_timeout_kills_child_and_releases_port() {
        let mut fx = fixture(17680);
        fx.spawner.config.readiness_timeout = std::time::Duration::from_millis(700);
        // No scripted statuses: every probe fails.
        let fresh = MockWorkerClient::new();
        fx.spawner.client = Arc::new(fresh);

        let cancel = CancellationToken::new();
        let err = fx
            .spawner
            .spawn(SpawnOptions { name: "slow".into(), ..SpawnOptions::default() }, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::NotReady(_)), "got {err:?}");
        assert!(!fx.ports.is_leased(fx.base_port));
    }

    #[tokio::test]
    async fn destroy_removes_the_worktree() {
        let fx = fixture(17800);
        let cancel = CancellationToken::new();

        let mut agent = fx
            .spawner
            .spawn(SpawnOptions { name: "doomed".into(), ..SpawnOptions::default() }, &cancel)
            .await
            .unwrap();
        let worktree = agent.worktree_path.clone();
        assert!(worktree.exists());

        fx.spawner.destroy(&mut agent, &cancel).await.unwrap();
        assert!(!worktree.exists());
        assert!(!fx.ports.is_leased(agent.port));
    }

    #[tokio::test]
    async fn missing_worker_binary_fails_before_any_process_starts() {
        let mut fx = fixture(17920);
        fx.spawner.config.probe_bin = "definitely-not-installed-anywhere".into();

        let cancel = CancellationToken::new();
        let err = fx
            .spawner
            .spawn(SpawnOptions { name: "ghost".into(), ..SpawnOptions::default() }, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::NotFound(_)), "got {err:?}");
        // The scan lease was rolled back.
        assert!(!fx.ports.is_leased(fx.base_port));
    }

    #[test]
    fn port_exhaustion_reports_no_ports() {
        let repo = TempDir::new().unwrap();
        let trees = TempDir::new().unwrap();
        init_repo(repo.path());

        let mut config = Config::new(repo.path().to_path_buf());
        config.worktrees_dir = trees.path().to_path_buf();
        config.base_port = 18040;

        let ports = Arc::new(PortRegistry::new(EventPublisher::disconnected()));
        // Lease the whole range to other agents.
        for port in 18040..18040 + PORT_RANGE {
            ports.restore_lease(crate::ports::PortLease {
                port,
                agent_id: "other".into(),
                agent_name: "other".into(),
                service_tag: "drone".into(),
                pid: None,
                leased_at: Utc::now(),
            });
        }

        let spawner = AgentSpawner::new(
            config,
            Arc::new(WorktreeManager::new(
                repo.path().to_path_buf(),
                trees.path().to_path_buf(),
            )),
            ports,
            Arc::new(MockWorkerClient::new()) as Arc<dyn WorkerClient>,
        );

        let err = spawner.allocate_port("x", "x").unwrap_err();
        assert!(matches!(err, HiveError::NoPorts { .. }), "got {err:?}");
    }

    #[test]
    fn resolve_binary_finds_path_entries_and_rejects_ghosts() {
        let sh = resolve_binary("sh").unwrap();
        assert!(sh.is_file());
        let err = resolve_binary("no-such-binary-here").unwrap_err();
        assert!(matches!(err, HiveError::NotFound(_)));
    }

    #[tokio::test]
    async fn spawn_failure_leaves_worktree_for_destroy_level_cleanup() {
        let mut fx = fixture(18160);
        fx.spawner.config.readiness_timeout = std::time::Duration::from_millis(600);
        fx.spawner.client = Arc::new(MockWorkerClient::new());

        let cancel = CancellationToken::new();
        let err = fx
            .spawner
            .spawn(SpawnOptions { name: "leftover".into(), ..SpawnOptions::default() }, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::NotReady(_)));

        // Spawn cleanup covers child + port only; the worktree survives.
        assert!(fx.spawner.worktrees.exists("leftover").unwrap());
    }
}
