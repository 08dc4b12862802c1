//! Agent registry and message routing.
//!
//! The manager is the only owner of [`Agent`] values. Everything else —
//! HTTP handlers, restoration, the snapshot — goes through it by id (or
//! unique name) and gets back serializable [`AgentRecord`] projections.
//!
//! Locking discipline: the registry lock is never held across an HTTP call
//! or any other suspension. Operations that talk to a drone or its process
//! take the agent out of the registry, work on it, and put it back.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tokio_util::sync::CancellationToken;

use crate::agent::client::{WorkerClient, WorkerMessage, WorkerStatus};
use crate::agent::spawner::{AgentSpawner, SpawnOptions};
use crate::agent::{Agent, AgentRecord, AgentStatus};
use crate::error::{HiveError, Result};
use crate::events::{EventPublisher, EventType};
use crate::tasks::TaskStore;

#[derive(Default)]
struct Registry {
    agents: HashMap<String, Agent>,
    by_name: HashMap<String, String>,
    /// Names with a spawn in flight; blocks duplicate concurrent spawns.
    reserved: HashSet<String>,
}

impl Registry {
    fn running_with_name(&self, name: &str) -> bool {
        self.agents
            .values()
            .any(|a| a.name == name && a.status.is_running())
    }
}

/// Registry of live agents, safe for concurrent callers.
pub struct AgentManager {
    registry: RwLock<Registry>,
    spawner: AgentSpawner,
    client: Arc<dyn WorkerClient>,
    tasks: Arc<TaskStore>,
    events: EventPublisher,
}

impl std::fmt::Debug for AgentManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentManager")
            .field("agents", &self.count())
            .finish_non_exhaustive()
    }
}

impl AgentManager {
    /// Creates a manager delegating process work to `spawner`.
    pub fn new(
        spawner: AgentSpawner,
        client: Arc<dyn WorkerClient>,
        tasks: Arc<TaskStore>,
        events: EventPublisher,
    ) -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
            spawner,
            client,
            tasks,
            events,
        }
    }

    /// Spawns a new agent.
    ///
    /// Rejected when the name is already used by a *running* agent (stopped
    /// agents do not block reuse). The internal tracking task is created
    /// alongside, and the initial prompt, if any, is delivered once ready.
    pub async fn spawn(&self, opts: SpawnOptions, cancel: &CancellationToken) -> Result<AgentRecord> {
        let name = opts.name.clone();
        if name.trim().is_empty() {
            return Err(HiveError::InvalidTransition("agent name is empty".into()));
        }

        {
            let mut registry = self.registry.write().expect("agent registry poisoned");
            if registry.reserved.contains(&name) || registry.running_with_name(&name) {
                return Err(HiveError::AlreadyExists(format!("agent {name}")));
            }
            registry.reserved.insert(name.clone());
        }

        let initial_prompt = opts.initial_prompt.clone();
        let spawned = self.spawner.spawn(opts, cancel).await;

        let agent = match spawned {
            Ok(agent) => agent,
            Err(err) => {
                self.registry
                    .write()
                    .expect("agent registry poisoned")
                    .reserved
                    .remove(&name);
                return Err(err);
            }
        };

        // One internal task per live agent; a store hiccup must not orphan
        // the process we just started.
        let description = initial_prompt.clone().unwrap_or_else(|| format!("agent {name}"));
        if let Err(err) = self.tasks.create_internal(&name, &description) {
            log::warn!("[manager] internal task for {name} not created: {err}");
        }

        if let Some(prompt) = initial_prompt {
            if let Err(err) = self.client.send_message(agent.port, &prompt).await {
                log::warn!("[manager] initial prompt to {name} failed: {err}");
            }
        }

        let record = agent.record();
        {
            let mut registry = self.registry.write().expect("agent registry poisoned");
            registry.reserved.remove(&name);
            registry.by_name.insert(name.clone(), agent.id.clone());
            registry.agents.insert(agent.id.clone(), agent);
        }

        self.events.publish(
            EventType::AgentSpawned,
            serde_json::json!({
                "id": record.id,
                "name": record.name,
                "port": record.port,
                "branch": record.branch,
            }),
        );
        Ok(record)
    }

    /// Stops an agent; it stays registered with status `stopped`.
    pub async fn stop(&self, id_or_name: &str, cancel: &CancellationToken) -> Result<AgentRecord> {
        let id = self.resolve(id_or_name)?;
        let mut agent = self.take(&id)?;

        let result = self.spawner.stop(&mut agent, cancel).await;
        if let Err(err) = self.tasks.close_internal(&agent.name) {
            log::warn!("[manager] internal task for {} not closed: {err}", agent.name);
        }
        let record = agent.record();
        self.put_back(agent);
        result?;

        self.events.publish(
            EventType::AgentStopped,
            serde_json::json!({ "id": record.id, "name": record.name }),
        );
        Ok(record)
    }

    /// Stops an agent and removes its worktree and registry entry.
    pub async fn destroy(&self, id_or_name: &str, cancel: &CancellationToken) -> Result<AgentRecord> {
        let id = self.resolve(id_or_name)?;
        let mut agent = self.take(&id)?;

        let result = self.spawner.destroy(&mut agent, cancel).await;
        if let Err(err) = self.tasks.close_internal(&agent.name) {
            log::warn!("[manager] internal task for {} not closed: {err}", agent.name);
        }
        let record = agent.record();

        match result {
            Ok(()) => {
                // Fully gone; drop the registry entry and the name.
                let mut registry = self.registry.write().expect("agent registry poisoned");
                if registry.by_name.get(&record.name) == Some(&record.id) {
                    registry.by_name.remove(&record.name);
                }
                self.events.publish(
                    EventType::AgentDestroyed,
                    serde_json::json!({ "id": record.id, "name": record.name }),
                );
                Ok(record)
            }
            Err(err) => {
                // The process is stopped but the worktree lingers; keep the
                // agent so destroy can be retried.
                self.put_back(agent);
                Err(err)
            }
        }
    }

    /// Fetches one agent by id or unique name.
    pub fn get(&self, id_or_name: &str) -> Result<AgentRecord> {
        let id = self.resolve(id_or_name)?;
        let registry = self.registry.read().expect("agent registry poisoned");
        registry
            .agents
            .get(&id)
            .map(Agent::record)
            .ok_or_else(|| HiveError::not_found(format!("agent {id_or_name}")))
    }

    /// Fetches one agent by name.
    pub fn get_by_name(&self, name: &str) -> Result<AgentRecord> {
        let registry = self.registry.read().expect("agent registry poisoned");
        let id = registry
            .by_name
            .get(name)
            .ok_or_else(|| HiveError::not_found(format!("agent {name}")))?;
        registry
            .agents
            .get(id)
            .map(Agent::record)
            .ok_or_else(|| HiveError::not_found(format!("agent {name}")))
    }

    /// Every registered agent, oldest first.
    pub fn list(&self) -> Vec<AgentRecord> {
        let registry = self.registry.read().expect("agent registry poisoned");
        let mut records: Vec<AgentRecord> =
            registry.agents.values().map(Agent::record).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    /// Agents currently running (starting, ready, or busy).
    pub fn list_running(&self) -> Vec<AgentRecord> {
        self.list()
            .into_iter()
            .filter(|a| a.status.is_running())
            .collect()
    }

    /// Total registered agents.
    pub fn count(&self) -> usize {
        self.registry
            .read()
            .expect("agent registry poisoned")
            .agents
            .len()
    }

    /// Running agents only.
    pub fn count_running(&self) -> usize {
        self.list_running().len()
    }

    /// Delivers an operator message to a running agent.
    pub async fn send_message(&self, id_or_name: &str, content: &str) -> Result<()> {
        let record = self.get(id_or_name)?;
        if !record.status.is_running() {
            return Err(HiveError::InvalidTransition(format!(
                "agent {} is {:?}",
                record.name, record.status
            )));
        }

        self.client.send_message(record.port, content).await?;
        self.events.publish(
            EventType::MessageSent,
            serde_json::json!({ "id": record.id, "name": record.name }),
        );
        Ok(())
    }

    /// Fetches an agent's conversation log.
    pub async fn conversation(&self, id_or_name: &str) -> Result<Vec<WorkerMessage>> {
        let record = self.get(id_or_name)?;
        if !record.status.is_running() {
            return Err(HiveError::InvalidTransition(format!(
                "agent {} is {:?}",
                record.name, record.status
            )));
        }
        let messages = self.client.get_messages(record.port).await?;
        if !messages.is_empty() {
            self.events.publish(
                EventType::MessageReceived,
                serde_json::json!({ "id": record.id, "count": messages.len() }),
            );
        }
        Ok(messages)
    }

    /// Probes one agent's status and folds the answer into the registry.
    ///
    /// Transport errors mark the agent `error` with the captured message
    /// rather than propagating — a dead drone is a state, not a hub failure.
    pub async fn refresh_status(&self, id_or_name: &str) -> Result<AgentRecord> {
        let record = self.get(id_or_name)?;
        if !record.status.is_running() {
            return Ok(record);
        }

        let probed = self.client.get_status(record.port).await;
        let mut registry = self.registry.write().expect("agent registry poisoned");
        let agent = registry
            .agents
            .get_mut(&record.id)
            .ok_or_else(|| HiveError::not_found(format!("agent {id_or_name}")))?;

        let previous = agent.status;
        match probed {
            Ok(WorkerStatus::Ready) => agent.set_status(AgentStatus::Ready),
            Ok(WorkerStatus::Busy) => agent.set_status(AgentStatus::Busy),
            Ok(WorkerStatus::Error) => {
                agent.last_error = Some("drone reported an unknown status".to_string());
                agent.set_status(AgentStatus::Error);
            }
            Err(err) => {
                agent.last_error = Some(err.to_string());
                agent.set_status(AgentStatus::Error);
            }
        }

        let updated = agent.record();
        drop(registry);

        if updated.status != previous {
            self.events.publish(
                EventType::AgentStatus,
                serde_json::json!({
                    "id": updated.id,
                    "name": updated.name,
                    "status": updated.status,
                }),
            );
        }
        Ok(updated)
    }

    /// Refreshes every agent, without holding the registry lock across
    /// probes.
    pub async fn refresh_all(&self) {
        let ids: Vec<String> = {
            let registry = self.registry.read().expect("agent registry poisoned");
            registry.agents.keys().cloned().collect()
        };
        for id in ids {
            if let Err(err) = self.refresh_status(&id).await {
                log::debug!("[manager] refresh of {id} failed: {err}");
            }
        }
    }

    /// Stops every agent; keeps going on failure and returns the last error.
    pub async fn stop_all(&self, cancel: &CancellationToken) -> Result<()> {
        let ids: Vec<String> = {
            let registry = self.registry.read().expect("agent registry poisoned");
            registry.agents.keys().cloned().collect()
        };
        let mut last_error = None;
        for id in ids {
            if let Err(err) = self.stop(&id, cancel).await {
                log::warn!("[manager] stop of {id} failed: {err}");
                last_error = Some(err);
            }
        }
        match last_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Destroys every agent; keeps going on failure and returns the last
    /// error.
    pub async fn destroy_all(&self, cancel: &CancellationToken) -> Result<()> {
        let ids: Vec<String> = {
            let registry = self.registry.read().expect("agent registry poisoned");
            registry.agents.keys().cloned().collect()
        };
        let mut last_error = None;
        for id in ids {
            if let Err(err) = self.destroy(&id, cancel).await {
                log::warn!("[manager] destroy of {id} failed: {err}");
                last_error = Some(err);
            }
        }
        match last_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Agents that have sat in `busy` longer than `threshold` without a
    /// status change. Dashboards surface these as stuck drones.
    pub fn stuck_agents(&self, threshold: std::time::Duration) -> Vec<AgentRecord> {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::zero());
        let registry = self.registry.read().expect("agent registry poisoned");
        registry
            .agents
            .values()
            .filter(|a| a.status == AgentStatus::Busy && a.status_changed_at < cutoff)
            .map(Agent::record)
            .collect()
    }

    /// Inserts an agent without spawning anything. Restoration only.
    pub fn register(&self, agent: Agent) {
        let mut registry = self.registry.write().expect("agent registry poisoned");
        registry.by_name.insert(agent.name.clone(), agent.id.clone());
        registry.agents.insert(agent.id.clone(), agent);
    }

    /// Removes an agent without touching its process. Restoration only.
    pub fn unregister(&self, id: &str) -> Option<AgentRecord> {
        let mut registry = self.registry.write().expect("agent registry poisoned");
        let agent = registry.agents.remove(id)?;
        if registry.by_name.get(&agent.name) == Some(&agent.id) {
            registry.by_name.remove(&agent.name);
        }
        Some(agent.record())
    }

    // ─── Internals ─────────────────────────────────────────────────────────

    /// Resolves an id-or-name to the canonical agent id.
    fn resolve(&self, id_or_name: &str) -> Result<String> {
        let registry = self.registry.read().expect("agent registry poisoned");
        if registry.agents.contains_key(id_or_name) {
            return Ok(id_or_name.to_string());
        }
        registry
            .by_name
            .get(id_or_name)
            .cloned()
            .ok_or_else(|| HiveError::not_found(format!("agent {id_or_name}")))
    }

    /// Takes an agent out of the registry for an operation that suspends.
    fn take(&self, id: &str) -> Result<Agent> {
        self.registry
            .write()
            .expect("agent registry poisoned")
            .agents
            .remove(id)
            .ok_or_else(|| HiveError::not_found(format!("agent {id}")))
    }

    fn put_back(&self, agent: Agent) {
        let mut registry = self.registry.write().expect("agent registry poisoned");
        registry.by_name.insert(agent.name.clone(), agent.id.clone());
        registry.agents.insert(agent.id.clone(), agent);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::client::MockWorkerClient;
    use crate::config::{Config, PORT_RANGE};
    use crate::ports::PortRegistry;
    use crate::testutil::{fake_probe, init_repo};
    use crate::worktree::WorktreeManager;
    use tempfile::TempDir;

    struct Fixture {
        _repo: TempDir,
        _trees: TempDir,
        _bin: TempDir,
        _tasks: TempDir,
        manager: AgentManager,
        mock: Arc<MockWorkerClient>,
        tasks: Arc<TaskStore>,
        ports: Arc<PortRegistry>,
        base_port: u16,
    }

    fn fixture(base_port: u16) -> Fixture {
        let repo = TempDir::new().unwrap();
        let trees = TempDir::new().unwrap();
        let bin = TempDir::new().unwrap();
        let tasks_dir = TempDir::new().unwrap();
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
        for port in base_port..base_port + PORT_RANGE {
            mock.set_status(port, WorkerStatus::Ready);
        }
        let tasks = Arc::new(
            TaskStore::open(tasks_dir.path().to_path_buf(), EventPublisher::disconnected())
                .unwrap(),
        );

        let client: Arc<dyn WorkerClient> = Arc::clone(&mock) as Arc<dyn WorkerClient>;
        let spawner = AgentSpawner::new(
            config,
            worktrees,
            Arc::clone(&ports),
            Arc::clone(&client),
        );
        let manager = AgentManager::new(
            spawner,
            client,
            Arc::clone(&tasks),
            EventPublisher::disconnected(),
        );

        Fixture {
            _repo: repo,
            _trees: trees,
            _bin: bin,
            _tasks: tasks_dir,
            manager,
            mock,
            tasks,
            ports,
            base_port,
        }
    }

    fn opts(name: &str) -> SpawnOptions {
        SpawnOptions {
            name: name.to_string(),
            initial_prompt: Some(format!("work on {name} things")),
            ..SpawnOptions::default()
        }
    }

    #[tokio::test]
    async fn spawn_registers_agent_and_internal_task() {
        let fx = fixture(18300);
        let cancel = CancellationToken::new();

        let record = fx.manager.spawn(opts("alpha"), &cancel).await.unwrap();
        assert_eq!(record.name, "alpha");
        assert_eq!(fx.manager.count(), 1);
        assert_eq!(fx.manager.count_running(), 1);

        // Internal task tracks the agent.
        let internal: Vec<_> = fx
            .tasks
            .all()
            .into_iter()
            .filter(crate::tasks::Task::is_internal)
            .collect();
        assert_eq!(internal.len(), 1);
        assert_eq!(internal[0].subject, "alpha");

        // The initial prompt went out over the control protocol.
        let sent = fx.mock.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, record.port);
        assert!(sent[0].1.contains("alpha things"));

        fx.manager.stop(&record.id, &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn running_name_collision_is_rejected_until_stop() {
        let fx = fixture(18420);
        let cancel = CancellationToken::new();

        let first = fx.manager.spawn(opts("alpha"), &cancel).await.unwrap();
        let err = fx.manager.spawn(opts("alpha"), &cancel).await.unwrap_err();
        assert!(matches!(err, HiveError::AlreadyExists(_)), "got {err:?}");

        fx.manager.stop(&first.id, &cancel).await.unwrap();
        assert_eq!(fx.manager.count_running(), 0);

        // A stopped agent no longer blocks the name, but the old worktree
        // does — reuse a different branchless name to prove the name gate.
        let err = fx.manager.spawn(opts("alpha"), &cancel).await.unwrap_err();
        assert!(matches!(err, HiveError::AlreadyExists(_)), "worktree still present");

        fx.manager.destroy(&first.id, &cancel).await.unwrap();
        let again = fx.manager.spawn(opts("alpha"), &cancel).await.unwrap();
        assert_ne!(again.id, first.id);
        fx.manager.stop(&again.id, &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn lookup_works_by_id_and_name() {
        let fx = fixture(18540);
        let cancel = CancellationToken::new();

        let record = fx.manager.spawn(opts("beta"), &cancel).await.unwrap();
        assert_eq!(fx.manager.get(&record.id).unwrap().name, "beta");
        assert_eq!(fx.manager.get("beta").unwrap().id, record.id);
        assert_eq!(fx.manager.get_by_name("beta").unwrap().id, record.id);
        assert!(matches!(
            fx.manager.get("nope").unwrap_err(),
            HiveError::NotFound(_)
        ));

        fx.manager.stop(&record.id, &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn send_message_requires_a_running_agent() {
        let fx = fixture(18660);
        let cancel = CancellationToken::new();

        let record = fx.manager.spawn(opts("gamma"), &cancel).await.unwrap();
        fx.manager.send_message("gamma", "status report").await.unwrap();

        fx.manager.stop(&record.id, &cancel).await.unwrap();
        let err = fx
            .manager
            .send_message("gamma", "anyone home?")
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::InvalidTransition(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn refresh_captures_probe_failures_as_agent_error() {
        let fx = fixture(18780);
        let cancel = CancellationToken::new();

        let record = fx.manager.spawn(opts("delta"), &cancel).await.unwrap();
        assert_eq!(record.status, AgentStatus::Ready);

        // Drone goes busy, then falls off the network entirely.
        fx.mock.set_status(record.port, WorkerStatus::Busy);
        let updated = fx.manager.refresh_status(&record.id).await.unwrap();
        assert_eq!(updated.status, AgentStatus::Busy);

        fx.mock.clear_status(record.port);
        let updated = fx.manager.refresh_status(&record.id).await.unwrap();
        assert_eq!(updated.status, AgentStatus::Error);
        assert!(updated.last_error.is_some());

        fx.manager.stop(&record.id, &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn stop_all_reaches_every_agent() {
        let fx = fixture(18900);
        let cancel = CancellationToken::new();

        fx.manager.spawn(opts("one"), &cancel).await.unwrap();
        fx.manager.spawn(opts("two"), &cancel).await.unwrap();
        assert_eq!(fx.manager.count_running(), 2);

        fx.manager.stop_all(&cancel).await.unwrap();
        assert_eq!(fx.manager.count_running(), 0);
        assert_eq!(fx.manager.count(), 2);
        assert!(fx.ports.list_leases().is_empty());
        let _ = fx.base_port;
    }

    #[tokio::test]
    async fn register_and_unregister_skip_process_work() {
        let fx = fixture(19020);
        let record = crate::agent::AgentRecord {
            id: "restored1".into(),
            name: "ghost".into(),
            worktree_path: std::path::PathBuf::from("/tmp/ghost"),
            branch: "hive/ghost".into(),
            port: 19021,
            pid: Some(1),
            status: AgentStatus::Ready,
            specialty: None,
            created_at: chrono::Utc::now(),
            last_error: None,
        };
        fx.manager.register(record.into_agent());
        assert_eq!(fx.manager.get("ghost").unwrap().id, "restored1");

        let removed = fx.manager.unregister("restored1").unwrap();
        assert_eq!(removed.name, "ghost");
        assert!(fx.manager.get("ghost").is_err());
    }
}
