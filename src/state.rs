//! Crash-safe hub snapshot: save, load, and boot-time restoration.
//!
//! The snapshot is a single JSON document at `<repo>/.hive/hub-state.json`
//! capturing running agents, all tasks, pending solicitations, and port
//! leases. Writes go through a temp file sibling plus rename, so an
//! external observer sees either the old snapshot or the new one, never a
//! torn file.
//!
//! Restoration rebuilds bookkeeping only: recovered agents carry no process
//! handle, and each one must prove it is alive (pid probe + control
//! protocol answer) before it is registered. Everything else is reloaded
//! verbatim.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::client::{WorkerClient, WorkerStatus};
use crate::agent::manager::AgentManager;
use crate::agent::spawner::pid_alive;
use crate::agent::{AgentRecord, AgentStatus};
use crate::error::Result;
use crate::ports::{PortLease, PortRegistry};
use crate::solicitations::{Solicitation, SolicitationStore};
use crate::tasks::{Task, TaskStore};

/// Snapshot schema version.
pub const SNAPSHOT_VERSION: u32 = 1;

/// Persisted projection of hub state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubSnapshot {
    /// Schema version; bumped on incompatible layout changes.
    pub version: u32,
    /// When the snapshot was taken.
    pub saved_at: DateTime<Utc>,
    /// Agents that were running (starting/ready/busy) at capture time.
    pub agents: Vec<AgentRecord>,
    /// Every task, including tombstones.
    pub tasks: Vec<Task>,
    /// Pending solicitations only; terminal ones are history.
    pub solicitations: Vec<Solicitation>,
    /// All port leases.
    pub ports: Vec<PortLease>,
}

impl HubSnapshot {
    /// Captures the current state of the given stores.
    pub fn capture(
        manager: &AgentManager,
        tasks: &TaskStore,
        solicitations: &SolicitationStore,
        ports: &PortRegistry,
    ) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            agents: manager
                .list()
                .into_iter()
                .filter(|a| a.status.is_running())
                .collect(),
            tasks: tasks.all(),
            solicitations: solicitations.pending(),
            ports: ports.list_leases(),
        }
    }
}

/// Atomic snapshot reader/writer.
#[derive(Debug)]
pub struct StatePersistor {
    path: PathBuf,
    /// Save and Load mutually exclude.
    io_lock: Mutex<()>,
}

impl StatePersistor {
    /// Creates a persistor writing to `path`.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            io_lock: Mutex::new(()),
        }
    }

    /// Writes the snapshot via temp file + rename, creating the parent
    /// directory if absent. The file ends up world-readable (0644).
    pub fn save(&self, snapshot: &HubSnapshot) -> Result<()> {
        let _guard = self.io_lock.lock().expect("persistor lock poisoned");

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(snapshot)?)?;
        fs::set_permissions(&tmp, fs::Permissions::from_mode(0o644))?;
        fs::rename(&tmp, &self.path)?;

        log::info!(
            "[state] snapshot saved: {} agents, {} tasks, {} leases",
            snapshot.agents.len(),
            snapshot.tasks.len(),
            snapshot.ports.len()
        );
        Ok(())
    }

    /// Reads the last snapshot; `None` when no snapshot exists. Decoding
    /// errors propagate.
    pub fn load(&self) -> Result<Option<HubSnapshot>> {
        let _guard = self.io_lock.lock().expect("persistor lock poisoned");
        if !self.path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    /// Whether a snapshot file exists.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Removes the snapshot file, if present.
    pub fn delete(&self) -> Result<()> {
        let _guard = self.io_lock.lock().expect("persistor lock poisoned");
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// Outcome of boot-time restoration.
#[derive(Debug, Default, Clone, Copy)]
pub struct RestoreSummary {
    /// Agents that proved alive and were re-registered.
    pub agents_restored: usize,
    /// Agents found dead and dropped.
    pub agents_dropped: usize,
    /// Tasks reloaded.
    pub tasks: usize,
    /// Pending solicitations reloaded.
    pub solicitations: usize,
    /// Port leases reloaded.
    pub ports: usize,
}

/// Applies a snapshot to fresh stores and probes recovered agents.
///
/// An agent survives only if its recorded pid still exists *and* its
/// control port answers as ready or busy. Survivors are registered without
/// a process handle; the dead are dropped and their leases released.
pub async fn restore_snapshot(
    snapshot: HubSnapshot,
    manager: &AgentManager,
    tasks: &TaskStore,
    solicitations: &SolicitationStore,
    ports: &PortRegistry,
    client: &dyn WorkerClient,
) -> Result<RestoreSummary> {
    let mut summary = RestoreSummary {
        tasks: snapshot.tasks.len(),
        solicitations: snapshot.solicitations.len(),
        ports: snapshot.ports.len(),
        ..RestoreSummary::default()
    };

    tasks.restore(snapshot.tasks)?;
    solicitations.restore(snapshot.solicitations);
    for lease in snapshot.ports {
        ports.restore_lease(lease);
    }

    for record in snapshot.agents {
        let pid = record.pid.unwrap_or(0);
        let alive = pid > 0 && pid_alive(pid) && {
            matches!(
                client.get_status(record.port).await,
                Ok(WorkerStatus::Ready | WorkerStatus::Busy)
            )
        };

        if alive {
            log::info!(
                "[state] recovered agent {} (pid {pid}, port {})",
                record.name,
                record.port
            );
            let mut agent = record.into_agent();
            // A recovered drone answered the probe, so it is at least ready.
            if agent.status == AgentStatus::Starting {
                agent.set_status(AgentStatus::Ready);
            }
            manager.register(agent);
            summary.agents_restored += 1;
        } else {
            log::warn!(
                "[state] dropping dead agent {} (pid {pid}, port {})",
                record.name,
                record.port
            );
            ports.release_all_for_agent(&record.id);
            summary.agents_dropped += 1;
        }
    }

    Ok(summary)
}
