//! Agent types and lifecycle submodules.
//!
//! An agent ("drone") is a managed child worker bound to its own git
//! worktree and TCP port. The submodules split the lifecycle:
//!
//! - [`client`]: the drone control protocol (HTTP) behind a capability trait
//! - [`spawner`]: worktree + port + process assembly and teardown
//! - [`manager`]: the registry of live agents and message routing

pub mod client;
pub mod manager;
pub mod spawner;

pub use client::{HttpWorkerClient, WorkerClient, WorkerMessage, WorkerStatus};
pub use manager::AgentManager;
pub use spawner::{AgentSpawner, SpawnOptions};

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Execution status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Process launched, readiness probe still pending.
    Starting,
    /// Drone reports stable and can take messages.
    Ready,
    /// Drone is working.
    Busy,
    /// Process terminated by Stop/Destroy.
    Stopped,
    /// Drone unreachable or reported a failure.
    Error,
}

impl AgentStatus {
    /// Whether this status counts as running (holds a port and a worktree).
    pub fn is_running(self) -> bool {
        matches!(self, Self::Starting | Self::Ready | Self::Busy)
    }
}

/// A managed drone.
///
/// Owned exclusively by the [`AgentManager`]; everything else refers to
/// agents by id. The process handle is absent for agents recovered from a
/// snapshot — signalling falls back to the recorded pid.
#[derive(Debug)]
pub struct Agent {
    /// 8-char random identifier.
    pub id: String,
    /// Operator-chosen name, unique among live agents.
    pub name: String,
    /// Worktree the drone runs in.
    pub worktree_path: PathBuf,
    /// Branch checked out in the worktree.
    pub branch: String,
    /// Control-protocol port while live.
    pub port: u16,
    /// OS pid, when known.
    pub pid: Option<i32>,
    /// Current status.
    pub status: AgentStatus,
    /// Role tag ("backend", "tests", …).
    pub specialty: Option<String>,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// When the status last changed. Drives stuck-drone detection.
    pub status_changed_at: DateTime<Utc>,
    /// Last error captured from the drone or its lifecycle.
    pub last_error: Option<String>,
    /// Child handle; `None` for snapshot-recovered agents.
    pub child: Option<tokio::process::Child>,
}

impl Agent {
    /// Updates the status and its change timestamp.
    pub fn set_status(&mut self, status: AgentStatus) {
        if self.status != status {
            self.status = status;
            self.status_changed_at = Utc::now();
        }
    }

    /// Serializable projection of this agent.
    pub fn record(&self) -> AgentRecord {
        AgentRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            worktree_path: self.worktree_path.clone(),
            branch: self.branch.clone(),
            port: self.port,
            pid: self.pid,
            status: self.status,
            specialty: self.specialty.clone(),
            created_at: self.created_at,
            last_error: self.last_error.clone(),
        }
    }
}

/// Wire/persisted form of an [`Agent`] — everything but the live process
/// handle. Snapshot restoration rebuilds a sparse `Agent` from this.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    /// 8-char random identifier.
    pub id: String,
    /// Operator-chosen name.
    pub name: String,
    /// Worktree path.
    pub worktree_path: PathBuf,
    /// Branch name.
    pub branch: String,
    /// Control-protocol port.
    pub port: u16,
    /// OS pid, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    /// Status at capture time.
    pub status: AgentStatus,
    /// Role tag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub specialty: Option<String>,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last captured error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl AgentRecord {
    /// Rebuilds a sparse agent (no process handle) from this record.
    pub fn into_agent(self) -> Agent {
        Agent {
            id: self.id,
            name: self.name,
            worktree_path: self.worktree_path,
            branch: self.branch,
            port: self.port,
            pid: self.pid,
            status: self.status,
            specialty: self.specialty,
            created_at: self.created_at,
            status_changed_at: Utc::now(),
            last_error: self.last_error,
            child: None,
        }
    }
}

/// Allocates a fresh 8-character lowercase alphanumeric agent id.
pub fn new_agent_id() -> String {
    rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .take(8)
        .map(|b| (b as char).to_ascii_lowercase())
        .collect()
}
