//! Hive — a local orchestrator for worktree-isolated coding drones.
//!
//! A central [`Hub`] spawns and supervises a fleet of interactive
//! coding-assistant workers, each in its own git worktree on its own port,
//! and exposes an HTTP + SSE API for operators and dashboards.
//!
//! # Architecture
//!
//! ```text
//! Hub (HTTP API, SSE, snapshot)
//! ├── AgentManager ── AgentSpawner ── drone processes
//! │        │               ├── WorktreeManager (git worktrees)
//! │        │               └── PortRegistry (leases + waiters)
//! │        └── WorkerClient (drone control protocol)
//! ├── TaskStore (filesystem, dependency graph)
//! ├── SolicitationStore (request/response pipe)
//! ├── EventBus (bounded fan-out)
//! └── StatePersistor (.hive/hub-state.json)
//! ```
//!
//! The [`inbox`] module is the alternative coordination backend for agents
//! hosted as cooperative tasks instead of external processes.

pub mod agent;
pub mod config;
pub mod error;
pub mod events;
pub mod hub;
pub mod inbox;
pub mod ports;
pub mod solicitations;
pub mod state;
pub mod tasks;
pub mod worktree;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::Config;
pub use error::{HiveError, Result};
pub use hub::Hub;
