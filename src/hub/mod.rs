//! Hub — central orchestrator wiring every store together.
//!
//! The Hub owns all core state and is a plain value the caller constructs;
//! there is no global. Components publish onto the shared event bus, the
//! HTTP layer (see [`http`]) exposes them to operators and dashboards, and
//! the persistor snapshots them across restarts.
//!
//! ```text
//!            ┌──────────────────────┐
//!            │         Hub          │
//!            │  - owns all stores   │
//!            │  - restore/shutdown  │
//!            └──────────┬───────────┘
//!                       │
//!        ┌──────────┬───┴─────┬──────────┐
//!        ▼          ▼         ▼          ▼
//!     HTTP API   Event Bus  Spawner   Persistor
//!    (operators) (SSE fan)  (drones)  (.hive/)
//! ```
//!
//! Shutdown order matters: snapshot first, then stop agents, then the HTTP
//! server — a crash while agents terminate still leaves a recoverable file.

pub mod http;
pub mod stream;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::agent::client::{HttpWorkerClient, WorkerClient};
use crate::agent::manager::AgentManager;
use crate::agent::spawner::AgentSpawner;
use crate::config::Config;
use crate::error::Result;
use crate::events::EventBus;
use crate::ports::PortRegistry;
use crate::solicitations::SolicitationStore;
use crate::state::{restore_snapshot, HubSnapshot, RestoreSummary, StatePersistor};
use crate::tasks::TaskStore;
use crate::worktree::WorktreeManager;

/// A drone counts as stuck after this long busy without a status change.
pub const STUCK_THRESHOLD: std::time::Duration = std::time::Duration::from_secs(10 * 60);

/// Interval between background status sweeps.
const REFRESH_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Central orchestrator for the hive.
pub struct Hub {
    /// Configuration the hub was built with.
    pub config: Config,
    /// Shared event bus.
    pub events: Arc<EventBus>,
    /// Worktree manager.
    pub worktrees: Arc<WorktreeManager>,
    /// Port registry.
    pub ports: Arc<PortRegistry>,
    /// Task store.
    pub tasks: Arc<TaskStore>,
    /// Solicitation store.
    pub solicitations: Arc<SolicitationStore>,
    /// Agent registry.
    pub manager: Arc<AgentManager>,
    /// Snapshot reader/writer.
    pub persistor: StatePersistor,
    client: Arc<dyn WorkerClient>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("hub_port", &self.config.hub_port)
            .field("agents", &self.manager.count())
            .finish_non_exhaustive()
    }
}

impl Hub {
    /// Builds a hub speaking real HTTP to its drones.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_client(config, Arc::new(HttpWorkerClient::new()))
    }

    /// Builds a hub with an injected worker client (tests use the mock).
    pub fn with_client(config: Config, client: Arc<dyn WorkerClient>) -> Result<Self> {
        let events = Arc::new(EventBus::new());
        let publisher = events.publisher();

        let worktrees = Arc::new(WorktreeManager::new(
            config.repo_path.clone(),
            config.worktrees_dir.clone(),
        ));
        let ports = Arc::new(PortRegistry::new(publisher.clone()));
        let tasks = Arc::new(TaskStore::open(config.tasks_dir(), publisher.clone())?);
        let solicitations = Arc::new(SolicitationStore::new(publisher.clone()));

        let spawner = AgentSpawner::new(
            config.clone(),
            Arc::clone(&worktrees),
            Arc::clone(&ports),
            Arc::clone(&client),
        );
        let manager = Arc::new(AgentManager::new(
            spawner,
            Arc::clone(&client),
            Arc::clone(&tasks),
            publisher,
        ));
        let persistor = StatePersistor::new(config.state_path());

        Ok(Self {
            config,
            events,
            worktrees,
            ports,
            tasks,
            solicitations,
            manager,
            persistor,
            client,
            shutdown: CancellationToken::new(),
        })
    }

    /// Token cancelled when the hub shuts down. Long-running operations
    /// derive their contexts from it.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Restores the last snapshot, if any.
    ///
    /// Restoration problems are logged and swallowed — a bad snapshot must
    /// never keep the hub from starting.
    pub async fn restore(&self) -> RestoreSummary {
        let snapshot = match self.persistor.load() {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                log::info!("[hub] no snapshot to restore");
                return RestoreSummary::default();
            }
            Err(err) => {
                log::error!("[hub] snapshot unreadable, starting fresh: {err}");
                return RestoreSummary::default();
            }
        };

        match restore_snapshot(
            snapshot,
            &self.manager,
            &self.tasks,
            &self.solicitations,
            &self.ports,
            self.client.as_ref(),
        )
        .await
        {
            Ok(summary) => {
                log::info!(
                    "[hub] restored {} agents ({} dropped), {} tasks, {} leases",
                    summary.agents_restored,
                    summary.agents_dropped,
                    summary.tasks,
                    summary.ports
                );
                summary
            }
            Err(err) => {
                log::error!("[hub] restoration failed, starting fresh: {err}");
                RestoreSummary::default()
            }
        }
    }

    /// Captures and writes a snapshot now.
    pub fn snapshot(&self) -> Result<()> {
        let snapshot = HubSnapshot::capture(
            &self.manager,
            &self.tasks,
            &self.solicitations,
            &self.ports,
        );
        self.persistor.save(&snapshot)
    }

    /// Serves the hub API on `listener` until shutdown.
    ///
    /// Also runs the event bus dispatch loop; both stop when the shutdown
    /// token fires.
    pub async fn serve(self: Arc<Self>, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
        let bus = Arc::clone(&self.events);
        let bus_cancel = self.shutdown.clone();
        let dispatch = tokio::spawn(async move { bus.run(bus_cancel).await });

        // Periodic status sweep so dashboards see dead drones without
        // polling each agent themselves.
        let refresh_manager = Arc::clone(&self.manager);
        let refresh_cancel = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(REFRESH_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => refresh_manager.refresh_all().await,
                    () = refresh_cancel.cancelled() => break,
                }
            }
        });

        let app = http::router(Arc::clone(&self));
        let shutdown = self.shutdown.clone();
        log::info!("[hub] listening on {}", listener.local_addr()?);
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await?;

        let _ = dispatch.await;
        Ok(())
    }

    /// Restores state, binds the configured port, and serves until shutdown.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        self.restore().await;
        let listener =
            tokio::net::TcpListener::bind(("127.0.0.1", self.config.hub_port)).await?;
        self.serve(listener).await
    }

    /// Graceful stop: snapshot, stop every agent, then stop the server.
    pub async fn stop(&self) {
        log::info!("[hub] shutting down");

        // Snapshot before touching agents so a crash mid-termination still
        // leaves a recoverable file.
        if let Err(err) = self.snapshot() {
            log::error!("[hub] shutdown snapshot failed: {err}");
        }

        // Agents are stopped with a fresh token: the shutdown itself must
        // not cancel the stop grace period.
        let stop_token = CancellationToken::new();
        if let Err(err) = self.manager.stop_all(&stop_token).await {
            log::warn!("[hub] stop_all finished with errors, last: {err}");
        }

        self.shutdown.cancel();
    }
}
