//! Event bus for pub/sub broadcasting to streaming clients.
//!
//! State changes anywhere in the hub are published here and fanned out to
//! subscribers (the SSE endpoint, tests). Both sides are bounded:
//!
//! ```text
//! Publisher ──try_send──► ingress (cap 100) ──dispatch──► per-subscriber
//!                                                          buffers (cap 10)
//! ```
//!
//! Publishing never blocks. A saturated ingress queue drops the event; a
//! saturated subscriber buffer drops the newest event for that subscriber
//! only. Slow consumers therefore cannot stall producers or each other.

// Rust guideline compliant 2026-02

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Capacity of the bus ingress queue.
///
/// 100 events absorbs a full spawn/stop burst; beyond that producers keep
/// running and the overflow is dropped.
const INGRESS_CAPACITY: usize = 100;

/// Capacity of each subscriber's buffer.
const SUBSCRIBER_CAPACITY: usize = 10;

/// Typed event kinds broadcast by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// A new agent finished spawning.
    #[serde(rename = "agent.spawned")]
    AgentSpawned,
    /// An agent was stopped (process terminated, port released).
    #[serde(rename = "agent.stopped")]
    AgentStopped,
    /// An agent was destroyed (stopped and worktree removed).
    #[serde(rename = "agent.destroyed")]
    AgentDestroyed,
    /// An agent's status changed.
    #[serde(rename = "agent.status")]
    AgentStatus,
    /// A message was delivered to an agent.
    #[serde(rename = "message.sent")]
    MessageSent,
    /// New messages arrived from an agent's conversation.
    #[serde(rename = "message.received")]
    MessageReceived,
    /// A task was created.
    #[serde(rename = "task.created")]
    TaskCreated,
    /// A task moved to in-progress.
    #[serde(rename = "task.started")]
    TaskStarted,
    /// A task reported step progress.
    #[serde(rename = "task.progress")]
    TaskProgress,
    /// A task completed.
    #[serde(rename = "task.completed")]
    TaskCompleted,
    /// A task failed.
    #[serde(rename = "task.failed")]
    TaskFailed,
    /// A task was cancelled.
    #[serde(rename = "task.cancelled")]
    TaskCancelled,
    /// A solicitation was created.
    #[serde(rename = "solicitation.new")]
    SolicitationNew,
    /// A solicitation received a response.
    #[serde(rename = "solicitation.responded")]
    SolicitationResponded,
    /// A solicitation was dismissed.
    #[serde(rename = "solicitation.dismissed")]
    SolicitationDismissed,
    /// A solicitation expired.
    #[serde(rename = "solicitation.expired")]
    SolicitationExpired,
    /// A port lease was granted.
    #[serde(rename = "port.acquired")]
    PortAcquired,
    /// A port lease was released.
    #[serde(rename = "port.released")]
    PortReleased,
    /// A caller queued behind a held port.
    #[serde(rename = "port.waiting")]
    PortWaiting,
    /// A port wait elapsed without the lease transferring.
    #[serde(rename = "port.timeout")]
    PortTimeout,
    /// Contention detail for dashboards.
    #[serde(rename = "port.conflict")]
    PortConflict,
    /// Reserved error channel for streaming clients.
    #[serde(rename = "error")]
    Error,
}

impl EventType {
    /// Wire name of this event type (`agent.spawned`, `port.released`, …).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentSpawned => "agent.spawned",
            Self::AgentStopped => "agent.stopped",
            Self::AgentDestroyed => "agent.destroyed",
            Self::AgentStatus => "agent.status",
            Self::MessageSent => "message.sent",
            Self::MessageReceived => "message.received",
            Self::TaskCreated => "task.created",
            Self::TaskStarted => "task.started",
            Self::TaskProgress => "task.progress",
            Self::TaskCompleted => "task.completed",
            Self::TaskFailed => "task.failed",
            Self::TaskCancelled => "task.cancelled",
            Self::SolicitationNew => "solicitation.new",
            Self::SolicitationResponded => "solicitation.responded",
            Self::SolicitationDismissed => "solicitation.dismissed",
            Self::SolicitationExpired => "solicitation.expired",
            Self::PortAcquired => "port.acquired",
            Self::PortReleased => "port.released",
            Self::PortWaiting => "port.waiting",
            Self::PortTimeout => "port.timeout",
            Self::PortConflict => "port.conflict",
            Self::Error => "error",
        }
    }
}

/// An event broadcast on state change. Not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Event kind.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Opaque payload; shape depends on the kind.
    pub data: serde_json::Value,
    /// When the event was published.
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Builds an event stamped with the current time.
    pub fn new(event_type: EventType, data: serde_json::Value) -> Self {
        Self {
            event_type,
            data,
            timestamp: Utc::now(),
        }
    }
}

/// A registered subscriber's sending side.
struct SubscriberSink {
    id: u64,
    tx: mpsc::Sender<Event>,
}

/// Handle for publishing events onto the bus.
///
/// Cheap to clone; every store holds one. Publishing on a bus whose
/// dispatch loop has shut down is a silent no-op.
#[derive(Clone)]
pub struct EventPublisher {
    tx: Option<mpsc::Sender<Event>>,
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("connected", &self.tx.is_some())
            .finish()
    }
}

impl EventPublisher {
    /// A publisher that discards everything. Used by stores under test.
    pub fn disconnected() -> Self {
        Self { tx: None }
    }

    /// Publishes an event without blocking. Drops when the bus is saturated.
    pub fn publish(&self, event_type: EventType, data: serde_json::Value) {
        let Some(tx) = &self.tx else { return };
        let event = Event::new(event_type, data);
        if let Err(err) = tx.try_send(event) {
            log::debug!("[events] dropped {} ({err})", event_type.as_str());
        }
    }
}

/// Receiving side handed to a streaming client.
#[derive(Debug)]
pub struct Subscription {
    /// Identifier for explicit unsubscribe.
    pub id: u64,
    /// Bounded event stream; dropped events never appear here.
    pub rx: mpsc::Receiver<Event>,
}

/// Bounded fan-out bus.
///
/// One dispatch task owns the ingress receiver (see [`EventBus::run`]) and
/// copies each event into every live subscriber buffer.
pub struct EventBus {
    ingress_tx: mpsc::Sender<Event>,
    ingress_rx: Mutex<Option<mpsc::Receiver<Event>>>,
    subscribers: Arc<Mutex<Vec<SubscriberSink>>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Creates a bus with the documented ingress capacity.
    pub fn new() -> Self {
        let (ingress_tx, ingress_rx) = mpsc::channel(INGRESS_CAPACITY);
        Self {
            ingress_tx,
            ingress_rx: Mutex::new(Some(ingress_rx)),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Returns a publish handle for stores.
    pub fn publisher(&self) -> EventPublisher {
        EventPublisher {
            tx: Some(self.ingress_tx.clone()),
        }
    }

    /// Registers a new subscriber and returns its bounded stream.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("subscriber set poisoned")
            .push(SubscriberSink { id, tx });
        Subscription { id, rx }
    }

    /// Removes a subscriber; its stream ends.
    pub fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("subscriber set poisoned")
            .retain(|s| s.id != id);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("subscriber set poisoned")
            .len()
    }

    /// Runs the dispatch loop until `cancel` fires or all publishers drop.
    ///
    /// Fan-out is `try_send` per sink: a full sink loses this event, the
    /// rest still receive it. Sinks whose receiver has gone away are pruned
    /// in the same pass. On shutdown every sink is dropped, which closes the
    /// subscriber streams.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut rx = match self
            .ingress_rx
            .lock()
            .expect("ingress receiver poisoned")
            .take()
        {
            Some(rx) => rx,
            None => {
                log::warn!("[events] run() called twice; dispatch already taken");
                return;
            }
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    self.dispatch(&event);
                }
            }
        }

        self.subscribers
            .lock()
            .expect("subscriber set poisoned")
            .clear();
        log::debug!("[events] dispatch loop stopped");
    }

    fn dispatch(&self, event: &Event) {
        let mut sinks = self.subscribers.lock().expect("subscriber set poisoned");
        sinks.retain(|sink| match sink.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::debug!(
                    "[events] subscriber {} full, dropping {}",
                    sink.id,
                    event.event_type.as_str()
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}
