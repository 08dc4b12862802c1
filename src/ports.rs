//! Port registry with leases and fair waiters.
//!
//! Ports are an advisory resource: a lease records which agent claims a
//! port, and callers that want a held port can queue behind it. The
//! registry guarantees FIFO hand-off per port — a release wakes exactly the
//! head waiter, which retries the acquire with priority.
//!
//! The lease map and per-port waiter queues sit behind a single mutex whose
//! critical sections never suspend. Blocked callers park outside the lock
//! on a per-waiter oneshot channel; release hands control off by firing the
//! head waiter's channel.

// Rust guideline compliant 2026-02

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{HiveError, Result};
use crate::events::{EventPublisher, EventType};

/// An exclusive, revocable hold on a TCP port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortLease {
    /// The leased port.
    pub port: u16,
    /// Id of the agent holding the lease.
    pub agent_id: String,
    /// Name of the agent holding the lease.
    pub agent_name: String,
    /// What the port is used for (`drone`, `dev-server`, …).
    pub service_tag: String,
    /// Pid bound to the port, when known. Used by force-release.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    /// When the lease was granted.
    pub leased_at: DateTime<Utc>,
}

/// Parameters for [`PortRegistry::acquire`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquireRequest {
    /// Port to lease.
    pub port: u16,
    /// Id of the requesting agent.
    pub agent_id: String,
    /// Name of the requesting agent; defaults to the id.
    #[serde(default)]
    pub agent_name: String,
    /// Service tag recorded on the lease.
    #[serde(default = "default_service_tag")]
    pub service_tag: String,
    /// Pid to record on the lease, when known.
    #[serde(default)]
    pub pid: Option<i32>,
    /// Whether to queue when the port is held.
    #[serde(default)]
    pub wait: bool,
    /// Wait bound in seconds; 0 means wait until cancelled.
    #[serde(default)]
    pub timeout_secs: u64,
}

fn default_service_tag() -> String {
    "adhoc".to_string()
}

impl AcquireRequest {
    /// A non-waiting request with the given identity.
    pub fn immediate(port: u16, agent_id: &str, agent_name: &str, service_tag: &str) -> Self {
        Self {
            port,
            agent_id: agent_id.to_string(),
            agent_name: agent_name.to_string(),
            service_tag: service_tag.to_string(),
            pid: None,
            wait: false,
            timeout_secs: 0,
        }
    }
}

/// Result of an acquire call.
#[derive(Debug, Clone)]
pub enum AcquireOutcome {
    /// The lease was granted to the caller.
    Acquired(PortLease),
    /// The port is held and the caller declined to wait.
    Busy(PortLease),
    /// The caller waited, and the wait elapsed.
    TimedOut,
}

/// A queued waiter, as reported by [`PortRegistry::list_waiters`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortWaiterInfo {
    /// Id of the waiting agent.
    pub agent_id: String,
    /// Port being waited on.
    pub port: u16,
    /// Service tag the waiter will record on its lease.
    pub service_tag: String,
    /// When the waiter queued.
    pub waiting_since: DateTime<Utc>,
    /// Wait bound in seconds; 0 means unbounded.
    pub timeout_secs: u64,
}

/// Point-in-time view of one port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortStatus {
    /// The port in question.
    pub port: u16,
    /// Current lease, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease: Option<PortLease>,
    /// Number of queued waiters.
    pub waiters: usize,
}

struct Waiter {
    seq: u64,
    agent_id: String,
    service_tag: String,
    waiting_since: DateTime<Utc>,
    timeout_secs: u64,
    wake_tx: oneshot::Sender<()>,
}

#[derive(Default)]
struct Inner {
    leases: HashMap<u16, PortLease>,
    waiters: HashMap<u16, VecDeque<Waiter>>,
    next_seq: u64,
}

impl Inner {
    /// Wakes the head waiter for `port`, skipping waiters whose receiver is
    /// already gone (cancelled between pop and send).
    fn wake_next(&mut self, port: u16) {
        if let Some(queue) = self.waiters.get_mut(&port) {
            while let Some(waiter) = queue.pop_front() {
                if waiter.wake_tx.send(()).is_ok() {
                    break;
                }
            }
            if queue.is_empty() {
                self.waiters.remove(&port);
            }
        }
    }

    /// Removes a specific waiter; false means it was already woken.
    fn remove_waiter(&mut self, port: u16, seq: u64) -> bool {
        let Some(queue) = self.waiters.get_mut(&port) else {
            return false;
        };
        let before = queue.len();
        queue.retain(|w| w.seq != seq);
        let removed = queue.len() < before;
        if queue.is_empty() {
            self.waiters.remove(&port);
        }
        removed
    }
}

/// Advisory port allocation with blocking acquisition and fair hand-off.
pub struct PortRegistry {
    inner: Mutex<Inner>,
    events: EventPublisher,
}

impl std::fmt::Debug for PortRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().expect("port registry poisoned");
        f.debug_struct("PortRegistry")
            .field("leases", &inner.leases.len())
            .field("waiting_ports", &inner.waiters.len())
            .finish()
    }
}

impl PortRegistry {
    /// Creates a registry publishing `port.*` events through `events`.
    pub fn new(events: EventPublisher) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    /// Acquires a lease on `req.port`.
    ///
    /// When the port is free the lease is granted immediately. When held:
    /// without `wait` the current lease is returned as [`AcquireOutcome::Busy`];
    /// with `wait` the caller queues FIFO and suspends until woken by a
    /// release, the timeout elapses, or `cancel` fires. A woken waiter that
    /// loses the re-acquire race is requeued at the head so fairness holds.
    pub async fn acquire(
        &self,
        req: AcquireRequest,
        cancel: &CancellationToken,
    ) -> Result<AcquireOutcome> {
        let deadline = (req.timeout_secs > 0)
            .then(|| tokio::time::Instant::now() + Duration::from_secs(req.timeout_secs));
        // First pass queues at the tail; a woken waiter that lost the race
        // requeues at the head.
        let mut requeue_front = false;

        loop {
            let (rx, seq) = {
                let mut inner = self.inner.lock().expect("port registry poisoned");

                if !inner.leases.contains_key(&req.port) {
                    let lease = self.grant(&mut inner, &req);
                    return Ok(AcquireOutcome::Acquired(lease));
                }

                let holder = inner.leases[&req.port].clone();
                if !req.wait {
                    self.events.publish(
                        EventType::PortConflict,
                        serde_json::json!({
                            "port": req.port,
                            "requestedBy": req.agent_id,
                            "heldBy": holder.agent_id,
                        }),
                    );
                    return Ok(AcquireOutcome::Busy(holder));
                }

                let seq = inner.next_seq;
                inner.next_seq += 1;
                let (tx, rx) = oneshot::channel();
                let waiter = Waiter {
                    seq,
                    agent_id: req.agent_id.clone(),
                    service_tag: req.service_tag.clone(),
                    waiting_since: Utc::now(),
                    timeout_secs: req.timeout_secs,
                    wake_tx: tx,
                };
                let queue = inner.waiters.entry(req.port).or_default();
                if requeue_front {
                    queue.push_front(waiter);
                } else {
                    queue.push_back(waiter);
                    self.events.publish(
                        EventType::PortWaiting,
                        serde_json::json!({
                            "port": req.port,
                            "agentId": req.agent_id,
                            "position": queue.len(),
                        }),
                    );
                }
                (rx, seq)
            };

            let woken = self.park(rx, seq, &req, deadline, cancel).await?;
            if !woken {
                return Ok(AcquireOutcome::TimedOut);
            }
            requeue_front = true;
        }
    }

    /// Suspends one queued waiter until wake, timeout, or cancellation.
    ///
    /// Ok(true) means woken (retry the acquire); Ok(false) means timed out.
    async fn park(
        &self,
        rx: oneshot::Receiver<()>,
        seq: u64,
        req: &AcquireRequest,
        deadline: Option<tokio::time::Instant>,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let outcome = if let Some(deadline) = deadline {
            tokio::select! {
                result = rx => Park::Woken(result.is_ok()),
                () = tokio::time::sleep_until(deadline) => Park::TimedOut,
                () = cancel.cancelled() => Park::Cancelled,
            }
        } else {
            tokio::select! {
                result = rx => Park::Woken(result.is_ok()),
                () = cancel.cancelled() => Park::Cancelled,
            }
        };

        match outcome {
            Park::Woken(true) => Ok(true),
            // Wake sender dropped without firing: the waiter was evicted.
            Park::Woken(false) => Err(HiveError::Cancelled),
            Park::TimedOut => {
                let mut inner = self.inner.lock().expect("port registry poisoned");
                if inner.remove_waiter(req.port, seq) {
                    self.events.publish(
                        EventType::PortTimeout,
                        serde_json::json!({
                            "port": req.port,
                            "agentId": req.agent_id,
                            "timeoutSecs": req.timeout_secs,
                        }),
                    );
                    Ok(false)
                } else {
                    // A release popped and woke us while the timer fired.
                    // Consume the wake-up: retry once rather than losing it.
                    Ok(true)
                }
            }
            Park::Cancelled => {
                let mut inner = self.inner.lock().expect("port registry poisoned");
                if !inner.remove_waiter(req.port, seq) {
                    // Already woken; pass the baton so the wake-up is not lost.
                    inner.wake_next(req.port);
                }
                Err(HiveError::Cancelled)
            }
        }
    }

    fn grant(&self, inner: &mut Inner, req: &AcquireRequest) -> PortLease {
        let lease = PortLease {
            port: req.port,
            agent_id: req.agent_id.clone(),
            agent_name: req.agent_name.clone(),
            service_tag: req.service_tag.clone(),
            pid: req.pid,
            leased_at: Utc::now(),
        };
        inner.leases.insert(req.port, lease.clone());
        self.events.publish(
            EventType::PortAcquired,
            serde_json::json!({
                "port": lease.port,
                "agentId": lease.agent_id,
                "serviceTag": lease.service_tag,
            }),
        );
        lease
    }

    /// Non-waiting acquire, usable from synchronous contexts.
    ///
    /// Exactly the fast path of [`PortRegistry::acquire`]: grant when free,
    /// report the holder when not.
    pub fn try_acquire(&self, req: &AcquireRequest) -> AcquireOutcome {
        let mut inner = self.inner.lock().expect("port registry poisoned");
        if !inner.leases.contains_key(&req.port) {
            let lease = self.grant(&mut inner, req);
            return AcquireOutcome::Acquired(lease);
        }
        let holder = inner.leases[&req.port].clone();
        self.events.publish(
            EventType::PortConflict,
            serde_json::json!({
                "port": req.port,
                "requestedBy": req.agent_id,
                "heldBy": holder.agent_id,
            }),
        );
        AcquireOutcome::Busy(holder)
    }

    /// Records the pid bound to a leased port (set once the child starts).
    pub fn record_pid(&self, port: u16, pid: i32) {
        let mut inner = self.inner.lock().expect("port registry poisoned");
        if let Some(lease) = inner.leases.get_mut(&port) {
            lease.pid = Some(pid);
        }
    }

    /// Releases a lease held by `agent_id`.
    ///
    /// Only the holder may release; anything else is `NotHeld` and leaves the
    /// registry untouched. The head waiter, if any, is woken.
    pub fn release(&self, agent_id: &str, port: u16) -> Result<()> {
        let mut inner = self.inner.lock().expect("port registry poisoned");
        match inner.leases.get(&port) {
            Some(lease) if lease.agent_id == agent_id => {
                inner.leases.remove(&port);
                self.events.publish(
                    EventType::PortReleased,
                    serde_json::json!({ "port": port, "agentId": agent_id }),
                );
                inner.wake_next(port);
                Ok(())
            }
            _ => Err(HiveError::NotHeld(port)),
        }
    }

    /// Releases a lease regardless of ownership.
    ///
    /// When the lease records a pid, that process gets a best-effort SIGTERM
    /// first so the OS-level socket actually frees up.
    pub fn force_release(&self, port: u16, reason: &str) -> Result<()> {
        let mut inner = self.inner.lock().expect("port registry poisoned");
        let Some(lease) = inner.leases.remove(&port) else {
            return Err(HiveError::not_found(format!("lease on port {port}")));
        };

        if let Some(pid) = lease.pid {
            log::warn!("[ports] force-release {port}: signalling pid {pid} ({reason})");
            // SAFETY: plain kill(2) with a valid signal number; the worst a
            // stale pid can do is ESRCH, which we ignore.
            unsafe {
                libc::kill(pid, libc::SIGTERM);
            }
        }

        self.events.publish(
            EventType::PortReleased,
            serde_json::json!({
                "port": port,
                "agentId": lease.agent_id,
                "forced": true,
                "reason": reason,
            }),
        );
        inner.wake_next(port);
        Ok(())
    }

    /// Releases every lease held by `agent_id` and evicts its waiters.
    ///
    /// Evicted waiters observe a dropped wake channel and fail their acquire
    /// with `Cancelled`. Returns the number of leases released.
    pub fn release_all_for_agent(&self, agent_id: &str) -> usize {
        let mut inner = self.inner.lock().expect("port registry poisoned");

        let ports: Vec<u16> = inner
            .leases
            .values()
            .filter(|l| l.agent_id == agent_id)
            .map(|l| l.port)
            .collect();
        for port in &ports {
            inner.leases.remove(port);
            self.events.publish(
                EventType::PortReleased,
                serde_json::json!({ "port": port, "agentId": agent_id }),
            );
        }

        // Evict this agent's waiters everywhere by dropping their wake
        // senders, then hand freed ports to the new head waiters.
        for queue in inner.waiters.values_mut() {
            queue.retain(|w| w.agent_id != agent_id);
        }
        inner.waiters.retain(|_, q| !q.is_empty());
        for port in &ports {
            inner.wake_next(*port);
        }

        ports.len()
    }

    /// Lease and queue state for one port.
    pub fn status(&self, port: u16) -> PortStatus {
        let inner = self.inner.lock().expect("port registry poisoned");
        PortStatus {
            port,
            lease: inner.leases.get(&port).cloned(),
            waiters: inner.waiters.get(&port).map_or(0, VecDeque::len),
        }
    }

    /// All current leases, ordered by port.
    pub fn list_leases(&self) -> Vec<PortLease> {
        let inner = self.inner.lock().expect("port registry poisoned");
        let mut leases: Vec<PortLease> = inner.leases.values().cloned().collect();
        leases.sort_by_key(|l| l.port);
        leases
    }

    /// All queued waiters, ordered by port then queue position.
    pub fn list_waiters(&self) -> Vec<PortWaiterInfo> {
        let inner = self.inner.lock().expect("port registry poisoned");
        let mut ports: Vec<&u16> = inner.waiters.keys().collect();
        ports.sort();
        ports
            .into_iter()
            .flat_map(|port| {
                inner.waiters[port].iter().map(|w| PortWaiterInfo {
                    agent_id: w.agent_id.clone(),
                    port: *port,
                    service_tag: w.service_tag.clone(),
                    waiting_since: w.waiting_since,
                    timeout_secs: w.timeout_secs,
                })
            })
            .collect()
    }

    /// Whether `port` currently has a lease. Used by the spawner's scan.
    pub fn is_leased(&self, port: u16) -> bool {
        self.inner
            .lock()
            .expect("port registry poisoned")
            .leases
            .contains_key(&port)
    }

    /// Restores a lease verbatim. Used by state restoration only; emits no
    /// event and overwrites silently.
    pub fn restore_lease(&self, lease: PortLease) {
        let mut inner = self.inner.lock().expect("port registry poisoned");
        inner.leases.insert(lease.port, lease);
    }
}

enum Park {
    Woken(bool),
    TimedOut,
    Cancelled,
}
