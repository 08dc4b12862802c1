//! Drone control protocol client.
//!
//! Every drone runs a tiny HTTP server on its allocated port:
//!
//! ```text
//! POST /message  {"content": "...", "type": "user"}
//! GET  /messages → {"messages": [...]}
//! GET  /status   → {"status": "stable" | "running"}
//! ```
//!
//! Higher layers talk to drones only through the [`WorkerClient`]
//! capability set, so tests swap in [`MockWorkerClient`] without touching
//! the manager or spawner.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{HiveError, Result};

/// Default per-call HTTP timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between readiness polls.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How much of an error body to quote back in error messages.
const BODY_SNIPPET_MAX: usize = 200;

/// Status a drone reports on its control port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// `"stable"` — idle and accepting input.
    Ready,
    /// `"running"` — processing.
    Busy,
    /// Anything else.
    Error,
}

/// One message from a drone's conversation log.
///
/// Drones attach assorted fields; everything beyond role/content is kept
/// verbatim in `extra`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerMessage {
    /// Message author role, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Message content.
    #[serde(default)]
    pub content: serde_json::Value,
    /// Any other fields the drone included.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Capability set for talking to one drone.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Delivers an operator/user message to the drone.
    async fn send_message(&self, port: u16, content: &str) -> Result<()>;

    /// Fetches the drone's conversation log.
    async fn get_messages(&self, port: u16) -> Result<Vec<WorkerMessage>>;

    /// Asks the drone for its current status.
    async fn get_status(&self, port: u16) -> Result<WorkerStatus>;

    /// Polls every 500 ms until the drone reports Ready or Busy.
    ///
    /// Fails with `Timeout` when `timeout` elapses first, `Cancelled` when
    /// the caller's token fires.
    async fn wait_ready(
        &self,
        port: u16,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<WorkerStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.get_status(port).await {
                Ok(status @ (WorkerStatus::Ready | WorkerStatus::Busy)) => return Ok(status),
                Ok(WorkerStatus::Error) => {}
                Err(err) => log::debug!("[client] status probe on {port} failed: {err}"),
            }
            if tokio::time::Instant::now() + POLL_INTERVAL > deadline {
                return Err(HiveError::Timeout(format!(
                    "drone on port {port} not ready after {timeout:?}"
                )));
            }
            tokio::select! {
                () = tokio::time::sleep(POLL_INTERVAL) => {}
                () = cancel.cancelled() => return Err(HiveError::Cancelled),
            }
        }
    }

    /// Non-throwing single probe: is the drone answering as Ready or Busy?
    async fn health(&self, port: u16) -> bool {
        matches!(
            self.get_status(port).await,
            Ok(WorkerStatus::Ready | WorkerStatus::Busy)
        )
    }
}

#[derive(Serialize)]
struct OutboundMessage<'a> {
    content: &'a str,
    #[serde(rename = "type")]
    message_type: &'a str,
}

#[derive(Deserialize)]
struct MessagesEnvelope {
    #[serde(default)]
    messages: Vec<WorkerMessage>,
}

#[derive(Deserialize)]
struct StatusEnvelope {
    status: String,
}

/// HTTP implementation of the drone control protocol.
#[derive(Debug, Clone)]
pub struct HttpWorkerClient {
    client: reqwest::Client,
}

impl Default for HttpWorkerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpWorkerClient {
    /// Builds a client with the default 30 s per-call timeout.
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    fn url(port: u16, path: &str) -> String {
        format!("http://127.0.0.1:{port}{path}")
    }
}

#[async_trait]
impl WorkerClient for HttpWorkerClient {
    async fn send_message(&self, port: u16, content: &str) -> Result<()> {
        let response = self
            .client
            .post(Self::url(port, "/message"))
            .json(&OutboundMessage {
                content,
                message_type: "user",
            })
            .send()
            .await?;

        if response.status().is_success() {
            return Ok(());
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let snippet: String = body.chars().take(BODY_SNIPPET_MAX).collect();
        Err(HiveError::ChildFailed(format!(
            "drone on port {port} rejected message ({status}): {snippet}"
        )))
    }

    async fn get_messages(&self, port: u16) -> Result<Vec<WorkerMessage>> {
        let envelope: MessagesEnvelope = self
            .client
            .get(Self::url(port, "/messages"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(envelope.messages)
    }

    async fn get_status(&self, port: u16) -> Result<WorkerStatus> {
        let envelope: StatusEnvelope = self
            .client
            .get(Self::url(port, "/status"))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(match envelope.status.as_str() {
            "stable" => WorkerStatus::Ready,
            "running" => WorkerStatus::Busy,
            other => {
                log::debug!("[client] drone on {port} reported status {other:?}");
                WorkerStatus::Error
            }
        })
    }
}

/// In-memory drone for tests: scripted statuses, recorded messages.
#[derive(Debug, Default)]
pub struct MockWorkerClient {
    state: Mutex<MockState>,
}

#[derive(Debug, Default)]
struct MockState {
    statuses: HashMap<u16, WorkerStatus>,
    conversations: HashMap<u16, Vec<WorkerMessage>>,
    sent: Vec<(u16, String)>,
}

impl MockWorkerClient {
    /// An empty mock; unknown ports answer as unreachable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the status a port reports.
    pub fn set_status(&self, port: u16, status: WorkerStatus) {
        self.state
            .lock()
            .expect("mock state poisoned")
            .statuses
            .insert(port, status);
    }

    /// Unscripts a port; it answers as unreachable again.
    pub fn clear_status(&self, port: u16) {
        self.state
            .lock()
            .expect("mock state poisoned")
            .statuses
            .remove(&port);
    }

    /// Scripts the conversation a port returns.
    pub fn set_messages(&self, port: u16, messages: Vec<WorkerMessage>) {
        self.state
            .lock()
            .expect("mock state poisoned")
            .conversations
            .insert(port, messages);
    }

    /// Messages delivered so far, in order.
    pub fn sent(&self) -> Vec<(u16, String)> {
        self.state.lock().expect("mock state poisoned").sent.clone()
    }
}

#[async_trait]
impl WorkerClient for MockWorkerClient {
    async fn send_message(&self, port: u16, content: &str) -> Result<()> {
        let mut state = self.state.lock().expect("mock state poisoned");
        if !state.statuses.contains_key(&port) {
            return Err(HiveError::ChildFailed(format!(
                "no drone listening on port {port}"
            )));
        }
        state.sent.push((port, content.to_string()));
        Ok(())
    }

    async fn get_messages(&self, port: u16) -> Result<Vec<WorkerMessage>> {
        Ok(self
            .state
            .lock()
            .expect("mock state poisoned")
            .conversations
            .get(&port)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_status(&self, port: u16) -> Result<WorkerStatus> {
        self.state
            .lock()
            .expect("mock state poisoned")
            .statuses
            .get(&port)
            .copied()
            .ok_or_else(|| HiveError::ChildFailed(format!("no drone listening on port {port}")))
    }
}
