//! File-based inbox coordination.
//!
//! The alternative coordination backend for agents hosted as cooperative
//! tasks rather than external processes. Each team owns a directory with
//! one JSON array file per recipient; messages are appended in arrival
//! order and the recipient is implied by the file, never repeated in the
//! envelope.
//!
//! Typed protocol messages (idle notifications, the shutdown handshake,
//! task assignment, plan approval) ride **inside** the `text` field as a
//! JSON string — double encoding. Consumers sniff a leading `{` and try the
//! nested type discriminator; a parse failure just means plain text.
//!
//! Liveness is not tracked in files. Stale teams linger until
//! [`Inbox::delete_team`] removes the team directory and its sibling task
//! directory.

// Rust guideline compliant 2026-02

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::{HiveError, Result};

/// One envelope in a recipient's inbox file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboxMessage {
    /// Sender name.
    pub from: String,
    /// Plain text, or a JSON-encoded [`ProtocolMessage`].
    pub text: String,
    /// Short preview; plain-text messages only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// ISO-8601 UTC with milliseconds.
    pub timestamp: String,
    /// Display color hint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    /// Whether the recipient has read it.
    pub read: bool,
}

/// Why an agent went idle at turn end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleReason {
    /// Finished its turn and can take new work.
    Available,
    /// Interrupted mid-turn.
    Interrupted,
}

/// Typed inner messages carried double-encoded in `InboxMessage::text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolMessage {
    /// Automatic turn-end notification.
    IdleNotification {
        /// Why the sender is idle.
        reason: IdleReason,
    },
    /// First phase of the shutdown handshake.
    ShutdownRequest {
        /// Correlation id: `shutdown-<epoch_ms>@<recipient>`.
        request_id: String,
        /// Why shutdown is being requested.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Second phase; rejection is permitted.
    ShutdownResponse {
        /// Correlation id echoed from the request.
        request_id: String,
        /// Whether the recipient agrees to shut down.
        approve: bool,
        /// Rationale, typically on rejection.
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Hands a task to a teammate.
    TaskAssignment {
        /// Task id in the team's task directory.
        task_id: String,
        /// Task subject.
        subject: String,
    },
    /// Asks a supervisor to approve a plan.
    PlanApprovalRequest {
        /// Correlation id.
        request_id: String,
        /// The plan text.
        plan: String,
    },
    /// Supervisor's verdict on a plan.
    PlanApprovalResponse {
        /// Correlation id echoed from the request.
        request_id: String,
        /// Whether the plan may proceed.
        approve: bool,
        /// Revision guidance on rejection.
        #[serde(skip_serializing_if = "Option::is_none")]
        feedback: Option<String>,
    },
}

impl ProtocolMessage {
    /// Decodes a protocol message from an envelope's `text` field.
    ///
    /// Plain text — including text that merely starts with `{` but is not a
    /// protocol object — decodes to `None`.
    pub fn decode(text: &str) -> Option<Self> {
        if !text.trim_start().starts_with('{') {
            return None;
        }
        serde_json::from_str(text).ok()
    }

    /// Builds the shutdown correlation id for `recipient`.
    pub fn shutdown_request_id(recipient: &str) -> String {
        format!("shutdown-{}@{recipient}", Utc::now().timestamp_millis())
    }
}

/// Per-team append-only message files.
#[derive(Debug)]
pub struct Inbox {
    root: PathBuf,
}

impl Inbox {
    /// Creates an inbox manager rooted at `root`.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Directory holding one inbox file per recipient.
    fn inboxes_dir(&self, team: &str) -> PathBuf {
        self.root.join(team).join("inboxes")
    }

    /// The team's sibling task directory (for a [`crate::tasks::TaskStore`]).
    pub fn tasks_dir(&self, team: &str) -> PathBuf {
        self.root.join(team).join("tasks")
    }

    /// Sends plain text; `summary` gives readers a preview.
    pub fn send_text(
        &self,
        team: &str,
        from: &str,
        to: &str,
        text: &str,
        summary: Option<&str>,
    ) -> Result<()> {
        self.append(
            team,
            to,
            InboxMessage {
                from: from.to_string(),
                text: text.to_string(),
                summary: summary.map(str::to_string),
                timestamp: now_ms(),
                color: None,
                read: false,
            },
        )
    }

    /// Sends a typed protocol message, double-encoded. No summary — the
    /// inner type discriminator is the preview.
    pub fn send_protocol(
        &self,
        team: &str,
        from: &str,
        to: &str,
        message: &ProtocolMessage,
    ) -> Result<()> {
        self.append(
            team,
            to,
            InboxMessage {
                from: from.to_string(),
                text: serde_json::to_string(message)?,
                summary: None,
                timestamp: now_ms(),
                color: None,
                read: false,
            },
        )
    }

    /// Appends the same plain-text envelope to every other recipient.
    pub fn broadcast_text(
        &self,
        team: &str,
        from: &str,
        text: &str,
        summary: Option<&str>,
    ) -> Result<usize> {
        let mut delivered = 0;
        for recipient in self.recipients(team)? {
            if recipient == from {
                continue;
            }
            self.send_text(team, from, &recipient, text, summary)?;
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Emits the automatic turn-end idle notification.
    pub fn notify_idle(&self, team: &str, from: &str, to: &str, reason: IdleReason) -> Result<()> {
        self.send_protocol(team, from, to, &ProtocolMessage::IdleNotification { reason })
    }

    /// Starts the shutdown handshake; returns the correlation id the
    /// responder must echo.
    pub fn request_shutdown(
        &self,
        team: &str,
        from: &str,
        to: &str,
        reason: Option<&str>,
    ) -> Result<String> {
        let request_id = ProtocolMessage::shutdown_request_id(to);
        self.send_protocol(
            team,
            from,
            to,
            &ProtocolMessage::ShutdownRequest {
                request_id: request_id.clone(),
                reason: reason.map(str::to_string),
            },
        )?;
        Ok(request_id)
    }

    /// Answers a shutdown request. Rejection carries a reason; the
    /// initiator may retry later.
    pub fn respond_shutdown(
        &self,
        team: &str,
        from: &str,
        to: &str,
        request_id: &str,
        approve: bool,
        reason: Option<&str>,
    ) -> Result<()> {
        self.send_protocol(
            team,
            from,
            to,
            &ProtocolMessage::ShutdownResponse {
                request_id: request_id.to_string(),
                approve,
                reason: reason.map(str::to_string),
            },
        )
    }

    /// Reads a recipient's messages in append order.
    pub fn read(&self, team: &str, recipient: &str) -> Result<Vec<InboxMessage>> {
        let path = self.inbox_path(team, recipient);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let _lock = self.lock_team(team)?;
        read_messages(&path)
    }

    /// Marks every message in a recipient's inbox read.
    pub fn mark_read(&self, team: &str, recipient: &str) -> Result<()> {
        let path = self.inbox_path(team, recipient);
        if !path.exists() {
            return Ok(());
        }
        let _lock = self.lock_team(team)?;
        let mut messages = read_messages(&path)?;
        for message in &mut messages {
            message.read = true;
        }
        write_messages(&path, &messages)
    }

    /// Recipient names with an inbox file in this team.
    pub fn recipients(&self, team: &str) -> Result<Vec<String>> {
        let dir = self.inboxes_dir(team);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Ensures a recipient has an (empty) inbox, so broadcasts reach it.
    pub fn register(&self, team: &str, recipient: &str) -> Result<()> {
        let path = self.inbox_path(team, recipient);
        if path.exists() {
            return Ok(());
        }
        fs::create_dir_all(self.inboxes_dir(team))?;
        let _lock = self.lock_team(team)?;
        if !path.exists() {
            write_messages(&path, &[])?;
        }
        Ok(())
    }

    /// Removes a team: its inboxes and the sibling task directory.
    pub fn delete_team(&self, team: &str) -> Result<()> {
        let dir = self.root.join(team);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Teams that currently have a directory.
    pub fn teams(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.path().is_dir() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    // ─── Internals ─────────────────────────────────────────────────────────

    fn inbox_path(&self, team: &str, recipient: &str) -> PathBuf {
        self.inboxes_dir(team).join(format!("{recipient}.json"))
    }

    /// Read → append → rewrite under the team's advisory lock.
    fn append(&self, team: &str, to: &str, message: InboxMessage) -> Result<()> {
        if to.contains('/') || to.contains("..") {
            return Err(HiveError::Conflict(format!("invalid recipient name {to}")));
        }
        fs::create_dir_all(self.inboxes_dir(team))?;
        let _lock = self.lock_team(team)?;

        let path = self.inbox_path(team, to);
        let mut messages = if path.exists() {
            read_messages(&path)?
        } else {
            Vec::new()
        };
        messages.push(message);
        write_messages(&path, &messages)
    }

    fn lock_team(&self, team: &str) -> Result<fs::File> {
        let dir = self.root.join(team);
        fs::create_dir_all(&dir)?;
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(".lock"))?;
        file.lock_exclusive()?;
        Ok(file)
    }
}

fn now_ms() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn read_messages(path: &Path) -> Result<Vec<InboxMessage>> {
    let text = fs::read_to_string(path)?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(&text)?)
}

/// Temp-file + rename, same discipline as every other store.
fn write_messages(path: &Path, messages: &[InboxMessage]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_string_pretty(messages)?)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
