//! Solicitation store: agent → supervisor request/response pipe.
//!
//! Agents surface blockers, ambiguities, and decisions as solicitations;
//! a supervisor answers asynchronously through the hub API. Transitions out
//! of `Pending` are one-shot — responded, dismissed, and expired are all
//! terminal.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HiveError, Result};
use crate::events::{EventPublisher, EventType};

/// What kind of attention the agent is asking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolicitationType {
    /// Work cannot continue without intervention.
    Blocker,
    /// The task statement is ambiguous.
    Ambiguity,
    /// A decision between named options is needed.
    Decision,
    /// The agent wants its output validated.
    Validation,
    /// FYI, no response required.
    Info,
    /// The agent believes the task is done.
    Completion,
    /// Progress report.
    Progress,
    /// Two agents contend for a resource.
    ResourceConflict,
}

/// How urgently a response is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    /// Whenever convenient.
    Low,
    /// Normal priority.
    Medium,
    /// Blocking soon.
    High,
    /// Blocking now.
    Critical,
}

/// Lifecycle of a solicitation. `Pending` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolicitationStatus {
    /// Awaiting a supervisor response.
    Pending,
    /// Answered.
    Responded,
    /// Closed without an answer.
    Dismissed,
    /// Timed out before anyone answered.
    Expired,
}

/// A structured request from an agent to its supervisor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Solicitation {
    /// Store-assigned id (`s-1`, `s-2`, …).
    pub id: String,
    /// Id of the agent that raised it.
    pub agent_id: String,
    /// Name of the agent that raised it.
    pub agent_name: String,
    /// Task the request relates to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    /// Request kind.
    #[serde(rename = "type")]
    pub solicitation_type: SolicitationType,
    /// Response urgency.
    pub urgency: Urgency,
    /// Human-readable request.
    pub message: String,
    /// Supporting context (logs, diffs).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Options for decision-type requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    /// Free-form metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Lifecycle state.
    pub status: SolicitationStatus,
    /// Supervisor response, once given.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// When the terminal transition happened.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responded_at: Option<DateTime<Utc>>,
}

/// Parameters for [`SolicitationStore::create`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSolicitationRequest {
    /// Id of the requesting agent.
    pub agent_id: String,
    /// Name of the requesting agent.
    pub agent_name: String,
    /// Related task id, if any.
    #[serde(default)]
    pub task_id: Option<String>,
    /// Request kind.
    #[serde(rename = "type")]
    pub solicitation_type: SolicitationType,
    /// Response urgency.
    pub urgency: Urgency,
    /// Human-readable request.
    pub message: String,
    /// Supporting context.
    #[serde(default)]
    pub context: Option<String>,
    /// Options for decision requests.
    #[serde(default)]
    pub options: Option<Vec<String>>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Query filter; `status` defaults to pending at the API layer.
#[derive(Debug, Clone, Default)]
pub struct SolicitationFilter {
    /// Keep only requests from this agent.
    pub agent_id: Option<String>,
    /// Keep only this kind.
    pub solicitation_type: Option<SolicitationType>,
    /// Keep only this urgency.
    pub urgency: Option<Urgency>,
    /// Keep only this status.
    pub status: Option<SolicitationStatus>,
}

/// In-memory store of solicitations; pending ones survive via the snapshot.
pub struct SolicitationStore {
    inner: Mutex<Inner>,
    events: EventPublisher,
}

#[derive(Default)]
struct Inner {
    items: HashMap<String, Solicitation>,
    next_id: u64,
}

impl std::fmt::Debug for SolicitationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SolicitationStore")
            .field(
                "items",
                &self.inner.lock().expect("solicitation store poisoned").items.len(),
            )
            .finish()
    }
}

impl SolicitationStore {
    /// Creates an empty store.
    pub fn new(events: EventPublisher) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    /// Records a new pending solicitation.
    pub fn create(&self, req: CreateSolicitationRequest) -> Solicitation {
        let mut inner = self.inner.lock().expect("solicitation store poisoned");
        inner.next_id += 1;
        let id = format!("s-{}", inner.next_id);
        let solicitation = Solicitation {
            id: id.clone(),
            agent_id: req.agent_id,
            agent_name: req.agent_name,
            task_id: req.task_id,
            solicitation_type: req.solicitation_type,
            urgency: req.urgency,
            message: req.message,
            context: req.context,
            options: req.options,
            metadata: req.metadata,
            status: SolicitationStatus::Pending,
            response: None,
            created_at: Utc::now(),
            responded_at: None,
        };
        inner.items.insert(id, solicitation.clone());
        self.events.publish(
            EventType::SolicitationNew,
            serde_json::json!({
                "id": solicitation.id,
                "agentId": solicitation.agent_id,
                "type": solicitation.solicitation_type,
                "urgency": solicitation.urgency,
            }),
        );
        solicitation
    }

    /// Fetches one solicitation.
    pub fn get(&self, id: &str) -> Result<Solicitation> {
        self.inner
            .lock()
            .expect("solicitation store poisoned")
            .items
            .get(id)
            .cloned()
            .ok_or_else(|| HiveError::not_found(format!("solicitation {id}")))
    }

    /// Lists solicitations matching `filter`, newest last.
    pub fn list(&self, filter: &SolicitationFilter) -> Vec<Solicitation> {
        let inner = self.inner.lock().expect("solicitation store poisoned");
        let mut items: Vec<Solicitation> = inner
            .items
            .values()
            .filter(|s| filter.agent_id.as_ref().is_none_or(|a| &s.agent_id == a))
            .filter(|s| {
                filter
                    .solicitation_type
                    .is_none_or(|t| s.solicitation_type == t)
            })
            .filter(|s| filter.urgency.is_none_or(|u| s.urgency == u))
            .filter(|s| filter.status.is_none_or(|st| s.status == st))
            .cloned()
            .collect();
        items.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        items
    }

    /// Pending solicitations only. Used by the snapshot.
    pub fn pending(&self) -> Vec<Solicitation> {
        self.list(&SolicitationFilter {
            status: Some(SolicitationStatus::Pending),
            ..SolicitationFilter::default()
        })
    }

    /// Answers a pending solicitation.
    pub fn respond(&self, id: &str, response: &str) -> Result<Solicitation> {
        let updated = self.transition(id, SolicitationStatus::Responded, |s| {
            s.response = Some(response.to_string());
        })?;
        self.events.publish(
            EventType::SolicitationResponded,
            serde_json::json!({ "id": id, "agentId": updated.agent_id }),
        );
        Ok(updated)
    }

    /// Closes a pending solicitation without answering.
    pub fn dismiss(&self, id: &str, reason: Option<&str>) -> Result<Solicitation> {
        let updated = self.transition(id, SolicitationStatus::Dismissed, |s| {
            s.response = reason.map(str::to_string);
        })?;
        self.events.publish(
            EventType::SolicitationDismissed,
            serde_json::json!({ "id": id, "agentId": updated.agent_id }),
        );
        Ok(updated)
    }

    /// Expires a pending solicitation.
    pub fn expire(&self, id: &str) -> Result<Solicitation> {
        let updated = self.transition(id, SolicitationStatus::Expired, |_| {})?;
        self.events.publish(
            EventType::SolicitationExpired,
            serde_json::json!({ "id": id, "agentId": updated.agent_id }),
        );
        Ok(updated)
    }

    /// Restores solicitations from a snapshot and fast-forwards the id
    /// counter past anything restored.
    pub fn restore(&self, items: Vec<Solicitation>) {
        let mut inner = self.inner.lock().expect("solicitation store poisoned");
        for item in items {
            if let Some(n) = item.id.strip_prefix("s-").and_then(|n| n.parse::<u64>().ok()) {
                inner.next_id = inner.next_id.max(n);
            }
            inner.items.insert(item.id.clone(), item);
        }
    }

    fn transition(
        &self,
        id: &str,
        to: SolicitationStatus,
        apply: impl FnOnce(&mut Solicitation),
    ) -> Result<Solicitation> {
        let mut inner = self.inner.lock().expect("solicitation store poisoned");
        let item = inner
            .items
            .get_mut(id)
            .ok_or_else(|| HiveError::not_found(format!("solicitation {id}")))?;

        if item.status != SolicitationStatus::Pending {
            return Err(HiveError::InvalidTransition(format!(
                "solicitation {id} is already {:?}",
                item.status
            )));
        }

        apply(item);
        item.status = to;
        item.responded_at = Some(Utc::now());
        Ok(item.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SolicitationStore {
        SolicitationStore::new(EventPublisher::disconnected())
    }

    fn blocker(agent: &str) -> CreateSolicitationRequest {
        CreateSolicitationRequest {
            agent_id: agent.to_string(),
            agent_name: agent.to_string(),
            task_id: None,
            solicitation_type: SolicitationType::Blocker,
            urgency: Urgency::High,
            message: "cannot push: remote rejected".to_string(),
            context: None,
            options: None,
            metadata: None,
        }
    }

    #[test]
    fn respond_is_one_shot() {
        let store = store();
        let s = store.create(blocker("a1"));
        assert_eq!(s.status, SolicitationStatus::Pending);

        let answered = store.respond(&s.id, "force-push is fine here").unwrap();
        assert_eq!(answered.status, SolicitationStatus::Responded);
        assert!(answered.responded_at.is_some());
        assert_eq!(answered.response.as_deref(), Some("force-push is fine here"));

        let err = store.respond(&s.id, "second answer").unwrap_err();
        assert!(matches!(err, HiveError::InvalidTransition(_)));
        let err = store.dismiss(&s.id, None).unwrap_err();
        assert!(matches!(err, HiveError::InvalidTransition(_)));
    }

    #[test]
    fn filters_narrow_the_listing() {
        let store = store();
        store.create(blocker("a1"));
        let mut decision = blocker("a2");
        decision.solicitation_type = SolicitationType::Decision;
        decision.urgency = Urgency::Low;
        let d = store.create(decision);
        store.dismiss(&d.id, Some("obsolete")).unwrap();

        let pending = store.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].agent_id, "a1");

        let by_type = store.list(&SolicitationFilter {
            solicitation_type: Some(SolicitationType::Decision),
            ..SolicitationFilter::default()
        });
        assert_eq!(by_type.len(), 1);
        assert_eq!(by_type[0].status, SolicitationStatus::Dismissed);
    }

    #[test]
    fn restore_keeps_ids_monotonic() {
        let store = store();
        let s = store.create(blocker("a1"));
        let pending = store.pending();

        let fresh = SolicitationStore::new(EventPublisher::disconnected());
        fresh.restore(pending);
        assert_eq!(fresh.get(&s.id).unwrap().agent_id, "a1");

        let next = fresh.create(blocker("a2"));
        assert_eq!(next.id, "s-2");
    }

    #[test]
    fn expire_is_terminal() {
        let store = store();
        let s = store.create(blocker("a1"));
        store.expire(&s.id).unwrap();
        let err = store.expire(&s.id).unwrap_err();
        assert!(matches!(err, HiveError::InvalidTransition(_)));
    }
}
