//! Filesystem-backed task store with dependencies and a status machine.
//!
//! One JSON document per task lives in the task directory, named
//! `<id>.json`; ids are monotonically increasing decimal strings shared by
//! user tasks and internal agent-tracking tasks. An advisory `.lock` file
//! serializes mutations across cooperating processes, and every write goes
//! through temp-file + rename so a crash mid-write never leaves a torn
//! document.
//!
//! The store keeps an in-memory index for queries; the on-disk form is
//! canonical and re-scanned for id allocation so external writers under the
//! same lock stay consistent.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::{HiveError, Result};
use crate::events::{EventPublisher, EventType};

/// Internal-task descriptions are truncated to this many characters.
const INTERNAL_DESCRIPTION_MAX: usize = 100;

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Created, not yet claimed.
    Pending,
    /// Being worked on.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Removed from the active set; the file persists as a tombstone.
    Deleted,
}

/// A unit of work tracked by the hub.
///
/// Two classes share the id space: user tasks, and internal tasks (one per
/// live agent, marked by `metadata.internal == true`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Monotonic decimal id, as a string.
    pub id: String,
    /// Short imperative title.
    pub subject: String,
    /// Full description of the work.
    pub description: String,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// Agent name that claimed the task, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    /// Present-continuous form shown while in progress.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_form: Option<String>,
    /// Ids of tasks this task blocks.
    #[serde(default)]
    pub blocks: Vec<String>,
    /// Ids of tasks that must complete before this one starts.
    #[serde(default)]
    pub blocked_by: Vec<String>,
    /// Free-form metadata; `internal: true` marks agent-tracking tasks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// Last mutation instant.
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Whether this is an internal agent-tracking task.
    pub fn is_internal(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("internal"))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    fn numeric_id(&self) -> u64 {
        self.id.parse().unwrap_or(0)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Sets one metadata key, creating the object if needed. Non-object
    /// metadata is left untouched.
    fn set_metadata(&mut self, key: &str, value: serde_json::Value) {
        let metadata = self
            .metadata
            .get_or_insert_with(|| serde_json::json!({}));
        if let Some(map) = metadata.as_object_mut() {
            map.insert(key.to_string(), value);
        }
    }
}

/// Parameters for [`TaskStore::create`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
    /// Short imperative title.
    pub subject: String,
    /// Full description.
    #[serde(default)]
    pub description: String,
    /// Initial owner, if pre-assigned.
    #[serde(default)]
    pub owner: Option<String>,
    /// Ids of tasks that must complete first.
    #[serde(default)]
    pub blocked_by: Vec<String>,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Query filter for [`TaskStore::list`].
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Keep only tasks with this status.
    pub status: Option<TaskStatus>,
    /// Keep only tasks owned by this agent.
    pub owner: Option<String>,
}

/// Filesystem-backed task store.
pub struct TaskStore {
    dir: PathBuf,
    index: Mutex<HashMap<String, Task>>,
    events: EventPublisher,
}

impl std::fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStore")
            .field("dir", &self.dir)
            .field("tasks", &self.index.lock().expect("task index poisoned").len())
            .finish()
    }
}

impl TaskStore {
    /// Opens (or creates) the store rooted at `dir` and loads every task.
    ///
    /// Individual `<id>.json` files are canonical. A consolidated
    /// `tasks.json` array is accepted on input for interop, but the store
    /// never writes one.
    pub fn open(dir: PathBuf, events: EventPublisher) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        let store = Self {
            dir,
            index: Mutex::new(HashMap::new()),
            events,
        };
        store.reload()?;
        Ok(store)
    }

    /// Re-reads every task document from disk into the index.
    pub fn reload(&self) -> Result<()> {
        let mut loaded: HashMap<String, Task> = HashMap::new();

        let consolidated = self.dir.join("tasks.json");
        if consolidated.exists() {
            let text = fs::read_to_string(&consolidated)?;
            let tasks: Vec<Task> = serde_json::from_str(&text)?;
            for task in tasks {
                loaded.insert(task.id.clone(), task);
            }
        }

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if path.extension().and_then(|e| e.to_str()) != Some("json")
                || stem.parse::<u64>().is_err()
            {
                continue;
            }
            let text = fs::read_to_string(&path)?;
            match serde_json::from_str::<Task>(&text) {
                Ok(task) => {
                    loaded.insert(task.id.clone(), task);
                }
                Err(err) => {
                    log::warn!("[tasks] skipping unreadable {}: {err}", path.display());
                }
            }
        }

        *self.index.lock().expect("task index poisoned") = loaded;
        Ok(())
    }

    /// Creates a task. The new id is `max(existing) + 1`, computed under the
    /// directory lock so concurrent creators never collide or leave gaps.
    pub fn create(&self, req: CreateTaskRequest) -> Result<Task> {
        if req.subject.trim().is_empty() {
            return Err(HiveError::InvalidTransition("task subject is empty".into()));
        }

        let _lock = self.lock_dir()?;
        let mut index = self.index.lock().expect("task index poisoned");

        for dep in &req.blocked_by {
            if !index.contains_key(dep) {
                return Err(HiveError::Conflict(format!("blocking task {dep} does not exist")));
            }
        }

        let id = (self.max_id_on_disk()?.max(
            index.values().map(Task::numeric_id).max().unwrap_or(0),
        ) + 1)
            .to_string();

        let now = Utc::now();
        let mut task = Task {
            id: id.clone(),
            subject: req.subject,
            description: req.description,
            status: TaskStatus::Pending,
            owner: req.owner,
            active_form: None,
            blocks: Vec::new(),
            blocked_by: req.blocked_by.clone(),
            metadata: req.metadata,
            created_at: now,
            updated_at: now,
        };
        task.blocked_by.sort_by_key(|id| id.parse::<u64>().unwrap_or(0));
        task.blocked_by.dedup();

        // Mirror the reverse edges before anything is visible.
        for dep in &task.blocked_by {
            let blocker = index.get_mut(dep).expect("checked above");
            if !blocker.blocks.contains(&id) {
                blocker.blocks.push(id.clone());
                blocker.touch();
            }
        }
        for dep in &task.blocked_by {
            self.write_task(&index[dep])?;
        }

        self.write_task(&task)?;
        index.insert(id.clone(), task.clone());

        self.events.publish(
            EventType::TaskCreated,
            serde_json::json!({ "id": task.id, "subject": task.subject }),
        );
        Ok(task)
    }

    /// Creates the internal tracking task for a freshly spawned agent.
    ///
    /// Subject is the agent name; the description is the initial prompt
    /// truncated to 100 characters.
    pub fn create_internal(&self, agent_name: &str, description: &str) -> Result<Task> {
        let truncated: String = description.chars().take(INTERNAL_DESCRIPTION_MAX).collect();
        self.create(CreateTaskRequest {
            subject: agent_name.to_string(),
            description: truncated,
            owner: Some(agent_name.to_string()),
            blocked_by: Vec::new(),
            metadata: Some(serde_json::json!({ "internal": true })),
        })
    }

    /// Ends the internal task tracking `agent_name`, if one is live.
    ///
    /// This is the only path that deletes an internal task; the regular
    /// task operations refuse to touch them.
    pub fn close_internal(&self, agent_name: &str) -> Result<()> {
        let _lock = self.lock_dir()?;
        let mut index = self.index.lock().expect("task index poisoned");
        let Some(task) = index.values_mut().find(|t| {
            t.is_internal() && t.subject == agent_name && t.status != TaskStatus::Deleted
        }) else {
            return Ok(());
        };
        task.status = TaskStatus::Deleted;
        task.touch();
        let snapshot = task.clone();
        self.write_task(&snapshot)?;
        Ok(())
    }

    /// Fetches a task by id.
    pub fn get(&self, id: &str) -> Result<Task> {
        self.index
            .lock()
            .expect("task index poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| HiveError::not_found(format!("task {id}")))
    }

    /// Lists tasks matching `filter`, ordered by numeric id.
    pub fn list(&self, filter: &TaskFilter) -> Vec<Task> {
        let index = self.index.lock().expect("task index poisoned");
        let mut tasks: Vec<Task> = index
            .values()
            .filter(|t| filter.status.is_none_or(|s| t.status == s))
            .filter(|t| {
                filter
                    .owner
                    .as_ref()
                    .is_none_or(|o| t.owner.as_deref() == Some(o.as_str()))
            })
            .cloned()
            .collect();
        tasks.sort_by_key(Task::numeric_id);
        tasks
    }

    /// Every task, ordered by numeric id. Used by the snapshot.
    pub fn all(&self) -> Vec<Task> {
        self.list(&TaskFilter::default())
    }

    /// Moves a task to in-progress.
    ///
    /// Refused with `Blocked` while any blocker is incomplete.
    pub fn start(&self, id: &str) -> Result<Task> {
        let _lock = self.lock_dir()?;
        let mut index = self.index.lock().expect("task index poisoned");
        let blockers_clear = Self::blockers_clear(&index, id)?;
        let task = index
            .get_mut(id)
            .ok_or_else(|| HiveError::not_found(format!("task {id}")))?;

        if task.status != TaskStatus::Pending {
            return Err(HiveError::InvalidTransition(format!(
                "task {id} is {:?}, only pending tasks can start",
                task.status
            )));
        }
        if !blockers_clear {
            return Err(HiveError::Blocked(id.to_string()));
        }

        task.status = TaskStatus::InProgress;
        task.touch();
        let snapshot = task.clone();
        self.write_task(&snapshot)?;

        self.events.publish(
            EventType::TaskStarted,
            serde_json::json!({ "id": id, "owner": snapshot.owner }),
        );
        Ok(snapshot)
    }

    /// Records step progress on an in-flight task.
    pub fn update_step(&self, id: &str, step: &str) -> Result<Task> {
        let _lock = self.lock_dir()?;
        let mut index = self.index.lock().expect("task index poisoned");
        let task = index
            .get_mut(id)
            .ok_or_else(|| HiveError::not_found(format!("task {id}")))?;

        if matches!(task.status, TaskStatus::Completed | TaskStatus::Deleted) {
            return Err(HiveError::InvalidTransition(format!(
                "task {id} is {:?}",
                task.status
            )));
        }

        task.active_form = Some(step.to_string());
        task.touch();
        let snapshot = task.clone();
        self.write_task(&snapshot)?;

        self.events.publish(
            EventType::TaskProgress,
            serde_json::json!({ "id": id, "step": step }),
        );
        Ok(snapshot)
    }

    /// Completes an in-progress task; `payload` lands in `metadata.result`.
    pub fn complete(&self, id: &str, payload: Option<serde_json::Value>) -> Result<Task> {
        let snapshot = self.terminate(id, TaskStatus::Completed, |task| {
            if task.status != TaskStatus::InProgress {
                return Err(HiveError::InvalidTransition(format!(
                    "task {id} is {:?}, only in-progress tasks complete",
                    task.status
                )));
            }
            if let Some(payload) = payload.clone() {
                task.set_metadata("result", payload);
            }
            Ok(())
        })?;
        self.events.publish(
            EventType::TaskCompleted,
            serde_json::json!({ "id": id, "owner": snapshot.owner }),
        );
        Ok(snapshot)
    }

    /// Fails a task; the file persists with status `deleted` and the reason
    /// recorded in metadata.
    pub fn fail(&self, id: &str, reason: &str) -> Result<Task> {
        let snapshot = self.terminate(id, TaskStatus::Deleted, |task| {
            if matches!(task.status, TaskStatus::Completed | TaskStatus::Deleted) {
                return Err(HiveError::InvalidTransition(format!(
                    "task {id} is already {:?}",
                    task.status
                )));
            }
            task.set_metadata("failureReason", serde_json::Value::String(reason.to_string()));
            Ok(())
        })?;
        self.events.publish(
            EventType::TaskFailed,
            serde_json::json!({ "id": id, "reason": reason }),
        );
        Ok(snapshot)
    }

    /// Cancels a task; same tombstone shape as [`TaskStore::fail`].
    pub fn cancel(&self, id: &str, reason: &str) -> Result<Task> {
        let snapshot = self.terminate(id, TaskStatus::Deleted, |task| {
            if matches!(task.status, TaskStatus::Completed | TaskStatus::Deleted) {
                return Err(HiveError::InvalidTransition(format!(
                    "task {id} is already {:?}",
                    task.status
                )));
            }
            task.set_metadata("cancelReason", serde_json::Value::String(reason.to_string()));
            Ok(())
        })?;
        self.events.publish(
            EventType::TaskCancelled,
            serde_json::json!({ "id": id, "reason": reason }),
        );
        Ok(snapshot)
    }

    /// Assigns an owner.
    pub fn assign_owner(&self, id: &str, owner: &str) -> Result<Task> {
        let _lock = self.lock_dir()?;
        let mut index = self.index.lock().expect("task index poisoned");
        let task = index
            .get_mut(id)
            .ok_or_else(|| HiveError::not_found(format!("task {id}")))?;
        task.owner = Some(owner.to_string());
        task.touch();
        let snapshot = task.clone();
        self.write_task(&snapshot)?;
        Ok(snapshot)
    }

    /// Adds a dependency edge: `blocked` cannot start until `blocker`
    /// completes. Both documents are rewritten in one lock scope so the
    /// edge is never half-present.
    pub fn add_edge(&self, blocker: &str, blocked: &str) -> Result<()> {
        if blocker == blocked {
            return Err(HiveError::Conflict(format!("task {blocker} cannot block itself")));
        }

        let _lock = self.lock_dir()?;
        let mut index = self.index.lock().expect("task index poisoned");
        if !index.contains_key(blocker) {
            return Err(HiveError::Conflict(format!("task {blocker} does not exist")));
        }
        if !index.contains_key(blocked) {
            return Err(HiveError::Conflict(format!("task {blocked} does not exist")));
        }
        if Self::reachable(&index, blocker, blocked) {
            return Err(HiveError::Conflict(format!(
                "edge {blocker} -> {blocked} would create a cycle"
            )));
        }

        {
            let b = index.get_mut(blocker).expect("checked above");
            if !b.blocks.contains(&blocked.to_string()) {
                b.blocks.push(blocked.to_string());
                b.touch();
            }
        }
        {
            let b = index.get_mut(blocked).expect("checked above");
            if !b.blocked_by.contains(&blocker.to_string()) {
                b.blocked_by.push(blocker.to_string());
                b.touch();
            }
        }
        self.write_task(&index[blocker])?;
        self.write_task(&index[blocked])?;
        Ok(())
    }

    /// Lowest-id pending task whose blockers are all complete.
    ///
    /// Internal tasks are never claimable; owned tasks are only claimable by
    /// their owner.
    pub fn next_claimable(&self, owner: &str) -> Option<Task> {
        let index = self.index.lock().expect("task index poisoned");
        let mut candidates: Vec<&Task> = index
            .values()
            .filter(|t| t.status == TaskStatus::Pending && !t.is_internal())
            .filter(|t| t.owner.is_none() || t.owner.as_deref() == Some(owner))
            .filter(|t| {
                t.blocked_by.iter().all(|dep| {
                    index
                        .get(dep)
                        .is_some_and(|d| d.status == TaskStatus::Completed)
                })
            })
            .collect();
        candidates.sort_by_key(|t| t.numeric_id());
        candidates.first().map(|t| (*t).clone())
    }

    /// Restores tasks from a snapshot, writing any documents missing on disk.
    pub fn restore(&self, tasks: Vec<Task>) -> Result<()> {
        let _lock = self.lock_dir()?;
        let mut index = self.index.lock().expect("task index poisoned");
        for task in tasks {
            if !self.task_path(&task.id).exists() {
                self.write_task(&task)?;
            }
            index.insert(task.id.clone(), task);
        }
        Ok(())
    }

    // ─── Internals ─────────────────────────────────────────────────────────

    fn terminate(
        &self,
        id: &str,
        status: TaskStatus,
        prepare: impl FnOnce(&mut Task) -> Result<()>,
    ) -> Result<Task> {
        let _lock = self.lock_dir()?;
        let mut index = self.index.lock().expect("task index poisoned");
        let task = index
            .get_mut(id)
            .ok_or_else(|| HiveError::not_found(format!("task {id}")))?;

        if task.is_internal() {
            return Err(HiveError::InvalidTransition(format!(
                "task {id} tracks an agent and ends only with it"
            )));
        }

        prepare(task)?;
        task.status = status;
        task.touch();
        let snapshot = task.clone();
        self.write_task(&snapshot)?;
        Ok(snapshot)
    }

    /// True when every blocker of `id` is completed (or it has none).
    fn blockers_clear(index: &HashMap<String, Task>, id: &str) -> Result<bool> {
        let task = index
            .get(id)
            .ok_or_else(|| HiveError::not_found(format!("task {id}")))?;
        Ok(task.blocked_by.iter().all(|dep| {
            index
                .get(dep)
                .is_some_and(|d| d.status == TaskStatus::Completed)
        }))
    }

    /// Whether `from` transitively depends on `to` via `blocked_by` edges.
    fn reachable(index: &HashMap<String, Task>, from: &str, to: &str) -> bool {
        let mut queue: VecDeque<&str> = VecDeque::from([from]);
        let mut seen: HashSet<&str> = HashSet::new();
        while let Some(current) = queue.pop_front() {
            if current == to {
                return true;
            }
            if !seen.insert(current) {
                continue;
            }
            if let Some(task) = index.get(current) {
                for dep in &task.blocked_by {
                    queue.push_back(dep.as_str());
                }
            }
        }
        false
    }

    fn task_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Writes one task document via temp-file + rename.
    fn write_task(&self, task: &Task) -> Result<()> {
        let path = self.task_path(&task.id);
        let tmp = self.dir.join(format!("{}.json.tmp", task.id));
        let text = serde_json::to_string_pretty(task)?;
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Highest task id present on disk, 0 when the directory is fresh.
    fn max_id_on_disk(&self) -> Result<u64> {
        let mut max = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
            {
                max = max.max(id);
            }
        }
        Ok(max)
    }

    /// Takes the advisory directory lock; released when the guard drops.
    fn lock_dir(&self) -> Result<fs::File> {
        let lock_path = self.dir.join(".lock");
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        file.lock_exclusive()?;
        Ok(file)
    }
}
