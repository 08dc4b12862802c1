//! Operator/dashboard HTTP API.
//!
//! All responses are JSON; errors render as `{"error": "<message>"}` with
//! the status mapped from the error kind. CORS is wide open — the hub binds
//! loopback and dashboards are served from arbitrary origins.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};

use crate::agent::spawner::SpawnOptions;
use crate::agent::AgentRecord;
use crate::error::HiveError;
use crate::hub::{Hub, STUCK_THRESHOLD};
use crate::ports::{AcquireOutcome, AcquireRequest};
use crate::solicitations::{
    CreateSolicitationRequest, SolicitationFilter, SolicitationStatus, SolicitationType, Urgency,
};
use crate::tasks::{CreateTaskRequest, TaskFilter, TaskStatus};

/// Error wrapper rendering `HiveError` as a JSON body + mapped status.
#[derive(Debug)]
pub struct ApiError(pub HiveError);

impl From<HiveError> for ApiError {
    fn from(err: HiveError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(serde_json::json!({ "error": self.0.to_string() }));
        (status, body).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;
type HubState = State<Arc<Hub>>;

/// Builds the hub router.
pub fn router(hub: Arc<Hub>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/status", get(status_detail))
        .route("/ws", get(crate::hub::stream::events))
        .route("/agents", get(list_agents).post(create_agent))
        .route("/agents/:id", get(get_agent).delete(stop_agent))
        .route("/agents/:id/destroy", delete(destroy_agent))
        .route("/agents/:id/message", post(message_agent))
        .route("/agents/:id/conversation", get(agent_conversation))
        .route("/agents/:id/status", get(agent_status))
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/:id", get(get_task).delete(delete_task))
        .route("/tasks/:id/start", post(start_task))
        .route("/tasks/:id/steps/:step", put(step_task))
        .route("/tasks/:id/complete", post(complete_task))
        .route("/tasks/:id/fail", post(fail_task))
        .route("/solicitations", get(list_solicitations).post(create_solicitation))
        .route("/solicitations/:id", get(get_solicitation))
        .route("/solicitations/:id/respond", post(respond_solicitation))
        .route("/solicitations/:id/dismiss", post(dismiss_solicitation))
        .route("/ports", get(list_ports))
        .route("/ports/acquire", post(acquire_port))
        .route("/ports/release", post(release_port))
        .route("/ports/:port", get(port_status))
        .route("/ports/:port/force-release", post(force_release_port))
        .layer(cors)
        .with_state(hub)
}

// ─── Health ────────────────────────────────────────────────────────────────

async fn health(State(hub): HubState) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "agents_total": hub.manager.count(),
        "agents_running": hub.manager.count_running(),
    }))
}

async fn status_detail(State(hub): HubState) -> Json<serde_json::Value> {
    let agents = hub.manager.list();
    let errored: Vec<&AgentRecord> = agents
        .iter()
        .filter(|a| a.status == crate::agent::AgentStatus::Error)
        .collect();
    let stuck = hub.manager.stuck_agents(STUCK_THRESHOLD);

    let overall = if !errored.is_empty() {
        "error"
    } else if !stuck.is_empty() {
        "warning"
    } else {
        "healthy"
    };

    Json(serde_json::json!({
        "status": overall,
        "agents_total": agents.len(),
        "agents_running": agents.iter().filter(|a| a.status.is_running()).count(),
        "errors": errored
            .iter()
            .map(|a| serde_json::json!({
                "id": a.id,
                "name": a.name,
                "error": a.last_error,
            }))
            .collect::<Vec<_>>(),
        "stuck": stuck
            .iter()
            .map(|a| serde_json::json!({ "id": a.id, "name": a.name }))
            .collect::<Vec<_>>(),
    }))
}

// ─── Agents ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateAgentRequest {
    #[serde(default)]
    name: String,
    #[serde(default)]
    branch: Option<String>,
    #[serde(default)]
    base_branch: Option<String>,
    #[serde(default)]
    specialty: Option<String>,
    #[serde(default)]
    sandbox: Option<bool>,
    #[serde(default)]
    initial_prompt: Option<String>,
}

async fn list_agents(State(hub): HubState) -> Json<Vec<AgentRecord>> {
    Json(hub.manager.list())
}

async fn create_agent(
    State(hub): HubState,
    Json(req): Json<CreateAgentRequest>,
) -> ApiResult<(StatusCode, Json<AgentRecord>)> {
    if req.name.trim().is_empty() {
        return Err(HiveError::InvalidTransition("agent name is required".into()).into());
    }

    let opts = SpawnOptions {
        name: req.name,
        branch: req.branch,
        base_branch: req.base_branch,
        specialty: req.specialty,
        sandbox: req.sandbox,
        initial_prompt: req.initial_prompt,
    };
    let cancel = hub.shutdown_token();
    let record = hub.manager.spawn(opts, &cancel).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn get_agent(State(hub): HubState, Path(id): Path<String>) -> ApiResult<Json<AgentRecord>> {
    // Refresh before answering so dashboards see live status.
    Ok(Json(hub.manager.refresh_status(&id).await?))
}

async fn stop_agent(
    State(hub): HubState,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let cancel = hub.shutdown_token();
    let record = hub.manager.stop(&id, &cancel).await?;
    Ok(Json(serde_json::json!({ "status": "stopped", "id": record.id })))
}

async fn destroy_agent(
    State(hub): HubState,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let cancel = hub.shutdown_token();
    let record = hub.manager.destroy(&id, &cancel).await?;
    Ok(Json(serde_json::json!({ "status": "destroyed", "id": record.id })))
}

#[derive(Debug, Deserialize)]
struct MessageRequest {
    #[serde(default)]
    content: String,
}

async fn message_agent(
    State(hub): HubState,
    Path(id): Path<String>,
    Json(req): Json<MessageRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if req.content.trim().is_empty() {
        return Err(HiveError::InvalidTransition("message content is empty".into()).into());
    }
    hub.manager.send_message(&id, &req.content).await?;
    Ok(Json(serde_json::json!({ "status": "sent" })))
}

async fn agent_conversation(
    State(hub): HubState,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let messages = hub.manager.conversation(&id).await?;
    Ok(Json(serde_json::json!({ "messages": messages })))
}

async fn agent_status(
    State(hub): HubState,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let record = hub.manager.refresh_status(&id).await?;
    Ok(Json(serde_json::json!({
        "status": record.status,
        "error": record.last_error,
    })))
}

// ─── Tasks ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TaskQuery {
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    status: Option<TaskStatus>,
}

async fn list_tasks(
    State(hub): HubState,
    Query(query): Query<TaskQuery>,
) -> Json<Vec<crate::tasks::Task>> {
    let filter = TaskFilter {
        status: query.status,
        owner: query.agent_id,
    };
    Json(hub.tasks.list(&filter))
}

async fn create_task(
    State(hub): HubState,
    Json(req): Json<CreateTaskRequest>,
) -> ApiResult<(StatusCode, Json<crate::tasks::Task>)> {
    Ok((StatusCode::CREATED, Json(hub.tasks.create(req)?)))
}

async fn get_task(
    State(hub): HubState,
    Path(id): Path<String>,
) -> ApiResult<Json<crate::tasks::Task>> {
    Ok(Json(hub.tasks.get(&id)?))
}

async fn start_task(
    State(hub): HubState,
    Path(id): Path<String>,
) -> ApiResult<Json<crate::tasks::Task>> {
    Ok(Json(hub.tasks.start(&id)?))
}

async fn step_task(
    State(hub): HubState,
    Path((id, step)): Path<(String, String)>,
) -> ApiResult<Json<crate::tasks::Task>> {
    Ok(Json(hub.tasks.update_step(&id, &step)?))
}

async fn complete_task(
    State(hub): HubState,
    Path(id): Path<String>,
    payload: Option<Json<serde_json::Value>>,
) -> ApiResult<Json<crate::tasks::Task>> {
    Ok(Json(hub.tasks.complete(&id, payload.map(|Json(v)| v))?))
}

#[derive(Debug, Deserialize)]
struct ReasonBody {
    #[serde(default)]
    reason: String,
}

async fn fail_task(
    State(hub): HubState,
    Path(id): Path<String>,
    Json(body): Json<ReasonBody>,
) -> ApiResult<Json<crate::tasks::Task>> {
    Ok(Json(hub.tasks.fail(&id, &body.reason)?))
}

#[derive(Debug, Deserialize)]
struct ReasonQuery {
    #[serde(default)]
    reason: Option<String>,
}

async fn delete_task(
    State(hub): HubState,
    Path(id): Path<String>,
    Query(query): Query<ReasonQuery>,
) -> ApiResult<Json<crate::tasks::Task>> {
    let reason = query.reason.unwrap_or_else(|| "deleted by operator".to_string());
    Ok(Json(hub.tasks.cancel(&id, &reason)?))
}

// ─── Solicitations ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SolicitationQuery {
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default, rename = "type")]
    solicitation_type: Option<SolicitationType>,
    #[serde(default)]
    urgency: Option<Urgency>,
    /// Missing means pending; `all` lifts the filter.
    #[serde(default)]
    status: Option<String>,
}

async fn list_solicitations(
    State(hub): HubState,
    Query(query): Query<SolicitationQuery>,
) -> ApiResult<Json<Vec<crate::solicitations::Solicitation>>> {
    let status = match query.status.as_deref() {
        None => Some(SolicitationStatus::Pending),
        Some("all") => None,
        Some(raw) => Some(
            serde_json::from_value(serde_json::Value::String(raw.to_string()))
                .map_err(HiveError::Decoding)?,
        ),
    };
    let filter = SolicitationFilter {
        agent_id: query.agent_id,
        solicitation_type: query.solicitation_type,
        urgency: query.urgency,
        status,
    };
    Ok(Json(hub.solicitations.list(&filter)))
}

async fn create_solicitation(
    State(hub): HubState,
    Json(req): Json<CreateSolicitationRequest>,
) -> (StatusCode, Json<crate::solicitations::Solicitation>) {
    (StatusCode::CREATED, Json(hub.solicitations.create(req)))
}

async fn get_solicitation(
    State(hub): HubState,
    Path(id): Path<String>,
) -> ApiResult<Json<crate::solicitations::Solicitation>> {
    Ok(Json(hub.solicitations.get(&id)?))
}

#[derive(Debug, Deserialize)]
struct RespondBody {
    response: String,
}

async fn respond_solicitation(
    State(hub): HubState,
    Path(id): Path<String>,
    Json(body): Json<RespondBody>,
) -> ApiResult<Json<crate::solicitations::Solicitation>> {
    Ok(Json(hub.solicitations.respond(&id, &body.response)?))
}

#[derive(Debug, Default, Deserialize)]
struct DismissBody {
    #[serde(default)]
    reason: Option<String>,
}

async fn dismiss_solicitation(
    State(hub): HubState,
    Path(id): Path<String>,
    body: Option<Json<DismissBody>>,
) -> ApiResult<Json<crate::solicitations::Solicitation>> {
    let reason = body.and_then(|Json(b)| b.reason);
    Ok(Json(hub.solicitations.dismiss(&id, reason.as_deref())?))
}

// ─── Ports ─────────────────────────────────────────────────────────────────

async fn list_ports(State(hub): HubState) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "leases": hub.ports.list_leases(),
        "waiters": hub.ports.list_waiters(),
    }))
}

async fn port_status(
    State(hub): HubState,
    Path(port): Path<u16>,
) -> Json<crate::ports::PortStatus> {
    Json(hub.ports.status(port))
}

async fn acquire_port(
    State(hub): HubState,
    Json(mut req): Json<AcquireRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    if req.agent_name.is_empty() {
        req.agent_name = req.agent_id.clone();
    }
    let cancel = hub.shutdown_token();
    match hub.ports.acquire(req, &cancel).await? {
        AcquireOutcome::Acquired(lease) => Ok(Json(serde_json::json!({
            "status": "acquired",
            "lease": lease,
        }))),
        AcquireOutcome::Busy(holder) => Err(HiveError::Busy {
            port: holder.port,
            holder: holder.agent_name,
        }
        .into()),
        AcquireOutcome::TimedOut => {
            Err(HiveError::Timeout("port wait elapsed".into()).into())
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReleaseBody {
    agent_id: String,
    port: u16,
}

async fn release_port(
    State(hub): HubState,
    Json(body): Json<ReleaseBody>,
) -> ApiResult<Json<serde_json::Value>> {
    hub.ports.release(&body.agent_id, body.port)?;
    Ok(Json(serde_json::json!({ "status": "released", "port": body.port })))
}

async fn force_release_port(
    State(hub): HubState,
    Path(port): Path<u16>,
    body: Option<Json<ReasonBody>>,
) -> ApiResult<Json<serde_json::Value>> {
    let reason = body
        .map(|Json(b)| b.reason)
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| "operator request".to_string());
    hub.ports.force_release(port, &reason)?;
    Ok(Json(serde_json::json!({ "status": "released", "port": port })))
}
