//! Route table and handlers.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::{info_span, Instrument};

use crate::models::audit::TaskAuditEntry;
use crate::models::event::{ClassificationEvent, InboundReply};
use crate::models::task::{ActionHolder, Task, TaskStatus};
use crate::orchestrator::dedup::IngestOutcome;
use crate::orchestrator::reply::ReplyOutcome;
use crate::persistence::task_repo::TaskFilter;
use crate::state::AppState;

use super::ApiError;

type Shared = State<Arc<AppState>>;

/// Query string accepted by `GET /tasks`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListQuery {
    status: Option<TaskStatus>,
    property_id: Option<String>,
    action_holder: Option<ActionHolder>,
    unassigned: bool,
    limit: Option<u32>,
}

impl From<ListQuery> for TaskFilter {
    fn from(query: ListQuery) -> Self {
        Self {
            status: query.status,
            property_id: query.property_id,
            action_holder: query.action_holder,
            unassigned: query.unassigned,
            limit: query.limit,
        }
    }
}

/// Build the API router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/events/classification", post(ingest_event))
        .route("/replies", post(ingest_reply))
        .route("/tasks", get(list_tasks))
        .route("/tasks/{id}", get(get_task))
        .route("/tasks/{id}/audit", get(task_audit))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn ingest_event(
    State(state): Shared,
    Json(event): Json<ClassificationEvent>,
) -> Result<(StatusCode, Json<IngestOutcome>), ApiError> {
    let outcome = state.engine.dedup.ingest(&event).await?;
    let status = match outcome {
        IngestOutcome::Created { .. } => StatusCode::CREATED,
        _ => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

async fn ingest_reply(
    State(state): Shared,
    Json(reply): Json<InboundReply>,
) -> Result<(StatusCode, Json<ReplyOutcome>), ApiError> {
    let span = info_span!("http_reply", message_id = %reply.message_id);
    let outcome = state.engine.replies.ingest(&reply).instrument(span).await?;
    let status = match outcome {
        ReplyOutcome::Pending { .. } => StatusCode::ACCEPTED,
        _ => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

async fn list_tasks(
    State(state): Shared,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let tasks = state.engine.tasks.list_tasks(&query.into()).await?;
    Ok(Json(tasks))
}

async fn get_task(State(state): Shared, Path(id): Path<String>) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.engine.tasks.get_task(&id).await?))
}

async fn task_audit(
    State(state): Shared,
    Path(id): Path<String>,
) -> Result<Json<Vec<TaskAuditEntry>>, ApiError> {
    Ok(Json(state.engine.tasks.task_audit(&id).await?))
}
