//! Local IPC server for `stay-concierge-ctl` commands.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. Accepts line-delimited JSON commands and
//! routes them to the operator task API.
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "list", "status": "escalated"}
//! {"command": "get", "id": "task-123"}
//! {"command": "assign", "id": "task-123", "staff_address": "+15550100"}
//! {"command": "patch", "id": "task-123", "patch": {"status": "waiting_on_host"}}
//! {"command": "complete", "id": "task-123"}
//! {"command": "cancel", "id": "task-123", "reason": "guest checked out"}
//! {"command": "renotify", "id": "task-123"}
//! {"command": "audit", "id": "task-123"}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": { ... } }
//! {"ok": false, "error": "not found: task task-123"}
//! ```

use std::sync::Arc;

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::models::task::{ActionHolder, TaskStatus};
use crate::orchestrator::task_manager::TaskPatch;
use crate::persistence::task_repo::TaskFilter;
use crate::state::AppState;
use crate::{AppError, Result};

/// Inbound IPC request from `stay-concierge-ctl`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct IpcRequest {
    /// Command verb.
    pub command: String,
    /// Task identifier.
    pub id: Option<String>,
    /// Staff identity (for `assign`).
    pub staff_id: Option<String>,
    /// Staff contact (for `assign`).
    pub staff_address: Option<String>,
    /// Edit to apply (for `patch`).
    pub patch: Option<TaskPatch>,
    /// Cancellation reason.
    pub reason: Option<String>,
    /// List filter: status.
    pub status: Option<TaskStatus>,
    /// List filter: property.
    pub property_id: Option<String>,
    /// List filter: action holder.
    pub action_holder: Option<ActionHolder>,
    /// List filter: only tasks without staff.
    pub unassigned: bool,
    /// List filter: row cap.
    pub limit: Option<u32>,
    /// Shared-secret authentication token.
    pub auth_token: Option<String>,
}

/// Outbound IPC response to `stay-concierge-ctl`.
#[derive(Debug, Serialize, PartialEq)]
pub struct IpcResponse {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IpcResponse {
    fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

impl From<Result<serde_json::Value>> for IpcResponse {
    fn from(result: Result<serde_json::Value>) -> Self {
        match result {
            Ok(data) => Self::success(data),
            Err(err) => Self::error(err.to_string()),
        }
    }
}

/// Spawn the IPC server task.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    state: Arc<AppState>,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let name = state.config.ipc_name.clone();

    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let handle = tokio::spawn(async move {
        let span = info_span!("ipc_server", name = %name);
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                let state = Arc::clone(&state);
                                tokio::spawn(handle_connection(stream, state));
                            }
                            Err(err) => {
                                warn!(%err, "IPC accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;
    });

    Ok(handle)
}

/// Handle a single IPC client connection.
async fn handle_connection(stream: interprocess::local_socket::tokio::Stream, state: Arc<AppState>) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let response = match serde_json::from_str::<IpcRequest>(trimmed) {
                        Ok(request) => dispatch_command(&request, &state).await,
                        Err(err) => IpcResponse::error(format!("invalid json: {err}")),
                    };

                    let mut response_line = serde_json::to_string(&response).unwrap_or_else(|_| {
                        r#"{"ok":false,"error":"serialization failed"}"#.to_owned()
                    });
                    response_line.push('\n');

                    if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                        warn!(%err, "failed to write ipc response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }

        info!("IPC connection closed");
    }
    .instrument(span)
    .await;
}

/// Authenticate and route one command.
pub async fn dispatch_command(request: &IpcRequest, state: &AppState) -> IpcResponse {
    let span = info_span!("ipc_command", command = %request.command);

    if let Some(ref expected) = state.ipc_auth_token {
        match request.auth_token {
            Some(ref provided) if provided == expected => {}
            _ => {
                warn!(command = %request.command, "IPC request rejected: invalid auth token");
                return IpcResponse::error(AppError::Unauthorized("invalid ipc token".into()).to_string());
            }
        }
    }

    run_command(request, state).instrument(span).await.into()
}

async fn run_command(request: &IpcRequest, state: &AppState) -> Result<serde_json::Value> {
    let tasks = &state.engine.tasks;
    match request.command.as_str() {
        "list" => {
            let filter = TaskFilter {
                status: request.status,
                property_id: request.property_id.clone(),
                action_holder: request.action_holder,
                unassigned: request.unassigned,
                limit: request.limit,
            };
            to_json(&tasks.list_tasks(&filter).await?)
        }
        "get" => to_json(&tasks.get_task(required_id(request)?).await?),
        "audit" => to_json(&tasks.task_audit(required_id(request)?).await?),
        "assign" => {
            let id = required_id(request)?;
            let address = request
                .staff_address
                .as_deref()
                .ok_or_else(|| AppError::InvalidInput("missing required 'staff_address' field".into()))?;
            let outcome = tasks
                .assign_staff(id, request.staff_id.as_deref(), address)
                .await?;
            info!(task_id = %id, "staff assigned via IPC");
            to_json(&outcome)
        }
        "patch" => {
            let id = required_id(request)?;
            let patch = request
                .patch
                .as_ref()
                .ok_or_else(|| AppError::InvalidInput("missing required 'patch' field".into()))?;
            let task = tasks.patch_task(id, patch).await?;
            info!(task_id = %id, "task patched via IPC");
            to_json(&task)
        }
        "complete" => {
            let id = required_id(request)?;
            let task = tasks.complete_task(id).await?;
            info!(task_id = %id, "task completed via IPC");
            to_json(&task)
        }
        "cancel" => {
            let id = required_id(request)?;
            let task = tasks.cancel_task(id, request.reason.as_deref()).await?;
            info!(task_id = %id, "task cancelled via IPC");
            to_json(&task)
        }
        "renotify" => {
            let id = required_id(request)?;
            let task = tasks.renotify(id).await?;
            info!(task_id = %id, "guest notices re-armed via IPC");
            to_json(&task)
        }
        other => Err(AppError::InvalidInput(format!("unknown command: {other}"))),
    }
}

fn required_id(request: &IpcRequest) -> Result<&str> {
    request
        .id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::InvalidInput("missing required 'id' field".into()))
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    serde_json::to_value(value).map_err(|err| AppError::Ipc(format!("failed to encode response: {err}")))
}
