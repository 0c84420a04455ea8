//! Integration tests for IPC command dispatch and authentication.
//!
//! Validates:
//! - A matching auth token is accepted; a wrong or missing one is rejected
//! - `list`, `get`, `audit`, `assign`, `patch`, `complete`, `cancel` and
//!   `renotify` reach the task API and encode their results
//! - Malformed requests come back as errors, not panics

use std::sync::Arc;

use serde_json::json;
use stay_concierge::ipc::server::{dispatch_command, IpcRequest};
use stay_concierge::state::AppState;

use super::test_helpers::{harness, test_config, Harness, STAFF};

const TOKEN: &str = "ipc-secret";

async fn state() -> (Harness, AppState) {
    let h = harness().await;
    h.seed_towels().await;
    let state = AppState {
        config: Arc::new(test_config()),
        engine: h.engine.clone(),
        ipc_auth_token: Some(TOKEN.to_owned()),
    };
    (h, state)
}

fn request(value: serde_json::Value) -> IpcRequest {
    let mut value = value;
    if value.get("auth_token").is_none() {
        value["auth_token"] = json!(TOKEN);
    }
    serde_json::from_value(value).expect("valid request")
}

#[tokio::test]
async fn rejects_wrong_or_missing_token() {
    let (_h, state) = state().await;

    let wrong = dispatch_command(
        &request(json!({"command": "list", "auth_token": "nope"})),
        &state,
    )
    .await;
    assert!(!wrong.ok);
    assert!(wrong.error.as_deref().is_some_and(|e| e.starts_with("unauthorized:")));

    let missing: IpcRequest = serde_json::from_value(json!({"command": "list"})).expect("request");
    let response = dispatch_command(&missing, &state).await;
    assert!(!response.ok);
}

#[tokio::test]
async fn token_check_is_skipped_when_unset() {
    let (h, mut state) = state().await;
    state.ipc_auth_token = None;
    h.request("evt-1", "Towels", "Fresh towels please").await;

    let unauthenticated: IpcRequest =
        serde_json::from_value(json!({"command": "list"})).expect("request");
    let response = dispatch_command(&unauthenticated, &state).await;
    assert!(response.ok);
    assert_eq!(response.data.expect("data").as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn list_get_and_audit_return_task_data() {
    let (h, state) = state().await;
    let task = h.request("evt-1", "Towels", "Fresh towels please").await;

    let list = dispatch_command(
        &request(json!({"command": "list", "status": "waiting_on_staff"})),
        &state,
    )
    .await;
    assert!(list.ok);
    let data = list.data.expect("data");
    assert_eq!(data[0]["id"], json!(task.id));
    assert_eq!(data[0]["status"], json!("waiting_on_staff"));

    let get = dispatch_command(&request(json!({"command": "get", "id": task.id})), &state).await;
    assert!(get.ok);
    assert_eq!(get.data.expect("data")["category"], json!("Towels"));

    let audit =
        dispatch_command(&request(json!({"command": "audit", "id": task.id})), &state).await;
    assert!(audit.ok);
    assert_eq!(audit.data.expect("data")[0]["event_type"], json!("task_created"));
}

#[tokio::test]
async fn assign_routes_and_reports_triage_outcome() {
    let (h, state) = state().await;
    let task = h.request("evt-1", "Late checkout", "2pm please").await;

    let response = dispatch_command(
        &request(json!({
            "command": "assign",
            "id": task.id,
            "staff_address": STAFF,
            "staff_id": "staff-9",
        })),
        &state,
    )
    .await;
    assert!(response.ok, "error: {:?}", response.error);
    let data = response.data.expect("data");
    assert_eq!(data["triage"]["outcome"], json!("routed"));
    assert_eq!(data["task"]["staff_id"], json!("staff-9"));
    assert_eq!(h.notifier.sent().len(), 1);
}

#[tokio::test]
async fn patch_complete_and_cancel() {
    let (h, state) = state().await;
    let first = h.request("evt-1", "Towels", "Fresh towels please").await;
    let second = h.request("evt-2", "Late checkout", "2pm please").await;

    let patched = dispatch_command(
        &request(json!({
            "command": "patch",
            "id": first.id,
            "patch": {"status": "waiting_on_host", "escalation_reason": "guest is a VIP"},
        })),
        &state,
    )
    .await;
    assert!(patched.ok, "error: {:?}", patched.error);
    let data = patched.data.expect("data");
    assert_eq!(data["status"], json!("waiting_on_host"));
    assert_eq!(data["action_holder"], json!("host"));
    assert_eq!(data["escalation_reason"], json!("guest is a VIP"));

    let completed =
        dispatch_command(&request(json!({"command": "complete", "id": first.id})), &state).await;
    assert!(completed.ok);
    assert_eq!(completed.data.expect("data")["status"], json!("completed"));

    let cancelled = dispatch_command(
        &request(json!({"command": "cancel", "id": second.id, "reason": "not offered"})),
        &state,
    )
    .await;
    assert!(cancelled.ok);
    assert_eq!(cancelled.data.expect("data")["status"], json!("cancelled"));

    let again =
        dispatch_command(&request(json!({"command": "cancel", "id": second.id})), &state).await;
    assert!(!again.ok);
    assert!(again
        .error
        .as_deref()
        .is_some_and(|e| e.starts_with("invalid transition:")));
}

#[tokio::test]
async fn renotify_rearms_only_owed_notices() {
    let (h, state) = state().await;
    let done = h.request("evt-1", "Towels", "Fresh towels please").await;
    let open = h.request("evt-2", "Late checkout", "2pm please").await;
    h.engine.tasks.complete_task(&done.id).await.expect("complete");

    let rearmed =
        dispatch_command(&request(json!({"command": "renotify", "id": done.id})), &state).await;
    assert!(rearmed.ok, "error: {:?}", rearmed.error);
    let data = rearmed.data.expect("data");
    assert_eq!(data["status"], json!("completed"));
    assert_eq!(data["attempts"], json!(0));

    let nothing_owed =
        dispatch_command(&request(json!({"command": "renotify", "id": open.id})), &state).await;
    assert!(!nothing_owed.ok);
    assert!(nothing_owed
        .error
        .as_deref()
        .is_some_and(|e| e.starts_with("invalid input:")));
}

#[tokio::test]
async fn malformed_requests_are_reported() {
    let (_h, state) = state().await;

    let no_id = dispatch_command(&request(json!({"command": "get"})), &state).await;
    assert!(!no_id.ok);
    assert!(no_id.error.as_deref().is_some_and(|e| e.contains("'id'")));

    let unknown = dispatch_command(&request(json!({"command": "reboot"})), &state).await;
    assert!(!unknown.ok);
    assert!(unknown
        .error
        .as_deref()
        .is_some_and(|e| e.contains("unknown command")));

    let not_found =
        dispatch_command(&request(json!({"command": "get", "id": "missing"})), &state).await;
    assert!(!not_found.ok);
    assert!(not_found
        .error
        .as_deref()
        .is_some_and(|e| e.starts_with("not found:")));

    let no_patch = dispatch_command(&request(json!({"command": "patch", "id": "x"})), &state).await;
    assert!(!no_patch.ok);
}
