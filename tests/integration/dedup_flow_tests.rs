//! Integration tests for classification event intake.
//!
//! Validates:
//! - Repeat requests fold into the one open task and extend its chain
//! - Replayed event ids are consumed once
//! - Denylisted categories never become tasks
//! - Unmatched definitions create unassigned tasks that triage leaves alone
//! - A closed task does not absorb a new request for the same category

use stay_concierge::models::audit::AuditEventType;
use stay_concierge::models::task::TaskStatus;
use stay_concierge::orchestrator::dedup::IngestOutcome;
use stay_concierge::orchestrator::definition_match::MatchTier;
use stay_concierge::orchestrator::triage::{SkipReason, TriageOutcome};
use stay_concierge::persistence::task_repo::TaskFilter;
use stay_concierge::AppError;

use super::test_helpers::{event, harness};

#[tokio::test]
async fn repeat_request_links_to_open_task() {
    let h = harness().await;
    h.seed_towels().await;

    let first = h
        .engine
        .dedup
        .ingest(&event("evt-1", "Towels", "Fresh towels please"))
        .await
        .expect("first");
    let IngestOutcome::Created { task_id, definition } = first else {
        panic!("expected a new task, got {first:?}");
    };
    assert_eq!(definition, Some(MatchTier::Exact));

    let second = h
        .engine
        .dedup
        .ingest(&event("evt-2", "  towels ", "Still waiting on towels"))
        .await
        .expect("second");
    assert_eq!(
        second,
        IngestOutcome::Linked {
            task_id: task_id.clone()
        }
    );

    let tasks = h
        .engine
        .tasks
        .list_tasks(&TaskFilter::default())
        .await
        .expect("list");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].message_chain, vec!["evt-1".to_owned(), "evt-2".to_owned()]);
    assert_eq!(tasks[0].source_event_id, "evt-1");

    let linked = h
        .engine
        .ctx
        .audit
        .count(&task_id, AuditEventType::SourceEventLinked)
        .await
        .expect("count");
    assert_eq!(linked, 1);
}

#[tokio::test]
async fn replayed_event_is_consumed_once() {
    let h = harness().await;
    h.seed_towels().await;

    let ev = event("evt-1", "Towels", "Fresh towels please");
    let first = h.engine.dedup.ingest(&ev).await.expect("first");
    let IngestOutcome::Created { task_id, .. } = first else {
        panic!("expected a new task, got {first:?}");
    };

    let replay = h.engine.dedup.ingest(&ev).await.expect("replay");
    assert_eq!(
        replay,
        IngestOutcome::AlreadyConsumed {
            task_id: Some(task_id.clone())
        }
    );
    assert_eq!(h.task(&task_id).await.message_chain, vec!["evt-1".to_owned()]);
}

#[tokio::test]
async fn denylisted_category_is_discarded() {
    let h = harness().await;
    h.seed_towels().await;

    let outcome = h
        .engine
        .dedup
        .ingest(&event("evt-1", "General Inquiry", "hello!"))
        .await
        .expect("ingest");
    assert_eq!(outcome, IngestOutcome::Discarded);

    let replay = h
        .engine
        .dedup
        .ingest(&event("evt-1", "General Inquiry", "hello!"))
        .await
        .expect("replay");
    assert_eq!(replay, IngestOutcome::AlreadyConsumed { task_id: None });

    let tasks = h
        .engine
        .tasks
        .list_tasks(&TaskFilter::default())
        .await
        .expect("list");
    assert!(tasks.is_empty());
}

#[tokio::test]
async fn unmatched_definition_creates_unassigned_task() {
    let h = harness().await;
    h.seed_towels().await;

    let task = h.request("evt-1", "Late checkout", "Can we leave at 2pm?").await;
    assert!(task.staff_address.is_none());
    assert_eq!(task.status, TaskStatus::WaitingOnStaff);

    let unresolved = h
        .engine
        .ctx
        .audit
        .count(&task.id, AuditEventType::DefinitionUnresolved)
        .await
        .expect("count");
    assert_eq!(unresolved, 1);

    let outcome = h.engine.triage.route(&task.id).await.expect("route");
    assert_eq!(outcome, TriageOutcome::Skipped(SkipReason::Unassigned));
    assert!(h.notifier.sent().is_empty());

    let unassigned = h
        .engine
        .tasks
        .list_tasks(&TaskFilter {
            unassigned: true,
            ..TaskFilter::default()
        })
        .await
        .expect("list");
    assert_eq!(unassigned.len(), 1);
    assert_eq!(unassigned[0].id, task.id);
}

#[tokio::test]
async fn closed_task_does_not_absorb_new_request() {
    let h = harness().await;
    h.seed_towels().await;

    let first = h.request("evt-1", "Towels", "Fresh towels please").await;
    h.engine
        .tasks
        .cancel_task(&first.id, Some("guest checked out"))
        .await
        .expect("cancel");

    let second = h.request("evt-2", "Towels", "Towels again please").await;
    assert_ne!(first.id, second.id);
    assert_eq!(second.status, TaskStatus::WaitingOnStaff);
}

#[tokio::test]
async fn event_without_requester_is_rejected() {
    let h = harness().await;
    let mut ev = event("evt-1", "Towels", "Fresh towels please");
    ev.requester_address = "  ".into();

    let err = h.engine.dedup.ingest(&ev).await.expect_err("invalid");
    assert!(matches!(err, AppError::InvalidInput(_)));
}
