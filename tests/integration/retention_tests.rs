//! Integration tests for archival and the retention purge.
//!
//! Validates:
//! - Only notified completions and cancellations are archived
//! - Archived tasks keep their audit trail until the retention window passes
//! - The purge removes archives with their audit entries and messages

use stay_concierge::models::task::TaskStatus;
use stay_concierge::persistence::task_repo::TaskFilter;

use super::test_helpers::{harness, reply, STAFF};

#[tokio::test]
async fn archiver_moves_only_finished_tasks() {
    let h = harness().await;
    h.seed_towels().await;
    h.oracle.set_satisfied(true);

    let open = h.request("evt-1", "Towels", "Fresh towels please").await;
    let cancelled = h.request("evt-2", "Late checkout", "2pm please").await;
    h.engine
        .tasks
        .cancel_task(&cancelled.id, None)
        .await
        .expect("cancel");
    let unannounced = h.request("evt-3", "Crib", "A crib please").await;
    h.engine
        .tasks
        .complete_task(&unannounced.id)
        .await
        .expect("complete");

    assert_eq!(h.engine.archiver.run().await.expect("archive"), 1);

    let remaining: Vec<String> = h
        .engine
        .tasks
        .list_tasks(&TaskFilter::default())
        .await
        .expect("list")
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert!(remaining.contains(&open.id));
    assert!(remaining.contains(&unannounced.id));
    assert!(!remaining.contains(&cancelled.id));

    let archived = h
        .engine
        .ctx
        .archive
        .get_by_id(&cancelled.id)
        .await
        .expect("lookup")
        .expect("archived");
    assert_eq!(archived.payload.task.status, TaskStatus::Cancelled);
    assert_eq!(archived.payload.task.message_chain, vec!["evt-2".to_owned()]);
}

#[tokio::test]
async fn retention_window_keeps_recent_archives() {
    let h = harness().await;
    h.seed_towels().await;
    let task = h.request("evt-1", "Towels", "Fresh towels please").await;
    h.engine.tasks.cancel_task(&task.id, None).await.expect("cancel");
    h.engine.archiver.run().await.expect("archive");

    assert_eq!(h.engine.archiver.purge().await.expect("purge"), 0);
    assert!(h
        .engine
        .ctx
        .archive
        .get_by_id(&task.id)
        .await
        .expect("lookup")
        .is_some());
    assert!(!h.engine.tasks.task_audit(&task.id).await.expect("audit").is_empty());
}

#[tokio::test]
async fn purge_removes_expired_archives_with_children() {
    let h = harness().await;
    h.seed_towels().await;
    h.oracle.set_satisfied(true);
    let task = h.request("evt-1", "Towels", "Fresh towels please").await;
    h.engine.triage.route(&task.id).await.expect("route");
    h.engine
        .replies
        .ingest(&reply("in-1", STAFF, "Delivered"))
        .await
        .expect("reply");
    h.engine.completion.run().await.expect("notice");
    assert_eq!(h.engine.archiver.run().await.expect("archive"), 1);

    // A zero-day window expires everything archived so far.
    let removed = stay_concierge::persistence::retention::purge(&h.engine.ctx.db, 0)
        .await
        .expect("purge");
    assert_eq!(removed, 1);

    assert!(h
        .engine
        .ctx
        .archive
        .get_by_id(&task.id)
        .await
        .expect("lookup")
        .is_none());
    assert!(h
        .engine
        .ctx
        .audit
        .list_for_task(&task.id)
        .await
        .expect("audit")
        .is_empty());
    assert!(h
        .engine
        .ctx
        .messages
        .get_by_id("in-1")
        .await
        .expect("lookup")
        .is_none());
}
