//! Integration tests for owed guest notices and operator re-arming.
//!
//! Validates:
//! - A scheduled update that fails to send goes out on the next pass
//! - Guest notice failures never touch the task's attempts or escalate it
//! - A failed guest info request is retried after the staff send landed
//! - An exhausted completion notice is re-armed by an operator and archives

use std::sync::atomic::Ordering;

use stay_concierge::models::audit::AuditEventType;
use stay_concierge::models::definition::TaskDefinition;
use stay_concierge::models::task::{ActionHolder, TaskStatus};
use stay_concierge::oracle::{MessageKind, TriageVerdict};
use stay_concierge::orchestrator::pass;
use stay_concierge::orchestrator::reply::{ReplyOutcome, TaskReplyResult};
use stay_concierge::orchestrator::triage::TriageOutcome;
use stay_concierge::AppError;

use super::test_helpers::{harness, reply, Harness, GUEST, HOST, PROPERTY, STAFF, STAFF_ID};

async fn routed_towels(h: &Harness) -> String {
    h.seed_towels().await;
    let task = h.request("evt-1", "Towels", "Could we get fresh towels?").await;
    h.engine.triage.route(&task.id).await.expect("route");
    task.id
}

/// Ingest a scheduling reply while the notifier is down.
async fn scheduled_while_notifier_down(h: &Harness, task_id: &str) {
    h.oracle.set_satisfied(true);
    h.notifier.fail.store(true, Ordering::SeqCst);
    let outcome = h
        .engine
        .replies
        .ingest(&reply("in-1", STAFF, "I'll deliver tomorrow morning"))
        .await
        .expect("ingest");
    assert!(matches!(
        outcome,
        ReplyOutcome::Processed { ref results, .. }
            if results == &vec![(task_id.to_owned(), TaskReplyResult::Scheduled)]
    ));
}

#[tokio::test]
async fn failed_scheduled_update_is_sent_on_next_pass() {
    let h = harness().await;
    let task_id = routed_towels(&h).await;
    scheduled_while_notifier_down(&h, &task_id).await;

    let task = h.task(&task_id).await;
    assert_eq!(task.status, TaskStatus::Scheduled);
    assert!(task.guest_update_pending);
    assert_eq!(task.guest_notice_attempts, 1);
    assert_eq!(task.attempts, 0);
    assert!(h.notifier.sent_of(MessageKind::GuestScheduledUpdate).is_empty());

    h.notifier.fail.store(false, Ordering::SeqCst);
    let report = pass::run_pass(&h.engine).await.expect("pass");
    assert_eq!(report.guest_notices, 1);

    let updates = h.notifier.sent_of(MessageKind::GuestScheduledUpdate);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].to, GUEST);
    let task = h.task(&task_id).await;
    assert!(!task.guest_update_pending);
    assert_eq!(task.guest_notice_attempts, 0);

    let again = pass::run_pass(&h.engine).await.expect("pass again");
    assert_eq!(again.guest_notices, 0);
    assert_eq!(h.notifier.sent_of(MessageKind::GuestScheduledUpdate).len(), 1);
}

#[tokio::test]
async fn guest_notice_failures_never_escalate_the_task() {
    let h = harness().await;
    let task_id = routed_towels(&h).await;
    scheduled_while_notifier_down(&h, &task_id).await;

    for _ in 0..4 {
        let report = pass::run_pass(&h.engine).await.expect("pass");
        assert_eq!(report.guest_notices, 0);
    }

    let task = h.task(&task_id).await;
    assert_eq!(task.status, TaskStatus::Scheduled);
    assert_eq!(task.action_holder, ActionHolder::Staff);
    assert_eq!(task.attempts, 0);
    assert_eq!(task.guest_notice_attempts, 3);
    assert!(task.escalation_reason.is_none());
    assert!(task.guest_update_pending);
    assert!(h.notifier.sent_of(MessageKind::HostEscalation).is_empty());
    assert_eq!(
        h.engine
            .ctx
            .audit
            .count(&task_id, AuditEventType::RetryExhausted)
            .await
            .expect("count"),
        1
    );

    // Out of retries: only an operator brings the update back.
    h.notifier.fail.store(false, Ordering::SeqCst);
    assert_eq!(pass::run_pass(&h.engine).await.expect("pass").guest_notices, 0);

    let rearmed = h.engine.tasks.renotify(&task_id).await.expect("renotify");
    assert_eq!(rearmed.guest_notice_attempts, 0);
    assert_eq!(pass::run_pass(&h.engine).await.expect("pass").guest_notices, 1);
    assert_eq!(h.notifier.sent_of(MessageKind::GuestScheduledUpdate).len(), 1);
}

#[tokio::test]
async fn failed_guest_info_request_is_retried_on_next_pass() {
    let h = harness().await;
    h.seed_property(Some(HOST)).await;
    h.seed_definition(
        TaskDefinition::new(PROPERTY.into(), "Crib".into())
            .with_staff(STAFF_ID, STAFF)
            .with_requirements("staff confirms setup time", "guest confirms the room", ""),
    )
    .await;
    h.oracle.set_verdict(TriageVerdict {
        guest_missing: vec!["room number".into()],
        ..TriageVerdict::default()
    });
    let task = h.request("evt-1", "crib", "Can we get a crib?").await;

    h.notifier.fail_sends_to(Some(GUEST));
    let outcome = h.engine.triage.route(&task.id).await.expect("route");
    assert_eq!(
        outcome,
        TriageOutcome::Routed {
            holder: ActionHolder::Staff,
            guest_asked: false
        }
    );

    let stored = h.task(&task.id).await;
    assert_eq!(stored.status, TaskStatus::WaitingOnStaff);
    assert!(!stored.guest_info_requested);
    assert_eq!(stored.guest_info_missing, Some(vec!["room number".to_owned()]));
    assert_eq!(stored.guest_notice_attempts, 1);
    assert_eq!(stored.attempts, 0);

    h.notifier.fail_sends_to(None);
    let report = pass::run_pass(&h.engine).await.expect("pass");
    assert_eq!(report.guest_notices, 1);

    let asked = h.notifier.sent_of(MessageKind::GuestInfoRequest);
    assert_eq!(asked.len(), 1);
    assert_eq!(asked[0].to, GUEST);
    let stored = h.task(&task.id).await;
    assert!(stored.guest_info_requested);
    assert!(stored.guest_info_missing.is_none());
    assert_eq!(h.notifier.sent_of(MessageKind::StaffInfoRequest).len(), 1);
}

#[tokio::test]
async fn exhausted_completion_notice_is_rearmed_by_operator() {
    let h = harness().await;
    let task_id = routed_towels(&h).await;
    h.oracle.set_satisfied(true);
    h.engine
        .replies
        .ingest(&reply("in-1", STAFF, "Delivered to room 12B"))
        .await
        .expect("ingest");
    assert_eq!(h.task(&task_id).await.status, TaskStatus::Completed);

    h.notifier.fail.store(true, Ordering::SeqCst);
    for _ in 0..4 {
        assert_eq!(h.engine.completion.run().await.expect("completion"), 0);
    }
    let stuck = h.task(&task_id).await;
    assert_eq!(stuck.attempts, 3);
    assert!(!stuck.completion_notified);
    assert_eq!(h.engine.archiver.run().await.expect("archive"), 0);

    let rearmed = h.engine.tasks.renotify(&task_id).await.expect("renotify");
    assert_eq!(rearmed.status, TaskStatus::Completed);
    assert_eq!(rearmed.attempts, 0);
    assert_eq!(
        h.engine
            .ctx
            .audit
            .count(&task_id, AuditEventType::ManualOverride)
            .await
            .expect("count"),
        1
    );

    h.notifier.fail.store(false, Ordering::SeqCst);
    assert_eq!(h.engine.completion.run().await.expect("completion"), 1);
    assert_eq!(h.notifier.sent_of(MessageKind::GuestCompletionNotice).len(), 1);
    assert_eq!(h.engine.archiver.run().await.expect("archive"), 1);
}

#[tokio::test]
async fn renotify_refuses_task_that_owes_nothing() {
    let h = harness().await;
    let task_id = routed_towels(&h).await;

    let err = h.engine.tasks.renotify(&task_id).await.expect_err("nothing owed");
    assert!(matches!(err, AppError::InvalidInput(_)));

    let err = h.engine.tasks.renotify("missing").await.expect_err("missing");
    assert!(matches!(err, AppError::NotFound(_)));
}
