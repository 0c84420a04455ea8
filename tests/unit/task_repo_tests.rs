//! Unit tests for the task repository's conditional writes.

use std::sync::Arc;
use std::time::Duration;

use stay_concierge::models::audit::{AuditEventType, TaskAuditEntry};
use stay_concierge::models::definition::TaskDefinition;
use stay_concierge::models::event::ClassificationEvent;
use stay_concierge::models::message::{ConversationMessage, SenderRole};
use stay_concierge::models::task::{ActionHolder, Task, TaskStatus};
use stay_concierge::persistence::audit_repo::AuditRepo;
use stay_concierge::persistence::db;
use stay_concierge::persistence::task_repo::{
    ClaimGuard, DispatchEffect, Rearm, StatusUpdate, TaskFilter, TaskRepo,
};
use stay_concierge::AppError;

const LEASE: Duration = Duration::from_secs(60);
const STAFF: &str = "+15550100";

struct Fixture {
    repo: TaskRepo,
    audit: AuditRepo,
}

async fn fixture() -> Fixture {
    let database = Arc::new(db::connect_memory().await.expect("db"));
    Fixture {
        repo: TaskRepo::new(Arc::clone(&database)),
        audit: AuditRepo::new(database),
    }
}

fn event(id: &str, category: &str) -> ClassificationEvent {
    ClassificationEvent {
        source_event_id: id.into(),
        requester_address: "+15550001".into(),
        property_id: "prop-1".into(),
        booking_id: None,
        category: category.into(),
        request_text: "please".into(),
    }
}

fn staffed_task(id: &str, category: &str) -> Task {
    let definition =
        TaskDefinition::new("prop-1".into(), category.into()).with_staff("staff-7", STAFF);
    Task::new(&event(id, category), Some(&definition))
}

fn staff_effect() -> DispatchEffect {
    DispatchEffect::ActionHolder {
        expected: TaskStatus::WaitingOnStaff,
        next_status: TaskStatus::WaitingOnStaff,
        holder: ActionHolder::Staff,
        host_escalation_needed: false,
    }
}

#[tokio::test]
async fn second_open_task_for_same_category_is_duplicate() {
    let f = fixture().await;
    f.repo
        .create(&staffed_task("evt-1", "Towels"), &[])
        .await
        .expect("first");

    let err = f
        .repo
        .create(&staffed_task("evt-2", " towels "), &[])
        .await
        .expect_err("second open task");
    assert!(matches!(err, AppError::Duplicate(_)));

    f.repo
        .create(&staffed_task("evt-3", "Late checkout"), &[])
        .await
        .expect("different category");
}

#[tokio::test]
async fn closed_task_frees_the_category() {
    let f = fixture().await;
    let first = f
        .repo
        .create(&staffed_task("evt-1", "Towels"), &[])
        .await
        .expect("first");
    let cancelled = f
        .repo
        .update_status(
            &first.id,
            TaskStatus::WaitingOnStaff,
            &StatusUpdate::to(TaskStatus::Cancelled),
            &[],
        )
        .await
        .expect("cancel");
    assert!(cancelled);

    f.repo
        .create(&staffed_task("evt-2", "Towels"), &[])
        .await
        .expect("new task after close");
    let open = f
        .repo
        .find_open_for("+15550001", "prop-1", "towels")
        .await
        .expect("lookup")
        .expect("open task");
    assert_ne!(open.id, first.id);
}

#[tokio::test]
async fn claim_is_exclusive_until_released() {
    let f = fixture().await;
    let task = f
        .repo
        .create(&staffed_task("evt-1", "Towels"), &[])
        .await
        .expect("create");
    let guard = ClaimGuard::ActionHolder(TaskStatus::WaitingOnStaff);

    let claim = f
        .repo
        .claim(&task.id, guard, LEASE)
        .await
        .expect("claim")
        .expect("granted");
    assert!(f.repo.claim(&task.id, guard, LEASE).await.expect("claim").is_none());
    assert!(f
        .repo
        .triage_candidates(3)
        .await
        .expect("candidates")
        .is_empty());

    f.repo.release_claim(&claim).await.expect("release");
    assert!(f.repo.claim(&task.id, guard, LEASE).await.expect("claim").is_some());
}

#[tokio::test]
async fn claim_guard_checks_expected_status() {
    let f = fixture().await;
    let task = f
        .repo
        .create(&staffed_task("evt-1", "Towels"), &[])
        .await
        .expect("create");

    let wrong = f
        .repo
        .claim(&task.id, ClaimGuard::ActionHolder(TaskStatus::WaitingOnHost), LEASE)
        .await
        .expect("claim");
    assert!(wrong.is_none());

    let notice = f
        .repo
        .claim(&task.id, ClaimGuard::CompletionNotice, LEASE)
        .await
        .expect("claim");
    assert!(notice.is_none(), "open task has no completion notice to send");
}

#[tokio::test]
async fn apply_dispatch_records_message_and_blocks_reclaim() {
    let f = fixture().await;
    let task = f
        .repo
        .create(&staffed_task("evt-1", "Towels"), &[])
        .await
        .expect("create");
    let claim = f
        .repo
        .claim(&task.id, staff_effect().guard(), LEASE)
        .await
        .expect("claim")
        .expect("granted");

    let message =
        ConversationMessage::outbound(&task, "out-1".into(), STAFF, SenderRole::System, "Towels?");
    let audit = [TaskAuditEntry::new(
        &task.id,
        AuditEventType::TransportAttempt,
        "sent to staff",
    )];
    let applied = f
        .repo
        .apply_dispatch(&claim, staff_effect(), &message, &audit)
        .await
        .expect("apply");
    assert!(applied);

    let stored = f.repo.get_by_id(&task.id).await.expect("get").expect("task");
    assert!(stored.action_holder_notified);
    assert_eq!(stored.action_holder_address.as_deref(), Some(STAFF));
    assert_eq!(stored.last_outbound_message.as_deref(), Some("Towels?"));
    assert_eq!(stored.message_chain, vec!["out-1".to_owned()]);
    assert!(stored.awaiting_reply());
    assert_eq!(
        f.audit
            .count(&task.id, AuditEventType::TransportAttempt)
            .await
            .expect("count"),
        1
    );

    // Notified this round: no second claim, no second apply.
    assert!(f
        .repo
        .claim(&task.id, staff_effect().guard(), LEASE)
        .await
        .expect("claim")
        .is_none());
    let replay = f
        .repo
        .apply_dispatch(&claim, staff_effect(), &message, &[])
        .await
        .expect("apply");
    assert!(!replay);
}

#[tokio::test]
async fn record_failure_escalates_at_cap_and_resets_attempts() {
    let f = fixture().await;
    let task = f
        .repo
        .create(&staffed_task("evt-1", "Towels"), &[])
        .await
        .expect("create");

    let first = f
        .repo
        .record_failure(&task.id, None, 2, "gave up", &[])
        .await
        .expect("failure");
    assert_eq!(first.attempts, 1);
    assert!(!first.exhausted);
    assert!(!first.escalated);

    let second = f
        .repo
        .record_failure(&task.id, None, 2, "gave up", &[])
        .await
        .expect("failure");
    assert_eq!(second.attempts, 2);
    assert!(second.exhausted);
    assert!(second.escalated);

    let stored = f.repo.get_by_id(&task.id).await.expect("get").expect("task");
    assert_eq!(stored.status, TaskStatus::Escalated);
    assert_eq!(stored.action_holder, ActionHolder::Host);
    assert_eq!(stored.escalation_reason.as_deref(), Some("gave up"));
    assert!(stored.host_escalation_needed);
    assert_eq!(stored.attempts, 0);

    // An escalated task that keeps failing stays put.
    f.repo
        .record_failure(&task.id, None, 2, "again", &[])
        .await
        .expect("failure");
    let exhausted = f
        .repo
        .record_failure(&task.id, None, 2, "again", &[])
        .await
        .expect("failure");
    assert!(exhausted.exhausted);
    assert!(!exhausted.escalated);
    let parked = f.repo.get_by_id(&task.id).await.expect("get").expect("task");
    assert_eq!(parked.attempts, 2);
    assert_eq!(parked.escalation_reason.as_deref(), Some("gave up"));
}

#[tokio::test]
async fn record_failure_on_missing_task_is_not_found() {
    let f = fixture().await;
    let err = f
        .repo
        .record_failure("missing", None, 3, "x", &[])
        .await
        .expect_err("missing");
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test]
async fn update_status_is_compare_and_set() {
    let f = fixture().await;
    let task = f
        .repo
        .create(&staffed_task("evt-1", "Towels"), &[])
        .await
        .expect("create");

    let update = StatusUpdate {
        action_holder: Some(ActionHolder::Host),
        rearm: Rearm::AfterReply,
        ..StatusUpdate::to(TaskStatus::WaitingOnHost)
    };
    assert!(f
        .repo
        .update_status(&task.id, TaskStatus::WaitingOnStaff, &update, &[])
        .await
        .expect("update"));
    assert!(!f
        .repo
        .update_status(&task.id, TaskStatus::WaitingOnStaff, &update, &[])
        .await
        .expect("stale update"));

    let completed = f
        .repo
        .update_status(
            &task.id,
            TaskStatus::WaitingOnHost,
            &StatusUpdate::to(TaskStatus::Completed),
            &[],
        )
        .await
        .expect("complete");
    assert!(completed);
    let stored = f.repo.get_by_id(&task.id).await.expect("get").expect("task");
    assert!(stored.completed_at.is_some());
    assert_eq!(f.repo.completion_candidates(3).await.expect("candidates").len(), 1);
}

#[tokio::test]
async fn list_filters_unassigned_open_tasks() {
    let f = fixture().await;
    f.repo
        .create(&staffed_task("evt-1", "Towels"), &[])
        .await
        .expect("staffed");
    let orphan = Task::new(&event("evt-2", "Late checkout"), None);
    f.repo.create(&orphan, &[]).await.expect("orphan");

    let unassigned = f
        .repo
        .list(&TaskFilter {
            unassigned: true,
            ..TaskFilter::default()
        })
        .await
        .expect("list");
    assert_eq!(unassigned.len(), 1);
    assert_eq!(unassigned[0].id, orphan.id);

    let candidates = f.repo.triage_candidates(3).await.expect("candidates");
    assert_eq!(candidates.len(), 1, "unassigned tasks are not triaged");
}

#[tokio::test]
async fn escalation_ends_the_wait_for_a_reply() {
    let f = fixture().await;
    let task = f
        .repo
        .create(&staffed_task("evt-1", "Towels"), &[])
        .await
        .expect("create");
    let claim = f
        .repo
        .claim(&task.id, staff_effect().guard(), LEASE)
        .await
        .expect("claim")
        .expect("granted");
    let message =
        ConversationMessage::outbound(&task, "out-1".into(), STAFF, SenderRole::System, "Towels?");
    f.repo
        .apply_dispatch(&claim, staff_effect(), &message, &[])
        .await
        .expect("apply");
    assert!(f.repo.triage_candidates(3).await.expect("candidates").is_empty());

    assert!(f.repo.escalate(&task.id, "gave up", &[]).await.expect("escalate"));

    let stored = f.repo.get_by_id(&task.id).await.expect("get").expect("task");
    assert_eq!(stored.status, TaskStatus::Escalated);
    assert!(!stored.awaiting_reply());
    let candidates = f.repo.triage_candidates(3).await.expect("candidates");
    assert_eq!(candidates.len(), 1);
    assert_eq!(candidates[0].id, task.id);
}

#[tokio::test]
async fn guest_update_is_claimable_only_while_owed() {
    let f = fixture().await;
    let task = f
        .repo
        .create(&staffed_task("evt-1", "Towels"), &[])
        .await
        .expect("create");
    let scheduled = StatusUpdate {
        action_holder: Some(ActionHolder::Staff),
        ..StatusUpdate::to(TaskStatus::Scheduled)
    };
    f.repo
        .update_status(&task.id, TaskStatus::WaitingOnStaff, &scheduled, &[])
        .await
        .expect("schedule");

    let guard = ClaimGuard::GuestUpdate(TaskStatus::Scheduled);
    assert!(f.repo.claim(&task.id, guard, LEASE).await.expect("claim").is_none());

    let owed = StatusUpdate {
        notify_guest: true,
        ..StatusUpdate::to(TaskStatus::Scheduled)
    };
    f.repo
        .update_status(&task.id, TaskStatus::Scheduled, &owed, &[])
        .await
        .expect("owe update");
    assert_eq!(f.repo.guest_notice_candidates(3).await.expect("candidates").len(), 1);
    let claim = f
        .repo
        .claim(&task.id, guard, LEASE)
        .await
        .expect("claim")
        .expect("granted");

    let message = ConversationMessage::outbound(
        &task,
        "out-1".into(),
        "+15550001",
        SenderRole::Guest,
        "Soon",
    );
    let effect = DispatchEffect::GuestUpdate {
        expected: TaskStatus::Scheduled,
    };
    assert!(f
        .repo
        .apply_dispatch(&claim, effect, &message, &[])
        .await
        .expect("apply"));

    let stored = f.repo.get_by_id(&task.id).await.expect("get").expect("task");
    assert!(!stored.guest_update_pending);
    assert!(f.repo.guest_notice_candidates(3).await.expect("candidates").is_empty());
    assert!(f.repo.claim(&task.id, guard, LEASE).await.expect("claim").is_none());
}

#[tokio::test]
async fn guest_notice_failures_keep_their_own_count() {
    let f = fixture().await;
    let task = f
        .repo
        .create(&staffed_task("evt-1", "Towels"), &[])
        .await
        .expect("create");
    assert!(f
        .repo
        .mark_guest_info_pending(&task.id, &["room number".to_owned()])
        .await
        .expect("mark"));

    for expected in 1..=2 {
        let outcome = f
            .repo
            .record_guest_notice_failure(&task.id, None, 2, &[])
            .await
            .expect("failure");
        assert_eq!(outcome.attempts, expected);
        assert!(!outcome.escalated);
    }

    let stored = f.repo.get_by_id(&task.id).await.expect("get").expect("task");
    assert_eq!(stored.status, TaskStatus::WaitingOnStaff);
    assert_eq!(stored.attempts, 0);
    assert_eq!(stored.guest_notice_attempts, 2);
    assert!(stored.guest_info_missing.is_some());
    assert!(f.repo.guest_notice_candidates(2).await.expect("candidates").is_empty());

    assert!(f.repo.rearm_guest_notices(&task.id, &[]).await.expect("rearm"));
    assert_eq!(f.repo.guest_notice_candidates(2).await.expect("candidates").len(), 1);
}
