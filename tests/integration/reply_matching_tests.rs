//! Integration tests for reply matching and idempotent reply handling.
//!
//! Validates:
//! - A reply matching several tasks is applied to each and flagged
//! - Explicit `in_reply_to` and staff identity take precedence over addresses
//! - Property fallback matches are flagged for review
//! - Fallback ties between tasks flag all of them and apply to none
//! - A reply with nowhere to go is stored as unmatched
//! - Replies after completion never regress the task
//! - Re-delivered replies are applied once
//! - Oracle outages leave replies pending until attempts run out, and the
//!   escalated task then reaches the host

use std::sync::atomic::Ordering;

use stay_concierge::models::audit::AuditEventType;
use stay_concierge::models::definition::TaskDefinition;
use stay_concierge::models::message::MessageState;
use stay_concierge::models::task::TaskStatus;
use stay_concierge::oracle::MessageKind;
use stay_concierge::orchestrator::reply::{MatchRule, ReplyOutcome, TaskReplyResult};
use stay_concierge::orchestrator::task_manager::TaskPatch;
use stay_concierge::orchestrator::{pass, SYSTEM_ESCALATION_REASON};

use super::test_helpers::{harness, reply, Harness, HOST, PROPERTY, STAFF, STAFF_ID};

const STRANGER: &str = "+15559999";

async fn routed(h: &Harness, event_id: &str, category: &str) -> String {
    let task = h.request(event_id, category, "please help").await;
    h.engine.triage.route(&task.id).await.expect("route");
    task.id
}

async fn message_state(h: &Harness, id: &str) -> MessageState {
    h.engine
        .ctx
        .messages
        .get_by_id(id)
        .await
        .expect("lookup")
        .expect("stored message")
        .state
}

#[tokio::test]
async fn reply_matching_two_tasks_is_applied_to_both_and_flagged() {
    let h = harness().await;
    h.seed_towels().await;
    h.seed_definition(
        TaskDefinition::new(PROPERTY.into(), "Pillows".into()).with_staff(STAFF_ID, STAFF),
    )
    .await;
    let towels = routed(&h, "evt-1", "Towels").await;
    let pillows = routed(&h, "evt-2", "Pillows").await;

    let outcome = h
        .engine
        .replies
        .ingest(&reply("in-1", STAFF, "On it, which room?"))
        .await
        .expect("ingest");
    let ReplyOutcome::Processed { rule, results } = outcome else {
        panic!("expected processed, got {outcome:?}");
    };
    assert_eq!(rule, MatchRule::Address);
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, r)| *r == TaskReplyResult::InProgress));

    for id in [&towels, &pillows] {
        let flagged = h
            .engine
            .ctx
            .audit
            .count(id, AuditEventType::AmbiguousReplyMatch)
            .await
            .expect("count");
        assert_eq!(flagged, 1, "task {id} should be flagged");
        assert_eq!(h.task(id).await.status, TaskStatus::InProgress);
    }
}

#[tokio::test]
async fn property_fallback_match_is_flagged() {
    let h = harness().await;
    h.seed_towels().await;
    let task_id = routed(&h, "evt-1", "Towels").await;

    let outcome = h
        .engine
        .replies
        .ingest(&reply("in-1", STRANGER, "Covering for the team, on my way"))
        .await
        .expect("ingest");
    let ReplyOutcome::Processed { rule, .. } = outcome else {
        panic!("expected processed, got {outcome:?}");
    };
    assert_eq!(rule, MatchRule::PropertyWaiting);

    let flagged = h
        .engine
        .ctx
        .audit
        .count(&task_id, AuditEventType::AmbiguousReplyMatch)
        .await
        .expect("count");
    assert_eq!(flagged, 1);
}

#[tokio::test]
async fn reply_with_no_open_task_is_unmatched() {
    let h = harness().await;
    h.seed_towels().await;

    let mut stray = reply("in-1", STRANGER, "hello?");
    stray.property_id = None;
    let outcome = h.engine.replies.ingest(&stray).await.expect("ingest");

    assert_eq!(outcome, ReplyOutcome::Unmatched);
    assert_eq!(message_state(&h, "in-1").await, MessageState::Unmatched);
}

#[tokio::test]
async fn reply_after_completion_does_not_regress() {
    let h = harness().await;
    h.seed_towels().await;
    h.oracle.set_satisfied(true);
    let task_id = routed(&h, "evt-1", "Towels").await;

    h.engine
        .replies
        .ingest(&reply("in-1", STAFF, "Delivered"))
        .await
        .expect("complete");
    assert_eq!(h.task(&task_id).await.status, TaskStatus::Completed);

    let late = h
        .engine
        .replies
        .ingest(&reply("in-2", STAFF, "I'll bring more tomorrow"))
        .await
        .expect("late reply");
    assert_eq!(late, ReplyOutcome::Unmatched);

    let task = h.task(&task_id).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(!task.message_chain.contains(&"in-2".to_owned()));
}

#[tokio::test]
async fn redelivered_reply_is_applied_once() {
    let h = harness().await;
    h.seed_towels().await;
    h.oracle.set_satisfied(true);
    let task_id = routed(&h, "evt-1", "Towels").await;

    let r = reply("in-1", STAFF, "Will drop them off tonight");
    let first = h.engine.replies.ingest(&r).await.expect("first");
    assert!(matches!(first, ReplyOutcome::Processed { .. }));

    let second = h.engine.replies.ingest(&r).await.expect("second");
    assert_eq!(second, ReplyOutcome::Duplicate);

    assert_eq!(h.oracle.requirement_calls.load(Ordering::SeqCst), 1);
    let task = h.task(&task_id).await;
    assert_eq!(task.status, TaskStatus::Scheduled);
    assert_eq!(
        task.message_chain.iter().filter(|id| *id == "in-1").count(),
        1
    );
}

#[tokio::test]
async fn oracle_outage_keeps_reply_pending_then_escalates() {
    let h = harness().await;
    h.seed_towels().await;
    let task_id = routed(&h, "evt-1", "Towels").await;
    h.oracle.fail_requirement.store(true, Ordering::SeqCst);

    let outcome = h
        .engine
        .replies
        .ingest(&reply("in-1", STAFF, "Delivered"))
        .await
        .expect("ingest");
    assert!(matches!(outcome, ReplyOutcome::Pending { .. }));
    assert_eq!(message_state(&h, "in-1").await, MessageState::Pending);
    assert_eq!(h.task(&task_id).await.status, TaskStatus::WaitingOnStaff);

    // Attempts two and three come from the retry sweep.
    assert_eq!(h.engine.replies.retry_pending().await.expect("retry 2"), 0);
    assert_eq!(h.engine.replies.retry_pending().await.expect("retry 3"), 1);

    assert_eq!(message_state(&h, "in-1").await, MessageState::Failed);
    let task = h.task(&task_id).await;
    assert_eq!(task.status, TaskStatus::Escalated);
    assert_eq!(task.escalation_reason.as_deref(), Some(SYSTEM_ESCALATION_REASON));
    assert!(!task.awaiting_reply(), "escalation ends the wait on staff");

    let exhausted = h
        .engine
        .ctx
        .audit
        .count(&task_id, AuditEventType::RetryExhausted)
        .await
        .expect("count");
    assert_eq!(exhausted, 1);

    // The next pass hands the task to the host, once.
    let report = pass::run_pass(&h.engine).await.expect("pass");
    assert_eq!(report.routed, 1);
    pass::run_pass(&h.engine).await.expect("second pass");

    let host = h.notifier.sent_of(MessageKind::HostEscalation);
    assert_eq!(host.len(), 1);
    assert_eq!(host[0].to, HOST);
    assert_eq!(h.task(&task_id).await.status, TaskStatus::WaitingOnHost);
}

#[tokio::test]
async fn pending_reply_applies_once_oracle_recovers() {
    let h = harness().await;
    h.seed_towels().await;
    let task_id = routed(&h, "evt-1", "Towels").await;
    h.oracle.fail_requirement.store(true, Ordering::SeqCst);

    h.engine
        .replies
        .ingest(&reply("in-1", STAFF, "Delivered"))
        .await
        .expect("ingest");

    h.oracle.fail_requirement.store(false, Ordering::SeqCst);
    h.oracle.set_satisfied(true);
    assert_eq!(h.engine.replies.retry_pending().await.expect("retry"), 1);

    assert_eq!(message_state(&h, "in-1").await, MessageState::Processed);
    assert_eq!(h.task(&task_id).await.status, TaskStatus::Completed);
}

#[tokio::test]
async fn in_reply_to_matches_the_task_that_sent_the_message() {
    let h = harness().await;
    h.seed_towels().await;
    let task_id = routed(&h, "evt-1", "Towels").await;
    let transport_id = h.notifier.sent()[0].transport_id.clone();

    let mut answer = reply("in-1", STRANGER, "Looking into it");
    answer.property_id = None;
    answer.in_reply_to = Some(transport_id);
    let outcome = h.engine.replies.ingest(&answer).await.expect("ingest");

    assert_eq!(
        outcome,
        ReplyOutcome::Processed {
            rule: MatchRule::InReplyTo,
            results: vec![(task_id.clone(), TaskReplyResult::InProgress)],
        }
    );
    let flagged = h
        .engine
        .ctx
        .audit
        .count(&task_id, AuditEventType::AmbiguousReplyMatch)
        .await
        .expect("count");
    assert_eq!(flagged, 0);
}

#[tokio::test]
async fn staff_identity_matches_from_an_unknown_address() {
    let h = harness().await;
    h.seed_towels().await;
    let task_id = routed(&h, "evt-1", "Towels").await;

    let mut answer = reply("in-1", STRANGER, "Texting from my other phone, on it");
    answer.property_id = None;
    answer.sender_id = Some(STAFF_ID.into());
    let outcome = h.engine.replies.ingest(&answer).await.expect("ingest");

    assert_eq!(
        outcome,
        ReplyOutcome::Processed {
            rule: MatchRule::StaffId,
            results: vec![(task_id.clone(), TaskReplyResult::InProgress)],
        }
    );
    assert_eq!(h.task(&task_id).await.status, TaskStatus::InProgress);
}

/// Assert a reply was left unmatched and every tied task flagged but unchanged.
async fn assert_tie_left_for_review(
    h: &Harness,
    outcome: ReplyOutcome,
    message_id: &str,
    tied: &[&String],
    status: TaskStatus,
) {
    let ReplyOutcome::Ambiguous { mut task_ids } = outcome else {
        panic!("expected ambiguous, got {outcome:?}");
    };
    task_ids.sort();
    let mut expected: Vec<String> = tied.iter().map(|id| (*id).clone()).collect();
    expected.sort();
    assert_eq!(task_ids, expected);
    assert_eq!(message_state(h, message_id).await, MessageState::Unmatched);

    for id in tied {
        let flagged = h
            .engine
            .ctx
            .audit
            .count(id, AuditEventType::AmbiguousReplyMatch)
            .await
            .expect("count");
        assert_eq!(flagged, 1, "task {id} should be flagged");
        let task = h.task(id).await;
        assert_eq!(task.status, status);
        assert!(!task.message_chain.iter().any(|m| m == message_id));
    }
    assert_eq!(h.oracle.requirement_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn most_recent_tie_flags_all_and_applies_none() {
    let h = harness().await;
    h.seed_property(Some(HOST)).await;
    let towels = h.request("evt-1", "Towels", "fresh towels").await.id;
    let pillows = h.request("evt-2", "Pillows", "extra pillows").await.id;

    let working = TaskPatch {
        status: Some(TaskStatus::InProgress),
        ..TaskPatch::default()
    };
    for id in [&towels, &pillows] {
        h.engine.tasks.patch_task(id, &working).await.expect("patch");
    }
    sqlx::query("UPDATE task SET created_at = ?1")
        .bind("2026-01-01T09:00:00.000000Z")
        .execute(h.engine.ctx.db.as_ref())
        .await
        .expect("align created_at");

    let outcome = h
        .engine
        .replies
        .ingest(&reply("in-1", STRANGER, "All sorted"))
        .await
        .expect("ingest");

    assert_tie_left_for_review(&h, outcome, "in-1", &[&towels, &pillows], TaskStatus::InProgress)
        .await;
}

#[tokio::test]
async fn property_fallback_tie_flags_all_and_applies_none() {
    let h = harness().await;
    h.seed_property(Some(HOST)).await;
    let towels = h.request("evt-1", "Towels", "fresh towels").await.id;
    let pillows = h.request("evt-2", "Pillows", "extra pillows").await.id;
    assert_eq!(h.task(&towels).await.status, TaskStatus::WaitingOnStaff);

    let outcome = h
        .engine
        .replies
        .ingest(&reply("in-1", STRANGER, "Covering for the team, on my way"))
        .await
        .expect("ingest");

    assert_tie_left_for_review(
        &h,
        outcome,
        "in-1",
        &[&towels, &pillows],
        TaskStatus::WaitingOnStaff,
    )
    .await;
}
