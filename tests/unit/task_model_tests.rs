//! Unit tests for the task lifecycle table and task construction.

use stay_concierge::models::definition::TaskDefinition;
use stay_concierge::models::event::ClassificationEvent;
use stay_concierge::models::task::{category_key, ActionHolder, Task, TaskStatus};

fn event() -> ClassificationEvent {
    ClassificationEvent {
        source_event_id: "evt-1".into(),
        requester_address: "+15550001".into(),
        property_id: "prop-1".into(),
        booking_id: Some("bk-9".into()),
        category: "  Fresh Towels ".into(),
        request_text: "Could we get more towels?".into(),
    }
}

#[test]
fn terminal_states_have_no_exits() {
    for from in [TaskStatus::Completed, TaskStatus::Cancelled] {
        assert!(from.is_terminal());
        for to in TaskStatus::ALL {
            assert!(
                !from.can_transition_to(to),
                "{from:?} -> {to:?} must be rejected"
            );
        }
    }
}

#[test]
fn every_open_state_can_close() {
    for from in TaskStatus::ALL.into_iter().filter(|s| !s.is_terminal()) {
        assert!(from.can_transition_to(TaskStatus::Completed));
        assert!(from.can_transition_to(TaskStatus::Cancelled));
        assert!(from.can_transition_to(TaskStatus::Escalated));
    }
}

#[test]
fn nothing_returns_to_waiting_on_guest_except_itself() {
    for from in TaskStatus::ALL {
        let allowed = from.can_transition_to(TaskStatus::WaitingOnGuest);
        assert_eq!(allowed, from == TaskStatus::WaitingOnGuest, "{from:?}");
    }
}

#[test]
fn scheduled_cannot_jump_to_host() {
    assert!(!TaskStatus::Scheduled.can_transition_to(TaskStatus::WaitingOnHost));
    assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::WaitingOnHost));
    assert!(TaskStatus::Escalated.can_transition_to(TaskStatus::WaitingOnHost));
}

#[test]
fn holder_consistency() {
    assert!(TaskStatus::WaitingOnGuest.is_consistent_with(ActionHolder::Guest));
    assert!(!TaskStatus::WaitingOnGuest.is_consistent_with(ActionHolder::Staff));
    assert!(TaskStatus::WaitingOnStaff.is_consistent_with(ActionHolder::Staff));
    assert!(TaskStatus::Escalated.is_consistent_with(ActionHolder::Host));
    assert!(!TaskStatus::Escalated.is_consistent_with(ActionHolder::Staff));
    assert!(TaskStatus::Scheduled.is_consistent_with(ActionHolder::Host));
    assert!(!TaskStatus::InProgress.is_consistent_with(ActionHolder::Guest));
    assert!(TaskStatus::Completed.is_consistent_with(ActionHolder::Guest));
}

#[test]
fn only_waiting_states_need_an_outbound_decision() {
    let needing: Vec<TaskStatus> = TaskStatus::ALL
        .into_iter()
        .filter(|s| s.needs_outbound_decision())
        .collect();
    assert_eq!(
        needing,
        vec![
            TaskStatus::WaitingOnStaff,
            TaskStatus::WaitingOnHost,
            TaskStatus::Escalated
        ]
    );
}

#[test]
fn new_task_without_guest_requirements_waits_on_staff() {
    let definition = TaskDefinition::new("prop-1".into(), "Fresh Towels".into())
        .with_staff("staff-7", "+15550100")
        .with_requirements("confirm delivery time", "  ", "refund requests");

    let task = Task::new(&event(), Some(&definition));

    assert_eq!(task.status, TaskStatus::WaitingOnStaff);
    assert_eq!(task.action_holder, ActionHolder::Staff);
    assert_eq!(task.category, "Fresh Towels");
    assert_eq!(task.category_key(), "fresh towels");
    assert_eq!(task.staff_requirements, "confirm delivery time");
    assert_eq!(task.host_escalation_criteria, "refund requests");
    assert_eq!(task.staff_address.as_deref(), Some("+15550100"));
    assert_eq!(task.booking_id.as_deref(), Some("bk-9"));
    assert_eq!(task.attempts, 0);
    assert!(task.is_open());
    assert!(task.is_assigned());
    assert!(!task.awaiting_reply());
    assert!(task.message_chain.is_empty());
}

#[test]
fn new_task_with_guest_requirements_waits_on_guest() {
    let definition = TaskDefinition::new("prop-1".into(), "Crib".into())
        .with_staff("staff-7", "+15550100")
        .with_requirements("", "confirm the child's age", "");

    let task = Task::new(&event(), Some(&definition));

    assert_eq!(task.status, TaskStatus::WaitingOnGuest);
    assert_eq!(task.action_holder, ActionHolder::Guest);
}

#[test]
fn new_task_without_definition_is_unassigned() {
    let task = Task::new(&event(), None);

    assert_eq!(task.status, TaskStatus::WaitingOnStaff);
    assert!(!task.is_assigned());
    assert!(task.staff_requirements.is_empty());
}

#[test]
fn category_key_ignores_case_and_padding() {
    assert_eq!(category_key("  Late CHECKOUT "), "late checkout");
}

#[test]
fn status_serializes_snake_case() {
    let json = serde_json::to_string(&TaskStatus::WaitingOnHost).expect("serialize");
    assert_eq!(json, "\"waiting_on_host\"");
    let back: ActionHolder = serde_json::from_str("\"staff\"").expect("deserialize");
    assert_eq!(back, ActionHolder::Staff);
}
