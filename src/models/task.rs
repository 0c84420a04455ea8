//! Guest-service task model, lifecycle states and transition rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::definition::TaskDefinition;
use super::event::ClassificationEvent;

/// Lifecycle status for a guest-service task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Guest must confirm details before work can be completed.
    WaitingOnGuest,
    /// Staff has been (or is about to be) asked to act.
    WaitingOnStaff,
    /// Host approval or decision is required.
    WaitingOnHost,
    /// Requirement met with a committed time or window, not yet executed.
    Scheduled,
    /// Being worked; no outbound message pending.
    InProgress,
    /// Staff reported inability or automation gave up; needs the host.
    Escalated,
    /// Work done. Terminal.
    Completed,
    /// Abandoned or declined. Terminal.
    Cancelled,
}

/// Actor currently responsible for advancing a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionHolder {
    /// The guest who raised the request.
    Guest,
    /// Property staff assigned to the category.
    Staff,
    /// Property host.
    Host,
}

impl TaskStatus {
    /// Every status, in declaration order.
    pub const ALL: [Self; 8] = [
        Self::WaitingOnGuest,
        Self::WaitingOnStaff,
        Self::WaitingOnHost,
        Self::Scheduled,
        Self::InProgress,
        Self::Escalated,
        Self::Completed,
        Self::Cancelled,
    ];

    /// Whether the status ends the lifecycle.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Determine whether a lifecycle transition is permitted.
    ///
    /// Terminal states have no exits, so a completed task can never regress.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use TaskStatus::{
            Cancelled, Completed, Escalated, InProgress, Scheduled, WaitingOnGuest, WaitingOnHost,
            WaitingOnStaff,
        };

        match (self, next) {
            (Completed | Cancelled, _) => false,
            (_, Completed | Cancelled) => true,
            (
                WaitingOnGuest,
                WaitingOnGuest | WaitingOnStaff | WaitingOnHost | Scheduled | InProgress | Escalated,
            )
            | (WaitingOnStaff, WaitingOnStaff | WaitingOnHost | Scheduled | InProgress | Escalated)
            | (WaitingOnHost, WaitingOnHost | WaitingOnStaff | Scheduled | InProgress | Escalated)
            | (Scheduled, Scheduled | InProgress | Escalated | WaitingOnStaff)
            | (InProgress, InProgress | Scheduled | Escalated | WaitingOnStaff | WaitingOnHost)
            | (Escalated, Escalated | WaitingOnHost | WaitingOnStaff | Scheduled | InProgress) => {
                true
            }
            _ => false,
        }
    }

    /// The action holder a status forces, if any.
    #[must_use]
    pub fn required_holder(self) -> Option<ActionHolder> {
        match self {
            Self::WaitingOnGuest => Some(ActionHolder::Guest),
            Self::WaitingOnStaff => Some(ActionHolder::Staff),
            Self::WaitingOnHost | Self::Escalated => Some(ActionHolder::Host),
            Self::Scheduled | Self::InProgress | Self::Completed | Self::Cancelled => None,
        }
    }

    /// Whether `holder` may be the action holder while in this status.
    #[must_use]
    pub fn is_consistent_with(self, holder: ActionHolder) -> bool {
        match self {
            Self::Scheduled | Self::InProgress => holder != ActionHolder::Guest,
            Self::Completed | Self::Cancelled => true,
            other => other.required_holder() == Some(holder),
        }
    }

    /// Whether entering this status requires a fresh triage decision.
    #[must_use]
    pub fn needs_outbound_decision(self) -> bool {
        matches!(
            self,
            Self::WaitingOnStaff | Self::WaitingOnHost | Self::Escalated
        )
    }
}

/// A unit of trackable guest-service work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct Task {
    /// Unique record identifier.
    pub id: String,
    /// Free-text request bucket, e.g. "Fresh Towels".
    pub category: String,
    /// Verbatim guest wording.
    pub request_text: String,
    /// Property the request concerns.
    pub property_id: String,
    /// Booking the request was raised under, when known.
    pub booking_id: Option<String>,
    /// Guest contact address.
    pub requester_address: String,
    /// Assigned staff identity.
    pub staff_id: Option<String>,
    /// Assigned staff contact address.
    pub staff_address: Option<String>,
    /// Classification event that spawned the task.
    pub source_event_id: String,
    /// What staff must confirm.
    pub staff_requirements: String,
    /// What the guest must confirm.
    pub guest_requirements: String,
    /// When the host must be looped in.
    pub host_escalation_criteria: String,
    /// Current lifecycle status.
    pub status: TaskStatus,
    /// Actor currently responsible.
    pub action_holder: ActionHolder,
    /// Address the current action holder was notified at.
    pub action_holder_address: Option<String>,
    /// Current action holder has been sent this round's message.
    pub action_holder_notified: bool,
    /// A reply has been received since the last outbound message.
    pub response_received: bool,
    /// Final resolution notice delivered to the guest.
    pub completion_notified: bool,
    /// Triage routed the task to the host.
    pub host_escalation_needed: bool,
    /// Operator-visible reason for an escalation.
    pub escalation_reason: Option<String>,
    /// Guest has been asked for missing details.
    pub guest_info_requested: bool,
    /// Details to ask the guest for once a send gets through.
    #[serde(default)]
    pub guest_info_missing: Option<Vec<String>>,
    /// A scheduled-work update is owed to the guest.
    #[serde(default)]
    pub guest_update_pending: bool,
    /// Failed guest update or info request sends, counted apart from `attempts`.
    #[serde(default)]
    pub guest_notice_attempts: u32,
    /// Consecutive failed oracle or transport attempts.
    pub attempts: u32,
    /// Most recent message sent to the action holder.
    pub last_outbound_message: Option<String>,
    /// Ordered message ids referencing this task. Append-only.
    pub message_chain: Vec<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// When the task reached `Completed`.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Build a task from a classification event and its resolved definition.
    ///
    /// Requirement text and staff contact are copied so later definition edits
    /// do not affect in-flight work. Without a definition the task is created
    /// unassigned.
    #[must_use]
    pub fn new(event: &ClassificationEvent, definition: Option<&TaskDefinition>) -> Self {
        let now = Utc::now();
        let (staff_requirements, guest_requirements, host_escalation_criteria, staff_id, staff_address) =
            definition.map_or_else(Default::default, |def| {
                (
                    def.staff_requirements.clone(),
                    def.guest_requirements.clone(),
                    def.host_escalation_criteria.clone(),
                    def.staff_id.clone(),
                    def.staff_address.clone(),
                )
            });

        let status = if guest_requirements.trim().is_empty() {
            TaskStatus::WaitingOnStaff
        } else {
            TaskStatus::WaitingOnGuest
        };
        let action_holder = status.required_holder().unwrap_or(ActionHolder::Staff);

        Self {
            id: Uuid::new_v4().to_string(),
            category: event.category.trim().to_owned(),
            request_text: event.request_text.clone(),
            property_id: event.property_id.clone(),
            booking_id: event.booking_id.clone(),
            requester_address: event.requester_address.clone(),
            staff_id,
            staff_address,
            source_event_id: event.source_event_id.clone(),
            staff_requirements,
            guest_requirements,
            host_escalation_criteria,
            status,
            action_holder,
            action_holder_address: None,
            action_holder_notified: false,
            response_received: false,
            completion_notified: false,
            host_escalation_needed: false,
            escalation_reason: None,
            guest_info_requested: false,
            guest_info_missing: None,
            guest_update_pending: false,
            guest_notice_attempts: 0,
            attempts: 0,
            last_outbound_message: None,
            message_chain: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Whether the task is still live (not completed or cancelled).
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.status.is_terminal()
    }

    /// Normalized category used for dedup and denylist checks.
    #[must_use]
    pub fn category_key(&self) -> String {
        category_key(&self.category)
    }

    /// Whether a staff contact is on record.
    #[must_use]
    pub fn is_assigned(&self) -> bool {
        self.staff_address
            .as_deref()
            .is_some_and(|addr| !addr.trim().is_empty())
    }

    /// A message was sent this round and nobody has answered yet.
    #[must_use]
    pub fn awaiting_reply(&self) -> bool {
        self.last_outbound_message.is_some() && !self.response_received
    }
}

/// Normalize a category label for comparison.
#[must_use]
pub fn category_key(category: &str) -> String {
    category.trim().to_lowercase()
}
