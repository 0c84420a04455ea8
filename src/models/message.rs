//! Conversation messages that make up a task's thread.

use std::fmt::Write as _;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use super::event::{ClassificationEvent, InboundReply};
use super::task::Task;

/// Who authored a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SenderRole {
    /// The guest.
    Guest,
    /// Property staff.
    Staff,
    /// Property host.
    Host,
    /// This engine.
    System,
}

/// Direction relative to the engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    /// Received from a guest, staff member or host.
    Inbound,
    /// Sent by the engine.
    Outbound,
}

/// Processing state of a stored message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageState {
    /// Inbound reply not yet applied to its tasks.
    Pending,
    /// Fully handled.
    Processed,
    /// No open task could be associated with the reply.
    Unmatched,
    /// Evaluation kept failing; handed to operators.
    Failed,
}

/// A single message on a guest-service conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ConversationMessage {
    /// Transport or event identifier.
    pub id: String,
    /// Property the conversation belongs to.
    pub property_id: String,
    /// Booking, when known.
    pub booking_id: Option<String>,
    /// Task the message was attached to, when known.
    pub task_id: Option<String>,
    /// Guest the conversation concerns.
    pub requester_address: String,
    /// Address the message came from (or was sent to, for outbound).
    pub sender_address: String,
    /// Author role.
    pub sender_role: SenderRole,
    /// Inbound or outbound.
    pub direction: MessageDirection,
    /// Message text.
    pub body: String,
    /// Processing state.
    pub state: MessageState,
    /// Staff identity supplied with an inbound reply.
    pub sender_id: Option<String>,
    /// Outbound message an inbound reply answers, when known.
    pub in_reply_to: Option<String>,
    /// Failed processing attempts.
    pub attempts: u32,
    /// Receive or send timestamp.
    pub created_at: DateTime<Utc>,
}

impl ConversationMessage {
    /// Record of a message the engine sent on behalf of `task`.
    #[must_use]
    pub fn outbound(task: &Task, id: String, to_address: &str, role: SenderRole, body: &str) -> Self {
        Self {
            id,
            property_id: task.property_id.clone(),
            booking_id: task.booking_id.clone(),
            task_id: Some(task.id.clone()),
            requester_address: task.requester_address.clone(),
            sender_address: to_address.to_owned(),
            sender_role: role,
            direction: MessageDirection::Outbound,
            body: body.to_owned(),
            state: MessageState::Processed,
            sender_id: None,
            in_reply_to: None,
            attempts: 0,
            created_at: Utc::now(),
        }
    }

    /// The guest wording behind a classification event, as a thread message.
    #[must_use]
    pub fn guest_request(event: &ClassificationEvent, task_id: &str) -> Self {
        Self {
            id: event.source_event_id.clone(),
            property_id: event.property_id.clone(),
            booking_id: event.booking_id.clone(),
            task_id: Some(task_id.to_owned()),
            requester_address: event.requester_address.clone(),
            sender_address: event.requester_address.clone(),
            sender_role: SenderRole::Guest,
            direction: MessageDirection::Inbound,
            body: event.request_text.clone(),
            state: MessageState::Processed,
            sender_id: None,
            in_reply_to: None,
            attempts: 0,
            created_at: Utc::now(),
        }
    }

    /// Pending record of an inbound reply not yet tied to a task.
    #[must_use]
    pub fn from_reply(reply: &InboundReply) -> Self {
        Self {
            id: reply.message_id.clone(),
            property_id: reply.property_id.clone().unwrap_or_default(),
            booking_id: None,
            task_id: None,
            requester_address: String::new(),
            sender_address: reply.from_address.clone(),
            sender_role: SenderRole::Staff,
            direction: MessageDirection::Inbound,
            body: reply.body.clone(),
            state: MessageState::Pending,
            sender_id: reply.sender_id.clone(),
            in_reply_to: reply.in_reply_to.clone(),
            attempts: 0,
            created_at: reply.received_at,
        }
    }

    /// Rebuild the reply a pending inbound record was stored from.
    #[must_use]
    pub fn to_reply(&self) -> InboundReply {
        InboundReply {
            message_id: self.id.clone(),
            from_address: self.sender_address.clone(),
            sender_id: self.sender_id.clone(),
            property_id: (!self.property_id.is_empty()).then(|| self.property_id.clone()),
            body: self.body.clone(),
            in_reply_to: self.in_reply_to.clone(),
            received_at: self.created_at,
        }
    }
}

/// Render messages as a chronological plain-text transcript for the oracle.
#[must_use]
pub fn render_thread(messages: &[ConversationMessage]) -> String {
    let mut out = String::new();
    for message in messages {
        let role = match message.sender_role {
            SenderRole::Guest => "Guest",
            SenderRole::Staff => "Staff",
            SenderRole::Host => "Host",
            SenderRole::System => "Concierge",
        };
        let arrow = match message.direction {
            MessageDirection::Inbound => "from",
            MessageDirection::Outbound => "to",
        };
        let _ = writeln!(
            out,
            "[{}] {role} ({arrow} {}): {}",
            message.created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            message.sender_address,
            message.body.trim()
        );
    }
    out
}
