//! Normalized inbound events produced by the webhook layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A guest message already classified into a request category.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ClassificationEvent {
    /// Identifier of the classification event; dedup and audit key.
    pub source_event_id: String,
    /// Guest contact address.
    pub requester_address: String,
    /// Property the guest is staying at.
    pub property_id: String,
    /// Booking, when the webhook layer could resolve one.
    #[serde(default)]
    pub booking_id: Option<String>,
    /// Category label assigned by the classifier.
    pub category: String,
    /// Verbatim guest wording.
    pub request_text: String,
}

/// A reply from staff, host or guest after normalization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct InboundReply {
    /// Transport message identifier; ingestion is idempotent on it.
    pub message_id: String,
    /// Normalized sender address.
    pub from_address: String,
    /// Staff identity when the sender is a mapped staff member.
    #[serde(default)]
    pub sender_id: Option<String>,
    /// Property the sender is associated with, when known.
    #[serde(default)]
    pub property_id: Option<String>,
    /// Message text.
    pub body: String,
    /// Transport id of the outbound message this replies to, when the
    /// channel carries reply context.
    #[serde(default)]
    pub in_reply_to: Option<String>,
    /// Receive timestamp.
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}
