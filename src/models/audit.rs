//! Per-task audit trail entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of event recorded against a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// Task created from a classification event.
    TaskCreated,
    /// A later classification event was folded into an existing open task.
    SourceEventLinked,
    /// No task definition matched the category.
    DefinitionUnresolved,
    /// Decision oracle call succeeded.
    OracleCall,
    /// Decision oracle call failed or timed out.
    OracleFailure,
    /// Notifier accepted a message.
    TransportAttempt,
    /// Notifier send failed or timed out.
    TransportFailure,
    /// Another worker held the task.
    ClaimLost,
    /// Lifecycle status changed.
    StatusChanged,
    /// A reply could not be tied to exactly one task.
    AmbiguousReplyMatch,
    /// A reply arrived for a closed task.
    ReplyIgnored,
    /// Attempt cap reached; handed to the host.
    RetryExhausted,
    /// Operator changed the task directly.
    ManualOverride,
    /// Task moved to cold storage.
    Archived,
}

impl AuditEventType {
    /// Stable storage name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaskCreated => "task_created",
            Self::SourceEventLinked => "source_event_linked",
            Self::DefinitionUnresolved => "definition_unresolved",
            Self::OracleCall => "oracle_call",
            Self::OracleFailure => "oracle_failure",
            Self::TransportAttempt => "transport_attempt",
            Self::TransportFailure => "transport_failure",
            Self::ClaimLost => "claim_lost",
            Self::StatusChanged => "status_changed",
            Self::AmbiguousReplyMatch => "ambiguous_reply_match",
            Self::ReplyIgnored => "reply_ignored",
            Self::RetryExhausted => "retry_exhausted",
            Self::ManualOverride => "manual_override",
            Self::Archived => "archived",
        }
    }

    /// Parse a stored name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        let kind = match value {
            "task_created" => Self::TaskCreated,
            "source_event_linked" => Self::SourceEventLinked,
            "definition_unresolved" => Self::DefinitionUnresolved,
            "oracle_call" => Self::OracleCall,
            "oracle_failure" => Self::OracleFailure,
            "transport_attempt" => Self::TransportAttempt,
            "transport_failure" => Self::TransportFailure,
            "claim_lost" => Self::ClaimLost,
            "status_changed" => Self::StatusChanged,
            "ambiguous_reply_match" => Self::AmbiguousReplyMatch,
            "reply_ignored" => Self::ReplyIgnored,
            "retry_exhausted" => Self::RetryExhausted,
            "manual_override" => Self::ManualOverride,
            "archived" => Self::Archived,
            _ => return None,
        };
        Some(kind)
    }
}

/// One append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TaskAuditEntry {
    /// Unique record identifier.
    pub id: String,
    /// Task the entry belongs to.
    pub task_id: String,
    /// What happened.
    pub event_type: AuditEventType,
    /// Free-form operator-facing detail.
    pub detail: String,
    /// Classification event involved, if any.
    pub source_event_id: Option<String>,
    /// Message involved, if any.
    pub message_id: Option<String>,
    /// When it happened.
    pub created_at: DateTime<Utc>,
}

impl TaskAuditEntry {
    /// Start an entry for `task_id`.
    #[must_use]
    pub fn new(task_id: &str, event_type: AuditEventType, detail: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task_id.to_owned(),
            event_type,
            detail: detail.into(),
            source_event_id: None,
            message_id: None,
            created_at: Utc::now(),
        }
    }

    /// Attach the classification event.
    #[must_use]
    pub fn with_source_event(mut self, source_event_id: impl Into<String>) -> Self {
        self.source_event_id = Some(source_event_id.into());
        self
    }

    /// Attach the message.
    #[must_use]
    pub fn with_message(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }
}
