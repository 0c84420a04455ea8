//! Decision oracle abstraction.
//!
//! The oracle answers the natural-language questions the lifecycle depends
//! on: where a request should be routed, whether a reply satisfies the
//! staff requirements, and what a message to a guest, staff member or host
//! should say. The engine never interprets free text beyond this seam and
//! the configured reply vocabularies.

pub mod http;

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::models::task::Task;
use crate::Result;

/// Inputs for a routing decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriageRequest {
    /// Request category.
    pub category: String,
    /// When the host must be involved.
    pub host_escalation_criteria: String,
    /// What the guest must confirm.
    pub guest_requirements: String,
    /// What staff must confirm.
    pub staff_requirements: String,
    /// Rendered conversation so far.
    pub thread: String,
    /// The guest's latest wording.
    pub latest_request_text: String,
}

impl TriageRequest {
    /// Build from a task and its rendered thread.
    #[must_use]
    pub fn for_task(task: &Task, thread: String) -> Self {
        Self {
            category: task.category.clone(),
            host_escalation_criteria: task.host_escalation_criteria.clone(),
            guest_requirements: task.guest_requirements.clone(),
            staff_requirements: task.staff_requirements.clone(),
            thread,
            latest_request_text: task.request_text.clone(),
        }
    }
}

/// Routing decision.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriageVerdict {
    /// The host must decide or approve.
    #[serde(default)]
    pub host_needed: bool,
    /// Why the host is needed.
    #[serde(default)]
    pub host_reason: Option<String>,
    /// Details still missing from the guest.
    #[serde(default)]
    pub guest_missing: Vec<String>,
    /// Details staff must still confirm.
    #[serde(default)]
    pub staff_missing: Vec<String>,
}

/// Kind of message the oracle is asked to compose.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Ask the host to decide.
    HostEscalation,
    /// Ask staff to act and confirm.
    StaffInfoRequest,
    /// Ask the guest for missing details.
    GuestInfoRequest,
    /// Tell the guest when the work will happen.
    GuestScheduledUpdate,
    /// Tell the guest the request is resolved.
    GuestCompletionNotice,
}

/// Everything the oracle needs to word a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComposeContext {
    /// Request category.
    pub category: String,
    /// Guest's wording.
    pub request_text: String,
    /// Staff requirements.
    pub staff_requirements: String,
    /// Guest requirements.
    pub guest_requirements: String,
    /// Why the host is involved, when it is.
    pub reason: Option<String>,
    /// Items still missing.
    pub missing: Vec<String>,
    /// Rendered conversation so far.
    pub thread: String,
}

impl ComposeContext {
    /// Build from a task and its rendered thread.
    #[must_use]
    pub fn for_task(task: &Task, thread: String) -> Self {
        Self {
            category: task.category.clone(),
            request_text: task.request_text.clone(),
            staff_requirements: task.staff_requirements.clone(),
            guest_requirements: task.guest_requirements.clone(),
            reason: task.escalation_reason.clone(),
            missing: Vec::new(),
            thread,
        }
    }

    /// Attach the reason the host is involved.
    #[must_use]
    pub fn with_reason(mut self, reason: Option<String>) -> Self {
        if reason.is_some() {
            self.reason = reason;
        }
        self
    }

    /// Attach missing items.
    #[must_use]
    pub fn with_missing(mut self, missing: Vec<String>) -> Self {
        self.missing = missing;
        self
    }
}

/// Natural-language decision collaborator.
///
/// Calls may be slow or fail; callers wrap them in a timeout and count
/// failures against the task's attempt budget.
pub trait DecisionOracle: Send + Sync {
    /// Decide where a task should be routed.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Oracle`](crate::AppError::Oracle) when no usable
    /// decision is available.
    fn triage<'a>(
        &'a self,
        request: &'a TriageRequest,
    ) -> Pin<Box<dyn Future<Output = Result<TriageVerdict>> + Send + 'a>>;

    /// Decide whether the thread satisfies the requirements.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Oracle`](crate::AppError::Oracle) when no usable
    /// decision is available.
    fn requirement_satisfied<'a>(
        &'a self,
        requirements: &'a str,
        thread: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + 'a>>;

    /// Word a message of the given kind.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Oracle`](crate::AppError::Oracle) when no message
    /// could be composed.
    fn compose_message<'a>(
        &'a self,
        kind: MessageKind,
        context: &'a ComposeContext,
    ) -> Pin<Box<dyn Future<Output = Result<String>> + Send + 'a>>;
}
