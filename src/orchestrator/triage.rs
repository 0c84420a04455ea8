//! Triage routing: decide who acts next and notify them.
//!
//! The router claims a task before asking the oracle, so concurrent passes
//! never spend two oracle calls or two sends on the same round.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, info_span, Instrument};

use crate::models::audit::{AuditEventType, TaskAuditEntry};
use crate::models::message::{render_thread, SenderRole};
use crate::models::task::{ActionHolder, Task, TaskStatus};
use crate::oracle::{ComposeContext, MessageKind, TriageRequest, TriageVerdict};
use crate::persistence::task_repo::{ClaimGuard, DispatchEffect};
use crate::{AppError, Result};

use super::dispatcher::{DispatchOutcome, NotificationDispatcher, Outbound};
use super::guest_notice::GuestNotices;
use super::{bounded, Context};

/// Why a task was not routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Completed or cancelled.
    Terminal,
    /// Completion notice already sent.
    CompletionNotified,
    /// Holder already notified this round.
    AlreadyNotified,
    /// Last message not answered yet.
    AwaitingReply,
    /// Category is classifier noise.
    Denylisted,
    /// No staff contact and no reason to involve the host.
    Unassigned,
}

/// Result of routing one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum TriageOutcome {
    /// Preconditions not met.
    Skipped(SkipReason),
    /// Another worker holds the task.
    AlreadyClaimed,
    /// The holder was notified.
    Routed {
        /// Who must act next.
        holder: ActionHolder,
        /// The guest was also asked for missing details.
        guest_asked: bool,
    },
    /// Oracle or transport failed; attempts were counted.
    Failed,
}

/// Routes open tasks to the guest, staff or host.
#[derive(Clone)]
pub struct TriageRouter {
    ctx: Arc<Context>,
    dispatcher: NotificationDispatcher,
    guest_notices: GuestNotices,
}

impl TriageRouter {
    /// Create a router over the shared context.
    #[must_use]
    pub fn new(
        ctx: Arc<Context>,
        dispatcher: NotificationDispatcher,
        guest_notices: GuestNotices,
    ) -> Self {
        Self {
            ctx,
            dispatcher,
            guest_notices,
        }
    }

    /// Route a task by id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the task does not exist, or
    /// `AppError::Db` if bookkeeping fails.
    pub async fn route(&self, task_id: &str) -> Result<TriageOutcome> {
        let task = self
            .ctx
            .tasks
            .get_by_id(task_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task {task_id}")))?;
        self.route_task(&task).await
    }

    /// Route one task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if bookkeeping fails. Collaborator failures are
    /// reported as [`TriageOutcome::Failed`].
    pub async fn route_task(&self, task: &Task) -> Result<TriageOutcome> {
        let span = info_span!("triage", task_id = %task.id, category = %task.category);
        self.route_inner(task).instrument(span).await
    }

    fn skip_reason(&self, task: &Task) -> Option<SkipReason> {
        if task.status.is_terminal() {
            return Some(SkipReason::Terminal);
        }
        if task.completion_notified {
            return Some(SkipReason::CompletionNotified);
        }
        if task.action_holder_notified {
            return Some(SkipReason::AlreadyNotified);
        }
        if task.awaiting_reply() {
            return Some(SkipReason::AwaitingReply);
        }
        if self.ctx.denylist.is_denied(&task.category) {
            return Some(SkipReason::Denylisted);
        }
        if !host_forced(task) && !task.is_assigned() {
            return Some(SkipReason::Unassigned);
        }
        None
    }

    async fn route_inner(&self, task: &Task) -> Result<TriageOutcome> {
        if let Some(reason) = self.skip_reason(task) {
            debug!(?reason, "triage skipped");
            return Ok(TriageOutcome::Skipped(reason));
        }

        let Some(claim) = self
            .dispatcher
            .claim(task, ClaimGuard::ActionHolder(task.status))
            .await?
        else {
            return Ok(TriageOutcome::AlreadyClaimed);
        };

        let thread = render_thread(&self.ctx.messages.thread_for(task).await?);

        let verdict = if host_forced(task) {
            TriageVerdict {
                host_needed: true,
                host_reason: task.escalation_reason.clone(),
                ..TriageVerdict::default()
            }
        } else {
            let request = TriageRequest::for_task(task, thread.clone());
            match bounded(
                self.ctx.config.oracle_timeout(),
                "triage",
                self.ctx.oracle.triage(&request),
            )
            .await
            {
                Ok(verdict) => {
                    self.ctx
                        .audit
                        .append(&TaskAuditEntry::new(
                            &task.id,
                            AuditEventType::OracleCall,
                            format!(
                                "triage: host_needed={} guest_missing={} staff_missing={}",
                                verdict.host_needed,
                                verdict.guest_missing.len(),
                                verdict.staff_missing.len()
                            ),
                        ))
                        .await?;
                    verdict
                }
                Err(err) => {
                    self.dispatcher
                        .fail(task, Some(&claim), AuditEventType::OracleFailure, &err)
                        .await?;
                    return Ok(TriageOutcome::Failed);
                }
            }
        };

        let context = ComposeContext::for_task(task, thread);

        let (next_status, holder, outbound) = if verdict.host_needed {
            let Some(host) = self.ctx.host_address(&task.property_id).await? else {
                let err = AppError::Transport(format!(
                    "no host contact for property {}",
                    task.property_id
                ));
                self.dispatcher
                    .fail(task, Some(&claim), AuditEventType::TransportFailure, &err)
                    .await?;
                return Ok(TriageOutcome::Failed);
            };
            (
                TaskStatus::WaitingOnHost,
                ActionHolder::Host,
                Outbound {
                    to: host,
                    role: SenderRole::Host,
                    kind: MessageKind::HostEscalation,
                    context: context.with_reason(verdict.host_reason.clone()),
                },
            )
        } else {
            let staff = task.staff_address.clone().unwrap_or_default();
            (
                TaskStatus::WaitingOnStaff,
                ActionHolder::Staff,
                Outbound {
                    to: staff,
                    role: SenderRole::Staff,
                    kind: MessageKind::StaffInfoRequest,
                    context: context.with_missing(verdict.staff_missing.clone()),
                },
            )
        };

        if !task.status.can_transition_to(next_status) {
            self.dispatcher.release(&claim).await?;
            return Err(AppError::InvalidTransition(format!(
                "{:?} -> {next_status:?}",
                task.status
            )));
        }

        let effect = DispatchEffect::ActionHolder {
            expected: task.status,
            next_status,
            holder,
            host_escalation_needed: holder == ActionHolder::Host,
        };

        match self.dispatcher.deliver(&claim, task, effect, outbound).await? {
            DispatchOutcome::Delivered { .. } => {}
            DispatchOutcome::AlreadyClaimed | DispatchOutcome::ClaimLost => {
                return Ok(TriageOutcome::AlreadyClaimed);
            }
            DispatchOutcome::Failed { .. } => return Ok(TriageOutcome::Failed),
        }
        info!(?holder, "action holder notified");

        // Staff hear first; the guest is asked only after the staff send landed.
        let mut guest_asked = false;
        if holder == ActionHolder::Staff
            && !verdict.guest_missing.is_empty()
            && !task.guest_info_requested
        {
            let outcome = self
                .guest_notices
                .request_guest_info(task, verdict.guest_missing)
                .await?;
            guest_asked = matches!(outcome, DispatchOutcome::Delivered { .. });
        }

        Ok(TriageOutcome::Routed {
            holder,
            guest_asked,
        })
    }
}

/// Escalated tasks and tasks already routed to the host bypass the oracle.
fn host_forced(task: &Task) -> bool {
    task.status == TaskStatus::Escalated || task.host_escalation_needed
}
