//! Reply ingestion: match a reply to its task and apply the outcome.
//!
//! A reply is stored as a pending message before anything else, so a crash
//! or an oracle outage never loses it; the orchestration pass retries
//! pending replies until they are processed or their attempts run out.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::models::audit::{AuditEventType, TaskAuditEntry};
use crate::models::event::InboundReply;
use crate::models::message::{render_thread, ConversationMessage, MessageState, SenderRole};
use crate::models::task::{ActionHolder, Task, TaskStatus};
use crate::persistence::task_repo::{Rearm, StatusUpdate};
use crate::{AppError, Result};

use super::guest_notice::GuestNotices;
use super::{bounded, Context, STAFF_INABILITY_REASON, SYSTEM_ESCALATION_REASON};

/// Which rule tied a reply to its tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchRule {
    /// The reply names a message on the task's chain.
    InReplyTo,
    /// Sender is the assigned staff identity.
    StaffId,
    /// Sender address is the staff or holder contact.
    Address,
    /// Sender is the guest who raised the task.
    Requester,
    /// Task at the sender's property waiting on staff or host.
    PropertyWaiting,
    /// Most recent open task touching the sender or property.
    MostRecent,
}

impl MatchRule {
    /// Fallback rules are guesses: always flagged for review, and never
    /// applied when they tie between tasks.
    fn is_fallback(self) -> bool {
        matches!(self, Self::PropertyWaiting | Self::MostRecent)
    }
}

/// Per-task result of applying a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskReplyResult {
    /// Requirement met and the work reported done.
    Completed,
    /// Requirement met with work still to happen.
    Scheduled,
    /// Responder cannot help; the host takes over.
    Escalated,
    /// Host declined the request.
    Cancelled,
    /// Responder engaged but the requirement is not met yet.
    InProgress,
    /// Guest message added to the thread without a transition.
    GuestLinked,
    /// Task already closed; reply recorded for audit only.
    Ignored,
    /// Reply already on the chain.
    AlreadyApplied,
    /// Task moved on during evaluation; retry later.
    Stale,
    /// Oracle unavailable; retry later.
    OracleFailed,
}

impl TaskReplyResult {
    fn needs_retry(self) -> bool {
        matches!(self, Self::Stale | Self::OracleFailed)
    }
}

/// Result of ingesting one reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReplyOutcome {
    /// Message id already processed.
    Duplicate,
    /// No open task could be associated; stored as unmatched.
    Unmatched,
    /// Several tasks tied; all flagged, none processed.
    Ambiguous {
        /// Flagged tasks.
        task_ids: Vec<String>,
    },
    /// Applied to the matched tasks.
    Processed {
        /// Rule that matched.
        rule: MatchRule,
        /// Result per task id.
        results: Vec<(String, TaskReplyResult)>,
    },
    /// Left pending for the retry sweep.
    Pending {
        /// Result per task id.
        results: Vec<(String, TaskReplyResult)>,
    },
    /// Gave up; matched tasks were escalated.
    Failed {
        /// Tasks escalated.
        task_ids: Vec<String>,
    },
}

/// Candidate tasks and the rule that found them.
struct ReplyMatch {
    rule: MatchRule,
    tasks: Vec<Task>,
}

/// Ingests staff, host and guest replies.
#[derive(Clone)]
pub struct ReplyIngestor {
    ctx: Arc<Context>,
    guest_notices: GuestNotices,
}

impl ReplyIngestor {
    /// Create an ingestor over the shared context.
    #[must_use]
    pub fn new(ctx: Arc<Context>, guest_notices: GuestNotices) -> Self {
        Self { ctx, guest_notices }
    }

    /// Store and process an inbound reply.
    ///
    /// Idempotent on `message_id`: a reply that was already processed,
    /// parked as unmatched, or failed is reported as a duplicate.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidInput` for a reply without id or sender, or
    /// `AppError::Db` if persistence fails.
    pub async fn ingest(&self, reply: &InboundReply) -> Result<ReplyOutcome> {
        if reply.message_id.trim().is_empty() || reply.from_address.trim().is_empty() {
            return Err(AppError::InvalidInput(
                "message_id and from_address must not be empty".into(),
            ));
        }

        let stored = self
            .ctx
            .messages
            .insert(&ConversationMessage::from_reply(reply))
            .await?;
        if !stored {
            let existing = self.ctx.messages.get_by_id(&reply.message_id).await?;
            if existing.is_some_and(|m| m.state != MessageState::Pending) {
                debug!(message_id = %reply.message_id, "reply already handled");
                return Ok(ReplyOutcome::Duplicate);
            }
        }

        self.process(reply).await
    }

    /// Retry pending replies older than the configured delay.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the pending query fails. Per-reply errors
    /// are logged and skipped.
    pub async fn retry_pending(&self) -> Result<usize> {
        let delay = chrono::Duration::seconds(
            i64::try_from(self.ctx.config.orchestration.reply_retry_delay_seconds)
                .unwrap_or(i64::MAX),
        );
        let pending = self.ctx.messages.pending_before(Utc::now() - delay).await?;
        let mut processed = 0;
        for message in pending {
            match self.process(&message.to_reply()).await {
                Ok(ReplyOutcome::Pending { .. }) => {}
                Ok(_) => processed += 1,
                Err(err) => warn!(message_id = %message.id, %err, "pending reply retry failed"),
            }
        }
        Ok(processed)
    }

    /// Match and apply a stored reply.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if persistence fails.
    pub async fn process(&self, reply: &InboundReply) -> Result<ReplyOutcome> {
        let span = info_span!("reply", message_id = %reply.message_id, from = %reply.from_address);
        self.process_inner(reply).instrument(span).await
    }

    async fn process_inner(&self, reply: &InboundReply) -> Result<ReplyOutcome> {
        let Some(found) = self.match_reply(reply).await? else {
            info!("reply matched no open task");
            self.ctx
                .messages
                .set_state(&reply.message_id, MessageState::Unmatched)
                .await?;
            return Ok(ReplyOutcome::Unmatched);
        };

        if found.rule.is_fallback() || found.tasks.len() > 1 {
            self.flag_ambiguous(&found, reply).await?;
        }

        if found.rule.is_fallback() && found.tasks.len() > 1 {
            warn!(tasks = found.tasks.len(), "reply tied between tasks; left for review");
            self.ctx
                .messages
                .set_state(&reply.message_id, MessageState::Unmatched)
                .await?;
            return Ok(ReplyOutcome::Ambiguous {
                task_ids: found.tasks.iter().map(|t| t.id.clone()).collect(),
            });
        }

        let host_address = match found.tasks.first() {
            Some(task) => self.ctx.host_address(&task.property_id).await?,
            None => None,
        };

        let mut results = Vec::with_capacity(found.tasks.len());
        for task in &found.tasks {
            let role = responder_role(task, reply, host_address.as_deref());
            if results.is_empty() {
                self.ctx
                    .messages
                    .attribute(&reply.message_id, role, task)
                    .await?;
            }
            let result = self.apply_to_task(task, reply, role).await?;
            info!(task_id = %task.id, ?result, rule = ?found.rule, "reply applied");
            results.push((task.id.clone(), result));
        }

        if results.iter().any(|(_, r)| *r == TaskReplyResult::OracleFailed) {
            let attempts = self
                .ctx
                .messages
                .increment_attempts(&reply.message_id)
                .await?;
            if attempts >= self.ctx.max_attempts() {
                return self.give_up(reply, &found.tasks, attempts).await;
            }
            return Ok(ReplyOutcome::Pending { results });
        }
        if results.iter().any(|(_, r)| r.needs_retry()) {
            return Ok(ReplyOutcome::Pending { results });
        }

        self.ctx
            .messages
            .set_state(&reply.message_id, MessageState::Processed)
            .await?;
        Ok(ReplyOutcome::Processed {
            rule: found.rule,
            results,
        })
    }

    async fn match_reply(&self, reply: &InboundReply) -> Result<Option<ReplyMatch>> {
        let tasks = &self.ctx.tasks;
        let found = |rule, tasks: Vec<Task>| (!tasks.is_empty()).then_some(ReplyMatch { rule, tasks });

        if let Some(reference) = reply.in_reply_to.as_deref().filter(|r| !r.is_empty()) {
            if let Some(m) = found(MatchRule::InReplyTo, tasks.open_with_chain_message(reference).await?) {
                return Ok(Some(m));
            }
        }
        if let Some(staff_id) = reply.sender_id.as_deref().filter(|s| !s.is_empty()) {
            if let Some(m) = found(MatchRule::StaffId, tasks.open_by_staff_id(staff_id).await?) {
                return Ok(Some(m));
            }
        }
        if let Some(m) = found(
            MatchRule::Address,
            tasks.open_by_responder_address(&reply.from_address).await?,
        ) {
            return Ok(Some(m));
        }
        if let Some(m) = found(
            MatchRule::Requester,
            tasks.open_by_requester(&reply.from_address).await?,
        ) {
            return Ok(Some(m));
        }

        let Some(property_id) = reply.property_id.as_deref().filter(|p| !p.is_empty()) else {
            return Ok(None);
        };
        if let Some(m) = found(
            MatchRule::PropertyWaiting,
            tasks.open_waiting_at_property(property_id).await?,
        ) {
            return Ok(Some(m));
        }

        let touching = tasks
            .open_touching(&reply.from_address, Some(property_id))
            .await?;
        let newest: Vec<Task> = match touching.first() {
            Some(first) => {
                let newest_at = first.created_at;
                touching
                    .into_iter()
                    .take_while(|t| t.created_at == newest_at)
                    .collect()
            }
            None => Vec::new(),
        };
        Ok(found(MatchRule::MostRecent, newest))
    }

    async fn flag_ambiguous(&self, found: &ReplyMatch, reply: &InboundReply) -> Result<()> {
        for task in &found.tasks {
            self.ctx
                .audit
                .append(
                    &TaskAuditEntry::new(
                        &task.id,
                        AuditEventType::AmbiguousReplyMatch,
                        format!(
                            "reply from {} matched {} task(s) by {:?}",
                            reply.from_address,
                            found.tasks.len(),
                            found.rule
                        ),
                    )
                    .with_message(&reply.message_id),
                )
                .await?;
        }
        Ok(())
    }

    async fn apply_to_task(
        &self,
        task: &Task,
        reply: &InboundReply,
        role: SenderRole,
    ) -> Result<TaskReplyResult> {
        // Another reply may have closed the task since it was matched.
        let Some(task) = self.ctx.tasks.get_by_id(&task.id).await? else {
            return Ok(TaskReplyResult::Ignored);
        };
        let task = &task;

        if task.message_chain.iter().any(|id| id == &reply.message_id) {
            return Ok(TaskReplyResult::AlreadyApplied);
        }

        if task.status.is_terminal() {
            self.ctx
                .audit
                .append(
                    &TaskAuditEntry::new(
                        &task.id,
                        AuditEventType::ReplyIgnored,
                        format!("reply after {:?}", task.status),
                    )
                    .with_message(&reply.message_id),
                )
                .await?;
            return Ok(TaskReplyResult::Ignored);
        }

        if role == SenderRole::Guest {
            let mut message = ConversationMessage::from_reply(reply);
            message.sender_role = SenderRole::Guest;
            self.ctx.tasks.link_message(&task.id, &message, None).await?;
            return Ok(TaskReplyResult::GuestLinked);
        }

        let mut messages = self.ctx.messages.thread_for(task).await?;
        if !messages.iter().any(|m| m.id == reply.message_id) {
            let mut message = ConversationMessage::from_reply(reply);
            message.sender_role = role;
            messages.push(message);
        }
        let thread = render_thread(&messages);

        let satisfied = match bounded(
            self.ctx.config.oracle_timeout(),
            "requirement check",
            self.ctx
                .oracle
                .requirement_satisfied(&task.staff_requirements, &thread),
        )
        .await
        {
            Ok(satisfied) => satisfied,
            Err(err) => {
                warn!(task_id = %task.id, %err, "requirement check failed");
                self.ctx
                    .audit
                    .append(
                        &TaskAuditEntry::new(&task.id, AuditEventType::OracleFailure, err.to_string())
                            .with_message(&reply.message_id),
                    )
                    .await?;
                return Ok(TaskReplyResult::OracleFailed);
            }
        };

        let (result, update) = self.decide(reply, role, satisfied);

        if !task.status.can_transition_to(update.status) {
            warn!(task_id = %task.id, from = ?task.status, to = ?update.status, "reply outcome rejected");
            self.ctx
                .audit
                .append(
                    &TaskAuditEntry::new(
                        &task.id,
                        AuditEventType::ReplyIgnored,
                        format!("{:?} -> {:?} is not a valid transition", task.status, update.status),
                    )
                    .with_message(&reply.message_id),
                )
                .await?;
            return Ok(TaskReplyResult::Ignored);
        }

        let mut audit = vec![TaskAuditEntry::new(
            &task.id,
            AuditEventType::OracleCall,
            format!("requirement satisfied: {satisfied}"),
        )
        .with_message(&reply.message_id)];
        if update.status != task.status {
            audit.push(
                TaskAuditEntry::new(
                    &task.id,
                    AuditEventType::StatusChanged,
                    format!("{:?} -> {:?}", task.status, update.status),
                )
                .with_message(&reply.message_id),
            );
        }

        let applied = self
            .ctx
            .tasks
            .apply_reply(&task.id, &reply.message_id, task.status, &update, &audit)
            .await?;
        if !applied {
            debug!(task_id = %task.id, "task changed during evaluation");
            return Ok(TaskReplyResult::Stale);
        }

        // The update is owed from here on; a failed send is retried by the pass.
        if update.notify_guest {
            self.guest_notices.send_scheduled_update(task).await?;
        }

        Ok(result)
    }

    fn decide(
        &self,
        reply: &InboundReply,
        role: SenderRole,
        satisfied: bool,
    ) -> (TaskReplyResult, StatusUpdate) {
        let language = &self.ctx.language;
        let working_holder = if role == SenderRole::Host {
            ActionHolder::Host
        } else {
            ActionHolder::Staff
        };
        let base = |status, holder| StatusUpdate {
            status,
            action_holder: holder,
            rearm: Rearm::No,
            response_received: true,
            escalation_reason: None,
            notify_guest: false,
        };

        if satisfied {
            if language.is_definitive_completion(&reply.body) {
                return (TaskReplyResult::Completed, base(TaskStatus::Completed, None));
            }
            return (
                TaskReplyResult::Scheduled,
                StatusUpdate {
                    notify_guest: true,
                    ..base(TaskStatus::Scheduled, Some(working_holder))
                },
            );
        }

        if language.states_inability(&reply.body) {
            if role == SenderRole::Host {
                return (TaskReplyResult::Cancelled, base(TaskStatus::Cancelled, None));
            }
            return (
                TaskReplyResult::Escalated,
                StatusUpdate {
                    rearm: Rearm::AfterReply,
                    escalation_reason: Some(STAFF_INABILITY_REASON.to_owned()),
                    ..base(TaskStatus::Escalated, Some(ActionHolder::Host))
                },
            );
        }

        (
            TaskReplyResult::InProgress,
            base(TaskStatus::InProgress, Some(working_holder)),
        )
    }

    async fn give_up(
        &self,
        reply: &InboundReply,
        tasks: &[Task],
        attempts: u32,
    ) -> Result<ReplyOutcome> {
        warn!(attempts, "reply evaluation exhausted; escalating matched tasks");
        self.ctx
            .messages
            .set_state(&reply.message_id, MessageState::Failed)
            .await?;

        let mut escalated = Vec::new();
        for task in tasks.iter().filter(|t| t.is_open()) {
            let audit = [
                TaskAuditEntry::new(
                    &task.id,
                    AuditEventType::RetryExhausted,
                    format!("reply could not be evaluated after {attempts} attempts"),
                )
                .with_message(&reply.message_id),
                TaskAuditEntry::new(
                    &task.id,
                    AuditEventType::StatusChanged,
                    format!("{:?} -> Escalated", task.status),
                ),
            ];
            if self
                .ctx
                .tasks
                .escalate(&task.id, SYSTEM_ESCALATION_REASON, &audit)
                .await?
            {
                escalated.push(task.id.clone());
            }
        }
        Ok(ReplyOutcome::Failed { task_ids: escalated })
    }
}

/// Work out who sent a reply, relative to one task.
fn responder_role(task: &Task, reply: &InboundReply, host_address: Option<&str>) -> SenderRole {
    let from = reply.from_address.as_str();
    let is_staff = reply
        .sender_id
        .as_deref()
        .is_some_and(|id| task.staff_id.as_deref() == Some(id))
        || task.staff_address.as_deref() == Some(from);

    if is_staff {
        SenderRole::Staff
    } else if task.requester_address == from {
        SenderRole::Guest
    } else if host_address == Some(from)
        || (task.action_holder == ActionHolder::Host
            && task.action_holder_address.as_deref() == Some(from))
    {
        SenderRole::Host
    } else {
        SenderRole::Staff
    }
}
