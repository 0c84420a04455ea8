//! Claim-guarded notification dispatch.
//!
//! Each send follows claim, send, record: a conditional UPDATE takes a
//! lease on the task, the message is composed and sent under timeouts, and
//! the effect is recorded in one transaction that also releases the lease.
//! A worker that cannot take the claim sends nothing.

use std::sync::Arc;

use tracing::{info, info_span, warn, Instrument};

use crate::models::audit::{AuditEventType, TaskAuditEntry};
use crate::models::message::{ConversationMessage, SenderRole};
use crate::models::task::Task;
use crate::notifier::NotifyMetadata;
use crate::oracle::{ComposeContext, MessageKind};
use crate::persistence::task_repo::{Claim, ClaimGuard, DispatchEffect, FailureOutcome};
use crate::{AppError, Result};

use super::{bounded, Context, SYSTEM_ESCALATION_REASON};

/// What to send and to whom.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Recipient address.
    pub to: String,
    /// Recipient role.
    pub role: SenderRole,
    /// Message kind to compose.
    pub kind: MessageKind,
    /// Composition inputs.
    pub context: ComposeContext,
}

/// Result of a dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Sent and recorded.
    Delivered {
        /// Transport message id.
        transport_id: String,
    },
    /// Another worker holds the task, or the guard no longer holds.
    AlreadyClaimed,
    /// Sent, but the lease was lost before recording.
    ClaimLost,
    /// Composition or delivery failed; the attempt was counted.
    Failed {
        /// Attempt accounting after the failure.
        outcome: FailureOutcome,
    },
}

/// Sends composed messages at most once per guard.
#[derive(Clone)]
pub struct NotificationDispatcher {
    ctx: Arc<Context>,
}

impl NotificationDispatcher {
    /// Create a dispatcher over the shared context.
    #[must_use]
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Take the dispatch claim for `task`.
    ///
    /// A refused claim is recorded as `claim_lost` on the audit trail.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the claim update fails.
    pub async fn claim(&self, task: &Task, guard: ClaimGuard) -> Result<Option<Claim>> {
        let claim = self
            .ctx
            .tasks
            .claim(&task.id, guard, self.ctx.config.claim_lease())
            .await?;
        if claim.is_none() {
            info!(task_id = %task.id, ?guard, "claim refused");
            self.ctx
                .audit
                .append(&TaskAuditEntry::new(
                    &task.id,
                    AuditEventType::ClaimLost,
                    format!("claim refused for {guard:?}"),
                ))
                .await?;
        }
        Ok(claim)
    }

    /// Claim, compose, send and record in one call.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if bookkeeping fails. Oracle and transport
    /// failures are reported as [`DispatchOutcome::Failed`].
    pub async fn dispatch(
        &self,
        task: &Task,
        effect: DispatchEffect,
        outbound: Outbound,
    ) -> Result<DispatchOutcome> {
        let Some(claim) = self.claim(task, effect.guard()).await? else {
            return Ok(DispatchOutcome::AlreadyClaimed);
        };
        self.deliver(&claim, task, effect, outbound).await
    }

    /// Compose, send and record under a claim the caller already holds.
    ///
    /// The claim is released on every path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if bookkeeping fails. Oracle and transport
    /// failures are reported as [`DispatchOutcome::Failed`].
    pub async fn deliver(
        &self,
        claim: &Claim,
        task: &Task,
        effect: DispatchEffect,
        outbound: Outbound,
    ) -> Result<DispatchOutcome> {
        let span = info_span!(
            "dispatch",
            task_id = %task.id,
            category = %task.category,
            kind = ?outbound.kind,
        );
        self.deliver_inner(claim, task, effect, outbound)
            .instrument(span)
            .await
    }

    async fn deliver_inner(
        &self,
        claim: &Claim,
        task: &Task,
        effect: DispatchEffect,
        outbound: Outbound,
    ) -> Result<DispatchOutcome> {
        let config = &self.ctx.config;

        let body = match bounded(
            config.oracle_timeout(),
            "compose",
            self.ctx.oracle.compose_message(outbound.kind, &outbound.context),
        )
        .await
        {
            Ok(body) => body,
            Err(err) => {
                let outcome = self
                    .fail_effect(task, claim, effect, AuditEventType::OracleFailure, &err)
                    .await?;
                return Ok(DispatchOutcome::Failed { outcome });
            }
        };

        let metadata = NotifyMetadata {
            task_id: task.id.clone(),
            property_id: task.property_id.clone(),
            kind: outbound.kind,
        };
        let receipt = match bounded(
            config.notifier_timeout(),
            "notifier send",
            self.ctx.notifier.send(&outbound.to, &body, &metadata),
        )
        .await
        {
            Ok(receipt) => receipt,
            Err(err) => {
                let outcome = self
                    .fail_effect(task, claim, effect, AuditEventType::TransportFailure, &err)
                    .await?;
                return Ok(DispatchOutcome::Failed { outcome });
            }
        };

        let message = ConversationMessage::outbound(
            task,
            receipt.transport_id.clone(),
            &outbound.to,
            outbound.role,
            &body,
        );

        let mut audit = vec![
            TaskAuditEntry::new(
                &task.id,
                AuditEventType::OracleCall,
                format!("composed {:?}", outbound.kind),
            ),
            TaskAuditEntry::new(
                &task.id,
                AuditEventType::TransportAttempt,
                format!("sent {:?} to {}", outbound.kind, outbound.to),
            )
            .with_message(&receipt.transport_id),
        ];
        if let DispatchEffect::ActionHolder {
            expected,
            next_status,
            ..
        } = effect
        {
            if expected != next_status {
                audit.push(TaskAuditEntry::new(
                    &task.id,
                    AuditEventType::StatusChanged,
                    format!("{expected:?} -> {next_status:?}"),
                ));
            }
        }

        let recorded = self
            .ctx
            .tasks
            .apply_dispatch(claim, effect, &message, &audit)
            .await?;

        if !recorded {
            warn!(transport_id = %receipt.transport_id, "claim lost after send");
            self.ctx
                .audit
                .append(
                    &TaskAuditEntry::new(
                        &task.id,
                        AuditEventType::ClaimLost,
                        "lease lost before the send could be recorded",
                    )
                    .with_message(&receipt.transport_id),
                )
                .await?;
            return Ok(DispatchOutcome::ClaimLost);
        }

        info!(transport_id = %receipt.transport_id, to = %outbound.to, "notification delivered");
        Ok(DispatchOutcome::Delivered {
            transport_id: receipt.transport_id,
        })
    }

    async fn fail_effect(
        &self,
        task: &Task,
        claim: &Claim,
        effect: DispatchEffect,
        event_type: AuditEventType,
        err: &AppError,
    ) -> Result<FailureOutcome> {
        if effect.is_guest_notice() {
            self.fail_guest_notice(task, claim, event_type, err).await
        } else {
            self.fail(task, Some(claim), event_type, err).await
        }
    }

    /// Count a failed guest update or info request.
    ///
    /// The notice stays owed for the next pass; the task's own attempt
    /// budget and status are left alone.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if bookkeeping fails.
    pub async fn fail_guest_notice(
        &self,
        task: &Task,
        claim: &Claim,
        event_type: AuditEventType,
        err: &AppError,
    ) -> Result<FailureOutcome> {
        warn!(task_id = %task.id, %err, ?event_type, "guest notice failed");

        let entry = TaskAuditEntry::new(&task.id, event_type, err.to_string());
        let outcome = self
            .ctx
            .tasks
            .record_guest_notice_failure(&task.id, Some(claim), self.ctx.max_attempts(), &[entry])
            .await?;

        if outcome.exhausted {
            warn!(
                task_id = %task.id,
                attempts = outcome.attempts,
                "guest notice retries exhausted"
            );
            self.ctx
                .audit
                .append(&TaskAuditEntry::new(
                    &task.id,
                    AuditEventType::RetryExhausted,
                    format!(
                        "{} guest notice attempts failed; waiting for an operator",
                        outcome.attempts
                    ),
                ))
                .await?;
        }
        Ok(outcome)
    }

    /// Count a failed oracle or transport attempt against `task`.
    ///
    /// Releases `claim` if given. Reaching the attempt cap escalates the task
    /// to the host and records `retry_exhausted`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if bookkeeping fails.
    pub async fn fail(
        &self,
        task: &Task,
        claim: Option<&Claim>,
        event_type: AuditEventType,
        err: &AppError,
    ) -> Result<FailureOutcome> {
        warn!(task_id = %task.id, %err, ?event_type, "collaborator call failed");

        let entry = TaskAuditEntry::new(&task.id, event_type, err.to_string());
        let outcome = self
            .ctx
            .tasks
            .record_failure(
                &task.id,
                claim,
                self.ctx.max_attempts(),
                SYSTEM_ESCALATION_REASON,
                &[entry],
            )
            .await?;

        if outcome.exhausted {
            let detail = if outcome.escalated {
                format!("{} attempts failed; escalated to host", outcome.attempts)
            } else {
                format!("{} attempts failed; waiting for an operator", outcome.attempts)
            };
            warn!(task_id = %task.id, attempts = outcome.attempts, escalated = outcome.escalated, "retries exhausted");
            self.ctx
                .audit
                .append(&TaskAuditEntry::new(
                    &task.id,
                    AuditEventType::RetryExhausted,
                    detail,
                ))
                .await?;
            if outcome.escalated {
                self.ctx
                    .audit
                    .append(&TaskAuditEntry::new(
                        &task.id,
                        AuditEventType::StatusChanged,
                        format!("{:?} -> Escalated", task.status),
                    ))
                    .await?;
            }
        }

        Ok(outcome)
    }

    /// Give a claim back without sending.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn release(&self, claim: &Claim) -> Result<()> {
        self.ctx.tasks.release_claim(claim).await
    }
}
