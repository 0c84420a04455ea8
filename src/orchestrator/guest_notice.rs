//! Guest progress notices: scheduled-work updates and requests for missing
//! details.
//!
//! A notice is recorded as owed on the task before the first send. A send
//! that fails leaves it owed, and [`GuestNotices::run`] picks it up again on
//! the next orchestration pass until it lands or its own attempt budget
//! runs out.

use std::sync::Arc;

use tracing::{debug, info, info_span, warn, Instrument};

use crate::models::message::{render_thread, SenderRole};
use crate::models::task::{Task, TaskStatus};
use crate::oracle::{ComposeContext, MessageKind};
use crate::persistence::task_repo::DispatchEffect;
use crate::Result;

use super::dispatcher::{DispatchOutcome, NotificationDispatcher, Outbound};
use super::Context;

/// Sends owed guest notices at most once each.
#[derive(Clone)]
pub struct GuestNotices {
    ctx: Arc<Context>,
    dispatcher: NotificationDispatcher,
}

impl GuestNotices {
    /// Create a sender over the shared context.
    #[must_use]
    pub fn new(ctx: Arc<Context>, dispatcher: NotificationDispatcher) -> Self {
        Self { ctx, dispatcher }
    }

    /// Retry every owed guest notice.
    ///
    /// Returns the number of notices delivered.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the candidate query fails. Per-task errors
    /// are logged and the task is retried on the next pass.
    pub async fn run(&self) -> Result<usize> {
        let candidates = self
            .ctx
            .tasks
            .guest_notice_candidates(self.ctx.max_attempts())
            .await?;
        debug!(candidates = candidates.len(), "guest notice candidates loaded");

        let mut delivered = 0;
        for task in candidates {
            if task.status == TaskStatus::Scheduled && task.guest_update_pending {
                match self.send_scheduled_update(&task).await {
                    Ok(DispatchOutcome::Delivered { .. }) => delivered += 1,
                    Ok(_) => {}
                    Err(err) => warn!(task_id = %task.id, %err, "scheduled update failed"),
                }
            }
            if task.guest_info_requested {
                continue;
            }
            if let Some(missing) = task.guest_info_missing.clone() {
                match self.send_info_request(&task, missing).await {
                    Ok(DispatchOutcome::Delivered { .. }) => delivered += 1,
                    Ok(_) => {}
                    Err(err) => warn!(task_id = %task.id, %err, "guest info request failed"),
                }
            }
        }
        Ok(delivered)
    }

    /// Tell the guest their request is scheduled.
    ///
    /// The update must already be owed on the task; the claim guard refuses
    /// it otherwise.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if bookkeeping fails.
    pub async fn send_scheduled_update(&self, task: &Task) -> Result<DispatchOutcome> {
        let span = info_span!("guest_update", task_id = %task.id, category = %task.category);
        async {
            let thread = render_thread(&self.ctx.messages.thread_for(task).await?);
            let outcome = self
                .dispatcher
                .dispatch(
                    task,
                    DispatchEffect::GuestUpdate {
                        expected: TaskStatus::Scheduled,
                    },
                    Outbound {
                        to: task.requester_address.clone(),
                        role: SenderRole::Guest,
                        kind: MessageKind::GuestScheduledUpdate,
                        context: ComposeContext::for_task(task, thread),
                    },
                )
                .await?;
            if matches!(outcome, DispatchOutcome::Delivered { .. }) {
                info!("guest told the work is scheduled");
            }
            Ok(outcome)
        }
        .instrument(span)
        .await
    }

    /// Record that the guest owes `missing` details, then ask for them.
    ///
    /// Returns [`DispatchOutcome::AlreadyClaimed`] without sending if the
    /// guest was already asked.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if bookkeeping fails.
    pub async fn request_guest_info(
        &self,
        task: &Task,
        missing: Vec<String>,
    ) -> Result<DispatchOutcome> {
        if !self.ctx.tasks.mark_guest_info_pending(&task.id, &missing).await? {
            return Ok(DispatchOutcome::AlreadyClaimed);
        }
        self.send_info_request(task, missing).await
    }

    async fn send_info_request(
        &self,
        task: &Task,
        missing: Vec<String>,
    ) -> Result<DispatchOutcome> {
        let span = info_span!("guest_info", task_id = %task.id, category = %task.category);
        async {
            let thread = render_thread(&self.ctx.messages.thread_for(task).await?);
            self.dispatcher
                .dispatch(
                    task,
                    DispatchEffect::GuestInfoRequest,
                    Outbound {
                        to: task.requester_address.clone(),
                        role: SenderRole::Guest,
                        kind: MessageKind::GuestInfoRequest,
                        context: ComposeContext::for_task(task, thread).with_missing(missing),
                    },
                )
                .await
        }
        .instrument(span)
        .await
    }
}
