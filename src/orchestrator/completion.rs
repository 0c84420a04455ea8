//! Guest completion notices.

use std::sync::Arc;

use tracing::{info, info_span, warn, Instrument};

use crate::models::message::{render_thread, SenderRole};
use crate::models::task::Task;
use crate::oracle::{ComposeContext, MessageKind};
use crate::persistence::task_repo::DispatchEffect;
use crate::Result;

use super::dispatcher::{DispatchOutcome, NotificationDispatcher, Outbound};
use super::Context;

/// Tells guests their request is resolved, once per task.
#[derive(Clone)]
pub struct CompletionCoordinator {
    ctx: Arc<Context>,
    dispatcher: NotificationDispatcher,
}

impl CompletionCoordinator {
    /// Create a coordinator over the shared context.
    #[must_use]
    pub fn new(ctx: Arc<Context>, dispatcher: NotificationDispatcher) -> Self {
        Self { ctx, dispatcher }
    }

    /// Notify the guest of every completed task not yet announced.
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
            .completion_candidates(self.ctx.max_attempts())
            .await?;

        let mut delivered = 0;
        for task in candidates {
            match self.notify(&task).await {
                Ok(DispatchOutcome::Delivered { .. }) => delivered += 1,
                Ok(_) => {}
                Err(err) => warn!(task_id = %task.id, %err, "completion notice failed"),
            }
        }
        Ok(delivered)
    }

    /// Send the completion notice for one task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if bookkeeping fails.
    pub async fn notify(&self, task: &Task) -> Result<DispatchOutcome> {
        let span = info_span!("completion", task_id = %task.id, category = %task.category);
        async {
            let thread = render_thread(&self.ctx.messages.thread_for(task).await?);
            let outcome = self
                .dispatcher
                .dispatch(
                    task,
                    DispatchEffect::CompletionNotice,
                    Outbound {
                        to: task.requester_address.clone(),
                        role: SenderRole::Guest,
                        kind: MessageKind::GuestCompletionNotice,
                        context: ComposeContext::for_task(task, thread),
                    },
                )
                .await?;
            if matches!(outcome, DispatchOutcome::Delivered { .. }) {
                info!("guest told the request is resolved");
            }
            Ok(outcome)
        }
        .instrument(span)
        .await
    }
}
