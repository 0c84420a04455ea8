//! Classification event intake and deduplication.
//!
//! At most one open task exists per requester, property and category.
//! Repeat requests are folded into the open task; new ones are bound to a
//! task definition and created.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::models::audit::{AuditEventType, TaskAuditEntry};
use crate::models::event::ClassificationEvent;
use crate::models::message::ConversationMessage;
use crate::models::task::{category_key, Task};
use crate::persistence::event_repo::EventOutcome;
use crate::{AppError, Result};

use super::definition_match::{self, MatchTier};
use super::Context;

/// Result of ingesting one classification event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// A new task was created.
    Created {
        /// New task id.
        task_id: String,
        /// How the definition was matched, if it was.
        definition: Option<MatchTier>,
    },
    /// Folded into an existing open task.
    Linked {
        /// Existing task id.
        task_id: String,
    },
    /// Category was classifier noise; no task.
    Discarded,
    /// Event id seen before; nothing done.
    AlreadyConsumed {
        /// Task the event produced or joined, if any.
        task_id: Option<String>,
    },
}

/// Turns classification events into at most one open task each.
#[derive(Clone)]
pub struct Deduplicator {
    ctx: Arc<Context>,
}

impl Deduplicator {
    /// Create a deduplicator over the shared context.
    #[must_use]
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Ingest a classification event.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidInput` for an event missing its id,
    /// requester or property, or `AppError::Db` if persistence fails.
    pub async fn ingest(&self, event: &ClassificationEvent) -> Result<IngestOutcome> {
        validate(event)?;
        let span = info_span!(
            "dedup",
            source_event_id = %event.source_event_id,
            category = %event.category,
        );
        self.ingest_inner(event).instrument(span).await
    }

    async fn ingest_inner(&self, event: &ClassificationEvent) -> Result<IngestOutcome> {
        if let Some((_, task_id)) = self.ctx.events.outcome(&event.source_event_id).await? {
            return Ok(IngestOutcome::AlreadyConsumed { task_id });
        }

        if self.ctx.denylist.is_denied(&event.category) {
            info!(
                denylist_version = self.ctx.denylist.version(),
                "category is classifier noise; discarded"
            );
            self.ctx
                .events
                .mark_consumed(&event.source_event_id, EventOutcome::Discarded, None)
                .await?;
            return Ok(IngestOutcome::Discarded);
        }

        let key = category_key(&event.category);
        if let Some(task) = self
            .ctx
            .tasks
            .find_open_for(&event.requester_address, &event.property_id, &key)
            .await?
        {
            return self.link(&task, event).await;
        }

        let definitions = self
            .ctx
            .definitions
            .list_for_property(&event.property_id)
            .await?;
        let resolved = definition_match::resolve(&event.category, &definitions);

        let mut task = Task::new(event, resolved.map(|(def, _)| def));
        task.message_chain.push(event.source_event_id.clone());

        let mut audit = vec![TaskAuditEntry::new(
            &task.id,
            AuditEventType::TaskCreated,
            format!("{:?} for {}", task.status, task.category),
        )
        .with_source_event(&event.source_event_id)];
        match resolved {
            Some((def, tier)) => {
                info!(definition = %def.label, ?tier, "definition resolved");
            }
            None => {
                warn!("no task definition matched; task created unassigned");
                audit.push(
                    TaskAuditEntry::new(
                        &task.id,
                        AuditEventType::DefinitionUnresolved,
                        format!("no definition at {} matches {:?}", event.property_id, event.category),
                    )
                    .with_source_event(&event.source_event_id),
                );
            }
        }

        match self.ctx.tasks.create(&task, &audit).await {
            Ok(_) => {}
            Err(AppError::Duplicate(_)) => {
                // Lost a race with a concurrent event for the same request.
                let winner = self
                    .ctx
                    .tasks
                    .find_open_for(&event.requester_address, &event.property_id, &key)
                    .await?
                    .ok_or_else(|| {
                        AppError::Conflict("open task vanished after a duplicate insert".into())
                    })?;
                return self.link(&winner, event).await;
            }
            Err(err) => return Err(err),
        }

        self.ctx
            .messages
            .insert(&ConversationMessage::guest_request(event, &task.id))
            .await?;

        self.ctx
            .events
            .mark_consumed(&event.source_event_id, EventOutcome::Created, Some(&task.id))
            .await?;

        info!(task_id = %task.id, status = ?task.status, "task created");
        Ok(IngestOutcome::Created {
            task_id: task.id,
            definition: resolved.map(|(_, tier)| tier),
        })
    }

    async fn link(&self, task: &Task, event: &ClassificationEvent) -> Result<IngestOutcome> {
        let entry = TaskAuditEntry::new(
            &task.id,
            AuditEventType::SourceEventLinked,
            "repeat request folded into open task",
        )
        .with_source_event(&event.source_event_id);

        self.ctx
            .tasks
            .link_message(
                &task.id,
                &ConversationMessage::guest_request(event, &task.id),
                Some(&entry),
            )
            .await?;
        self.ctx
            .events
            .mark_consumed(&event.source_event_id, EventOutcome::Linked, Some(&task.id))
            .await?;

        info!(task_id = %task.id, "event linked to open task");
        Ok(IngestOutcome::Linked {
            task_id: task.id.clone(),
        })
    }
}

fn validate(event: &ClassificationEvent) -> Result<()> {
    let missing = [
        ("source_event_id", &event.source_event_id),
        ("requester_address", &event.requester_address),
        ("property_id", &event.property_id),
    ]
    .into_iter()
    .find(|(_, value)| value.trim().is_empty());

    match missing {
        Some((field, _)) => Err(AppError::InvalidInput(format!("{field} must not be empty"))),
        None => Ok(()),
    }
}
