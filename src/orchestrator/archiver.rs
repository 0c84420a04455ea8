//! Cold storage for finished tasks and retention purge.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::models::audit::{AuditEventType, TaskAuditEntry};
use crate::persistence::archive_repo::ArchivePayload;
use crate::persistence::retention;
use crate::Result;

use super::Context;

/// Tasks moved per archive tick.
const ARCHIVE_BATCH: u32 = 100;

/// Moves finished tasks out of the live store.
#[derive(Clone)]
pub struct Archiver {
    ctx: Arc<Context>,
}

impl Archiver {
    /// Create an archiver over the shared context.
    #[must_use]
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }

    /// Archive one batch of finished tasks.
    ///
    /// Returns the number archived. A task that fails is left in place for
    /// the next tick.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the candidate query fails.
    pub async fn run(&self) -> Result<usize> {
        let ids = self.ctx.tasks.archivable_ids(ARCHIVE_BATCH).await?;
        let mut archived = 0;
        for id in ids {
            match self.archive_one(&id).await {
                Ok(true) => archived += 1,
                Ok(false) => debug!(task_id = %id, "task no longer archivable"),
                Err(err) => warn!(task_id = %id, %err, "archive failed; will retry"),
            }
        }
        if archived > 0 {
            info!(archived, "finished tasks archived");
        }
        Ok(archived)
    }

    async fn archive_one(&self, id: &str) -> Result<bool> {
        let Some(task) = self.ctx.tasks.get_by_id(id).await? else {
            return Ok(false);
        };
        let audit = self.ctx.audit.list_for_task(id).await?;
        let marker = TaskAuditEntry::new(
            id,
            AuditEventType::Archived,
            format!("archived as {:?}", task.status),
        );
        self.ctx
            .archive
            .archive(&ArchivePayload { task, audit }, &marker)
            .await
    }

    /// Delete archives older than the retention window.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the purge fails.
    pub async fn purge(&self) -> Result<u64> {
        let removed = retention::purge(&self.ctx.db, self.ctx.config.retention_days).await?;
        if removed > 0 {
            info!(removed, retention_days = self.ctx.config.retention_days, "archives purged");
        }
        Ok(removed)
    }
}
