//! Cold storage for finished tasks.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::audit::TaskAuditEntry;
use crate::models::task::Task;
use crate::{AppError, Result};

use super::audit_repo::AuditRepo;
use super::db::Database;
use super::task_repo::task_status_str;
use super::{parse_ts, ts};

/// Snapshot written to the archive row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchivePayload {
    /// The task as it was when archived, chain included.
    pub task: Task,
    /// Its audit trail at that moment.
    pub audit: Vec<TaskAuditEntry>,
}

/// An archived task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedTask {
    /// Original task id.
    pub id: String,
    /// When it was archived.
    pub archived_at: DateTime<Utc>,
    /// Snapshot.
    pub payload: ArchivePayload,
}

/// Repository wrapper around `SQLite` for archived tasks.
#[derive(Clone)]
pub struct ArchiveRepo {
    db: Arc<Database>,
}

impl ArchiveRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Copy a task to the archive and delete it, atomically.
    ///
    /// The delete is guarded by the archivable condition, so a task that was
    /// reopened or lost its notice flag meanwhile is left untouched and
    /// `false` is returned.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if serialization or the transaction fails.
    pub async fn archive(&self, payload: &ArchivePayload, marker: &TaskAuditEntry) -> Result<bool> {
        let task = &payload.task;
        let body = serde_json::to_string(payload)
            .map_err(|err| AppError::Db(format!("failed to serialize archive: {err}")))?;

        let mut tx = self.db.begin().await?;

        sqlx::query(
            "INSERT OR REPLACE INTO task_archive (id, property_id, category, status, archived_at, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&task.id)
        .bind(&task.property_id)
        .bind(&task.category)
        .bind(task_status_str(task.status))
        .bind(ts(Utc::now()))
        .bind(&body)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM task_message_chain WHERE task_id = ?1")
            .bind(&task.id)
            .execute(&mut *tx)
            .await?;

        let deleted = sqlx::query(
            "DELETE FROM task WHERE id = ?1
             AND ((status = 'completed' AND completion_notified = 1) OR status = 'cancelled')",
        )
        .bind(&task.id)
        .execute(&mut *tx)
        .await?;

        if deleted.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        AuditRepo::insert_with(&mut *tx, marker).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Retrieve an archived task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query or payload decoding fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<ArchivedTask>> {
        let row: Option<(String, String, String)> =
            sqlx::query_as("SELECT id, archived_at, payload FROM task_archive WHERE id = ?1")
                .bind(id)
                .fetch_optional(self.db.as_ref())
                .await?;

        row.map(|(id, archived_at, payload)| {
            let payload = serde_json::from_str(&payload)
                .map_err(|err| AppError::Db(format!("invalid archive payload: {err}")))?;
            Ok(ArchivedTask {
                id,
                archived_at: parse_ts("archived_at", &archived_at)?,
                payload,
            })
        })
        .transpose()
    }
}
