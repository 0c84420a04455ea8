//! Task audit trail repository.

use std::sync::Arc;

use sqlx::SqliteExecutor;

use crate::models::audit::{AuditEventType, TaskAuditEntry};
use crate::{AppError, Result};

use super::db::Database;
use super::{parse_ts, ts};

/// Repository wrapper around `SQLite` for append-only audit entries.
#[derive(Clone)]
pub struct AuditRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct AuditRow {
    id: String,
    task_id: String,
    event_type: String,
    detail: String,
    source_event_id: Option<String>,
    message_id: Option<String>,
    created_at: String,
}

impl AuditRow {
    fn into_entry(self) -> Result<TaskAuditEntry> {
        let event_type = AuditEventType::parse(&self.event_type)
            .ok_or_else(|| AppError::Db(format!("invalid audit event type: {}", self.event_type)))?;
        Ok(TaskAuditEntry {
            id: self.id,
            task_id: self.task_id,
            event_type,
            detail: self.detail,
            source_event_id: self.source_event_id,
            message_id: self.message_id,
            created_at: parse_ts("created_at", &self.created_at)?,
        })
    }
}

impl AuditRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Append an entry.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn append(&self, entry: &TaskAuditEntry) -> Result<()> {
        Self::insert_with(self.db.as_ref(), entry).await
    }

    /// Append an entry on an existing connection or transaction.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn insert_with<'e, E>(executor: E, entry: &TaskAuditEntry) -> Result<()>
    where
        E: SqliteExecutor<'e>,
    {
        sqlx::query(
            "INSERT INTO task_audit (id, task_id, event_type, detail, source_event_id,
             message_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(&entry.id)
        .bind(&entry.task_id)
        .bind(entry.event_type.as_str())
        .bind(&entry.detail)
        .bind(&entry.source_event_id)
        .bind(&entry.message_id)
        .bind(ts(entry.created_at))
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Entries for a task, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_task(&self, task_id: &str) -> Result<Vec<TaskAuditEntry>> {
        Self::list_with(self.db.as_ref(), task_id).await
    }

    /// Entries for a task on an existing connection or transaction.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_with<'e, E>(executor: E, task_id: &str) -> Result<Vec<TaskAuditEntry>>
    where
        E: SqliteExecutor<'e>,
    {
        let rows: Vec<AuditRow> = sqlx::query_as(
            "SELECT * FROM task_audit WHERE task_id = ?1 ORDER BY created_at ASC, rowid ASC",
        )
        .bind(task_id)
        .fetch_all(executor)
        .await?;
        rows.into_iter().map(AuditRow::into_entry).collect()
    }

    /// Count entries of one kind for a task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn count(&self, task_id: &str, event_type: AuditEventType) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM task_audit WHERE task_id = ?1 AND event_type = ?2",
        )
        .bind(task_id)
        .bind(event_type.as_str())
        .fetch_one(self.db.as_ref())
        .await?;
        u64::try_from(count).map_err(|err| AppError::Db(format!("invalid count: {err}")))
    }
}
