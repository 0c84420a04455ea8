//! Consumed classification events, for idempotent ingestion.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

use super::db::Database;
use super::now_ts;

/// What happened to a classification event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    /// A new task was created.
    Created,
    /// Folded into an existing open task.
    Linked,
    /// Category was classifier noise.
    Discarded,
}

impl EventOutcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Linked => "linked",
            Self::Discarded => "discarded",
        }
    }

    fn parse(value: &str) -> Result<Self> {
        match value {
            "created" => Ok(Self::Created),
            "linked" => Ok(Self::Linked),
            "discarded" => Ok(Self::Discarded),
            other => Err(AppError::Db(format!("invalid event outcome: {other}"))),
        }
    }
}

/// Repository wrapper around `SQLite` for consumed event ids.
#[derive(Clone)]
pub struct EventRepo {
    db: Arc<Database>,
}

impl EventRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Outcome recorded for an event, if it was already consumed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn outcome(&self, event_id: &str) -> Result<Option<(EventOutcome, Option<String>)>> {
        let row: Option<(String, Option<String>)> =
            sqlx::query_as("SELECT outcome, task_id FROM consumed_event WHERE event_id = ?1")
                .bind(event_id)
                .fetch_optional(self.db.as_ref())
                .await?;
        row.map(|(outcome, task_id)| Ok((EventOutcome::parse(&outcome)?, task_id)))
            .transpose()
    }

    /// Mark an event consumed. Returns `false` if it already was.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn mark_consumed(
        &self,
        event_id: &str,
        outcome: EventOutcome,
        task_id: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO consumed_event (event_id, outcome, task_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(event_id)
        .bind(outcome.as_str())
        .bind(task_id)
        .bind(now_ts())
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
