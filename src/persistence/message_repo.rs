//! Conversation message repository.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::SqliteExecutor;

use crate::models::message::{ConversationMessage, MessageDirection, MessageState, SenderRole};
use crate::models::task::Task;
use crate::{AppError, Result};

use super::db::Database;
use super::{parse_ts, ts};

/// Repository wrapper around `SQLite` for inbound and outbound messages.
#[derive(Clone)]
pub struct MessageRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    property_id: String,
    booking_id: Option<String>,
    task_id: Option<String>,
    requester_address: String,
    sender_address: String,
    sender_role: String,
    direction: String,
    body: String,
    state: String,
    sender_id: Option<String>,
    in_reply_to: Option<String>,
    attempts: i64,
    created_at: String,
}

impl MessageRow {
    fn into_message(self) -> Result<ConversationMessage> {
        Ok(ConversationMessage {
            sender_role: parse_sender_role(&self.sender_role)?,
            direction: parse_direction(&self.direction)?,
            state: parse_message_state(&self.state)?,
            attempts: u32::try_from(self.attempts)
                .map_err(|err| AppError::Db(format!("invalid attempts: {err}")))?,
            created_at: parse_ts("created_at", &self.created_at)?,
            id: self.id,
            property_id: self.property_id,
            booking_id: self.booking_id,
            task_id: self.task_id,
            requester_address: self.requester_address,
            sender_address: self.sender_address,
            body: self.body,
            sender_id: self.sender_id,
            in_reply_to: self.in_reply_to,
        })
    }
}

fn parse_sender_role(s: &str) -> Result<SenderRole> {
    match s {
        "guest" => Ok(SenderRole::Guest),
        "staff" => Ok(SenderRole::Staff),
        "host" => Ok(SenderRole::Host),
        "system" => Ok(SenderRole::System),
        other => Err(AppError::Db(format!("invalid sender role: {other}"))),
    }
}

fn sender_role_str(r: SenderRole) -> &'static str {
    match r {
        SenderRole::Guest => "guest",
        SenderRole::Staff => "staff",
        SenderRole::Host => "host",
        SenderRole::System => "system",
    }
}

fn parse_direction(s: &str) -> Result<MessageDirection> {
    match s {
        "inbound" => Ok(MessageDirection::Inbound),
        "outbound" => Ok(MessageDirection::Outbound),
        other => Err(AppError::Db(format!("invalid direction: {other}"))),
    }
}

fn direction_str(d: MessageDirection) -> &'static str {
    match d {
        MessageDirection::Inbound => "inbound",
        MessageDirection::Outbound => "outbound",
    }
}

fn parse_message_state(s: &str) -> Result<MessageState> {
    match s {
        "pending" => Ok(MessageState::Pending),
        "processed" => Ok(MessageState::Processed),
        "unmatched" => Ok(MessageState::Unmatched),
        "failed" => Ok(MessageState::Failed),
        other => Err(AppError::Db(format!("invalid message state: {other}"))),
    }
}

fn message_state_str(s: MessageState) -> &'static str {
    match s {
        MessageState::Pending => "pending",
        MessageState::Processed => "processed",
        MessageState::Unmatched => "unmatched",
        MessageState::Failed => "failed",
    }
}

impl MessageRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Store a message. Returns `false` if its id is already stored.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn insert(&self, message: &ConversationMessage) -> Result<bool> {
        Self::insert_with(self.db.as_ref(), message).await
    }

    /// Store a message on an existing connection or transaction.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails.
    pub async fn insert_with<'e, E>(executor: E, message: &ConversationMessage) -> Result<bool>
    where
        E: SqliteExecutor<'e>,
    {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO message (id, property_id, booking_id, task_id,
             requester_address, sender_address, sender_role, direction, body, state,
             sender_id, in_reply_to, attempts, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        )
        .bind(&message.id)
        .bind(&message.property_id)
        .bind(&message.booking_id)
        .bind(&message.task_id)
        .bind(&message.requester_address)
        .bind(&message.sender_address)
        .bind(sender_role_str(message.sender_role))
        .bind(direction_str(message.direction))
        .bind(&message.body)
        .bind(message_state_str(message.state))
        .bind(&message.sender_id)
        .bind(&message.in_reply_to)
        .bind(i64::from(message.attempts))
        .bind(ts(message.created_at))
        .execute(executor)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Retrieve a message by identifier.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<ConversationMessage>> {
        let row: Option<MessageRow> = sqlx::query_as("SELECT * FROM message WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;
        row.map(MessageRow::into_message).transpose()
    }

    /// The conversation a task belongs to, oldest first.
    ///
    /// Includes every message with the task's guest at its property, every
    /// message on its booking, and every message linked to the task itself.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn thread_for(&self, task: &Task) -> Result<Vec<ConversationMessage>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT * FROM message
             WHERE (property_id = ?1 AND requester_address = ?2)
                OR (?3 IS NOT NULL AND booking_id = ?3)
                OR task_id = ?4
                OR id IN (SELECT message_id FROM task_message_chain WHERE task_id = ?4)
             ORDER BY created_at ASC, rowid ASC",
        )
        .bind(&task.property_id)
        .bind(&task.requester_address)
        .bind(&task.booking_id)
        .bind(&task.id)
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(MessageRow::into_message).collect()
    }

    /// Record who an inbound message turned out to come from.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn attribute(
        &self,
        id: &str,
        role: SenderRole,
        task: &Task,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE message SET sender_role = ?1, task_id = COALESCE(task_id, ?2),
             property_id = CASE WHEN property_id = '' THEN ?3 ELSE property_id END,
             requester_address = CASE WHEN requester_address = '' THEN ?4
                                      ELSE requester_address END,
             booking_id = COALESCE(booking_id, ?5)
             WHERE id = ?6",
        )
        .bind(sender_role_str(role))
        .bind(&task.id)
        .bind(&task.property_id)
        .bind(&task.requester_address)
        .bind(&task.booking_id)
        .bind(id)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Set the processing state of a message.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn set_state(&self, id: &str, state: MessageState) -> Result<()> {
        sqlx::query("UPDATE message SET state = ?1 WHERE id = ?2")
            .bind(message_state_str(state))
            .bind(id)
            .execute(self.db.as_ref())
            .await?;
        Ok(())
    }

    /// Count a failed evaluation and return the new attempt count.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the message does not exist, or
    /// `AppError::Db` if the update fails.
    pub async fn increment_attempts(&self, id: &str) -> Result<u32> {
        let (attempts,): (i64,) = sqlx::query_as(
            "UPDATE message SET attempts = attempts + 1 WHERE id = ?1 RETURNING attempts",
        )
        .bind(id)
        .fetch_optional(self.db.as_ref())
        .await?
        .ok_or_else(|| AppError::NotFound(format!("message {id}")))?;
        u32::try_from(attempts).map_err(|err| AppError::Db(format!("invalid attempts: {err}")))
    }

    /// Pending inbound messages received at or before `cutoff`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn pending_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<ConversationMessage>> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT * FROM message WHERE state = 'pending' AND direction = 'inbound'
             AND created_at <= ?1 ORDER BY created_at ASC",
        )
        .bind(ts(cutoff))
        .fetch_all(self.db.as_ref())
        .await?;
        rows.into_iter().map(MessageRow::into_message).collect()
    }
}
