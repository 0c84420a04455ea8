//! Task repository for `SQLite` persistence.
//!
//! Every lifecycle write is conditional: claims match on a guard plus a free
//! or expired lease, and status changes match on the status the caller read.
//! A write that affects zero rows means another worker got there first.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::types::Json;
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::models::audit::TaskAuditEntry;
use crate::models::message::ConversationMessage;
use crate::models::task::{ActionHolder, Task, TaskStatus};
use crate::{AppError, Result};

use super::audit_repo::AuditRepo;
use super::db::Database;
use super::message_repo::MessageRepo;
use super::{now_ts, parse_opt_ts, parse_ts, ts};

/// Repository wrapper around `SQLite` for task records and their message chains.
#[derive(Clone)]
pub struct TaskRepo {
    db: Arc<Database>,
}

/// Condition a task must satisfy for a claim to be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimGuard {
    /// Current holder not yet notified this round, task still in `expected`.
    ActionHolder(TaskStatus),
    /// Guest update owed and task still in `expected`.
    GuestUpdate(TaskStatus),
    /// Guest owed a request for missing details not yet sent.
    GuestInfoRequest,
    /// Completed and the completion notice not yet sent.
    CompletionNotice,
}

/// State a successful delivery records on the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchEffect {
    /// The party that must act next was notified.
    ActionHolder {
        /// Status read before the decision was made.
        expected: TaskStatus,
        /// Status after notification.
        next_status: TaskStatus,
        /// New action holder.
        holder: ActionHolder,
        /// Whether the host was involved.
        host_escalation_needed: bool,
    },
    /// The guest was told work is scheduled.
    GuestUpdate {
        /// Status the update describes.
        expected: TaskStatus,
    },
    /// The guest was asked for missing details.
    GuestInfoRequest,
    /// The guest was told the request is resolved.
    CompletionNotice,
}

impl DispatchEffect {
    /// Claim guard matching this effect.
    #[must_use]
    pub fn guard(self) -> ClaimGuard {
        match self {
            Self::ActionHolder { expected, .. } => ClaimGuard::ActionHolder(expected),
            Self::GuestUpdate { expected } => ClaimGuard::GuestUpdate(expected),
            Self::GuestInfoRequest => ClaimGuard::GuestInfoRequest,
            Self::CompletionNotice => ClaimGuard::CompletionNotice,
        }
    }

    /// Guest updates and info requests keep their own attempt count and
    /// never escalate the task.
    #[must_use]
    pub fn is_guest_notice(self) -> bool {
        matches!(self, Self::GuestUpdate { .. } | Self::GuestInfoRequest)
    }
}

/// An exclusive, time-limited right to dispatch for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    /// Claimed task.
    pub task_id: String,
    /// Opaque owner token.
    pub token: String,
}

/// How much of the notification round a status change resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rearm {
    /// Leave notification flags alone.
    No,
    /// A reply asked for a new round: clear `action_holder_notified` and attempts.
    AfterReply,
    /// Operator reset: also forget the previous outbound message.
    Full,
}

/// A compare-and-set status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    /// Target status.
    pub status: TaskStatus,
    /// New holder; `None` keeps the current one.
    pub action_holder: Option<ActionHolder>,
    /// Notification round reset.
    pub rearm: Rearm,
    /// Mark that a reply arrived.
    pub response_received: bool,
    /// New escalation reason; `None` keeps the current one.
    pub escalation_reason: Option<String>,
    /// Owe the guest an update on the new status.
    pub notify_guest: bool,
}

impl StatusUpdate {
    /// Plain status change with no side effects.
    #[must_use]
    pub fn to(status: TaskStatus) -> Self {
        Self {
            status,
            action_holder: None,
            rearm: Rearm::No,
            response_received: false,
            escalation_reason: None,
            notify_guest: false,
        }
    }
}

/// Result of recording a failed oracle or transport attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureOutcome {
    /// Attempts after the increment.
    pub attempts: u32,
    /// The cap was reached on this failure.
    pub exhausted: bool,
    /// The task was moved to `Escalated`.
    pub escalated: bool,
}

/// Filters for task listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    /// Only tasks in this status.
    pub status: Option<TaskStatus>,
    /// Only tasks at this property.
    pub property_id: Option<String>,
    /// Only tasks held by this party.
    pub action_holder: Option<ActionHolder>,
    /// Only open tasks with no staff contact.
    pub unassigned: bool,
    /// Maximum rows returned.
    pub limit: Option<u32>,
}

/// Text fields an operator may edit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskDetails {
    /// Replacement staff requirements.
    pub staff_requirements: Option<String>,
    /// Replacement guest requirements.
    pub guest_requirements: Option<String>,
    /// Replacement host escalation criteria.
    pub host_escalation_criteria: Option<String>,
    /// Replacement escalation reason.
    pub escalation_reason: Option<String>,
}

impl TaskDetails {
    /// Whether nothing would change.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.staff_requirements.is_none()
            && self.guest_requirements.is_none()
            && self.host_escalation_criteria.is_none()
            && self.escalation_reason.is_none()
    }
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: String,
    category: String,
    request_text: String,
    property_id: String,
    booking_id: Option<String>,
    requester_address: String,
    staff_id: Option<String>,
    staff_address: Option<String>,
    source_event_id: String,
    staff_requirements: String,
    guest_requirements: String,
    host_escalation_criteria: String,
    status: String,
    action_holder: String,
    action_holder_address: Option<String>,
    action_holder_notified: bool,
    response_received: bool,
    completion_notified: bool,
    host_escalation_needed: bool,
    escalation_reason: Option<String>,
    guest_info_requested: bool,
    guest_info_missing: Option<Json<Vec<String>>>,
    guest_update_pending: bool,
    guest_notice_attempts: i64,
    attempts: i64,
    last_outbound_message: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl TaskRow {
    /// Convert a database row into the domain model.
    fn into_task(self, message_chain: Vec<String>) -> Result<Task> {
        Ok(Task {
            status: parse_task_status(&self.status)?,
            action_holder: parse_action_holder(&self.action_holder)?,
            attempts: u32::try_from(self.attempts)
                .map_err(|err| AppError::Db(format!("invalid attempts: {err}")))?,
            guest_notice_attempts: u32::try_from(self.guest_notice_attempts)
                .map_err(|err| AppError::Db(format!("invalid guest notice attempts: {err}")))?,
            created_at: parse_ts("created_at", &self.created_at)?,
            updated_at: parse_ts("updated_at", &self.updated_at)?,
            completed_at: parse_opt_ts("completed_at", self.completed_at.as_deref())?,
            id: self.id,
            category: self.category,
            request_text: self.request_text,
            property_id: self.property_id,
            booking_id: self.booking_id,
            requester_address: self.requester_address,
            staff_id: self.staff_id,
            staff_address: self.staff_address,
            source_event_id: self.source_event_id,
            staff_requirements: self.staff_requirements,
            guest_requirements: self.guest_requirements,
            host_escalation_criteria: self.host_escalation_criteria,
            action_holder_address: self.action_holder_address,
            action_holder_notified: self.action_holder_notified,
            response_received: self.response_received,
            completion_notified: self.completion_notified,
            host_escalation_needed: self.host_escalation_needed,
            escalation_reason: self.escalation_reason,
            guest_info_requested: self.guest_info_requested,
            guest_info_missing: self.guest_info_missing.map(|Json(missing)| missing),
            guest_update_pending: self.guest_update_pending,
            last_outbound_message: self.last_outbound_message,
            message_chain,
        })
    }
}

/// Parse a stored task status.
///
/// # Errors
///
/// Returns `AppError::Db` for an unknown value.
pub fn parse_task_status(s: &str) -> Result<TaskStatus> {
    match s {
        "waiting_on_guest" => Ok(TaskStatus::WaitingOnGuest),
        "waiting_on_staff" => Ok(TaskStatus::WaitingOnStaff),
        "waiting_on_host" => Ok(TaskStatus::WaitingOnHost),
        "scheduled" => Ok(TaskStatus::Scheduled),
        "in_progress" => Ok(TaskStatus::InProgress),
        "escalated" => Ok(TaskStatus::Escalated),
        "completed" => Ok(TaskStatus::Completed),
        "cancelled" => Ok(TaskStatus::Cancelled),
        other => Err(AppError::Db(format!("invalid task status: {other}"))),
    }
}

/// Storage name of a task status.
#[must_use]
pub fn task_status_str(s: TaskStatus) -> &'static str {
    match s {
        TaskStatus::WaitingOnGuest => "waiting_on_guest",
        TaskStatus::WaitingOnStaff => "waiting_on_staff",
        TaskStatus::WaitingOnHost => "waiting_on_host",
        TaskStatus::Scheduled => "scheduled",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::Escalated => "escalated",
        TaskStatus::Completed => "completed",
        TaskStatus::Cancelled => "cancelled",
    }
}

/// Parse a stored action holder.
///
/// # Errors
///
/// Returns `AppError::Db` for an unknown value.
pub fn parse_action_holder(s: &str) -> Result<ActionHolder> {
    match s {
        "guest" => Ok(ActionHolder::Guest),
        "staff" => Ok(ActionHolder::Staff),
        "host" => Ok(ActionHolder::Host),
        other => Err(AppError::Db(format!("invalid action holder: {other}"))),
    }
}

/// Storage name of an action holder.
#[must_use]
pub fn action_holder_str(h: ActionHolder) -> &'static str {
    match h {
        ActionHolder::Guest => "guest",
        ActionHolder::Staff => "staff",
        ActionHolder::Host => "host",
    }
}

const OPEN: &str = "status NOT IN ('completed','cancelled')";
const CLAIM_FREE: &str = "(claim_token IS NULL OR claim_expires_at < ?)";

impl TaskRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert a new task together with its creation audit entries.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Duplicate` if an open task already exists for the
    /// same requester, property and category, or `AppError::Db` on other
    /// failures.
    pub async fn create(&self, task: &Task, audit: &[TaskAuditEntry]) -> Result<Task> {
        let mut tx = self.db.begin().await?;

        sqlx::query(
            "INSERT INTO task (id, category, category_key, request_text, property_id, booking_id,
             requester_address, staff_id, staff_address, source_event_id, staff_requirements,
             guest_requirements, host_escalation_criteria, status, action_holder,
             action_holder_address, action_holder_notified, response_received, completion_notified,
             host_escalation_needed, escalation_reason, guest_info_requested, guest_info_missing,
             guest_update_pending, guest_notice_attempts, attempts, last_outbound_message,
             created_at, updated_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
             ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30)",
        )
        .bind(&task.id)
        .bind(&task.category)
        .bind(task.category_key())
        .bind(&task.request_text)
        .bind(&task.property_id)
        .bind(&task.booking_id)
        .bind(&task.requester_address)
        .bind(&task.staff_id)
        .bind(&task.staff_address)
        .bind(&task.source_event_id)
        .bind(&task.staff_requirements)
        .bind(&task.guest_requirements)
        .bind(&task.host_escalation_criteria)
        .bind(task_status_str(task.status))
        .bind(action_holder_str(task.action_holder))
        .bind(&task.action_holder_address)
        .bind(task.action_holder_notified)
        .bind(task.response_received)
        .bind(task.completion_notified)
        .bind(task.host_escalation_needed)
        .bind(&task.escalation_reason)
        .bind(task.guest_info_requested)
        .bind(task.guest_info_missing.as_ref().map(Json))
        .bind(task.guest_update_pending)
        .bind(i64::from(task.guest_notice_attempts))
        .bind(i64::from(task.attempts))
        .bind(&task.last_outbound_message)
        .bind(ts(task.created_at))
        .bind(ts(task.updated_at))
        .bind(task.completed_at.map(ts))
        .execute(&mut *tx)
        .await?;

        for message_id in &task.message_chain {
            append_chain(&mut tx, &task.id, message_id).await?;
        }
        for entry in audit {
            AuditRepo::insert_with(&mut *tx, entry).await?;
        }

        tx.commit().await?;
        Ok(task.clone())
    }

    /// Retrieve a task by identifier, including its message chain.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<Task>> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM task WHERE id = ?1")
            .bind(id)
            .fetch_optional(self.db.as_ref())
            .await?;

        match row {
            Some(row) => {
                let chain = self.chain(&row.id).await?;
                row.into_task(chain).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Most recent open task for a requester, property and category.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn find_open_for(
        &self,
        requester_address: &str,
        property_id: &str,
        category_key: &str,
    ) -> Result<Option<Task>> {
        let sql = format!(
            "SELECT * FROM task WHERE requester_address = ?1 AND property_id = ?2
             AND category_key = ?3 AND {OPEN} ORDER BY created_at DESC LIMIT 1"
        );
        let row: Option<TaskRow> = sqlx::query_as(&sql)
            .bind(requester_address)
            .bind(property_id)
            .bind(category_key)
            .fetch_optional(self.db.as_ref())
            .await?;

        match row {
            Some(row) => {
                let chain = self.chain(&row.id).await?;
                row.into_task(chain).map(Some)
            }
            None => Ok(None),
        }
    }

    /// List tasks matching a filter, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        let mut sql = String::from("SELECT * FROM task WHERE 1 = 1");
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.property_id.is_some() {
            sql.push_str(" AND property_id = ?");
        }
        if filter.action_holder.is_some() {
            sql.push_str(" AND action_holder = ?");
        }
        if filter.unassigned {
            sql.push_str(" AND (staff_address IS NULL OR TRIM(staff_address) = '') AND ");
            sql.push_str(OPEN);
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ?");

        let mut query = sqlx::query_as::<_, TaskRow>(&sql);
        if let Some(status) = filter.status {
            query = query.bind(task_status_str(status));
        }
        if let Some(property_id) = &filter.property_id {
            query = query.bind(property_id);
        }
        if let Some(holder) = filter.action_holder {
            query = query.bind(action_holder_str(holder));
        }
        let limit = filter.limit.map_or(-1, i64::from);
        let rows = query.bind(limit).fetch_all(self.db.as_ref()).await?;
        self.hydrate(rows).await
    }

    /// Open tasks ready for a triage decision.
    ///
    /// Excludes tasks whose holder was already notified this round, tasks
    /// still waiting on an answer to the last outbound message, tasks at the
    /// attempt cap, tasks with a live claim, and unassigned tasks unless the
    /// host must be reached.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn triage_candidates(&self, max_attempts: u32) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT * FROM task WHERE {OPEN} AND completion_notified = 0
             AND action_holder_notified = 0
             AND NOT (last_outbound_message IS NOT NULL AND response_received = 0)
             AND attempts < ? AND {CLAIM_FREE}
             AND ((staff_address IS NOT NULL AND TRIM(staff_address) <> '')
                  OR status = 'escalated' OR host_escalation_needed = 1)
             ORDER BY created_at ASC"
        );
        let rows: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(i64::from(max_attempts))
            .bind(now_ts())
            .fetch_all(self.db.as_ref())
            .await?;
        self.hydrate(rows).await
    }

    /// Completed tasks whose guest notice has not been delivered.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn completion_candidates(&self, max_attempts: u32) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT * FROM task WHERE status = 'completed' AND completion_notified = 0
             AND attempts < ? AND {CLAIM_FREE} ORDER BY completed_at ASC"
        );
        let rows: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(i64::from(max_attempts))
            .bind(now_ts())
            .fetch_all(self.db.as_ref())
            .await?;
        self.hydrate(rows).await
    }

    /// Open tasks that still owe the guest an update or an info request.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn guest_notice_candidates(&self, max_attempts: u32) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT * FROM task WHERE {OPEN} AND guest_notice_attempts < ? AND {CLAIM_FREE}
             AND ((status = 'scheduled' AND guest_update_pending = 1)
                  OR (guest_info_requested = 0 AND guest_info_missing IS NOT NULL))
             ORDER BY updated_at ASC"
        );
        let rows: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(i64::from(max_attempts))
            .bind(now_ts())
            .fetch_all(self.db.as_ref())
            .await?;
        self.hydrate(rows).await
    }

    /// Ids of tasks ready for cold storage.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn archivable_ids(&self, limit: u32) -> Result<Vec<String>> {
        let ids: Vec<(String,)> = sqlx::query_as(
            "SELECT id FROM task
             WHERE (status = 'completed' AND completion_notified = 1) OR status = 'cancelled'
             ORDER BY updated_at ASC LIMIT ?1",
        )
        .bind(i64::from(limit))
        .fetch_all(self.db.as_ref())
        .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    /// Open tasks whose chain contains `message_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn open_with_chain_message(&self, message_id: &str) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT * FROM task WHERE {OPEN} AND id IN
             (SELECT task_id FROM task_message_chain WHERE message_id = ?1)
             ORDER BY created_at DESC"
        );
        let rows: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(message_id)
            .fetch_all(self.db.as_ref())
            .await?;
        self.hydrate(rows).await
    }

    /// Open tasks assigned to a staff identity.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn open_by_staff_id(&self, staff_id: &str) -> Result<Vec<Task>> {
        let sql =
            format!("SELECT * FROM task WHERE {OPEN} AND staff_id = ?1 ORDER BY created_at DESC");
        let rows: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(staff_id)
            .fetch_all(self.db.as_ref())
            .await?;
        self.hydrate(rows).await
    }

    /// Open tasks whose staff or current holder was reached at `address`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn open_by_responder_address(&self, address: &str) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT * FROM task WHERE {OPEN}
             AND (staff_address = ?1 OR action_holder_address = ?1) ORDER BY created_at DESC"
        );
        let rows: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(address)
            .fetch_all(self.db.as_ref())
            .await?;
        self.hydrate(rows).await
    }

    /// Open tasks raised by the guest at `address`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn open_by_requester(&self, address: &str) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT * FROM task WHERE {OPEN} AND requester_address = ?1 ORDER BY created_at DESC"
        );
        let rows: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(address)
            .fetch_all(self.db.as_ref())
            .await?;
        self.hydrate(rows).await
    }

    /// Open tasks at a property waiting on staff or host.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn open_waiting_at_property(&self, property_id: &str) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(
            "SELECT * FROM task WHERE property_id = ?1
             AND status IN ('waiting_on_staff','waiting_on_host') ORDER BY created_at DESC",
        )
        .bind(property_id)
        .fetch_all(self.db.as_ref())
        .await?;
        self.hydrate(rows).await
    }

    /// Open tasks touching an address or property, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn open_touching(
        &self,
        address: &str,
        property_id: Option<&str>,
    ) -> Result<Vec<Task>> {
        let sql = format!(
            "SELECT * FROM task WHERE {OPEN} AND (property_id = ?1 OR requester_address = ?2
             OR staff_address = ?2 OR action_holder_address = ?2) ORDER BY created_at DESC"
        );
        let rows: Vec<TaskRow> = sqlx::query_as(&sql)
            .bind(property_id)
            .bind(address)
            .fetch_all(self.db.as_ref())
            .await?;
        self.hydrate(rows).await
    }

    /// Ordered message ids on a task's chain.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn chain(&self, task_id: &str) -> Result<Vec<String>> {
        let ids: Vec<(String,)> = sqlx::query_as(
            "SELECT message_id FROM task_message_chain WHERE task_id = ?1 ORDER BY seq ASC",
        )
        .bind(task_id)
        .fetch_all(self.db.as_ref())
        .await?;
        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    /// Append a message to a task's chain and record it, without any transition.
    ///
    /// Returns `false` if the message was already on the chain.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn link_message(
        &self,
        task_id: &str,
        message: &ConversationMessage,
        audit: Option<&TaskAuditEntry>,
    ) -> Result<bool> {
        let mut tx = self.db.begin().await?;
        MessageRepo::insert_with(&mut *tx, message).await?;
        let appended = append_chain(&mut tx, task_id, &message.id).await?;
        if appended {
            touch(&mut tx, task_id).await?;
            if let Some(entry) = audit {
                AuditRepo::insert_with(&mut *tx, entry).await?;
            }
        }
        tx.commit().await?;
        Ok(appended)
    }

    /// Take the dispatch claim on a task.
    ///
    /// Returns `None` if the guard does not hold or another worker holds a
    /// live claim.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn claim(
        &self,
        task_id: &str,
        guard: ClaimGuard,
        lease: Duration,
    ) -> Result<Option<Claim>> {
        let token = Uuid::new_v4().to_string();
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease)
            .map_err(|err| AppError::Config(format!("invalid claim lease: {err}")))?;

        let (guard_sql, expected) = match guard {
            ClaimGuard::ActionHolder(status) => (
                "action_holder_notified = 0 AND completion_notified = 0 AND status = ?",
                Some(status),
            ),
            ClaimGuard::GuestUpdate(status) => {
                ("guest_update_pending = 1 AND status = ?", Some(status))
            }
            ClaimGuard::GuestInfoRequest => (
                "guest_info_requested = 0 AND guest_info_missing IS NOT NULL
                 AND status NOT IN ('completed','cancelled')",
                None,
            ),
            ClaimGuard::CompletionNotice => {
                ("status = 'completed' AND completion_notified = 0", None)
            }
        };

        let sql = format!(
            "UPDATE task SET claim_token = ?, claim_expires_at = ?
             WHERE id = ? AND {CLAIM_FREE} AND {guard_sql}"
        );
        let mut query = sqlx::query(&sql)
            .bind(&token)
            .bind(ts(now + lease))
            .bind(task_id)
            .bind(ts(now));
        if let Some(status) = expected {
            query = query.bind(task_status_str(status));
        }
        let result = query.execute(self.db.as_ref()).await?;

        Ok((result.rows_affected() == 1).then(|| Claim {
            task_id: task_id.to_owned(),
            token,
        }))
    }

    /// Give up a claim without recording anything.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn release_claim(&self, claim: &Claim) -> Result<()> {
        sqlx::query(
            "UPDATE task SET claim_token = NULL, claim_expires_at = NULL
             WHERE id = ?1 AND claim_token = ?2",
        )
        .bind(&claim.task_id)
        .bind(&claim.token)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Record a delivered message and its effect, releasing the claim.
    ///
    /// Returns `false` if the claim was lost or the task moved on meanwhile;
    /// nothing is written in that case.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the transaction fails.
    pub async fn apply_dispatch(
        &self,
        claim: &Claim,
        effect: DispatchEffect,
        message: &ConversationMessage,
        audit: &[TaskAuditEntry],
    ) -> Result<bool> {
        let mut tx = self.db.begin().await?;
        let now = now_ts();

        let result = match effect {
            DispatchEffect::ActionHolder {
                expected,
                next_status,
                holder,
                host_escalation_needed,
            } => {
                sqlx::query(
                    "UPDATE task SET status = ?1, action_holder = ?2, action_holder_address = ?3,
                     action_holder_notified = 1, response_received = 0, last_outbound_message = ?4,
                     host_escalation_needed = ?5, attempts = 0, claim_token = NULL,
                     claim_expires_at = NULL, updated_at = ?6
                     WHERE id = ?7 AND claim_token = ?8 AND status = ?9",
                )
                .bind(task_status_str(next_status))
                .bind(action_holder_str(holder))
                .bind(&message.sender_address)
                .bind(&message.body)
                .bind(host_escalation_needed)
                .bind(&now)
                .bind(&claim.task_id)
                .bind(&claim.token)
                .bind(task_status_str(expected))
                .execute(&mut *tx)
                .await?
            }
            DispatchEffect::GuestUpdate { expected } => {
                sqlx::query(
                    "UPDATE task SET guest_update_pending = 0, guest_notice_attempts = 0,
                     claim_token = NULL, claim_expires_at = NULL, updated_at = ?1
                     WHERE id = ?2 AND claim_token = ?3 AND status = ?4",
                )
                .bind(&now)
                .bind(&claim.task_id)
                .bind(&claim.token)
                .bind(task_status_str(expected))
                .execute(&mut *tx)
                .await?
            }
            DispatchEffect::GuestInfoRequest => {
                sqlx::query(
                    "UPDATE task SET guest_info_requested = 1, guest_info_missing = NULL,
                     guest_notice_attempts = 0, claim_token = NULL, claim_expires_at = NULL,
                     updated_at = ?1 WHERE id = ?2 AND claim_token = ?3",
                )
                .bind(&now)
                .bind(&claim.task_id)
                .bind(&claim.token)
                .execute(&mut *tx)
                .await?
            }
            DispatchEffect::CompletionNotice => {
                sqlx::query(
                    "UPDATE task SET completion_notified = 1, attempts = 0, claim_token = NULL,
                     claim_expires_at = NULL, updated_at = ?1
                     WHERE id = ?2 AND claim_token = ?3 AND status = 'completed'",
                )
                .bind(&now)
                .bind(&claim.task_id)
                .bind(&claim.token)
                .execute(&mut *tx)
                .await?
            }
        };

        if result.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }

        MessageRepo::insert_with(&mut *tx, message).await?;
        append_chain(&mut tx, &claim.task_id, &message.id).await?;
        for entry in audit {
            AuditRepo::insert_with(&mut *tx, entry).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Count a failed attempt and release the claim.
    ///
    /// When the count reaches `max_attempts` on a task that is open and not
    /// already escalated, the task is escalated to the host with `reason`
    /// and its attempt budget restarts for the host path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the transaction fails.
    pub async fn record_failure(
        &self,
        task_id: &str,
        claim: Option<&Claim>,
        max_attempts: u32,
        reason: &str,
        audit: &[TaskAuditEntry],
    ) -> Result<FailureOutcome> {
        let mut tx = self.db.begin().await?;
        let now = now_ts();

        let (attempts, status): (i64, String) = sqlx::query_as(
            "UPDATE task SET attempts = attempts + 1, updated_at = ?1 WHERE id = ?2
             RETURNING attempts, status",
        )
        .bind(&now)
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("task {task_id}")))?;

        if let Some(claim) = claim {
            sqlx::query(
                "UPDATE task SET claim_token = NULL, claim_expires_at = NULL
                 WHERE id = ?1 AND claim_token = ?2",
            )
            .bind(task_id)
            .bind(&claim.token)
            .execute(&mut *tx)
            .await?;
        }

        for entry in audit {
            AuditRepo::insert_with(&mut *tx, entry).await?;
        }

        let attempts = u32::try_from(attempts)
            .map_err(|err| AppError::Db(format!("invalid attempts: {err}")))?;
        let status = parse_task_status(&status)?;
        let exhausted = attempts >= max_attempts;
        let mut escalated = false;

        if exhausted && !status.is_terminal() && status != TaskStatus::Escalated {
            escalated = escalate_with(&mut tx, task_id, reason).await?;
        }

        tx.commit().await?;
        Ok(FailureOutcome {
            attempts,
            exhausted,
            escalated,
        })
    }

    /// Count a failed guest update or info request and release the claim.
    ///
    /// Never touches `attempts` or the task's status. Past `max_attempts` the
    /// notice stays owed but is no longer swept.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the task does not exist, or
    /// `AppError::Db` if the transaction fails.
    pub async fn record_guest_notice_failure(
        &self,
        task_id: &str,
        claim: Option<&Claim>,
        max_attempts: u32,
        audit: &[TaskAuditEntry],
    ) -> Result<FailureOutcome> {
        let mut tx = self.db.begin().await?;

        let (attempts,): (i64,) = sqlx::query_as(
            "UPDATE task SET guest_notice_attempts = guest_notice_attempts + 1, updated_at = ?1
             WHERE id = ?2 RETURNING guest_notice_attempts",
        )
        .bind(now_ts())
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("task {task_id}")))?;

        if let Some(claim) = claim {
            sqlx::query(
                "UPDATE task SET claim_token = NULL, claim_expires_at = NULL
                 WHERE id = ?1 AND claim_token = ?2",
            )
            .bind(task_id)
            .bind(&claim.token)
            .execute(&mut *tx)
            .await?;
        }
        for entry in audit {
            AuditRepo::insert_with(&mut *tx, entry).await?;
        }
        tx.commit().await?;

        let attempts = u32::try_from(attempts)
            .map_err(|err| AppError::Db(format!("invalid attempts: {err}")))?;
        Ok(FailureOutcome {
            attempts,
            exhausted: attempts >= max_attempts,
            escalated: false,
        })
    }

    /// Record that the guest must be asked for `missing` details.
    ///
    /// Returns `false` if the guest was already asked or the task is closed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn mark_guest_info_pending(&self, task_id: &str, missing: &[String]) -> Result<bool> {
        let sql = format!(
            "UPDATE task SET guest_info_missing = ?1, updated_at = ?2
             WHERE id = ?3 AND guest_info_requested = 0 AND {OPEN}"
        );
        let result = sqlx::query(&sql)
            .bind(Json(missing))
            .bind(now_ts())
            .bind(task_id)
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Restore the attempt budget of guest notices that ran out of retries.
    ///
    /// Covers the completion notice of a completed task that was never
    /// announced, and any scheduled update or info request still owed.
    /// Returns `false` if the task owes the guest nothing.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the transaction fails.
    pub async fn rearm_guest_notices(
        &self,
        task_id: &str,
        audit: &[TaskAuditEntry],
    ) -> Result<bool> {
        let mut tx = self.db.begin().await?;

        let sql = format!(
            "UPDATE task SET attempts = CASE WHEN status = 'completed' THEN 0 ELSE attempts END,
             guest_notice_attempts = 0, updated_at = ?1
             WHERE id = ?2 AND ((status = 'completed' AND completion_notified = 0)
                OR (status = 'scheduled' AND guest_update_pending = 1)
                OR ({OPEN} AND guest_info_requested = 0 AND guest_info_missing IS NOT NULL))"
        );
        let result = sqlx::query(&sql)
            .bind(now_ts())
            .bind(task_id)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }
        for entry in audit {
            AuditRepo::insert_with(&mut *tx, entry).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    /// Escalate an open task to the host outside of a dispatch round.
    ///
    /// Returns `false` if the task is already closed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the transaction fails.
    pub async fn escalate(
        &self,
        task_id: &str,
        reason: &str,
        audit: &[TaskAuditEntry],
    ) -> Result<bool> {
        let mut tx = self.db.begin().await?;
        let escalated = escalate_with(&mut tx, task_id, reason).await?;
        if escalated {
            for entry in audit {
                AuditRepo::insert_with(&mut *tx, entry).await?;
            }
        }
        tx.commit().await?;
        Ok(escalated)
    }

    /// Compare-and-set a status change.
    ///
    /// Returns `false` if the task is no longer in `expected`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the transaction fails.
    pub async fn update_status(
        &self,
        task_id: &str,
        expected: TaskStatus,
        update: &StatusUpdate,
        audit: &[TaskAuditEntry],
    ) -> Result<bool> {
        let mut tx = self.db.begin().await?;
        if !update_status_with(&mut tx, task_id, expected, update).await? {
            tx.rollback().await?;
            return Ok(false);
        }
        for entry in audit {
            AuditRepo::insert_with(&mut *tx, entry).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    /// Apply the outcome of evaluating a reply.
    ///
    /// Appends the reply to the chain and changes status in one transaction.
    /// Returns `false`, writing nothing, if the reply is already on the chain
    /// or the task left `expected` while the reply was being evaluated.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the transaction fails.
    pub async fn apply_reply(
        &self,
        task_id: &str,
        message_id: &str,
        expected: TaskStatus,
        update: &StatusUpdate,
        audit: &[TaskAuditEntry],
    ) -> Result<bool> {
        let mut tx = self.db.begin().await?;

        if !append_chain(&mut tx, task_id, message_id).await? {
            tx.rollback().await?;
            return Ok(false);
        }
        if !update_status_with(&mut tx, task_id, expected, update).await? {
            tx.rollback().await?;
            return Ok(false);
        }
        for entry in audit {
            AuditRepo::insert_with(&mut *tx, entry).await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    /// Point a task at new staff and start a fresh notification round.
    ///
    /// Returns `false` if the task left `expected` meanwhile.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the transaction fails.
    pub async fn assign_staff(
        &self,
        task_id: &str,
        expected: TaskStatus,
        staff_id: Option<&str>,
        staff_address: &str,
        audit: &[TaskAuditEntry],
    ) -> Result<bool> {
        let mut tx = self.db.begin().await?;

        let result = sqlx::query(
            "UPDATE task SET staff_id = ?1, staff_address = ?2, status = 'waiting_on_staff',
             action_holder = 'staff', action_holder_address = NULL, action_holder_notified = 0,
             response_received = 0, last_outbound_message = NULL, host_escalation_needed = 0,
             escalation_reason = NULL, attempts = 0, updated_at = ?3
             WHERE id = ?4 AND status = ?5",
        )
        .bind(staff_id)
        .bind(staff_address)
        .bind(now_ts())
        .bind(task_id)
        .bind(task_status_str(expected))
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }
        for entry in audit {
            AuditRepo::insert_with(&mut *tx, entry).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    /// Apply an operator edit: optional status change plus text fields.
    ///
    /// Returns `false` if the task left `expected` meanwhile.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the transaction fails.
    pub async fn apply_patch(
        &self,
        task_id: &str,
        expected: TaskStatus,
        update: Option<&StatusUpdate>,
        details: &TaskDetails,
        audit: &[TaskAuditEntry],
    ) -> Result<bool> {
        let mut tx = self.db.begin().await?;

        let result = sqlx::query(
            "UPDATE task SET staff_requirements = COALESCE(?1, staff_requirements),
             guest_requirements = COALESCE(?2, guest_requirements),
             host_escalation_criteria = COALESCE(?3, host_escalation_criteria),
             escalation_reason = COALESCE(?4, escalation_reason), updated_at = ?5
             WHERE id = ?6 AND status = ?7",
        )
        .bind(&details.staff_requirements)
        .bind(&details.guest_requirements)
        .bind(&details.host_escalation_criteria)
        .bind(&details.escalation_reason)
        .bind(now_ts())
        .bind(task_id)
        .bind(task_status_str(expected))
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() != 1 {
            tx.rollback().await?;
            return Ok(false);
        }
        if let Some(update) = update {
            if !update_status_with(&mut tx, task_id, expected, update).await? {
                tx.rollback().await?;
                return Ok(false);
            }
        }
        for entry in audit {
            AuditRepo::insert_with(&mut *tx, entry).await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn hydrate(&self, rows: Vec<TaskRow>) -> Result<Vec<Task>> {
        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let chain = self.chain(&row.id).await?;
            tasks.push(row.into_task(chain)?);
        }
        Ok(tasks)
    }
}

/// Insert a chain row; `false` if the message is already on the chain.
async fn append_chain(conn: &mut SqliteConnection, task_id: &str, message_id: &str) -> Result<bool> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO task_message_chain (task_id, message_id, created_at)
         VALUES (?1, ?2, ?3)",
    )
    .bind(task_id)
    .bind(message_id)
    .bind(now_ts())
    .execute(conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

async fn touch(conn: &mut SqliteConnection, task_id: &str) -> Result<()> {
    sqlx::query("UPDATE task SET updated_at = ?1 WHERE id = ?2")
        .bind(now_ts())
        .bind(task_id)
        .execute(conn)
        .await?;
    Ok(())
}

async fn escalate_with(conn: &mut SqliteConnection, task_id: &str, reason: &str) -> Result<bool> {
    let sql = format!(
        "UPDATE task SET status = 'escalated', action_holder = 'host', action_holder_notified = 0,
         response_received = 1, host_escalation_needed = 1, escalation_reason = ?1, attempts = 0,
         updated_at = ?2 WHERE id = ?3 AND {OPEN}"
    );
    let result = sqlx::query(&sql)
        .bind(reason)
        .bind(now_ts())
        .bind(task_id)
        .execute(conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

async fn update_status_with(
    conn: &mut SqliteConnection,
    task_id: &str,
    expected: TaskStatus,
    update: &StatusUpdate,
) -> Result<bool> {
    let now = now_ts();
    let completed_at = (update.status == TaskStatus::Completed).then(|| now.clone());
    let holder = update.action_holder.map(action_holder_str);

    let rearm_sql = match update.rearm {
        Rearm::No => "",
        Rearm::AfterReply => ", action_holder_notified = 0, attempts = 0",
        Rearm::Full => {
            ", action_holder_notified = 0, attempts = 0, response_received = 0,
             last_outbound_message = NULL, action_holder_address = NULL"
        }
    };
    let host_needed = matches!(
        update.status,
        TaskStatus::WaitingOnHost | TaskStatus::Escalated
    );
    let host_sql = if update.rearm == Rearm::Full {
        ", host_escalation_needed = ?"
    } else {
        ""
    };
    let guest_sql = if update.notify_guest {
        ", guest_update_pending = 1, guest_notice_attempts = 0"
    } else {
        ""
    };

    let sql = format!(
        "UPDATE task SET status = ?, action_holder = COALESCE(?, action_holder),
         response_received = MAX(response_received, ?),
         escalation_reason = COALESCE(?, escalation_reason),
         completed_at = COALESCE(?, completed_at), updated_at = ?{rearm_sql}{host_sql}{guest_sql}
         WHERE id = ? AND status = ?"
    );

    let mut query = sqlx::query(&sql)
        .bind(task_status_str(update.status))
        .bind(holder)
        .bind(update.response_received)
        .bind(&update.escalation_reason)
        .bind(completed_at)
        .bind(&now);
    if update.rearm == Rearm::Full {
        query = query.bind(host_needed);
    }
    let result = query
        .bind(task_id)
        .bind(task_status_str(expected))
        .execute(conn)
        .await?;

    Ok(result.rows_affected() == 1)
}
