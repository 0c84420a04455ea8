//! Operator task API.
//!
//! Manual edits go through the same transition table and status CAS as the
//! automated components, and every one leaves a `manual_override` entry.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, info_span, Instrument};

use crate::models::audit::{AuditEventType, TaskAuditEntry};
use crate::models::task::{ActionHolder, Task, TaskStatus};
use crate::persistence::task_repo::{Rearm, StatusUpdate, TaskDetails, TaskFilter};
use crate::{AppError, Result};

use super::triage::{TriageOutcome, TriageRouter};
use super::Context;

/// Fields an operator may change on a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TaskPatch {
    /// New status.
    pub status: Option<TaskStatus>,
    /// New action holder.
    pub action_holder: Option<ActionHolder>,
    /// Replacement staff requirements.
    pub staff_requirements: Option<String>,
    /// Replacement guest requirements.
    pub guest_requirements: Option<String>,
    /// Replacement host escalation criteria.
    pub host_escalation_criteria: Option<String>,
    /// Replacement escalation reason.
    pub escalation_reason: Option<String>,
}

impl TaskPatch {
    fn details(&self) -> TaskDetails {
        TaskDetails {
            staff_requirements: self.staff_requirements.clone(),
            guest_requirements: self.guest_requirements.clone(),
            host_escalation_criteria: self.host_escalation_criteria.clone(),
            escalation_reason: self.escalation_reason.clone(),
        }
    }

    fn is_empty(&self) -> bool {
        self.status.is_none() && self.action_holder.is_none() && self.details().is_empty()
    }
}

/// Result of assigning staff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssignOutcome {
    /// Task after routing.
    pub task: Task,
    /// What the immediate triage run did.
    pub triage: TriageOutcome,
}

/// Operator-facing task operations.
#[derive(Clone)]
pub struct TaskManager {
    ctx: Arc<Context>,
    triage: TriageRouter,
}

impl TaskManager {
    /// Create a manager over the shared context.
    #[must_use]
    pub fn new(ctx: Arc<Context>, triage: TriageRouter) -> Self {
        Self { ctx, triage }
    }

    /// Fetch a task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the task does not exist.
    pub async fn get_task(&self, id: &str) -> Result<Task> {
        self.ctx
            .tasks
            .get_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("task {id}")))
    }

    /// List tasks matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>> {
        self.ctx.tasks.list(filter).await
    }

    /// Audit trail of a live or archived task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the task is unknown.
    pub async fn task_audit(&self, id: &str) -> Result<Vec<TaskAuditEntry>> {
        let entries = self.ctx.audit.list_for_task(id).await?;
        if entries.is_empty()
            && self.ctx.tasks.get_by_id(id).await?.is_none()
            && self.ctx.archive.get_by_id(id).await?.is_none()
        {
            return Err(AppError::NotFound(format!("task {id}")));
        }
        Ok(entries)
    }

    /// Point a task at new staff and route it straight away.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidInput` for an empty address,
    /// `AppError::InvalidTransition` for a closed task, or
    /// `AppError::Conflict` if the task changed concurrently.
    pub async fn assign_staff(
        &self,
        id: &str,
        staff_id: Option<&str>,
        staff_address: &str,
    ) -> Result<AssignOutcome> {
        let staff_address = staff_address.trim();
        if staff_address.is_empty() {
            return Err(AppError::InvalidInput("staff_address must not be empty".into()));
        }

        let span = info_span!("assign_staff", task_id = %id);
        async {
            let task = self.get_task(id).await?;
            if !task.status.can_transition_to(TaskStatus::WaitingOnStaff) {
                return Err(AppError::InvalidTransition(format!(
                    "{:?} -> WaitingOnStaff",
                    task.status
                )));
            }

            let audit = [TaskAuditEntry::new(
                id,
                AuditEventType::ManualOverride,
                format!("staff assigned: {staff_address}"),
            )];
            let staff_id = staff_id.map(str::trim).filter(|s| !s.is_empty());
            if !self
                .ctx
                .tasks
                .assign_staff(id, task.status, staff_id, staff_address, &audit)
                .await?
            {
                return Err(AppError::Conflict(format!("task {id} changed during assignment")));
            }
            info!(staff_address, "staff assigned");

            let triage = self.triage.route(id).await?;
            Ok(AssignOutcome {
                task: self.get_task(id).await?,
                triage,
            })
        }
        .instrument(span)
        .await
    }

    /// Apply an operator edit.
    ///
    /// A status change into a state that needs a fresh outbound decision
    /// starts a new notification round.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` for a change the lifecycle does
    /// not allow, `AppError::InvalidInput` for a holder inconsistent with the
    /// status, or `AppError::Conflict` if the task changed concurrently.
    pub async fn patch_task(&self, id: &str, patch: &TaskPatch) -> Result<Task> {
        if patch.is_empty() {
            return Err(AppError::InvalidInput("patch changes nothing".into()));
        }
        let task = self.get_task(id).await?;
        if task.status.is_terminal() {
            return Err(AppError::InvalidTransition(format!(
                "{:?} tasks cannot be edited",
                task.status
            )));
        }

        let target = patch.status.unwrap_or(task.status);
        if target != task.status && !task.status.can_transition_to(target) {
            return Err(AppError::InvalidTransition(format!(
                "{:?} -> {target:?}",
                task.status
            )));
        }

        let holder = patch
            .action_holder
            .or_else(|| target.required_holder())
            .unwrap_or(task.action_holder);
        if !target.is_consistent_with(holder) {
            return Err(AppError::InvalidInput(format!(
                "{holder:?} cannot hold a {target:?} task"
            )));
        }

        let status_changed = target != task.status;
        let update = (status_changed || holder != task.action_holder).then(|| StatusUpdate {
            action_holder: Some(holder),
            rearm: if status_changed && target.needs_outbound_decision() {
                Rearm::Full
            } else {
                Rearm::No
            },
            ..StatusUpdate::to(target)
        });

        let mut audit = vec![TaskAuditEntry::new(
            id,
            AuditEventType::ManualOverride,
            describe(patch),
        )];
        if status_changed {
            audit.push(TaskAuditEntry::new(
                id,
                AuditEventType::StatusChanged,
                format!("{:?} -> {target:?}", task.status),
            ));
        }

        if !self
            .ctx
            .tasks
            .apply_patch(id, task.status, update.as_ref(), &patch.details(), &audit)
            .await?
        {
            return Err(AppError::Conflict(format!("task {id} changed during the edit")));
        }
        info!(task_id = %id, ?target, ?holder, "task patched");
        self.get_task(id).await
    }

    /// Give guest notices that ran out of retries a fresh attempt budget.
    ///
    /// Covers a completed task whose completion notice never went out, which
    /// otherwise stays in the live store forever, and a scheduled update or
    /// info request still owed on an open task. The notices go out on the
    /// next pass.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if the task does not exist, or
    /// `AppError::InvalidInput` if the task owes the guest nothing.
    pub async fn renotify(&self, id: &str) -> Result<Task> {
        let task = self.get_task(id).await?;
        let audit = [TaskAuditEntry::new(
            id,
            AuditEventType::ManualOverride,
            format!(
                "guest notices re-armed after {} failed attempts",
                task.attempts.max(task.guest_notice_attempts)
            ),
        )];
        if !self.ctx.tasks.rearm_guest_notices(id, &audit).await? {
            return Err(AppError::InvalidInput(format!(
                "task {id} owes the guest no notice"
            )));
        }
        info!(task_id = %id, status = ?task.status, "guest notices re-armed");
        self.get_task(id).await
    }

    /// Mark a task completed. The completion notice follows on the next pass.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` for a closed task, or
    /// `AppError::Conflict` if the task changed concurrently.
    pub async fn complete_task(&self, id: &str) -> Result<Task> {
        self.close(id, TaskStatus::Completed, "completed by operator".into())
            .await
    }

    /// Cancel a task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::InvalidTransition` for a closed task, or
    /// `AppError::Conflict` if the task changed concurrently.
    pub async fn cancel_task(&self, id: &str, reason: Option<&str>) -> Result<Task> {
        let detail = match reason {
            Some(reason) if !reason.trim().is_empty() => {
                format!("cancelled by operator: {}", reason.trim())
            }
            _ => "cancelled by operator".to_owned(),
        };
        self.close(id, TaskStatus::Cancelled, detail).await
    }

    async fn close(&self, id: &str, status: TaskStatus, detail: String) -> Result<Task> {
        let task = self.get_task(id).await?;
        if !task.status.can_transition_to(status) {
            return Err(AppError::InvalidTransition(format!(
                "{:?} -> {status:?}",
                task.status
            )));
        }

        let audit = [
            TaskAuditEntry::new(id, AuditEventType::ManualOverride, detail),
            TaskAuditEntry::new(
                id,
                AuditEventType::StatusChanged,
                format!("{:?} -> {status:?}", task.status),
            ),
        ];
        if !self
            .ctx
            .tasks
            .update_status(id, task.status, &StatusUpdate::to(status), &audit)
            .await?
        {
            return Err(AppError::Conflict(format!("task {id} changed concurrently")));
        }
        info!(task_id = %id, ?status, "task closed by operator");
        self.get_task(id).await
    }
}

fn describe(patch: &TaskPatch) -> String {
    let mut fields = Vec::new();
    if let Some(status) = patch.status {
        fields.push(format!("status={status:?}"));
    }
    if let Some(holder) = patch.action_holder {
        fields.push(format!("action_holder={holder:?}"));
    }
    for (name, value) in [
        ("staff_requirements", &patch.staff_requirements),
        ("guest_requirements", &patch.guest_requirements),
        ("host_escalation_criteria", &patch.host_escalation_criteria),
        ("escalation_reason", &patch.escalation_reason),
    ] {
        if value.is_some() {
            fields.push(name.to_owned());
        }
    }
    format!("patched {}", fields.join(", "))
}
