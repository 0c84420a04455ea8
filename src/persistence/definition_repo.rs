//! Task definition repository.

use std::sync::Arc;

use crate::models::definition::TaskDefinition;
use crate::Result;

use super::db::Database;

/// Repository wrapper around `SQLite` for property task definitions.
#[derive(Clone)]
pub struct DefinitionRepo {
    db: Arc<Database>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct DefinitionRow {
    id: String,
    property_id: String,
    label: String,
    staff_requirements: String,
    guest_requirements: String,
    host_escalation_criteria: String,
    staff_id: Option<String>,
    staff_address: Option<String>,
}

impl From<DefinitionRow> for TaskDefinition {
    fn from(row: DefinitionRow) -> Self {
        Self {
            id: row.id,
            property_id: row.property_id,
            label: row.label,
            staff_requirements: row.staff_requirements,
            guest_requirements: row.guest_requirements,
            host_escalation_criteria: row.host_escalation_criteria,
            staff_id: row.staff_id,
            staff_address: row.staff_address,
        }
    }
}

impl DefinitionRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Provision a definition, replacing any with the same property and label.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn upsert(&self, definition: &TaskDefinition) -> Result<()> {
        sqlx::query(
            "INSERT INTO task_definition (id, property_id, label, staff_requirements,
             guest_requirements, host_escalation_criteria, staff_id, staff_address)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(property_id, label) DO UPDATE SET
             staff_requirements = excluded.staff_requirements,
             guest_requirements = excluded.guest_requirements,
             host_escalation_criteria = excluded.host_escalation_criteria,
             staff_id = excluded.staff_id, staff_address = excluded.staff_address",
        )
        .bind(&definition.id)
        .bind(&definition.property_id)
        .bind(&definition.label)
        .bind(&definition.staff_requirements)
        .bind(&definition.guest_requirements)
        .bind(&definition.host_escalation_criteria)
        .bind(&definition.staff_id)
        .bind(&definition.staff_address)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// All definitions for a property, in label order.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list_for_property(&self, property_id: &str) -> Result<Vec<TaskDefinition>> {
        let rows: Vec<DefinitionRow> = sqlx::query_as(
            "SELECT * FROM task_definition WHERE property_id = ?1 ORDER BY label ASC",
        )
        .bind(property_id)
        .fetch_all(self.db.as_ref())
        .await?;
        Ok(rows.into_iter().map(TaskDefinition::from).collect())
    }
}
