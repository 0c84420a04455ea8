//! Property contact lookup.

use std::sync::Arc;

use crate::Result;

use super::db::Database;

/// Repository wrapper around `SQLite` for property host contacts.
#[derive(Clone)]
pub struct PropertyRepo {
    db: Arc<Database>,
}

impl PropertyRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or replace a property's contact details.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn upsert(&self, id: &str, name: &str, host_address: Option<&str>) -> Result<()> {
        sqlx::query(
            "INSERT INTO property (id, name, host_address) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name,
             host_address = excluded.host_address",
        )
        .bind(id)
        .bind(name)
        .bind(host_address)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Host contact address for a property, if on record.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn host_address(&self, id: &str) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT host_address FROM property WHERE id = ?1")
                .bind(id)
                .fetch_optional(self.db.as_ref())
                .await?;
        Ok(row
            .and_then(|(address,)| address)
            .filter(|address| !address.trim().is_empty()))
    }
}
