//! Retention service for time-based purge of archived tasks.
//!
//! Deletes children first (audit entries, messages), then archive rows
//! older than `retention_days`.

use chrono::Utc;

use super::db::Database;
use super::ts;
use crate::Result;

/// Delete archived tasks older than `retention_days` with their audit
/// trail and messages. Returns the number of archives removed.
///
/// # Errors
///
/// Returns `AppError::Db` if any delete fails.
pub async fn purge(db: &Database, retention_days: u32) -> Result<u64> {
    let cutoff = ts(Utc::now() - chrono::Duration::days(i64::from(retention_days)));
    let mut tx = db.begin().await?;

    let child_tables = ["task_audit", "message"];
    for table in child_tables {
        // `table` comes from the fixed list above.
        let query = format!(
            "DELETE FROM {table} WHERE task_id IN \
             (SELECT id FROM task_archive WHERE archived_at < ?1)"
        );
        sqlx::query(&query).bind(&cutoff).execute(&mut *tx).await?;
    }

    let removed = sqlx::query("DELETE FROM task_archive WHERE archived_at < ?1")
        .bind(&cutoff)
        .execute(&mut *tx)
        .await?
        .rows_affected();

    tx.commit().await?;
    Ok(removed)
}
