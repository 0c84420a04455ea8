//! Persistence layer modules.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::{AppError, Result};

pub mod archive_repo;
pub mod audit_repo;
pub mod db;
pub mod definition_repo;
pub mod event_repo;
pub mod message_repo;
pub mod property_repo;
pub mod retention;
pub mod schema;
pub mod task_repo;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;

/// Format a timestamp for storage.
///
/// Fixed microsecond precision keeps stored values lexicographically ordered.
#[must_use]
pub fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Current time in storage format.
#[must_use]
pub fn now_ts() -> String {
    ts(Utc::now())
}

/// Parse a stored timestamp column.
///
/// # Errors
///
/// Returns `AppError::Db` if the value is not valid RFC 3339.
pub fn parse_ts(column: &str, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| AppError::Db(format!("invalid {column}: {err}")))
}

/// Parse an optional stored timestamp column.
///
/// # Errors
///
/// Returns `AppError::Db` if a present value is not valid RFC 3339.
pub fn parse_opt_ts(column: &str, value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    value.map(|v| parse_ts(column, v)).transpose()
}
