//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS` and are safe to
//! re-run on every startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply all table and index definitions to the connected database.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS property (
    id              TEXT PRIMARY KEY NOT NULL,
    name            TEXT NOT NULL,
    host_address    TEXT
);

CREATE TABLE IF NOT EXISTS task_definition (
    id                       TEXT PRIMARY KEY NOT NULL,
    property_id              TEXT NOT NULL,
    label                    TEXT NOT NULL,
    staff_requirements       TEXT NOT NULL DEFAULT '',
    guest_requirements       TEXT NOT NULL DEFAULT '',
    host_escalation_criteria TEXT NOT NULL DEFAULT '',
    staff_id                 TEXT,
    staff_address            TEXT,
    UNIQUE(property_id, label)
);

CREATE TABLE IF NOT EXISTS task (
    id                       TEXT PRIMARY KEY NOT NULL,
    category                 TEXT NOT NULL,
    category_key             TEXT NOT NULL,
    request_text             TEXT NOT NULL,
    property_id              TEXT NOT NULL,
    booking_id               TEXT,
    requester_address        TEXT NOT NULL,
    staff_id                 TEXT,
    staff_address            TEXT,
    source_event_id          TEXT NOT NULL,
    staff_requirements       TEXT NOT NULL DEFAULT '',
    guest_requirements       TEXT NOT NULL DEFAULT '',
    host_escalation_criteria TEXT NOT NULL DEFAULT '',
    status                   TEXT NOT NULL CHECK(status IN ('waiting_on_guest','waiting_on_staff','waiting_on_host','scheduled','in_progress','escalated','completed','cancelled')),
    action_holder            TEXT NOT NULL CHECK(action_holder IN ('guest','staff','host')),
    action_holder_address    TEXT,
    action_holder_notified   INTEGER NOT NULL DEFAULT 0,
    response_received        INTEGER NOT NULL DEFAULT 0,
    completion_notified      INTEGER NOT NULL DEFAULT 0,
    host_escalation_needed   INTEGER NOT NULL DEFAULT 0,
    escalation_reason        TEXT,
    guest_info_requested     INTEGER NOT NULL DEFAULT 0,
    guest_info_missing       TEXT,
    guest_update_pending     INTEGER NOT NULL DEFAULT 0,
    guest_notice_attempts    INTEGER NOT NULL DEFAULT 0,
    attempts                 INTEGER NOT NULL DEFAULT 0,
    last_outbound_message    TEXT,
    claim_token              TEXT,
    claim_expires_at         TEXT,
    created_at               TEXT NOT NULL,
    updated_at               TEXT NOT NULL,
    completed_at             TEXT
);

CREATE TABLE IF NOT EXISTS task_message_chain (
    seq             INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id         TEXT NOT NULL REFERENCES task(id),
    message_id      TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    UNIQUE(task_id, message_id)
);

CREATE TABLE IF NOT EXISTS message (
    id                TEXT PRIMARY KEY NOT NULL,
    property_id       TEXT NOT NULL,
    booking_id        TEXT,
    task_id           TEXT,
    requester_address TEXT NOT NULL,
    sender_address    TEXT NOT NULL,
    sender_role       TEXT NOT NULL CHECK(sender_role IN ('guest','staff','host','system')),
    direction         TEXT NOT NULL CHECK(direction IN ('inbound','outbound')),
    body              TEXT NOT NULL,
    state             TEXT NOT NULL CHECK(state IN ('pending','processed','unmatched','failed')),
    sender_id         TEXT,
    in_reply_to       TEXT,
    attempts          INTEGER NOT NULL DEFAULT 0,
    created_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_audit (
    id              TEXT PRIMARY KEY NOT NULL,
    task_id         TEXT NOT NULL,
    event_type      TEXT NOT NULL,
    detail          TEXT NOT NULL,
    source_event_id TEXT,
    message_id      TEXT,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS consumed_event (
    event_id        TEXT PRIMARY KEY NOT NULL,
    outcome         TEXT NOT NULL,
    task_id         TEXT,
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_archive (
    id              TEXT PRIMARY KEY NOT NULL,
    property_id     TEXT NOT NULL,
    category        TEXT NOT NULL,
    status          TEXT NOT NULL,
    archived_at     TEXT NOT NULL,
    payload         TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_task_one_open
    ON task(requester_address, property_id, category_key)
    WHERE status NOT IN ('completed','cancelled');
CREATE INDEX IF NOT EXISTS idx_task_status ON task(status);
CREATE INDEX IF NOT EXISTS idx_task_property ON task(property_id);
CREATE INDEX IF NOT EXISTS idx_chain_message ON task_message_chain(message_id);
CREATE INDEX IF NOT EXISTS idx_message_thread ON message(property_id, requester_address);
CREATE INDEX IF NOT EXISTS idx_message_task ON message(task_id);
CREATE INDEX IF NOT EXISTS idx_audit_task ON task_audit(task_id);
CREATE INDEX IF NOT EXISTS idx_definition_property ON task_definition(property_id);
CREATE INDEX IF NOT EXISTS idx_archive_time ON task_archive(archived_at);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
