use rusqlite::Connection;

use crate::error::StoreResult;

/// Initialise the queue schema in `conn`.
///
/// Creates the `scheduled_emails` and `email_templates` tables (idempotent).
/// Timestamps are fixed-width RFC 3339 text, so `ORDER BY scheduled_at` and
/// `scheduled_at <= ?` compare chronologically.
pub fn init_db(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS scheduled_emails (
            id              TEXT    NOT NULL PRIMARY KEY,
            user_id         TEXT    NOT NULL,
            organization_id TEXT    NOT NULL,
            recipients      TEXT    NOT NULL,   -- JSON array of addresses
            subject         TEXT    NOT NULL,
            body            TEXT    NOT NULL,
            html_body       TEXT,
            attachments     TEXT    NOT NULL DEFAULT '[]',  -- opaque JSON blobs
            scheduled_at    TEXT    NOT NULL,
            status          TEXT    NOT NULL DEFAULT 'pending',
            retry_count     INTEGER NOT NULL DEFAULT 0,
            max_retries     INTEGER NOT NULL DEFAULT 0,
            error_message   TEXT,
            sent_at         TEXT,
            created_at      TEXT    NOT NULL,
            updated_at      TEXT    NOT NULL,
            metadata        TEXT,               -- opaque JSON or NULL
            CHECK (retry_count <= max_retries)
        ) STRICT;

        -- Due-job polling: WHERE status = 'pending' AND scheduled_at <= ?
        CREATE INDEX IF NOT EXISTS idx_emails_status_due
            ON scheduled_emails (status, scheduled_at);
        CREATE INDEX IF NOT EXISTS idx_emails_org
            ON scheduled_emails (organization_id, status);

        CREATE TABLE IF NOT EXISTS email_templates (
            id              TEXT    NOT NULL PRIMARY KEY,
            user_id         TEXT    NOT NULL,
            organization_id TEXT    NOT NULL,
            name            TEXT    NOT NULL,
            subject         TEXT    NOT NULL,
            body            TEXT    NOT NULL,
            html_body       TEXT,
            variables       TEXT    NOT NULL DEFAULT '[]',
            created_at      TEXT    NOT NULL,
            UNIQUE (user_id, name)
        ) STRICT;
        ",
    )?;
    Ok(())
}
