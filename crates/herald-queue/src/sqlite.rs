use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, instrument};

use crate::{
    db::init_db,
    error::{StoreError, StoreResult},
    stats::QueueStats,
    store::JobStore,
    types::{EmailFilter, EmailStatus, ScheduledEmail, Transition},
};

const EMAIL_COLUMNS: &str = "id, user_id, organization_id, recipients, subject, body, html_body,
     attachments, scheduled_at, status, retry_count, max_retries, error_message,
     sent_at, created_at, updated_at, metadata";

/// SQLite-backed job store, the durable source of truth.
///
/// Wraps a single connection in a `Mutex`. Every status change is one
/// `UPDATE … WHERE id = ? AND status = ?`, so the compare-and-set holds even
/// when several processes share the database file.
pub struct SqliteJobStore {
    db: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> StoreResult<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    /// Open (or create) the database file at `path` in WAL mode.
    pub fn open(path: &str) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        Self::new(conn)
    }

    /// Private in-memory database, mainly for tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::new(Connection::open_in_memory()?)
    }
}

/// Fixed-width UTC timestamp so text comparison equals time comparison.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {s:?}: {e}")))
}

/// Raw column values, decoded into a [`ScheduledEmail`] outside the row callback
/// so JSON and timestamp errors surface as [`StoreError`]s instead of being dropped.
struct EmailRow {
    id: String,
    user_id: String,
    organization_id: String,
    recipients: String,
    subject: String,
    body: String,
    html_body: Option<String>,
    attachments: String,
    scheduled_at: String,
    status: String,
    retry_count: u32,
    max_retries: u32,
    error_message: Option<String>,
    sent_at: Option<String>,
    created_at: String,
    updated_at: String,
    metadata: Option<String>,
}

impl EmailRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            organization_id: row.get(2)?,
            recipients: row.get(3)?,
            subject: row.get(4)?,
            body: row.get(5)?,
            html_body: row.get(6)?,
            attachments: row.get(7)?,
            scheduled_at: row.get(8)?,
            status: row.get(9)?,
            retry_count: row.get(10)?,
            max_retries: row.get(11)?,
            error_message: row.get(12)?,
            sent_at: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
            metadata: row.get(16)?,
        })
    }

    fn into_email(self) -> StoreResult<ScheduledEmail> {
        let status: EmailStatus = self.status.parse().map_err(StoreError::Corrupt)?;
        Ok(ScheduledEmail {
            recipients: serde_json::from_str(&self.recipients)?,
            attachments: serde_json::from_str(&self.attachments)?,
            scheduled_at: parse_ts(&self.scheduled_at)?,
            sent_at: self.sent_at.as_deref().map(parse_ts).transpose()?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            metadata: self
                .metadata
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            id: self.id,
            user_id: self.user_id,
            organization_id: self.organization_id,
            subject: self.subject,
            body: self.body,
            html_body: self.html_body,
            status,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            error_message: self.error_message,
        })
    }
}

fn query_emails(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> StoreResult<Vec<ScheduledEmail>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt
        .query_map(params, EmailRow::from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(EmailRow::into_email).collect()
}

impl JobStore for SqliteJobStore {
    #[instrument(skip(self, email), fields(email_id = %email.id))]
    fn insert(&self, email: &ScheduledEmail) -> StoreResult<()> {
        let recipients = serde_json::to_string(&email.recipients)?;
        let attachments = serde_json::to_string(&email.attachments)?;
        let metadata = email
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO scheduled_emails
             (id, user_id, organization_id, recipients, subject, body, html_body,
              attachments, scheduled_at, status, retry_count, max_retries, error_message,
              sent_at, created_at, updated_at, metadata)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)",
            params![
                email.id,
                email.user_id,
                email.organization_id,
                recipients,
                email.subject,
                email.body,
                email.html_body,
                attachments,
                ts(email.scheduled_at),
                email.status.as_str(),
                email.retry_count,
                email.max_retries,
                email.error_message,
                email.sent_at.map(ts),
                ts(email.created_at),
                ts(email.updated_at),
                metadata,
            ],
        )?;
        debug!("email row inserted");
        Ok(())
    }

    #[instrument(skip(self))]
    fn get(&self, id: &str) -> StoreResult<Option<ScheduledEmail>> {
        let db = self.db.lock().unwrap();
        let row = db
            .query_row(
                &format!("SELECT {EMAIL_COLUMNS} FROM scheduled_emails WHERE id = ?1"),
                [id],
                EmailRow::from_row,
            )
            .optional()?;
        row.map(EmailRow::into_email).transpose()
    }

    #[instrument(skip(self, transition), fields(to = %transition.to_status()))]
    fn apply(&self, id: &str, transition: &Transition, now: DateTime<Utc>) -> StoreResult<bool> {
        let from = transition.from_status().as_str();
        let to = transition.to_status().as_str();
        let now = ts(now);
        let db = self.db.lock().unwrap();

        // `max(updated_at, ?)` keeps updated_at monotonic even if the clock steps back.
        let changed = match transition {
            Transition::Claim => db.execute(
                "UPDATE scheduled_emails
                 SET status = ?1, updated_at = max(updated_at, ?2)
                 WHERE id = ?3 AND status = ?4 AND scheduled_at <= ?2",
                params![to, now, id, from],
            )?,
            Transition::Cancel => db.execute(
                "UPDATE scheduled_emails
                 SET status = ?1, updated_at = max(updated_at, ?2)
                 WHERE id = ?3 AND status = ?4",
                params![to, now, id, from],
            )?,
            Transition::Sent => db.execute(
                "UPDATE scheduled_emails
                 SET status = ?1, sent_at = ?2, error_message = NULL,
                     updated_at = max(updated_at, ?2)
                 WHERE id = ?3 AND status = ?4",
                params![to, now, id, from],
            )?,
            Transition::Requeue {
                error,
                next_attempt_at,
            } => db.execute(
                "UPDATE scheduled_emails
                 SET status = ?1, retry_count = retry_count + 1, error_message = ?2,
                     scheduled_at = ?3, updated_at = max(updated_at, ?4)
                 WHERE id = ?5 AND status = ?6 AND retry_count < max_retries",
                params![to, error, ts(*next_attempt_at), now, id, from],
            )?,
            Transition::Fail { error } => db.execute(
                "UPDATE scheduled_emails
                 SET status = ?1, error_message = ?2, updated_at = max(updated_at, ?3)
                 WHERE id = ?4 AND status = ?5",
                params![to, error, now, id, from],
            )?,
        };
        debug!(changed, "transition applied");
        Ok(changed == 1)
    }

    #[instrument(skip(self))]
    fn claim(&self, id: &str, now: DateTime<Utc>) -> StoreResult<Option<ScheduledEmail>> {
        let db = self.db.lock().unwrap();
        let row = db
            .query_row(
                &format!(
                    "UPDATE scheduled_emails
                     SET status = 'processing', updated_at = max(updated_at, ?1)
                     WHERE id = ?2 AND status = 'pending' AND scheduled_at <= ?1
                     RETURNING {EMAIL_COLUMNS}"
                ),
                params![ts(now), id],
                EmailRow::from_row,
            )
            .optional()?;
        debug!(claimed = row.is_some(), "claim attempted");
        row.map(EmailRow::into_email).transpose()
    }

    fn list_due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<ScheduledEmail>> {
        let db = self.db.lock().unwrap();
        query_emails(
            &db,
            &format!(
                "SELECT {EMAIL_COLUMNS} FROM scheduled_emails
                 WHERE status = 'pending' AND scheduled_at <= ?1
                 ORDER BY scheduled_at, rowid
                 LIMIT ?2"
            ),
            params![ts(now), limit as i64],
        )
    }

    #[instrument(skip(self))]
    fn list(&self, filter: &EmailFilter) -> StoreResult<Vec<ScheduledEmail>> {
        // LIMIT -1 means unlimited in SQLite.
        let limit = filter.limit.map_or(-1, |l| l as i64);
        let db = self.db.lock().unwrap();
        query_emails(
            &db,
            &format!(
                "SELECT {EMAIL_COLUMNS} FROM scheduled_emails
                 WHERE (?1 IS NULL OR status = ?1)
                   AND (?2 IS NULL OR user_id = ?2)
                   AND (?3 IS NULL OR organization_id = ?3)
                 ORDER BY scheduled_at, rowid
                 LIMIT ?4"
            ),
            params![
                filter.status.map(|s| s.as_str()),
                filter.user_id,
                filter.organization_id,
                limit,
            ],
        )
    }

    fn stale_processing(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<ScheduledEmail>> {
        let db = self.db.lock().unwrap();
        query_emails(
            &db,
            &format!(
                "SELECT {EMAIL_COLUMNS} FROM scheduled_emails
                 WHERE status = 'processing' AND updated_at < ?1
                 ORDER BY scheduled_at, rowid"
            ),
            [ts(cutoff)],
        )
    }

    #[instrument(skip(self))]
    fn stats(&self, now: DateTime<Utc>, organization_id: Option<&str>) -> StoreResult<QueueStats> {
        let db = self.db.lock().unwrap();
        let mut stats = QueueStats::default();

        let mut stmt = db.prepare_cached(
            "SELECT status, COUNT(*) FROM scheduled_emails
             WHERE (?1 IS NULL OR organization_id = ?1)
             GROUP BY status",
        )?;
        let counts = stmt
            .query_map([organization_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for (status, n) in counts {
            let status: EmailStatus = status.parse().map_err(StoreError::Corrupt)?;
            stats.add(status, n as u64);
        }

        let overdue: i64 = db.query_row(
            "SELECT COUNT(*) FROM scheduled_emails
             WHERE status = 'pending' AND scheduled_at < ?1
               AND (?2 IS NULL OR organization_id = ?2)",
            params![ts(now), organization_id],
            |row| row.get(0),
        )?;
        stats.overdue = overdue as u64;
        Ok(stats)
    }
}
