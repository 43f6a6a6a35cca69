use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Upper bound accepted for `max_retries` on new emails.
pub const MAX_RETRIES_LIMIT: u32 = 25;

/// Latest instant the stores can persist. Timestamps are kept as RFC 3339
/// text, which only covers four-digit years.
pub fn latest_storable() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(9999, 12, 31)
        .and_then(|d| d.and_hms_micro_opt(23, 59, 59, 999_999))
        .map_or(DateTime::<Utc>::MAX_UTC, |n| n.and_utc())
}

/// Whether `at` survives a round trip through the stores' timestamp format.
pub fn is_storable(at: DateTime<Utc>) -> bool {
    (0..=9999).contains(&at.year())
}

/// Lifecycle state of a scheduled email.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailStatus {
    /// Waiting for its `scheduled_at` time (or for a retry slot).
    Pending,
    /// Claimed by exactly one dispatch attempt; never set from outside the dispatcher.
    Processing,
    /// Accepted by the mail transport.
    Sent,
    /// Retries exhausted or the failure was permanent.
    Failed,
    /// Cancelled before any attempt was claimed.
    Cancelled,
}

impl EmailStatus {
    pub const ALL: [EmailStatus; 5] = [
        EmailStatus::Pending,
        EmailStatus::Processing,
        EmailStatus::Sent,
        EmailStatus::Failed,
        EmailStatus::Cancelled,
    ];

    /// Sent, failed and cancelled admit no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EmailStatus::Sent | EmailStatus::Failed | EmailStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EmailStatus::Pending => "pending",
            EmailStatus::Processing => "processing",
            EmailStatus::Sent => "sent",
            EmailStatus::Failed => "failed",
            EmailStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for EmailStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EmailStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EmailStatus::Pending),
            "processing" => Ok(EmailStatus::Processing),
            "sent" => Ok(EmailStatus::Sent),
            "failed" => Ok(EmailStatus::Failed),
            "cancelled" => Ok(EmailStatus::Cancelled),
            other => Err(format!("unknown email status: {other}")),
        }
    }
}

/// Opaque attachment blob. The queue stores and forwards it without looking inside.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub content: Vec<u8>,
}

/// A persisted send intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEmail {
    /// UUIDv7 string, primary key.
    pub id: String,
    pub user_id: String,
    pub organization_id: String,
    /// Non-empty, in the order the caller supplied.
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    pub html_body: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Earliest instant the dispatcher may claim this email.
    pub scheduled_at: DateTime<Utc>,
    pub status: EmailStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: Option<serde_json::Value>,
}

impl ScheduledEmail {
    /// Build a fresh `pending` record from a validated request.
    pub fn from_request(request: NewEmail, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            user_id: request.user_id,
            organization_id: request.organization_id,
            recipients: request.recipients,
            subject: request.subject,
            body: request.body,
            html_body: request.html_body,
            attachments: request.attachments,
            scheduled_at: request.scheduled_at.unwrap_or(now),
            status: EmailStatus::Pending,
            retry_count: 0,
            max_retries: request.max_retries,
            error_message: None,
            sent_at: None,
            created_at: now,
            updated_at: now,
            metadata: request.metadata,
        }
    }

    /// A pending email whose time has come.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == EmailStatus::Pending && self.scheduled_at <= now
    }

    /// Pending and strictly past its scheduled time.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.status == EmailStatus::Pending && self.scheduled_at < now
    }
}

/// Caller-supplied request for `EmailScheduler::schedule_email`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewEmail {
    pub user_id: String,
    pub organization_id: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    #[serde(default)]
    pub html_body: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// `None` means "as soon as possible". Past instants are valid and due immediately.
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl NewEmail {
    /// Check the request before anything is persisted.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.recipients.is_empty() {
            return Err("at least one recipient is required".to_string());
        }
        if let Some(bad) = self.recipients.iter().find(|r| !is_valid_address(r)) {
            return Err(format!("malformed recipient address: {bad:?}"));
        }
        if self.max_retries > MAX_RETRIES_LIMIT {
            return Err(format!(
                "max_retries {} exceeds limit {MAX_RETRIES_LIMIT}",
                self.max_retries
            ));
        }
        if let Some(at) = self.scheduled_at.filter(|at| !is_storable(*at)) {
            return Err(format!("scheduled_at {at} is outside years 0000-9999"));
        }
        Ok(())
    }
}

/// Structural address check: `local@domain.tld`, no whitespace or angle brackets.
///
/// The transport performs full RFC 5322 parsing; this only keeps obviously
/// broken input out of the queue.
pub fn is_valid_address(addr: &str) -> bool {
    if addr.is_empty() || addr.chars().any(|c| c.is_whitespace() || c == '<' || c == '>') {
        return false;
    }
    let Some((local, domain)) = addr.rsplit_once('@') else {
        return false;
    };
    if local.is_empty() || local.contains('@') {
        return false;
    }
    let labels: Vec<&str> = domain.split('.').collect();
    labels.len() >= 2 && labels.iter().all(|l| !l.is_empty())
}

/// A status change with a fixed expected prior status.
///
/// Stores apply a transition as a single compare-and-set: it takes effect only
/// when the row is still in [`Transition::from_status`], which is what makes
/// claims and cancellations race-safe.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// pending → processing
    Claim,
    /// pending → cancelled
    Cancel,
    /// processing → sent; stamps `sent_at` and clears `error_message`.
    Sent,
    /// processing → pending with `retry_count + 1` and a new `scheduled_at`.
    Requeue {
        error: String,
        next_attempt_at: DateTime<Utc>,
    },
    /// processing → failed
    Fail { error: String },
}

impl Transition {
    pub fn from_status(&self) -> EmailStatus {
        match self {
            Transition::Claim | Transition::Cancel => EmailStatus::Pending,
            Transition::Sent | Transition::Requeue { .. } | Transition::Fail { .. } => {
                EmailStatus::Processing
            }
        }
    }

    pub fn to_status(&self) -> EmailStatus {
        match self {
            Transition::Claim => EmailStatus::Processing,
            Transition::Cancel => EmailStatus::Cancelled,
            Transition::Sent => EmailStatus::Sent,
            Transition::Requeue { .. } => EmailStatus::Pending,
            Transition::Fail { .. } => EmailStatus::Failed,
        }
    }

    /// Apply to an in-memory record. Returns `false` (and leaves the record
    /// untouched) when the expected prior state does not hold. A claim also
    /// requires the email to be due at `now`.
    pub fn apply_to(&self, email: &mut ScheduledEmail, now: DateTime<Utc>) -> bool {
        if email.status != self.from_status() {
            return false;
        }
        match self {
            Transition::Claim if email.scheduled_at > now => return false,
            Transition::Claim | Transition::Cancel => {}
            Transition::Sent => {
                email.sent_at = Some(now);
                email.error_message = None;
            }
            Transition::Requeue {
                error,
                next_attempt_at,
            } => {
                if email.retry_count >= email.max_retries {
                    return false;
                }
                email.retry_count += 1;
                email.error_message = Some(error.clone());
                email.scheduled_at = *next_attempt_at;
            }
            Transition::Fail { error } => {
                email.error_message = Some(error.clone());
            }
        }
        email.status = self.to_status();
        email.updated_at = email.updated_at.max(now);
        true
    }
}

/// Selection criteria for `JobStore::list`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailFilter {
    pub status: Option<EmailStatus>,
    pub user_id: Option<String>,
    pub organization_id: Option<String>,
    /// `None` means no limit.
    pub limit: Option<usize>,
}

impl EmailFilter {
    pub fn matches(&self, email: &ScheduledEmail) -> bool {
        self.status.map_or(true, |s| email.status == s)
            && self.user_id.as_deref().map_or(true, |u| email.user_id == u)
            && self
                .organization_id
                .as_deref()
                .map_or(true, |o| email.organization_id == o)
    }
}

/// Named, reusable message skeleton owned by a user within an organization.
///
/// Stored verbatim; rendering happens before `schedule_email` is called.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailTemplate {
    pub id: String,
    pub user_id: String,
    pub organization_id: String,
    pub name: String,
    pub subject: String,
    pub body: String,
    pub html_body: Option<String>,
    /// Placeholder names the template expects, e.g. `["first_name"]`.
    pub variables: Vec<String>,
    pub created_at: DateTime<Utc>,
}
