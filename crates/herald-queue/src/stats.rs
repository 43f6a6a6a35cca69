use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{EmailStatus, ScheduledEmail};

/// Point-in-time queue counts, grouped by status.
///
/// `overdue` is a subset of `pending`: pending emails whose `scheduled_at`
/// has already passed (normally only true for a poll interval or two, so a
/// growing value means the dispatcher is not keeping up or not running).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub sent: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub overdue: u64,
}

impl QueueStats {
    /// Add `n` emails in `status` to the matching counter.
    pub fn add(&mut self, status: EmailStatus, n: u64) {
        match status {
            EmailStatus::Pending => self.pending += n,
            EmailStatus::Processing => self.processing += n,
            EmailStatus::Sent => self.sent += n,
            EmailStatus::Failed => self.failed += n,
            EmailStatus::Cancelled => self.cancelled += n,
        }
    }

    pub fn record(&mut self, email: &ScheduledEmail, now: DateTime<Utc>) {
        self.add(email.status, 1);
        if email.is_overdue(now) {
            self.overdue += 1;
        }
    }

    /// Every email counted, regardless of status. `overdue` is not added twice.
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.sent + self.failed + self.cancelled
    }

    pub fn from_emails<'a>(
        emails: impl IntoIterator<Item = &'a ScheduledEmail>,
        now: DateTime<Utc>,
    ) -> Self {
        emails.into_iter().fold(Self::default(), |mut stats, email| {
            stats.record(email, now);
            stats
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewEmail;
    use chrono::Duration;

    fn email(status: EmailStatus, scheduled_at: DateTime<Utc>) -> ScheduledEmail {
        let request = NewEmail {
            recipients: vec!["a@example.com".into()],
            scheduled_at: Some(scheduled_at),
            ..Default::default()
        };
        let mut email = ScheduledEmail::from_request(request, scheduled_at);
        email.status = status;
        email
    }

    #[test]
    fn overdue_counts_only_past_due_pending() {
        let now = Utc::now();
        let past = now - Duration::minutes(5);
        let future = now + Duration::minutes(5);

        let emails = vec![
            email(EmailStatus::Pending, past),
            email(EmailStatus::Pending, future),
            email(EmailStatus::Processing, past),
            email(EmailStatus::Failed, past),
            email(EmailStatus::Sent, past),
            email(EmailStatus::Cancelled, future),
        ];
        let stats = QueueStats::from_emails(&emails, now);

        assert_eq!(stats.pending, 2);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.overdue, 1);
        assert_eq!(stats.total(), emails.len() as u64);
    }
}
