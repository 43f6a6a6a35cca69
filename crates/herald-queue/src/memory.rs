use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::{
    error::StoreResult,
    stats::QueueStats,
    store::JobStore,
    types::{EmailFilter, EmailStatus, ScheduledEmail, Transition},
};

/// In-memory job store for tests and dry runs.
///
/// Emails live in a `Vec` in insertion order, which doubles as the creation
/// order tie-break. Every method takes the one lock, so `apply` is trivially
/// atomic.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    emails: Mutex<Vec<ScheduledEmail>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored emails in any status.
    pub fn len(&self) -> usize {
        self.emails.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn sorted_by_schedule(mut emails: Vec<ScheduledEmail>) -> Vec<ScheduledEmail> {
    // Stable sort keeps insertion order for equal schedules.
    emails.sort_by_key(|e| e.scheduled_at);
    emails
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, email: &ScheduledEmail) -> StoreResult<()> {
        let mut emails = self.emails.lock().unwrap();
        if emails.iter().any(|e| e.id == email.id) {
            return Err(crate::error::StoreError::Corrupt(format!(
                "duplicate email id {}",
                email.id
            )));
        }
        emails.push(email.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> StoreResult<Option<ScheduledEmail>> {
        let emails = self.emails.lock().unwrap();
        Ok(emails.iter().find(|e| e.id == id).cloned())
    }

    fn apply(&self, id: &str, transition: &Transition, now: DateTime<Utc>) -> StoreResult<bool> {
        let mut emails = self.emails.lock().unwrap();
        Ok(emails
            .iter_mut()
            .find(|e| e.id == id)
            .is_some_and(|email| transition.apply_to(email, now)))
    }

    fn claim(&self, id: &str, now: DateTime<Utc>) -> StoreResult<Option<ScheduledEmail>> {
        let mut emails = self.emails.lock().unwrap();
        let Some(email) = emails.iter_mut().find(|e| e.id == id) else {
            return Ok(None);
        };
        Ok(Transition::Claim
            .apply_to(email, now)
            .then(|| email.clone()))
    }

    fn list_due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<ScheduledEmail>> {
        let emails = self.emails.lock().unwrap();
        let due = emails.iter().filter(|e| e.is_due(now)).cloned().collect();
        let mut due = sorted_by_schedule(due);
        due.truncate(limit);
        Ok(due)
    }

    fn list(&self, filter: &EmailFilter) -> StoreResult<Vec<ScheduledEmail>> {
        let emails = self.emails.lock().unwrap();
        let matched = emails.iter().filter(|e| filter.matches(e)).cloned().collect();
        let mut matched = sorted_by_schedule(matched);
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    fn stale_processing(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<ScheduledEmail>> {
        let emails = self.emails.lock().unwrap();
        let stale = emails
            .iter()
            .filter(|e| e.status == EmailStatus::Processing && e.updated_at < cutoff)
            .cloned()
            .collect();
        Ok(sorted_by_schedule(stale))
    }

    fn stats(&self, now: DateTime<Utc>, organization_id: Option<&str>) -> StoreResult<QueueStats> {
        let emails = self.emails.lock().unwrap();
        Ok(QueueStats::from_emails(
            emails
                .iter()
                .filter(|e| organization_id.map_or(true, |org| e.organization_id == org)),
            now,
        ))
    }
}
