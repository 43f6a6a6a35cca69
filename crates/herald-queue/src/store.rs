//! Job store adapter: the only way the queue touches durable state.

use chrono::{DateTime, Utc};

use crate::{
    error::StoreResult,
    stats::QueueStats,
    types::{EmailFilter, ScheduledEmail, Transition},
};

/// Narrow persistence interface for scheduled emails.
///
/// Implementations hold no scheduling policy. The one hard requirement is
/// that [`JobStore::apply`] is an atomic compare-and-set on the email's
/// status: two concurrent callers applying transitions out of the same prior
/// status must see exactly one `true`.
pub trait JobStore: Send + Sync {
    /// Persist a new email. The record is written as given.
    fn insert(&self, email: &ScheduledEmail) -> StoreResult<()>;

    /// Fetch one email by ID.
    fn get(&self, id: &str) -> StoreResult<Option<ScheduledEmail>>;

    /// Apply `transition` if the email is still in `transition.from_status()`.
    ///
    /// Returns `false` when the email does not exist or is in any other state.
    fn apply(&self, id: &str, transition: &Transition, now: DateTime<Utc>) -> StoreResult<bool>;

    /// Claim a due email for delivery and return the row as claimed.
    ///
    /// `None` when another worker got there first, the email was cancelled,
    /// or it was rescheduled past `now` since it was listed. Stores that can
    /// update and read in one statement should override this.
    fn claim(&self, id: &str, now: DateTime<Utc>) -> StoreResult<Option<ScheduledEmail>> {
        if self.apply(id, &Transition::Claim, now)? {
            self.get(id)
        } else {
            Ok(None)
        }
    }

    /// Pending emails with `scheduled_at <= now`, oldest schedule first,
    /// ties broken by creation order.
    fn list_due(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<ScheduledEmail>>;

    /// Emails matching `filter`, in the same order as [`JobStore::list_due`].
    fn list(&self, filter: &EmailFilter) -> StoreResult<Vec<ScheduledEmail>>;

    /// Emails stuck in `processing` whose `updated_at` is older than `cutoff`.
    fn stale_processing(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<ScheduledEmail>>;

    /// Counts by status, optionally restricted to one organization.
    fn stats(&self, now: DateTime<Utc>, organization_id: Option<&str>) -> StoreResult<QueueStats>;
}
