use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::{
    dispatcher::after,
    error::StoreResult,
    retry::{FailureKind, RetryDecision, RetryPolicy},
    store::JobStore,
    types::Transition,
};

/// Result of one reconciliation pass over stuck `processing` emails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub examined: usize,
    pub requeued: usize,
    pub failed: usize,
    /// Emails that settled on their own while the pass was running.
    pub skipped: usize,
}

/// Settle emails that have been `processing` for longer than `stale_after`.
///
/// Whether such a send reached the server is unknown, so it is treated as a
/// transient failure: requeued while retries remain, failed otherwise. A
/// resend may duplicate a delivered message; leaving the row stuck would
/// lose it.
pub fn reconcile_stale(
    store: &dyn JobStore,
    policy: &RetryPolicy,
    stale_after: Duration,
    now: DateTime<Utc>,
) -> StoreResult<ReconcileReport> {
    let cutoff = now - chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::zero());
    let stale = store.stale_processing(cutoff)?;

    let mut report = ReconcileReport {
        examined: stale.len(),
        ..Default::default()
    };
    let error = format!(
        "delivery unconfirmed: still processing after {}s",
        stale_after.as_secs()
    );

    for email in stale {
        let transition =
            match policy.decide(email.retry_count, email.max_retries, FailureKind::Transient) {
                RetryDecision::RetryAfter(delay) => Transition::Requeue {
                    error: error.clone(),
                    next_attempt_at: after(now, delay),
                },
                RetryDecision::GiveUp => Transition::Fail {
                    error: error.clone(),
                },
            };

        if !store.apply(&email.id, &transition, now)? {
            report.skipped += 1;
            continue;
        }
        match transition {
            Transition::Requeue { .. } => {
                info!(email_id = %email.id, retry = email.retry_count + 1, "stale email requeued");
                report.requeued += 1;
            }
            _ => {
                warn!(email_id = %email.id, "stale email failed, no retries left");
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        memory::InMemoryJobStore,
        types::{EmailStatus, NewEmail, ScheduledEmail},
    };

    fn claimed(store: &InMemoryJobStore, max_retries: u32, at: DateTime<Utc>) -> String {
        let email = ScheduledEmail::from_request(
            NewEmail {
                user_id: "u".into(),
                organization_id: "o".into(),
                recipients: vec!["x@example.com".into()],
                scheduled_at: Some(at),
                max_retries,
                ..Default::default()
            },
            at,
        );
        store.insert(&email).unwrap();
        assert!(store.apply(&email.id, &Transition::Claim, at).unwrap());
        email.id
    }

    #[test]
    fn stale_emails_are_requeued_or_failed() {
        let store = InMemoryJobStore::new();
        let long_ago = Utc::now() - chrono::Duration::hours(2);
        let with_budget = claimed(&store, 2, long_ago);
        let exhausted = claimed(&store, 0, long_ago);
        let fresh = claimed(&store, 2, Utc::now());

        let report = reconcile_stale(
            &store,
            &RetryPolicy::immediate(),
            Duration::from_secs(600),
            Utc::now(),
        )
        .unwrap();

        assert_eq!(report.examined, 2);
        assert_eq!(report.requeued, 1);
        assert_eq!(report.failed, 1);

        let requeued = store.get(&with_budget).unwrap().unwrap();
        assert_eq!(requeued.status, EmailStatus::Pending);
        assert_eq!(requeued.retry_count, 1);
        assert!(requeued
            .error_message
            .unwrap()
            .starts_with("delivery unconfirmed"));

        assert_eq!(
            store.get(&exhausted).unwrap().unwrap().status,
            EmailStatus::Failed
        );
        assert_eq!(
            store.get(&fresh).unwrap().unwrap().status,
            EmailStatus::Processing
        );
    }

    #[test]
    fn nothing_stale_is_a_no_op() {
        let store = InMemoryJobStore::new();
        let report = reconcile_stale(
            &store,
            &RetryPolicy::default(),
            Duration::from_secs(60),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(report, ReconcileReport::default());
    }
}
