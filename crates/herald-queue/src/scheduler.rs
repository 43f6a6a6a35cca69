use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::{
    dispatcher::{Dispatcher, DispatcherConfig, DispatcherHandle},
    error::{QueueError, Result},
    reconcile::{self, ReconcileReport},
    retry::RetryPolicy,
    stats::QueueStats,
    store::JobStore,
    transport::MailTransport,
    types::{EmailFilter, NewEmail, ScheduledEmail, Transition},
};

/// Public entry point for scheduling, inspecting, and cancelling emails.
///
/// Every operation goes straight to the store, so a facade built with
/// [`EmailScheduler::new`] (no dispatcher) sees the same state as the one
/// running the poll loop.
pub struct EmailScheduler {
    store: Arc<dyn JobStore>,
    policy: RetryPolicy,
    dispatcher: Mutex<Option<DispatcherHandle>>,
}

impl EmailScheduler {
    /// Management-only facade; nothing is ever sent through it.
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            policy: RetryPolicy::default(),
            dispatcher: Mutex::new(None),
        }
    }

    /// Facade plus a dispatcher spawned on the current Tokio runtime.
    pub fn start(
        store: Arc<dyn JobStore>,
        transport: Arc<dyn MailTransport>,
        config: DispatcherConfig,
        policy: RetryPolicy,
    ) -> Self {
        let handle = Dispatcher::new(Arc::clone(&store), transport, config, policy).spawn();
        Self {
            store,
            policy,
            dispatcher: Mutex::new(Some(handle)),
        }
    }

    /// Retry policy used by [`EmailScheduler::reconcile_stale`].
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Validate and persist a new `pending` email. Returns its ID.
    #[instrument(skip(self, request), fields(org = %request.organization_id))]
    pub fn schedule_email(&self, request: NewEmail) -> Result<String> {
        request.validate().map_err(QueueError::Validation)?;

        let email = ScheduledEmail::from_request(request, Utc::now());
        self.store.insert(&email)?;
        info!(
            email_id = %email.id,
            scheduled_at = %email.scheduled_at,
            recipients = email.recipients.len(),
            "email scheduled"
        );
        Ok(email.id)
    }

    pub fn get_email_status(&self, id: &str) -> Result<ScheduledEmail> {
        self.store
            .get(id)?
            .ok_or_else(|| QueueError::NotFound { id: id.to_string() })
    }

    /// Cancel a pending email. `Ok(false)` when it is already processing or settled.
    #[instrument(skip(self))]
    pub fn cancel_email(&self, id: &str) -> Result<bool> {
        if self.store.apply(id, &Transition::Cancel, Utc::now())? {
            info!(email_id = %id, "email cancelled");
            return Ok(true);
        }
        // Distinguish "wrong state" from "no such email".
        let email = self.get_email_status(id)?;
        info!(email_id = %id, status = %email.status, "cancel refused");
        Ok(false)
    }

    pub fn get_queue_stats(&self) -> Result<QueueStats> {
        Ok(self.store.stats(Utc::now(), None)?)
    }

    pub fn get_organization_stats(&self, organization_id: &str) -> Result<QueueStats> {
        Ok(self.store.stats(Utc::now(), Some(organization_id))?)
    }

    pub fn list_emails(&self, filter: &EmailFilter) -> Result<Vec<ScheduledEmail>> {
        Ok(self.store.list(filter)?)
    }

    /// Emails stuck in `processing` for longer than `grace`.
    pub fn find_stale(&self, grace: Duration) -> Result<Vec<ScheduledEmail>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(grace)
                .map_err(|e| QueueError::Internal(format!("grace period out of range: {e}")))?;
        Ok(self.store.stale_processing(cutoff)?)
    }

    /// Requeue or fail emails stuck in `processing` for longer than `grace`.
    pub fn reconcile_stale(&self, grace: Duration) -> Result<ReconcileReport> {
        Ok(reconcile::reconcile_stale(
            self.store.as_ref(),
            &self.policy,
            grace,
            Utc::now(),
        )?)
    }

    /// Stop the dispatcher, giving in-flight sends up to `drain_timeout`.
    ///
    /// Pending emails stay pending. Calling this again, or on a facade
    /// without a dispatcher, returns immediately.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        let handle = self.dispatcher.lock().await.take();
        match handle {
            Some(handle) => {
                info!(drain_secs = drain_timeout.as_secs(), "shutting down dispatcher");
                handle.shutdown(drain_timeout).await;
            }
            None => warn!("shutdown requested but no dispatcher is running"),
        }
    }
}
