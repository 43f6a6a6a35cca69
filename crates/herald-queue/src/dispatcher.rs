use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use herald_core::DispatcherSettings;
use serde::Serialize;
use tokio::{
    sync::{watch, Semaphore},
    task::{JoinError, JoinHandle, JoinSet},
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};

use crate::{
    error::StoreResult,
    reconcile::reconcile_stale,
    retry::{RetryDecision, RetryPolicy},
    store::JobStore,
    transport::{MailMessage, MailTransport, TransportError},
    types::{latest_storable, ScheduledEmail, Transition},
};

/// Poll loop tunables.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    /// Maximum due emails read per cycle.
    pub batch_size: usize,
    /// Worker pool size: sends in flight at once.
    pub max_concurrent: usize,
    /// Per-send budget; exceeding it counts as a transient failure.
    pub send_timeout: Duration,
    /// Drain window used when the handle is dropped without an explicit shutdown.
    pub drain_timeout: Duration,
    pub reconcile_on_start: bool,
    /// How long an email may sit in `processing` before it is considered orphaned.
    pub stale_after: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from(&DispatcherSettings::default())
    }
}

impl From<&DispatcherSettings> for DispatcherConfig {
    fn from(s: &DispatcherSettings) -> Self {
        Self {
            poll_interval: Duration::from_secs(s.poll_interval_secs.max(1)),
            batch_size: s.batch_size.max(1),
            max_concurrent: s.max_concurrent.max(1),
            send_timeout: Duration::from_secs(s.send_timeout_secs.max(1)),
            drain_timeout: Duration::from_secs(s.drain_timeout_secs),
            reconcile_on_start: s.reconcile_on_start,
            stale_after: Duration::from_secs(s.stale_after_secs),
        }
    }
}

/// What happened to one claimed email.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Sent,
    Requeued,
    Failed,
    /// The outcome could not be persisted; the email stays `processing`
    /// until stale reconciliation picks it up.
    Unreconciled,
}

/// Tally of one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub claimed: usize,
    /// Due emails another claimer or a cancellation got to first.
    pub skipped: usize,
    pub sent: usize,
    pub requeued: usize,
    pub failed: usize,
    pub unreconciled: usize,
}

impl CycleReport {
    fn record(&mut self, settlement: Settlement) {
        match settlement {
            Settlement::Sent => self.sent += 1,
            Settlement::Requeued => self.requeued += 1,
            Settlement::Failed => self.failed += 1,
            Settlement::Unreconciled => self.unreconciled += 1,
        }
    }
}

/// The poll loop: claims due emails, sends them, and settles the outcome.
///
/// Holds no job state between cycles; every cycle re-reads the store.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    transport: Arc<dyn MailTransport>,
    policy: RetryPolicy,
    config: DispatcherConfig,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn JobStore>,
        transport: Arc<dyn MailTransport>,
        config: DispatcherConfig,
        policy: RetryPolicy,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            store,
            transport,
            policy,
            config,
            permits,
        }
    }

    /// Run exactly one cycle and wait for every send it started.
    pub async fn run_once(&self) -> StoreResult<CycleReport> {
        let mut tasks = JoinSet::new();
        let mut report = CycleReport::default();
        // Sends already claimed must settle even if the rest of the batch errored.
        let dispatched = self.dispatch_due(&mut tasks, None, &mut report).await;
        while let Some(joined) = tasks.join_next().await {
            report.record(settlement_of(joined));
        }
        dispatched.map(|()| report)
    }

    /// Spawn the loop on the current Tokio runtime.
    pub fn spawn(self) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(None);
        let join = tokio::spawn(self.run(shutdown_rx));
        DispatcherHandle { shutdown_tx, join }
    }

    /// Main loop. Runs until `shutdown` carries a drain timeout (or its sender is dropped).
    pub async fn run(self, mut shutdown: watch::Receiver<Option<Duration>>) {
        info!(
            transport = self.transport.name(),
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            max_concurrent = self.config.max_concurrent,
            "dispatcher started"
        );

        if self.config.reconcile_on_start {
            match reconcile_stale(
                self.store.as_ref(),
                &self.policy,
                self.config.stale_after,
                Utc::now(),
            ) {
                Ok(report) if report.examined > 0 => {
                    warn!(?report, "reconciled emails left in processing by a previous run")
                }
                Ok(_) => {}
                Err(e) => error!("startup reconciliation failed: {e}"),
            }
        }

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut tasks: JoinSet<Settlement> = JoinSet::new();

        let drain_timeout = loop {
            tokio::select! {
                _ = interval.tick() => {
                    let mut report = CycleReport::default();
                    if let Err(e) = self.dispatch_due(&mut tasks, Some(&shutdown), &mut report).await {
                        error!("dispatcher cycle error: {e}");
                    }
                    if report.claimed > 0 || report.skipped > 0 {
                        debug!(claimed = report.claimed, skipped = report.skipped, "cycle claimed emails");
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    settlement_of(joined);
                }
                changed = shutdown.changed() => {
                    match changed {
                        Ok(()) => {
                            if let Some(drain) = *shutdown.borrow() {
                                break drain;
                            }
                        }
                        // Handle dropped without an explicit shutdown.
                        Err(_) => break self.config.drain_timeout,
                    }
                }
            }
        };

        info!(
            in_flight = tasks.len(),
            drain_ms = drain_timeout.as_millis() as u64,
            "dispatcher stopping, draining in-flight sends"
        );
        let drained = tokio::time::timeout(drain_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                settlement_of(joined);
            }
        })
        .await;
        if drained.is_err() {
            // Aborted sends stay `processing` and surface through stale reconciliation.
            warn!(
                remaining = tasks.len(),
                "drain timeout elapsed, abandoning in-flight sends"
            );
            tasks.abort_all();
        }
        info!("dispatcher stopped");
    }

    /// Claim the current batch of due emails and start a send task for each.
    async fn dispatch_due(
        &self,
        tasks: &mut JoinSet<Settlement>,
        shutdown: Option<&watch::Receiver<Option<Duration>>>,
        report: &mut CycleReport,
    ) -> StoreResult<()> {
        let stopping = || shutdown.is_some_and(|rx| rx.borrow().is_some());

        let due = self.store.list_due(Utc::now(), self.config.batch_size)?;
        for listed in due {
            if stopping() {
                break;
            }
            // Bounded worker pool. The loop must stay responsive to shutdown,
            // so it only takes a free slot; the rest of the batch waits for
            // the next tick.
            let permit = match shutdown {
                Some(_) => Arc::clone(&self.permits).try_acquire_owned().ok(),
                None => Arc::clone(&self.permits).acquire_owned().await.ok(),
            };
            let Some(permit) = permit else {
                break;
            };
            if stopping() {
                break;
            }
            // Send from the row as claimed: it may have been retried or
            // rescheduled since it was listed.
            let Some(email) = self.store.claim(&listed.id, Utc::now())? else {
                debug!(email_id = %listed.id, "claim lost, skipping");
                report.skipped += 1;
                continue;
            };
            report.claimed += 1;
            debug!(email_id = %email.id, retry = email.retry_count, "email claimed");

            let store = Arc::clone(&self.store);
            let transport = Arc::clone(&self.transport);
            let policy = self.policy;
            let send_timeout = self.config.send_timeout;
            tasks.spawn(async move {
                let settlement = deliver(store, transport, policy, send_timeout, email).await;
                drop(permit);
                settlement
            });
        }
        Ok(())
    }
}

/// Handle to a spawned [`Dispatcher`] loop.
pub struct DispatcherHandle {
    shutdown_tx: watch::Sender<Option<Duration>>,
    join: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Stop claiming, wait up to `drain_timeout` for in-flight sends, then return.
    pub async fn shutdown(self, drain_timeout: Duration) {
        let _ = self.shutdown_tx.send(Some(drain_timeout));
        if let Err(e) = self.join.await {
            error!("dispatcher task ended abnormally: {e}");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

/// Send one claimed email and persist the outcome.
async fn deliver(
    store: Arc<dyn JobStore>,
    transport: Arc<dyn MailTransport>,
    policy: RetryPolicy,
    send_timeout: Duration,
    email: ScheduledEmail,
) -> Settlement {
    let message = MailMessage::from(&email);
    let outcome = match tokio::time::timeout(send_timeout, transport.send(&message)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Transient(format!(
            "send timed out after {}ms",
            send_timeout.as_millis()
        ))),
    };

    let now = Utc::now();
    let transition = match outcome {
        Ok(delivery) => {
            info!(
                email_id = %email.id,
                message_id = %delivery.message_id,
                recipients = email.recipients.len(),
                "email sent"
            );
            Transition::Sent
        }
        Err(err) => match policy.decide(email.retry_count, email.max_retries, err.kind()) {
            RetryDecision::RetryAfter(delay) => {
                warn!(
                    email_id = %email.id,
                    retry = email.retry_count + 1,
                    max_retries = email.max_retries,
                    retry_in_secs = delay.as_secs(),
                    error = %err,
                    "send failed, requeueing"
                );
                Transition::Requeue {
                    error: err.to_string(),
                    next_attempt_at: after(now, delay),
                }
            }
            RetryDecision::GiveUp => {
                error!(
                    email_id = %email.id,
                    retries = email.retry_count,
                    error = %err,
                    "send failed permanently"
                );
                Transition::Fail {
                    error: err.to_string(),
                }
            }
        },
    };

    settle(store.as_ref(), &email.id, &transition, now)
}

/// Persist a settling transition. Anything other than a clean write is logged
/// as unreconciled: the email may already be delivered but is still `processing`.
pub(crate) fn settle(
    store: &dyn JobStore,
    id: &str,
    transition: &Transition,
    now: DateTime<Utc>,
) -> Settlement {
    let outcome = transition.to_status();
    match store.apply(id, transition, now) {
        Ok(true) => match transition {
            Transition::Sent => Settlement::Sent,
            Transition::Requeue { .. } => Settlement::Requeued,
            _ => Settlement::Failed,
        },
        Ok(false) => {
            error!(
                email_id = %id,
                %outcome,
                "unreconciled delivery state: email was no longer processing when settling"
            );
            Settlement::Unreconciled
        }
        Err(e) => {
            error!(
                email_id = %id,
                %outcome,
                error = %e,
                "unreconciled delivery state: failed to persist outcome"
            );
            Settlement::Unreconciled
        }
    }
}

/// `now + delay`, clamped to the latest instant the stores can persist.
pub(crate) fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let latest = latest_storable();
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .map_or(latest, |at| at.min(latest))
}

fn settlement_of(joined: Result<Settlement, JoinError>) -> Settlement {
    joined.unwrap_or_else(|e| {
        error!("send task did not complete: {e}");
        Settlement::Unreconciled
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::is_storable;

    #[test]
    fn zero_second_settings_are_raised_to_one() {
        let settings = DispatcherSettings {
            poll_interval_secs: 0,
            batch_size: 0,
            max_concurrent: 0,
            send_timeout_secs: 0,
            ..DispatcherSettings::default()
        };
        let config = DispatcherConfig::from(&settings);
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.max_concurrent, 1);
        assert_eq!(config.send_timeout, Duration::from_secs(1));
    }

    #[test]
    fn retry_instant_stays_storable() {
        let now = Utc::now();
        assert_eq!(after(now, Duration::from_secs(30)), now + chrono::Duration::seconds(30));

        for delay in [Duration::MAX, Duration::from_secs(20_000 * 365 * 86_400)] {
            let at = after(now, delay);
            assert!(is_storable(at), "{at} cannot be persisted");
            assert_eq!(at, latest_storable());
        }
    }
}
