//! `herald-queue` — durable scheduled-email queue with a polling dispatcher.
//!
//! # Overview
//!
//! Emails are persisted through a [`store::JobStore`] (SQLite in production,
//! in memory for tests). The [`dispatcher::Dispatcher`] polls the store,
//! claims due emails with a compare-and-set status change, hands them to a
//! [`transport::MailTransport`], and records the outcome. Callers interact
//! through the [`scheduler::EmailScheduler`] facade.
//!
//! # Lifecycle
//!
//! | From         | To           | Trigger                                      |
//! |--------------|--------------|----------------------------------------------|
//! | `pending`    | `processing` | dispatcher claim                             |
//! | `pending`    | `cancelled`  | `cancel_email`                               |
//! | `processing` | `sent`       | transport success                            |
//! | `processing` | `pending`    | transient failure with retries left          |
//! | `processing` | `failed`     | permanent failure, or retries exhausted      |
//!
//! Delivery is at-least-once: a crash between the send and the status write
//! leaves the email `processing` until stale reconciliation requeues it.

pub mod db;
pub mod dispatcher;
pub mod error;
pub mod memory;
pub mod reconcile;
pub mod retry;
pub mod scheduler;
pub mod sqlite;
pub mod stats;
pub mod store;
pub mod templates;
pub mod transport;
pub mod types;

pub use dispatcher::{CycleReport, Dispatcher, DispatcherConfig, DispatcherHandle};
pub use error::{QueueError, Result, StoreError};
pub use memory::InMemoryJobStore;
pub use reconcile::ReconcileReport;
pub use retry::{FailureKind, RetryDecision, RetryPolicy};
pub use scheduler::EmailScheduler;
pub use sqlite::SqliteJobStore;
pub use stats::QueueStats;
pub use store::JobStore;
pub use templates::TemplateStore;
pub use transport::{Delivery, MailMessage, MailTransport, TransportError};
pub use types::{
    is_storable, latest_storable, Attachment, EmailFilter, EmailStatus, EmailTemplate, NewEmail,
    ScheduledEmail, Transition,
};
