use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    retry::FailureKind,
    types::{Attachment, ScheduledEmail},
};

/// A rendered message handed to the transport. Nothing here is interpreted by the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailMessage {
    pub to: Vec<String>,
    pub subject: String,
    pub text: String,
    pub html: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

impl From<&ScheduledEmail> for MailMessage {
    fn from(email: &ScheduledEmail) -> Self {
        Self {
            to: email.recipients.clone(),
            subject: email.subject.clone(),
            text: email.body.clone(),
            html: email.html_body.clone(),
            attachments: email.attachments.clone(),
        }
    }
}

/// Successful hand-off to the mail server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub message_id: String,
}

/// Why a send attempt failed, classified for the retry policy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Might succeed if tried again later.
    #[error("Transient send failure: {0}")]
    Transient(String),

    /// Will never succeed for this message.
    #[error("Permanent send failure: {0}")]
    Permanent(String),
}

impl TransportError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TransportError::Transient(_) => FailureKind::Transient,
            TransportError::Permanent(_) => FailureKind::Permanent,
        }
    }
}

/// The interface every delivery backend implements.
///
/// Implementations must not retry or schedule on their own; the dispatcher
/// owns all of that. `&self` so one adapter can serve concurrent sends.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Stable lowercase identifier for logs (e.g. `"smtp"`).
    fn name(&self) -> &str;

    /// Deliver one message.
    async fn send(&self, message: &MailMessage) -> Result<Delivery, TransportError>;
}
