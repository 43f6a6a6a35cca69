use thiserror::Error;

/// Errors raised while setting up the SMTP transport.
///
/// Per-message failures are reported as `herald_queue::TransportError`
/// instead, already classified for the retry policy.
#[derive(Debug, Error)]
pub enum SmtpError {
    /// The configured sender is not a valid mailbox.
    #[error("Invalid sender address {address:?}: {reason}")]
    InvalidSender { address: String, reason: String },

    /// The relay could not be configured (bad host, TLS parameters).
    #[error("SMTP configuration error: {0}")]
    Config(#[from] lettre::transport::smtp::Error),
}

pub type Result<T> = std::result::Result<T, SmtpError>;
