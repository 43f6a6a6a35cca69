//! `herald-smtp` — SMTP delivery for the Herald queue, built on `lettre`.
//!
//! [`SmtpMailer`] implements [`herald_queue::MailTransport`]. It builds one
//! MIME message per send (plain text, optional HTML alternative, optional
//! attachments), stamps a `Message-ID`, and classifies every failure as
//! transient or permanent. It never retries on its own.

pub mod error;
pub mod mailer;

pub use error::{Result, SmtpError};
pub use mailer::SmtpMailer;
