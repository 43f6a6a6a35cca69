use std::time::Duration;

use async_trait::async_trait;
use herald_core::{SmtpConfig, SmtpTls};
use herald_queue::{Delivery, MailMessage, MailTransport, TransportError};
use lettre::{
    message::{
        header::ContentType, Attachment as MimeAttachment, Mailbox, MultiPart, SinglePart,
    },
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, SmtpError};

/// SMTP relay client implementing [`MailTransport`].
///
/// Cheap to share: `lettre`'s async transport opens a connection per send,
/// so concurrent dispatcher workers never contend on this struct.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    host: String,
}

impl SmtpMailer {
    pub fn from_config(config: &SmtpConfig) -> Result<Self> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e: lettre::address::AddressError| SmtpError::InvalidSender {
                address: config.from.clone(),
                reason: e.to_string(),
            })?;

        let mut builder = match config.tls {
            SmtpTls::Wrapper => AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)?,
            SmtpTls::Starttls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
            }
            SmtpTls::None => {
                warn!(host = %config.host, "SMTP without TLS; credentials travel in clear text");
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
            }
        };
        builder = builder
            .port(config.port)
            .timeout(Some(Duration::from_secs(config.timeout_secs)));
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            // App passwords are often pasted with spaces.
            let pass: String = pass.chars().filter(|c| !c.is_whitespace()).collect();
            builder = builder.credentials(Credentials::new(user.clone(), pass));
        }

        info!(host = %config.host, port = config.port, tls = ?config.tls, "SMTP transport configured");
        Ok(Self {
            transport: builder.build(),
            from,
            host: config.host.clone(),
        })
    }

    /// Build the MIME message and its `Message-ID`.
    ///
    /// Anything rejected here can never succeed, so all errors are permanent.
    pub fn build_message(&self, message: &MailMessage) -> std::result::Result<(Message, String), TransportError> {
        let domain = self.from.email.domain();
        let message_id = format!("<{}@{}>", Uuid::new_v4(), domain);

        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(message.subject.clone())
            .message_id(Some(message_id.clone()));
        for to in &message.to {
            let mailbox: Mailbox = to.parse().map_err(|e| {
                TransportError::Permanent(format!("invalid recipient {to:?}: {e}"))
            })?;
            builder = builder.to(mailbox);
        }

        let text = message.text.clone();
        let built = if message.attachments.is_empty() {
            match &message.html {
                Some(html) => {
                    builder.multipart(MultiPart::alternative_plain_html(text, html.clone()))
                }
                None => builder.body(text),
            }
        } else {
            let mut mixed = match &message.html {
                Some(html) => MultiPart::mixed()
                    .multipart(MultiPart::alternative_plain_html(text, html.clone())),
                None => MultiPart::mixed().singlepart(SinglePart::plain(text)),
            };
            for attachment in &message.attachments {
                let content_type = ContentType::parse(&attachment.content_type).map_err(|e| {
                    TransportError::Permanent(format!(
                        "attachment {:?} has invalid content type {:?}: {e}",
                        attachment.filename, attachment.content_type
                    ))
                })?;
                mixed = mixed.singlepart(
                    MimeAttachment::new(attachment.filename.clone())
                        .body(attachment.content.clone(), content_type),
                );
            }
            builder.multipart(mixed)
        };

        let email = built
            .map_err(|e| TransportError::Permanent(format!("message build failed: {e}")))?;
        Ok((email, message_id))
    }
}

/// 5xx replies are permanent. Connection, TLS, timeout and 4xx errors may clear up.
fn classify(err: lettre::transport::smtp::Error) -> TransportError {
    if err.is_permanent() {
        TransportError::Permanent(err.to_string())
    } else {
        TransportError::Transient(err.to_string())
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(&self, message: &MailMessage) -> std::result::Result<Delivery, TransportError> {
        let (email, message_id) = self.build_message(message)?;
        debug!(host = %self.host, %message_id, recipients = message.to.len(), "sending via SMTP");

        let response = self.transport.send(email).await.map_err(classify)?;
        debug!(code = %response.code(), "SMTP accepted message");
        Ok(Delivery { message_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_queue::Attachment;

    fn config(from: &str) -> SmtpConfig {
        SmtpConfig {
            host: "localhost".into(),
            port: 2525,
            username: None,
            password: None,
            from: from.into(),
            tls: SmtpTls::None,
            timeout_secs: 5,
        }
    }

    fn mailer() -> SmtpMailer {
        SmtpMailer::from_config(&config("Reports <reports@example.com>")).unwrap()
    }

    fn message() -> MailMessage {
        MailMessage {
            to: vec!["dana@example.org".into(), "eli@example.org".into()],
            subject: "Monthly summary".into(),
            text: "Plain body".into(),
            html: None,
            attachments: vec![],
        }
    }

    fn render(email: &Message) -> String {
        String::from_utf8_lossy(&email.formatted()).into_owned()
    }

    #[tokio::test]
    async fn invalid_sender_is_a_config_error() {
        assert!(matches!(
            SmtpMailer::from_config(&config("not an address")),
            Err(SmtpError::InvalidSender { .. })
        ));
    }

    #[tokio::test]
    async fn plain_message_carries_headers_and_message_id() {
        let (email, message_id) = mailer().build_message(&message()).unwrap();
        assert!(message_id.starts_with('<'));
        assert!(message_id.ends_with("@example.com>"));

        let raw = render(&email);
        assert!(raw.contains("Subject: Monthly summary"));
        assert!(raw.contains("dana@example.org"));
        assert!(raw.contains("eli@example.org"));
        assert!(raw.contains(&message_id));
        assert!(!raw.contains("multipart"));
    }

    #[tokio::test]
    async fn html_body_becomes_alternative_part() {
        let msg = MailMessage {
            html: Some("<p>Rich body</p>".into()),
            ..message()
        };
        let (email, _) = mailer().build_message(&msg).unwrap();
        let raw = render(&email);
        assert!(raw.contains("multipart/alternative"));
        assert!(raw.contains("text/html"));
    }

    #[tokio::test]
    async fn attachments_make_a_mixed_message() {
        let msg = MailMessage {
            attachments: vec![Attachment {
                filename: "report.csv".into(),
                content_type: "text/csv".into(),
                content: b"a,b\n1,2\n".to_vec(),
            }],
            ..message()
        };
        let (email, _) = mailer().build_message(&msg).unwrap();
        let raw = render(&email);
        assert!(raw.contains("multipart/mixed"));
        assert!(raw.contains("report.csv"));
    }

    #[tokio::test]
    async fn bad_recipient_is_permanent() {
        let msg = MailMessage {
            to: vec!["nope".into()],
            ..message()
        };
        assert!(matches!(
            mailer().build_message(&msg),
            Err(TransportError::Permanent(_))
        ));
    }

    #[tokio::test]
    async fn bad_attachment_content_type_is_permanent() {
        let msg = MailMessage {
            attachments: vec![Attachment {
                filename: "x.bin".into(),
                content_type: "not a mime type".into(),
                content: vec![0, 1, 2],
            }],
            ..message()
        };
        assert!(matches!(
            mailer().build_message(&msg),
            Err(TransportError::Permanent(_))
        ));
    }
}
