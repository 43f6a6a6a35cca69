#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_queue::{
    Delivery, DispatcherConfig, MailMessage, MailTransport, NewEmail, TransportError,
};

/// Transport that replays a fixed script of outcomes, then succeeds forever.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<(), TransportError>>>,
    calls: AtomicUsize,
    delay: Duration,
    sent: Mutex<Vec<MailMessage>>,
}

impl ScriptedTransport {
    pub fn ok() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_script(script: Vec<Result<(), TransportError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            ..Default::default()
        })
    }

    /// Every send takes `delay` before returning.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<MailMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailTransport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn send(&self, message: &MailMessage) -> Result<Delivery, TransportError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
        next?;
        self.sent.lock().unwrap().push(message.clone());
        Ok(Delivery {
            message_id: format!("<scripted-{n}@example.com>"),
        })
    }
}

pub fn transient(msg: &str) -> Result<(), TransportError> {
    Err(TransportError::Transient(msg.to_string()))
}

pub fn permanent(msg: &str) -> Result<(), TransportError> {
    Err(TransportError::Permanent(msg.to_string()))
}

/// Fast loop settings for tests.
pub fn fast_config() -> DispatcherConfig {
    DispatcherConfig {
        poll_interval: Duration::from_millis(50),
        batch_size: 10,
        max_concurrent: 4,
        send_timeout: Duration::from_secs(2),
        drain_timeout: Duration::from_secs(2),
        reconcile_on_start: false,
        stale_after: Duration::from_secs(60),
    }
}

pub fn request(max_retries: u32) -> NewEmail {
    NewEmail {
        user_id: "user-1".into(),
        organization_id: "org-1".into(),
        recipients: vec!["carol@example.com".into()],
        subject: "Quarterly numbers".into(),
        body: "Attached.".into(),
        max_retries,
        ..Default::default()
    }
}

pub fn request_at(max_retries: u32, at: DateTime<Utc>) -> NewEmail {
    NewEmail {
        scheduled_at: Some(at),
        ..request(max_retries)
    }
}
