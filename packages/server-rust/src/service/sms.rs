//! SMS transport capability.
//!
//! Handlers depend on [`SmsService`] only; the wire protocol of the real
//! provider stays behind the trait.

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

/// Sends a text message to a phone number in E.164 format.
#[async_trait]
pub trait SmsService: Send + Sync {
    /// Deliver `message` to `phone_number`.
    async fn send_message(&self, phone_number: &str, message: &str) -> anyhow::Result<()>;
}

/// A message accepted by [`MockSmsService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub phone_number: String,
    pub message: String,
}

/// Logs messages instead of sending them. Used outside production.
#[derive(Debug, Default)]
pub struct MockSmsService {
    sent: Mutex<Vec<SentMessage>>,
}

impl MockSmsService {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages accepted so far, oldest first.
    #[must_use]
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl SmsService for MockSmsService {
    async fn send_message(&self, phone_number: &str, message: &str) -> anyhow::Result<()> {
        info!(phone = phone_number, message, "sms sent (mock)");
        self.sent.lock().push(SentMessage {
            phone_number: phone_number.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }
}
