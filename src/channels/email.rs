//! Email channel — SMTP via lettre.
//!
//! Inbound mail arrives through the webhook as raw RFC 5322 bytes and is
//! parsed by the normalizer; this module only sends.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use uuid::Uuid;

use crate::channels::{ChannelAdapter, DeliveryReceipt, OutgoingReply};
use crate::error::ChannelError;
use crate::pipeline::types::Channel;

/// Default subject when a reply has none.
const DEFAULT_SUBJECT: &str = "Hello from your concierge";

/// Email channel configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl EmailConfig {
    /// Returns `None` if `EMAIL_SMTP_HOST` is not set (channel disabled).
    pub fn from_env() -> Option<Self> {
        let smtp_host = std::env::var("EMAIL_SMTP_HOST").ok()?;

        let smtp_port: u16 = std::env::var("EMAIL_SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let password = SecretString::from(std::env::var("EMAIL_PASSWORD").unwrap_or_default());
        let from_address = std::env::var("EMAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Some(Self {
            smtp_host,
            smtp_port,
            username,
            password,
            from_address,
        })
    }
}

/// SMTP sender.
pub struct EmailChannel {
    config: EmailConfig,
}

impl EmailChannel {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }

    fn failed(reason: String) -> ChannelError {
        ChannelError::SendFailed {
            name: "email".into(),
            reason,
        }
    }

    /// Build the message; returns it with its Message-ID (without brackets).
    fn build_message(&self, reply: &OutgoingReply) -> Result<(Message, String), ChannelError> {
        let domain = self
            .config
            .from_address
            .rsplit_once('@')
            .map_or("localhost", |(_, d)| d);
        let message_id = format!("{}@{domain}", Uuid::new_v4());

        let to = reply.recipient.parse().map_err(|_| ChannelError::InvalidRecipient {
            name: "email".into(),
            recipient: reply.recipient.clone(),
        })?;
        let from = self
            .config
            .from_address
            .parse()
            .map_err(|e| Self::failed(format!("Invalid from address: {e}")))?;

        let mut builder = Message::builder()
            .from(from)
            .to(to)
            .subject(reply.subject.as_deref().unwrap_or(DEFAULT_SUBJECT))
            .message_id(Some(format!("<{message_id}>")));
        if let Some(parent) = &reply.in_reply_to {
            builder = builder
                .in_reply_to(format!("<{parent}>"))
                .references(format!("<{parent}>"));
        }

        let email = builder
            .body(reply.text.clone())
            .map_err(|e| Self::failed(format!("Failed to build email: {e}")))?;
        Ok((email, message_id))
    }
}

#[async_trait]
impl ChannelAdapter for EmailChannel {
    fn channel(&self) -> Channel {
        Channel::Email
    }

    async fn send(&self, reply: &OutgoingReply) -> Result<DeliveryReceipt, ChannelError> {
        let (email, message_id) = self.build_message(reply)?;

        let creds = Credentials::new(
            self.config.username.clone(),
            self.config.password.expose_secret().to_string(),
        );
        let transport = SmtpTransport::relay(&self.config.smtp_host)
            .map_err(|e| Self::failed(format!("SMTP relay error: {e}")))?
            .port(self.config.smtp_port)
            .credentials(creds)
            .build();

        // lettre's SMTP transport is blocking.
        tokio::task::spawn_blocking(move || transport.send(&email))
            .await
            .map_err(|e| Self::failed(format!("SMTP task failed: {e}")))?
            .map_err(|e| Self::failed(format!("SMTP send failed: {e}")))?;

        tracing::info!(
            thread_id = %reply.thread_id,
            message_id = %message_id,
            "Email sent to {}",
            reply.recipient
        );
        Ok(DeliveryReceipt::new(Some(message_id)))
    }
}
