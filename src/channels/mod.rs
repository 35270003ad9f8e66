//! Outbound channel adapters.
//!
//! Each adapter sends one reply and reports the provider's id for it. The
//! registry picks the adapter for a message's channel; a channel without a
//! configured adapter fails with `ChannelError::NotConfigured`.

pub mod email;
pub mod sms;
pub mod web;
pub mod whatsapp;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::ChannelError;
use crate::pipeline::types::{CanonicalMessage, Channel};

pub use email::{EmailChannel, EmailConfig};
pub use sms::{SmsChannel, SmsConfig};
pub use web::WebChannel;
pub use whatsapp::{WhatsAppChannel, WhatsAppConfig};

/// A message to send out.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingReply {
    /// Canonical id of the outbound message.
    pub message_id: String,
    pub channel: Channel,
    pub thread_id: String,
    /// Channel address (chat id, phone, email address, web session).
    pub recipient: String,
    pub text: String,
    pub subject: Option<String>,
    /// Channel-native id of the message being answered (email threading).
    pub in_reply_to: Option<String>,
}

impl OutgoingReply {
    /// The outbound form of a stored agent message.
    ///
    /// `trigger_id` is the inbound message it answers, when there is one.
    pub fn from_message(message: &CanonicalMessage, trigger_id: Option<&str>) -> Self {
        Self {
            message_id: message.id.clone(),
            channel: message.channel,
            thread_id: message.thread_id.clone(),
            recipient: message.reply_to.clone(),
            text: message.text.clone(),
            subject: message.subject.clone(),
            in_reply_to: trigger_id.map(str::to_string),
        }
    }
}

/// What the provider told us about an accepted send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub provider_id: Option<String>,
    pub accepted_at: DateTime<Utc>,
}

impl DeliveryReceipt {
    pub fn new(provider_id: Option<String>) -> Self {
        Self {
            provider_id,
            accepted_at: Utc::now(),
        }
    }
}

/// Sends messages on one channel.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Channel served by this adapter.
    fn channel(&self) -> Channel;

    async fn send(&self, reply: &OutgoingReply) -> Result<DeliveryReceipt, ChannelError>;
}

/// Adapter lookup by channel.
#[derive(Clone, Default)]
pub struct ChannelRegistry {
    adapters: HashMap<Channel, Arc<dyn ChannelAdapter>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one for its channel.
    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        tracing::info!(channel = %adapter.channel(), "Channel adapter registered");
        self.adapters.insert(adapter.channel(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn ChannelAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, channel: Channel) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(&channel).cloned()
    }

    pub async fn send(&self, reply: &OutgoingReply) -> Result<DeliveryReceipt, ChannelError> {
        let adapter = self.get(reply.channel).ok_or_else(|| ChannelError::NotConfigured {
            name: reply.channel.to_string(),
        })?;
        adapter.send(reply).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    struct Recording {
        channel: Channel,
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChannelAdapter for Recording {
        fn channel(&self) -> Channel {
            self.channel
        }

        async fn send(&self, reply: &OutgoingReply) -> Result<DeliveryReceipt, ChannelError> {
            self.sent.lock().unwrap().push(reply.text.clone());
            Ok(DeliveryReceipt::new(Some("p-1".into())))
        }
    }

    fn reply(channel: Channel) -> OutgoingReply {
        OutgoingReply {
            message_id: "reply:m1".into(),
            channel,
            thread_id: "t1".into(),
            recipient: "r".into(),
            text: "hello".into(),
            subject: None,
            in_reply_to: None,
        }
    }

    #[tokio::test]
    async fn routes_to_registered_adapter() {
        let sms = Arc::new(Recording {
            channel: Channel::Sms,
            sent: Mutex::new(Vec::new()),
        });
        let registry = ChannelRegistry::new().with(sms.clone());
        let receipt = registry.send(&reply(Channel::Sms)).await.unwrap();
        assert_eq!(receipt.provider_id.as_deref(), Some("p-1"));
        assert_eq!(*sms.sent.lock().unwrap(), vec!["hello".to_string()]);
    }

    #[tokio::test]
    async fn missing_adapter_is_not_configured() {
        let err = ChannelRegistry::new()
            .send(&reply(Channel::WhatsApp))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::NotConfigured { name } if name == "whatsapp"));
    }
}
