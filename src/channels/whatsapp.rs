//! WhatsApp channel — Cloud API compatible `POST {api_url}/messages`.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;

use crate::channels::{ChannelAdapter, DeliveryReceipt, OutgoingReply};
use crate::error::ChannelError;
use crate::pipeline::types::Channel;

/// WhatsApp sender configuration.
#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    /// Base URL up to and including the phone number id,
    /// e.g. `https://graph.facebook.com/v21.0/<phone_number_id>`.
    pub api_url: String,
    pub access_token: SecretString,
}

impl WhatsAppConfig {
    /// Returns `None` if `WHATSAPP_API_URL` is not set (channel disabled).
    pub fn from_env() -> Option<Self> {
        let api_url = std::env::var("WHATSAPP_API_URL").ok()?;
        let access_token = std::env::var("WHATSAPP_ACCESS_TOKEN").unwrap_or_default();
        Some(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            access_token: SecretString::from(access_token),
        })
    }
}

pub struct WhatsAppChannel {
    client: Client,
    config: WhatsAppConfig,
}

impl WhatsAppChannel {
    pub fn new(config: WhatsAppConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn failed(reason: String) -> ChannelError {
        ChannelError::SendFailed {
            name: "whatsapp".into(),
            reason,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: String,
}

#[async_trait]
impl ChannelAdapter for WhatsAppChannel {
    fn channel(&self) -> Channel {
        Channel::WhatsApp
    }

    async fn send(&self, reply: &OutgoingReply) -> Result<DeliveryReceipt, ChannelError> {
        if reply.recipient.trim().is_empty() {
            return Err(ChannelError::InvalidRecipient {
                name: "whatsapp".into(),
                recipient: reply.recipient.clone(),
            });
        }

        let payload = json!({
            "messaging_product": "whatsapp",
            "to": reply.recipient,
            "type": "text",
            "text": { "body": reply.text },
        });

        let response = self
            .client
            .post(format!("{}/messages", self.config.api_url))
            .bearer_auth(self.config.access_token.expose_secret())
            .json(&payload)
            .send()
            .await
            .map_err(|e| Self::failed(format!("request error: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Self::failed(format!("HTTP {status}: {body}")));
        }

        let body: SendResponse = response
            .json()
            .await
            .map_err(|e| Self::failed(format!("invalid response: {e}")))?;
        let provider_id = body.messages.into_iter().next().map(|m| m.id);

        tracing::info!(
            thread_id = %reply.thread_id,
            provider_id = ?provider_id,
            "WhatsApp message sent"
        );
        Ok(DeliveryReceipt::new(provider_id))
    }
}
