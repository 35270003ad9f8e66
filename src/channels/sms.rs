//! SMS channel — provider REST API, form-encoded, basic auth.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::channels::{ChannelAdapter, DeliveryReceipt, OutgoingReply};
use crate::error::ChannelError;
use crate::pipeline::types::Channel;

const DEFAULT_API_BASE: &str = "https://api.twilio.com";

/// SMS sender configuration.
#[derive(Debug, Clone)]
pub struct SmsConfig {
    pub api_base: String,
    pub account_sid: String,
    pub auth_token: SecretString,
    /// Number messages are sent from, E.164.
    pub from_number: String,
    /// Where the provider posts delivery status callbacks.
    pub status_callback_url: Option<String>,
}

impl SmsConfig {
    /// Returns `None` if `SMS_ACCOUNT_SID` is not set (channel disabled).
    pub fn from_env() -> Option<Self> {
        let account_sid = std::env::var("SMS_ACCOUNT_SID").ok()?;
        Some(Self {
            api_base: std::env::var("SMS_API_BASE")
                .unwrap_or_else(|_| DEFAULT_API_BASE.to_string())
                .trim_end_matches('/')
                .to_string(),
            account_sid,
            auth_token: SecretString::from(std::env::var("SMS_AUTH_TOKEN").unwrap_or_default()),
            from_number: std::env::var("SMS_FROM_NUMBER").unwrap_or_default(),
            status_callback_url: std::env::var("SMS_STATUS_CALLBACK_URL").ok(),
        })
    }
}

pub struct SmsChannel {
    client: Client,
    config: SmsConfig,
}

impl SmsChannel {
    pub fn new(config: SmsConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.config.api_base, self.config.account_sid
        )
    }
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    sid: Option<String>,
}

#[async_trait]
impl ChannelAdapter for SmsChannel {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn send(&self, reply: &OutgoingReply) -> Result<DeliveryReceipt, ChannelError> {
        if !reply.recipient.starts_with('+') || reply.recipient.len() < 2 {
            return Err(ChannelError::InvalidRecipient {
                name: "sms".into(),
                recipient: reply.recipient.clone(),
            });
        }

        let mut form = vec![
            ("To", reply.recipient.as_str()),
            ("From", self.config.from_number.as_str()),
            ("Body", reply.text.as_str()),
        ];
        if let Some(url) = &self.config.status_callback_url {
            form.push(("StatusCallback", url.as_str()));
        }

        let failed = |reason: String| ChannelError::SendFailed {
            name: "sms".into(),
            reason,
        };

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(
                &self.config.account_sid,
                Some(self.config.auth_token.expose_secret()),
            )
            .form(&form)
            .send()
            .await
            .map_err(|e| failed(format!("request error: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(failed(format!("HTTP {status}: {body}")));
        }

        let body: SendResponse = response
            .json()
            .await
            .map_err(|e| failed(format!("invalid response: {e}")))?;

        tracing::info!(thread_id = %reply.thread_id, sid = ?body.sid, "SMS sent");
        Ok(DeliveryReceipt::new(body.sid))
    }
}
