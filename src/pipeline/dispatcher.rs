//! Reply dispatcher — persists agent replies and sends them out.
//!
//! Every reply is stored as an agent-authored canonical message BEFORE the
//! send, keyed by its trigger, so a re-delivered trigger can never produce a
//! second reply record. Sends are tracked as append-only delivery events.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::channels::{ChannelRegistry, OutgoingReply};
use crate::error::{DatabaseError, TriageError};
use crate::pipeline::types::CanonicalMessage;
use crate::store::{AppendOutcome, Database, DeliveryEvent, DeliveryStatus};

/// How a dispatch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Stored and accepted by the channel.
    Sent { provider_id: Option<String> },
    /// Stored, but the channel send failed. The record is kept.
    Failed { reason: String },
    /// A reply to this trigger already exists; nothing was sent.
    AlreadyDispatched,
}

/// What happened to an inbound agent-authored message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoOutcome {
    /// Provider echo of a send we already recorded.
    KnownSend,
    /// Sent from outside this service (e.g. the phone itself); stored.
    Stored,
    /// Already stored.
    Duplicate,
}

/// SMS provider status callback body.
#[derive(Debug, Clone, Deserialize)]
pub struct SmsStatusPayload {
    #[serde(rename = "MessageSid")]
    pub message_sid: String,
    #[serde(rename = "MessageStatus")]
    pub message_status: String,
    #[serde(rename = "ErrorCode", default)]
    pub error_code: Option<String>,
}

/// Persists and sends agent replies.
#[derive(Clone)]
pub struct ReplyDispatcher {
    db: Arc<dyn Database>,
    channels: ChannelRegistry,
}

impl ReplyDispatcher {
    pub fn new(db: Arc<dyn Database>, channels: ChannelRegistry) -> Self {
        Self { db, channels }
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    /// Store and send the reply to `trigger`.
    ///
    /// Storage failure is returned so the caller can retry; send failure is
    /// logged and recorded as a delivery event.
    pub async fn dispatch(
        &self,
        trigger: &CanonicalMessage,
        text: &str,
    ) -> Result<DispatchOutcome, TriageError> {
        let reply = CanonicalMessage::agent_reply(trigger, text);

        match self
            .db
            .append_message(&reply)
            .await
            .map_err(TriageError::Persist)?
        {
            AppendOutcome::Duplicate => {
                info!(
                    thread_id = %reply.thread_id,
                    trigger_id = %trigger.id,
                    "Reply already dispatched for trigger, skipping send"
                );
                return Ok(DispatchOutcome::AlreadyDispatched);
            }
            AppendOutcome::Inserted(_) => {}
        }

        self.record(&reply, None, DeliveryStatus::Pending, None).await;
        Ok(self.deliver(trigger, &reply).await)
    }

    /// Send a reply an earlier attempt stored but never finished sending.
    pub async fn resend(
        &self,
        trigger: &CanonicalMessage,
        reply: &CanonicalMessage,
    ) -> DispatchOutcome {
        info!(
            thread_id = %reply.thread_id,
            trigger_id = %trigger.id,
            "Resending stored reply"
        );
        self.deliver(trigger, reply).await
    }

    async fn deliver(
        &self,
        trigger: &CanonicalMessage,
        reply: &CanonicalMessage,
    ) -> DispatchOutcome {
        let outgoing = OutgoingReply::from_message(reply, Some(&trigger.id));
        match self.channels.send(&outgoing).await {
            Ok(receipt) => {
                info!(
                    channel = %reply.channel,
                    thread_id = %reply.thread_id,
                    provider_id = ?receipt.provider_id,
                    "Reply sent"
                );
                self.record(reply, receipt.provider_id.clone(), DeliveryStatus::Sent, None)
                    .await;
                DispatchOutcome::Sent {
                    provider_id: receipt.provider_id,
                }
            }
            Err(e) => {
                warn!(
                    channel = %reply.channel,
                    thread_id = %reply.thread_id,
                    error = %e,
                    "Reply delivery failed"
                );
                let reason = e.to_string();
                self.record(reply, None, DeliveryStatus::Failed, Some(reason.clone()))
                    .await;
                DispatchOutcome::Failed { reason }
            }
        }
    }

    /// Loop guard for agent-authored inbound messages.
    ///
    /// These are never triaged. An echo of a send we recorded is dropped;
    /// anything else the agent account sent is stored so history stays
    /// complete.
    pub async fn ingest_agent_message(
        &self,
        message: &CanonicalMessage,
    ) -> Result<EchoOutcome, TriageError> {
        let known = self
            .db
            .latest_delivery_event(&message.id)
            .await
            .map_err(TriageError::HistoryUnavailable)?;
        if known.is_some() {
            debug!(message_id = %message.id, "Echo of our own send, ignoring");
            return Ok(EchoOutcome::KnownSend);
        }

        let outcome = self
            .db
            .append_message(message)
            .await
            .map_err(TriageError::Persist)?;
        Ok(match outcome {
            AppendOutcome::Inserted(_) => {
                debug!(thread_id = %message.thread_id, "Stored agent-authored message");
                EchoOutcome::Stored
            }
            AppendOutcome::Duplicate => EchoOutcome::Duplicate,
        })
    }

    /// Record an SMS provider status callback against the original send.
    pub async fn record_sms_status(&self, payload: &SmsStatusPayload) -> Result<(), DatabaseError> {
        let previous = self.db.latest_delivery_event(&payload.message_sid).await?;
        let event = DeliveryEvent {
            message_id: previous.and_then(|e| e.message_id),
            provider_id: Some(payload.message_sid.clone()),
            channel: "sms".into(),
            status: DeliveryStatus::from_provider(&payload.message_status),
            error: payload.error_code.clone().filter(|c| !c.is_empty()),
            created_at: Utc::now(),
        };
        info!(
            provider_id = %payload.message_sid,
            status = event.status.as_str(),
            "SMS delivery status"
        );
        self.db.record_delivery_event(&event).await
    }

    async fn record(
        &self,
        reply: &CanonicalMessage,
        provider_id: Option<String>,
        status: DeliveryStatus,
        error: Option<String>,
    ) {
        let event = DeliveryEvent {
            message_id: Some(reply.id.clone()),
            provider_id,
            channel: reply.channel.to_string(),
            status,
            error,
            created_at: Utc::now(),
        };
        if let Err(e) = self.db.record_delivery_event(&event).await {
            warn!(message_id = %reply.id, error = %e, "Failed to record delivery event");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::channels::{ChannelAdapter, DeliveryReceipt};
    use crate::error::ChannelError;
    use crate::pipeline::types::Channel;
    use crate::store::LibSqlBackend;

    struct Recorder {
        fail: bool,
        sent: Mutex<Vec<OutgoingReply>>,
    }

    #[async_trait]
    impl ChannelAdapter for Recorder {
        fn channel(&self) -> Channel {
            Channel::Sms
        }

        async fn send(&self, reply: &OutgoingReply) -> Result<DeliveryReceipt, ChannelError> {
            self.sent.lock().unwrap().push(reply.clone());
            if self.fail {
                return Err(ChannelError::SendFailed {
                    name: "sms".into(),
                    reason: "boom".into(),
                });
            }
            Ok(DeliveryReceipt::new(Some("SM123".into())))
        }
    }

    fn trigger() -> CanonicalMessage {
        CanonicalMessage {
            id: "SMin1".into(),
            thread_id: "sms:15550001111".into(),
            sender_id: Some("sms:15550001111".into()),
            sender_name: None,
            sender_is_agent: false,
            text: "hi".into(),
            channel: Channel::Sms,
            created_at: Utc::now(),
            reply_to: "+15550001111".into(),
            subject: None,
            is_group: false,
            mentions_agent: false,
        }
    }

    async fn setup(fail: bool) -> (ReplyDispatcher, Arc<Recorder>, Arc<dyn Database>) {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let recorder = Arc::new(Recorder {
            fail,
            sent: Mutex::new(Vec::new()),
        });
        let channels = ChannelRegistry::new().with(recorder.clone());
        (ReplyDispatcher::new(db.clone(), channels), recorder, db)
    }

    #[tokio::test]
    async fn dispatch_persists_then_sends() {
        let (dispatcher, recorder, db) = setup(false).await;
        let trigger = trigger();
        db.append_message(&trigger).await.unwrap();

        let outcome = dispatcher.dispatch(&trigger, "Hello!").await.unwrap();
        assert_eq!(
            outcome,
            DispatchOutcome::Sent {
                provider_id: Some("SM123".into())
            }
        );

        let history = db.get_history("sms:15550001111", None).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[1].sender_is_agent);
        assert_eq!(history[1].text, "Hello!");

        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, "+15550001111");

        let events = db.delivery_events_for_message("reply:SMin1").await.unwrap();
        let statuses: Vec<_> = events.iter().map(|e| e.status).collect();
        assert_eq!(statuses, vec![DeliveryStatus::Pending, DeliveryStatus::Sent]);
    }

    #[tokio::test]
    async fn second_dispatch_for_same_trigger_is_skipped() {
        let (dispatcher, recorder, _db) = setup(false).await;
        let trigger = trigger();
        dispatcher.dispatch(&trigger, "one").await.unwrap();
        let again = dispatcher.dispatch(&trigger, "two").await.unwrap();
        assert_eq!(again, DispatchOutcome::AlreadyDispatched);
        assert_eq!(recorder.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_send_keeps_record() {
        let (dispatcher, _recorder, db) = setup(true).await;
        let trigger = trigger();
        let outcome = dispatcher.dispatch(&trigger, "Hello!").await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::Failed { .. }));

        assert!(
            db.get_message("sms:15550001111", "reply:SMin1")
                .await
                .unwrap()
                .is_some()
        );
        let events = db.delivery_events_for_message("reply:SMin1").await.unwrap();
        assert_eq!(events.last().unwrap().status, DeliveryStatus::Failed);
    }

    #[tokio::test]
    async fn echo_of_known_send_is_not_stored() {
        let (dispatcher, _recorder, db) = setup(false).await;
        dispatcher.dispatch(&trigger(), "Hello!").await.unwrap();

        let echo = CanonicalMessage {
            id: "SM123".into(),
            sender_is_agent: true,
            sender_id: None,
            text: "Hello!".into(),
            ..trigger()
        };
        assert_eq!(
            dispatcher.ingest_agent_message(&echo).await.unwrap(),
            EchoOutcome::KnownSend
        );
        assert!(
            db.get_message("sms:15550001111", "SM123")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn unknown_agent_message_is_stored_once() {
        let (dispatcher, _recorder, _db) = setup(false).await;
        let manual = CanonicalMessage {
            id: "SMmanual".into(),
            sender_is_agent: true,
            sender_id: None,
            ..trigger()
        };
        assert_eq!(
            dispatcher.ingest_agent_message(&manual).await.unwrap(),
            EchoOutcome::Stored
        );
        assert_eq!(
            dispatcher.ingest_agent_message(&manual).await.unwrap(),
            EchoOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn sms_status_links_to_original_message() {
        let (dispatcher, _recorder, db) = setup(false).await;
        dispatcher.dispatch(&trigger(), "Hello!").await.unwrap();

        dispatcher
            .record_sms_status(&SmsStatusPayload {
                message_sid: "SM123".into(),
                message_status: "delivered".into(),
                error_code: None,
            })
            .await
            .unwrap();

        let latest = db.latest_delivery_event("SM123").await.unwrap().unwrap();
        assert_eq!(latest.status, DeliveryStatus::Delivered);
        assert_eq!(latest.message_id.as_deref(), Some("reply:SMin1"));
    }
}
