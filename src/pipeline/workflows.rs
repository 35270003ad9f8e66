//! Side workflows the router can hand a thread off to.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{info, warn};

use crate::channels::{ChannelRegistry, OutgoingReply};
use crate::error::Error;
use crate::pipeline::types::{CanonicalMessage, Channel};
use crate::store::{Database, DeliveryEvent, DeliveryStatus, TaskKind, TaskRun, TaskStatus};

/// A pending run untouched this long is treated as abandoned.
const STALE_AFTER_MINUTES: i64 = 10;

/// Sends a welcome email to an address a user shared in chat.
///
/// Each run is recorded as a task run keyed by the triggering message, so
/// the router can see a run is pending and a re-delivered trigger can see
/// it was already handled.
#[derive(Clone)]
pub struct WelcomeEmailWorkflow {
    db: Arc<dyn Database>,
    channels: ChannelRegistry,
    agent_name: String,
    stale_after: Duration,
}

impl WelcomeEmailWorkflow {
    pub fn new(db: Arc<dyn Database>, channels: ChannelRegistry, agent_name: impl Into<String>) -> Self {
        Self {
            db,
            channels,
            agent_name: agent_name.into(),
            stale_after: Duration::minutes(STALE_AFTER_MINUTES),
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    /// Whether a welcome email is still in flight for the thread.
    pub async fn is_pending(&self, thread_id: &str) -> Result<bool, Error> {
        let open = self
            .db
            .open_task_run(thread_id, TaskKind::WelcomeEmail)
            .await?;
        Ok(match open {
            Some(run) if Utc::now() - run.updated_at < self.stale_after => true,
            Some(run) => {
                warn!(run_id = %run.id, thread_id, "Ignoring stale pending welcome run");
                false
            }
            None => false,
        })
    }

    /// Run the workflow for `address`. Returns the finished task run.
    pub async fn run(
        &self,
        trigger: &CanonicalMessage,
        address: &str,
        display_name: Option<&str>,
    ) -> Result<TaskRun, Error> {
        let mut run = self
            .db
            .create_task_run(&trigger.thread_id, TaskKind::WelcomeEmail, address, &trigger.id)
            .await?;
        info!(run_id = %run.id, thread_id = %trigger.thread_id, "Welcome email workflow started");

        let email = OutgoingReply {
            message_id: format!("welcome:{}", run.id),
            channel: Channel::Email,
            thread_id: trigger.thread_id.clone(),
            recipient: address.to_string(),
            text: self.welcome_body(display_name),
            subject: Some(format!("Welcome from {}", self.agent_name)),
            in_reply_to: None,
        };

        let result = self.channels.send(&email).await;
        let (status, event) = match &result {
            Ok(receipt) => (
                TaskStatus::Completed,
                delivery_event(&email, receipt.provider_id.clone(), DeliveryStatus::Sent, None),
            ),
            Err(e) => (
                TaskStatus::Failed,
                delivery_event(&email, None, DeliveryStatus::Failed, Some(e.to_string())),
            ),
        };

        if let Err(e) = self.db.record_delivery_event(&event).await {
            warn!(run_id = %run.id, error = %e, "Failed to record welcome email delivery");
        }
        if let Err(e) = self.db.update_task_run_status(&run.id, status).await {
            warn!(run_id = %run.id, status = status.as_str(), error = %e, "Failed to update task run");
        }
        run.status = status;
        run.updated_at = Utc::now();

        match result {
            Ok(_) => {
                info!(run_id = %run.id, "Welcome email sent");
                Ok(run)
            }
            Err(e) => {
                warn!(run_id = %run.id, error = %e, "Welcome email failed");
                Err(Error::Channel(e))
            }
        }
    }

    fn welcome_body(&self, display_name: Option<&str>) -> String {
        let greeting = match display_name {
            Some(name) if !name.trim().is_empty() => format!("Hi {},", name.trim()),
            _ => "Hi there,".to_string(),
        };
        format!(
            "{greeting}\n\n\
             Thanks for sharing your email with me. I'm {agent}, and I'll use this \
             address to send you anything that's easier to read outside of chat.\n\n\
             Just reply to our conversation whenever you need something.\n\n\
             {agent}",
            agent = self.agent_name
        )
    }
}

fn delivery_event(
    email: &OutgoingReply,
    provider_id: Option<String>,
    status: DeliveryStatus,
    error: Option<String>,
) -> DeliveryEvent {
    DeliveryEvent {
        message_id: Some(email.message_id.clone()),
        provider_id,
        channel: email.channel.to_string(),
        status,
        error,
        created_at: Utc::now(),
    }
}
