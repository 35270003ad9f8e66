//! Thread history accessor.
//!
//! The router never talks to the database directly for conversation
//! state. Reads go through here so every decision sees history exactly up
//! to (and including) the message being triaged.

use std::sync::Arc;

use tracing::debug;

use crate::error::TriageError;
use crate::pipeline::types::{CanonicalMessage, reply_id_for};
use crate::store::{AppendOutcome, Database, DeliveryStatus};

/// What an earlier attempt at the same trigger left behind.
#[derive(Debug, Clone, PartialEq)]
pub enum PriorAttempt {
    /// Nothing; triage from scratch.
    None,
    /// A reply went out (or was refused by the channel), or a task run
    /// started.
    Handled,
    /// The reply was stored but its send never finished.
    Unsent(CanonicalMessage),
}

/// Read/append access to thread history.
#[derive(Clone)]
pub struct ThreadHistory {
    db: Arc<dyn Database>,
    context_limit: Option<usize>,
}

impl ThreadHistory {
    /// `context_limit` caps how many messages are handed to the model.
    /// State is always derived from the whole thread.
    pub fn new(db: Arc<dyn Database>, context_limit: Option<usize>) -> Self {
        Self { db, context_limit }
    }

    pub fn database(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// All messages of a thread, oldest first.
    pub async fn get_history(&self, thread_id: &str) -> Result<Vec<CanonicalMessage>, TriageError> {
        self.db
            .get_history(thread_id, None)
            .await
            .map_err(TriageError::HistoryUnavailable)
    }

    /// History up to and including `trigger`.
    ///
    /// Messages stored after the trigger (a concurrent delivery, or our own
    /// reply on a retry) are dropped so the decision is the same one the
    /// first attempt would have made.
    pub async fn history_through(
        &self,
        trigger: &CanonicalMessage,
    ) -> Result<Vec<CanonicalMessage>, TriageError> {
        let mut history = self.get_history(&trigger.thread_id).await?;
        match history.iter().position(|m| m.id == trigger.id) {
            Some(index) => history.truncate(index + 1),
            None => {
                debug!(message_id = %trigger.id, "Trigger not stored; appending");
                history.retain(|m| m.created_at <= trigger.created_at);
                history.push(trigger.clone());
            }
        }
        Ok(history)
    }

    /// The tail of `history` that fits the model context.
    pub fn context<'a>(&self, history: &'a [CanonicalMessage]) -> &'a [CanonicalMessage] {
        match self.context_limit {
            Some(limit) if history.len() > limit => &history[history.len() - limit..],
            _ => history,
        }
    }

    /// Store an inbound (or echoed) message.
    pub async fn append(&self, message: &CanonicalMessage) -> Result<AppendOutcome, TriageError> {
        self.db
            .append_message(message)
            .await
            .map_err(TriageError::Persist)
    }

    /// Inspect what a previous attempt at `trigger` got done.
    pub async fn prior_attempt(
        &self,
        trigger: &CanonicalMessage,
    ) -> Result<PriorAttempt, TriageError> {
        let reply = self
            .db
            .get_message(&trigger.thread_id, &reply_id_for(&trigger.id))
            .await
            .map_err(TriageError::HistoryUnavailable)?;

        if let Some(reply) = reply {
            let events = self
                .db
                .delivery_events_for_message(&reply.id)
                .await
                .map_err(TriageError::HistoryUnavailable)?;
            let finished = events
                .iter()
                .any(|e| e.status != DeliveryStatus::Pending);
            return Ok(if finished {
                PriorAttempt::Handled
            } else {
                PriorAttempt::Unsent(reply)
            });
        }

        let run = self
            .db
            .task_run_for_trigger(&trigger.thread_id, &trigger.id)
            .await
            .map_err(TriageError::HistoryUnavailable)?;
        Ok(match run {
            Some(_) => PriorAttempt::Handled,
            None => PriorAttempt::None,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::*;
    use crate::pipeline::types::Channel;
    use crate::store::{DeliveryEvent, LibSqlBackend, TaskKind};

    fn msg(id: &str, seconds: i64, agent: bool) -> CanonicalMessage {
        let base = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        CanonicalMessage {
            id: id.into(),
            thread_id: "web:s1".into(),
            sender_id: (!agent).then(|| "web:u1".to_string()),
            sender_name: None,
            sender_is_agent: agent,
            text: format!("text {id}"),
            channel: Channel::Web,
            created_at: base + Duration::seconds(seconds),
            reply_to: "s1".into(),
            subject: None,
            is_group: false,
            mentions_agent: false,
        }
    }

    async fn history() -> ThreadHistory {
        let db = LibSqlBackend::new_memory().await.unwrap();
        ThreadHistory::new(Arc::new(db), None)
    }

    #[tokio::test]
    async fn history_through_truncates_after_trigger() {
        let history = history().await;
        for m in [msg("a", 0, false), msg("b", 1, true), msg("c", 2, false), msg("d", 3, false)] {
            history.append(&m).await.unwrap();
        }

        let through = history.history_through(&msg("c", 2, false)).await.unwrap();
        let ids: Vec<_> = through.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn history_through_appends_unstored_trigger() {
        let history = history().await;
        history.append(&msg("a", 0, false)).await.unwrap();
        history.append(&msg("c", 5, true)).await.unwrap();

        let through = history.history_through(&msg("b", 1, false)).await.unwrap();
        let ids: Vec<_> = through.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn context_limit_only_trims_model_context() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let history = ThreadHistory::new(Arc::new(db), Some(2));
        for (i, id) in ["a", "b", "c", "d"].into_iter().enumerate() {
            history.append(&msg(id, i as i64, i % 2 == 1)).await.unwrap();
        }

        let full = history.history_through(&msg("d", 3, true)).await.unwrap();
        assert_eq!(full.len(), 4);
        let ids: Vec<_> = history.context(&full).iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "d"]);
    }

    #[tokio::test]
    async fn prior_attempt_tracks_reply_delivery_and_task_runs() {
        let history = history().await;
        let db = history.database().clone();
        let trigger = msg("a", 0, false);
        history.append(&trigger).await.unwrap();
        assert_eq!(history.prior_attempt(&trigger).await.unwrap(), PriorAttempt::None);

        let reply = CanonicalMessage::agent_reply(&trigger, "hi");
        history.append(&reply).await.unwrap();
        let mut event = DeliveryEvent {
            message_id: Some(reply.id.clone()),
            provider_id: None,
            channel: "web".into(),
            status: DeliveryStatus::Pending,
            error: None,
            created_at: Utc::now(),
        };
        db.record_delivery_event(&event).await.unwrap();
        match history.prior_attempt(&trigger).await.unwrap() {
            PriorAttempt::Unsent(stored) => assert_eq!(stored.text, "hi"),
            other => panic!("expected unsent reply, got {other:?}"),
        }

        event.status = DeliveryStatus::Sent;
        db.record_delivery_event(&event).await.unwrap();
        assert_eq!(history.prior_attempt(&trigger).await.unwrap(), PriorAttempt::Handled);

        let other = msg("b", 1, false);
        db.create_task_run("web:s1", TaskKind::WelcomeEmail, "jane@example.com", "b")
            .await
            .unwrap();
        assert_eq!(history.prior_attempt(&other).await.unwrap(), PriorAttempt::Handled);
    }
}
