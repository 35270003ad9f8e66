//! `Database` trait — the single async interface to persistence.
//!
//! History is the only source of onboarding state, so every read here must
//! see every write that completed before it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;
use crate::pipeline::types::CanonicalMessage;

/// Result of appending a message keyed by `(thread_id, external_id)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Stored; carries the row id.
    Inserted(String),
    /// A message with the same key already existed; nothing written.
    Duplicate,
}

impl AppendOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

/// Delivery state of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    /// Map a provider status word (SMS status callbacks, etc.).
    pub fn from_provider(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "sent" | "accepted" | "sending" => Self::Sent,
            "delivered" => Self::Delivered,
            "read" => Self::Read,
            "failed" | "undelivered" | "canceled" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// One delivery event. Events are appended, never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryEvent {
    /// Canonical message the event belongs to, when known.
    pub message_id: Option<String>,
    /// Id the provider assigned to the send.
    pub provider_id: Option<String>,
    pub channel: String,
    pub status: DeliveryStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Kind of side workflow a thread can hand off to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    WelcomeEmail,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WelcomeEmail => "welcome_email",
        }
    }
}

/// Lifecycle of a task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub(crate) fn parse(s: &str) -> Self {
        match s {
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// A recorded run of a side workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRun {
    pub id: String,
    pub thread_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    /// What the run acted on (e.g. the email address welcomed).
    pub subject: String,
    /// Inbound message that started the run.
    pub trigger_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Backend-agnostic persistence for messages, deliveries and task runs.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Messages ────────────────────────────────────────────────────

    /// Messages of a thread, oldest first, ordered by `created_at` then
    /// insertion order. With `limit`, only the most recent `limit` messages.
    async fn get_history(
        &self,
        thread_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<CanonicalMessage>, DatabaseError>;

    /// Append a message unless `(thread_id, id)` is already stored.
    async fn append_message(&self, message: &CanonicalMessage)
    -> Result<AppendOutcome, DatabaseError>;

    /// The stored message keyed `(thread_id, external_id)`, if any.
    async fn get_message(
        &self,
        thread_id: &str,
        external_id: &str,
    ) -> Result<Option<CanonicalMessage>, DatabaseError>;

    // ── Deliveries ──────────────────────────────────────────────────

    async fn record_delivery_event(&self, event: &DeliveryEvent) -> Result<(), DatabaseError>;

    /// Most recent event for a provider message id.
    async fn latest_delivery_event(
        &self,
        provider_id: &str,
    ) -> Result<Option<DeliveryEvent>, DatabaseError>;

    /// All events for a canonical message, oldest first.
    async fn delivery_events_for_message(
        &self,
        message_id: &str,
    ) -> Result<Vec<DeliveryEvent>, DatabaseError>;

    // ── Task runs ───────────────────────────────────────────────────

    /// The pending run of `kind` for a thread, if any.
    async fn open_task_run(
        &self,
        thread_id: &str,
        kind: TaskKind,
    ) -> Result<Option<TaskRun>, DatabaseError>;

    /// The run started by an inbound message of a thread, in any state.
    async fn task_run_for_trigger(
        &self,
        thread_id: &str,
        trigger_id: &str,
    ) -> Result<Option<TaskRun>, DatabaseError>;

    async fn create_task_run(
        &self,
        thread_id: &str,
        kind: TaskKind,
        subject: &str,
        trigger_id: &str,
    ) -> Result<TaskRun, DatabaseError>;

    async fn update_task_run_status(&self, id: &str, status: TaskStatus)
    -> Result<(), DatabaseError>;
}
