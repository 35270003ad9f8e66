//! Shared types for the triage pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Channel ─────────────────────────────────────────────────────────

/// The transport a message arrived on (or is sent through).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    #[serde(rename = "whatsapp")]
    WhatsApp,
    #[serde(rename = "sms")]
    Sms,
    #[serde(rename = "email")]
    Email,
    #[serde(rename = "web")]
    Web,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WhatsApp => "whatsapp",
            Self::Sms => "sms",
            Self::Email => "email",
            Self::Web => "web",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "whatsapp" => Ok(Self::WhatsApp),
            "sms" => Ok(Self::Sms),
            "email" => Ok(Self::Email),
            "web" => Ok(Self::Web),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

// ── Canonical message ───────────────────────────────────────────────

/// Channel-agnostic representation of one inbound or outbound message.
///
/// Immutable once stored. Conversational order within a thread is
/// `created_at`, ties broken by delivery (insertion) order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    /// Channel-native message id; unique per thread.
    pub id: String,
    /// Channel-scoped conversation id (chat, group, SMS pair, email thread, web session).
    pub thread_id: String,
    /// Opaque stable sender id, `None` for system messages.
    pub sender_id: Option<String>,
    pub sender_name: Option<String>,
    pub sender_is_agent: bool,
    /// Normalized plain text; empty for non-text payloads.
    pub text: String,
    pub channel: Channel,
    pub created_at: DateTime<Utc>,
    /// Opaque address replies on this thread are sent to.
    pub reply_to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default)]
    pub is_group: bool,
    #[serde(default)]
    pub mentions_agent: bool,
}

impl CanonicalMessage {
    /// Build the agent-authored reply to `trigger`.
    ///
    /// The id is derived from the trigger so a re-delivered trigger maps to
    /// the same reply record.
    pub fn agent_reply(trigger: &CanonicalMessage, text: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: reply_id_for(&trigger.id),
            thread_id: trigger.thread_id.clone(),
            sender_id: None,
            sender_name: None,
            sender_is_agent: true,
            text: text.into(),
            channel: trigger.channel,
            created_at: now.max(trigger.created_at),
            reply_to: trigger.reply_to.clone(),
            subject: trigger.subject.as_ref().map(|s| reply_subject(s)),
            is_group: trigger.is_group,
            mentions_agent: false,
        }
    }

    /// Whether the text is empty after trimming.
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Idempotency key for the reply to a given inbound message.
pub fn reply_id_for(trigger_id: &str) -> String {
    format!("reply:{trigger_id}")
}

fn reply_subject(subject: &str) -> String {
    if subject.trim_start().to_ascii_lowercase().starts_with("re:") {
        subject.to_string()
    } else {
        format!("Re: {subject}")
    }
}

// ── Triage result ───────────────────────────────────────────────────

/// What the router did with an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriageAction {
    /// A reply was generated and dispatched.
    Reply,
    /// No reply (agent echo, duplicate delivery, or muted group).
    Suppressed,
    /// A task workflow took over instead of a conversational reply.
    HandedOff,
}

impl TriageAction {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Reply => "reply",
            Self::Suppressed => "suppressed",
            Self::HandedOff => "handed-off",
        }
    }
}

/// Result returned to the caller of `triage()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageOutcome {
    pub action: TriageAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_text: Option<String>,
    /// Set when the reply is the generic fallback; carries the internal cause.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

impl TriageOutcome {
    pub fn reply(text: impl Into<String>) -> Self {
        Self {
            action: TriageAction::Reply,
            reply_text: Some(text.into()),
            degraded: None,
        }
    }

    pub fn fallback(text: impl Into<String>, cause: impl Into<String>) -> Self {
        Self {
            action: TriageAction::Reply,
            reply_text: Some(text.into()),
            degraded: Some(cause.into()),
        }
    }

    pub fn suppressed() -> Self {
        Self {
            action: TriageAction::Suppressed,
            reply_text: None,
            degraded: None,
        }
    }

    pub fn handed_off() -> Self {
        Self {
            action: TriageAction::HandedOff,
            reply_text: None,
            degraded: None,
        }
    }
}
