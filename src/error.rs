//! Error types for AI Concierge.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Normalize error: {0}")]
    Normalize(#[from] NormalizeError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Triage error: {0}")]
    Triage(#[from] TriageError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Inbound payload could not be turned into a canonical message.
///
/// Rejected at the boundary with a 4xx; never retried.
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("Malformed {channel} payload: {reason}")]
    MalformedPayload { channel: String, reason: String },

    #[error("Undecodable payload body: {0}")]
    Json(#[from] serde_json::Error),
}

impl NormalizeError {
    pub fn malformed(channel: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            channel: channel.into(),
            reason: reason.into(),
        }
    }
}

/// Outbound channel errors (delivery failures).
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Channel {name} is not configured")]
    NotConfigured { name: String },

    #[error("Invalid recipient for channel {name}: {recipient}")]
    InvalidRecipient { name: String, recipient: String },
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

/// Errors that leave an inbound message unanswered.
///
/// Everything else degrades to a fallback reply inside the router.
#[derive(Debug, thiserror::Error)]
pub enum TriageError {
    #[error("Thread history unavailable: {0}")]
    HistoryUnavailable(DatabaseError),

    #[error("Failed to persist message: {0}")]
    Persist(DatabaseError),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
