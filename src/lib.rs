//! AI Concierge — multi-channel triage and onboarding engine.

pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod onboarding;
pub mod pipeline;
pub mod server;
pub mod store;
