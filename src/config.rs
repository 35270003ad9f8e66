//! Configuration types.
//!
//! Everything here is built once at startup and passed explicitly into the
//! normalizer, extractor, prompt builder and router. Nothing downstream
//! reads the environment.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::onboarding::model::{FieldDefinition, FieldSet};

/// Default steady-state system prompt. `{agent_name}` is substituted.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are {agent_name}, a warm and practical personal assistant reachable over WhatsApp, SMS, \
email and web chat.

Guidelines:
- Keep replies short and conversational; this is a chat, not an essay.
- Use what you know about the user to personalize your help.
- If you are unsure what the user wants, ask one short clarifying question.";

/// Reply sent when anything between ingestion and dispatch goes wrong.
pub const DEFAULT_FALLBACK_REPLY: &str =
    "Sorry, I'm having trouble answering right now. Could you try again in a moment?";

/// When the agent answers in group threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupReplyMode {
    /// Reply to every group message.
    #[default]
    Always,
    /// Reply only when the agent is mentioned.
    MentionOnly,
}

impl std::str::FromStr for GroupReplyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" => Ok(Self::Always),
            "mention_only" | "mention-only" | "mentions" => Ok(Self::MentionOnly),
            other => Err(format!("expected always|mention_only, got {other:?}")),
        }
    }
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Agent display name, also used for mention detection.
    pub name: String,
    /// The agent's own WhatsApp number (digits), used to repair `"+"` group senders.
    pub whatsapp_number: Option<String>,
    /// The agent's SMS number (digits), used to recognize echoed sends.
    pub sms_number: Option<String>,
    /// The agent's own email address.
    pub email_address: Option<String>,
    /// Steady-state system prompt.
    pub system_prompt: String,
    /// Ordered onboarding fields.
    pub fields: FieldSet,
    pub group_reply_mode: GroupReplyMode,
    /// Upper bound on a single LLM call.
    pub llm_timeout: Duration,
    /// Most recent messages given to the model as context; `None` sends the
    /// whole thread. Onboarding state always reads the whole thread.
    pub history_limit: Option<usize>,
    pub fallback_reply: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Concierge".to_string(),
            whatsapp_number: None,
            sms_number: None,
            email_address: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            fields: FieldSet::default_fields(),
            group_reply_mode: GroupReplyMode::default(),
            llm_timeout: Duration::from_secs(25),
            history_limit: None,
            fallback_reply: DEFAULT_FALLBACK_REPLY.to_string(),
        }
    }
}

impl AgentConfig {
    /// Build from `CONCIERGE_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("CONCIERGE_AGENT_NAME") {
            config.name = name;
        }
        config.whatsapp_number = env_digits("CONCIERGE_WHATSAPP_NUMBER");
        config.sms_number = env_digits("CONCIERGE_SMS_NUMBER");
        config.email_address = std::env::var("CONCIERGE_EMAIL_ADDRESS")
            .ok()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());

        if let Ok(prompt) = std::env::var("CONCIERGE_SYSTEM_PROMPT") {
            config.system_prompt = prompt;
        }

        if let Ok(raw) = std::env::var("CONCIERGE_ONBOARDING_FIELDS") {
            config.fields = parse_fields(&raw)?;
        }

        if let Ok(mode) = std::env::var("CONCIERGE_GROUP_REPLY_MODE") {
            config.group_reply_mode =
                mode.parse().map_err(|message| ConfigError::InvalidValue {
                    key: "CONCIERGE_GROUP_REPLY_MODE".into(),
                    message,
                })?;
        }

        if let Ok(secs) = std::env::var("CONCIERGE_LLM_TIMEOUT_SECS") {
            let secs: u64 = secs.parse().map_err(|e| ConfigError::InvalidValue {
                key: "CONCIERGE_LLM_TIMEOUT_SECS".into(),
                message: format!("{e}"),
            })?;
            config.llm_timeout = Duration::from_secs(secs);
        }

        if let Ok(raw) = std::env::var("CONCIERGE_HISTORY_LIMIT") {
            config.history_limit = parse_history_limit(&raw)?;
        }

        if let Ok(reply) = std::env::var("CONCIERGE_FALLBACK_REPLY") {
            config.fallback_reply = reply;
        }

        Ok(config)
    }
}

/// Decode a JSON array of field definitions.
pub fn parse_fields(raw: &str) -> Result<FieldSet, ConfigError> {
    let defs: Vec<FieldDefinition> =
        serde_json::from_str(raw).map_err(|e| ConfigError::InvalidValue {
            key: "CONCIERGE_ONBOARDING_FIELDS".into(),
            message: e.to_string(),
        })?;
    FieldSet::new(defs)
}

/// Decode a context limit. `0` means no limit.
pub fn parse_history_limit(raw: &str) -> Result<Option<usize>, ConfigError> {
    let limit: usize = raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
        key: "CONCIERGE_HISTORY_LIMIT".into(),
        message: format!("{e}"),
    })?;
    Ok((limit > 0).then_some(limit))
}

fn env_digits(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.chars().filter(char::is_ascii_digit).collect::<String>())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_builtin_fields() {
        let config = AgentConfig::default();
        let keys: Vec<&str> = config.fields.iter().map(|f| f.field_key.as_str()).collect();
        assert_eq!(keys, ["name", "email", "big_dream"]);
        assert_eq!(config.group_reply_mode, GroupReplyMode::Always);
    }

    #[test]
    fn parse_fields_from_json() {
        let set = parse_fields(
            r#"[
                {"field_key": "goal", "prompt_hint": "their goal", "order": 2},
                {"field_key": "name", "prompt_hint": "their name", "order": 1, "keywords": ["name"]}
            ]"#,
        )
        .unwrap();
        assert_eq!(set.iter().next().unwrap().field_key, "name");
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn parse_fields_rejects_bad_json() {
        let err = parse_fields("{not json").unwrap_err();
        assert!(err.to_string().contains("CONCIERGE_ONBOARDING_FIELDS"));
    }

    #[test]
    fn parse_fields_rejects_duplicate_orders() {
        let result = parse_fields(
            r#"[{"field_key": "a", "prompt_hint": "a", "order": 1},
                {"field_key": "b", "prompt_hint": "b", "order": 1}]"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn history_limit_parses_or_rejects() {
        assert_eq!(parse_history_limit("40").unwrap(), Some(40));
        assert_eq!(parse_history_limit(" 0 ").unwrap(), None);
        let err = parse_history_limit("forty").unwrap_err();
        assert!(err.to_string().contains("CONCIERGE_HISTORY_LIMIT"));
    }

    #[test]
    fn group_reply_mode_parses() {
        assert_eq!("mention_only".parse::<GroupReplyMode>().unwrap(), GroupReplyMode::MentionOnly);
        assert_eq!("Always".parse::<GroupReplyMode>().unwrap(), GroupReplyMode::Always);
        assert!("sometimes".parse::<GroupReplyMode>().is_err());
    }
}
