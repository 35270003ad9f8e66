//! Steady-state rules engine.
//!
//! Once onboarding is complete (or there are no required fields) every inbound
//! message is checked against these rules in order before the LLM is called:
//! - group chat without a mention, when the agent only answers mentions → Suppress
//! - a message that is nothing but an email address → WelcomeEmail task
//!
//! If no rule matches, the router produces a default conversational reply.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::config::{AgentConfig, GroupReplyMode};
use crate::pipeline::types::CanonicalMessage;

static BARE_EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^<?([A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(?:\.[A-Za-z0-9\-]+)*\.[A-Za-z]{2,})>?[.!]?$")
        .expect("valid bare email regex")
});

/// A steady-state rule, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SteadyStateRule {
    /// Ignore group messages that don't mention the agent.
    GroupMentionOnly,
    /// Hand a bare email address to the welcome email workflow.
    WelcomeEmail,
}

/// What a matching rule asks the router to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleMatch {
    Suppress { reason: String },
    WelcomeEmail { address: String },
}

/// Ordered steady-state rules.
#[derive(Debug, Clone)]
pub struct RulesEngine {
    rules: Vec<SteadyStateRule>,
    group_reply_mode: GroupReplyMode,
    /// The agent's own address never triggers a welcome.
    own_email: Option<String>,
}

impl RulesEngine {
    pub fn new(group_reply_mode: GroupReplyMode) -> Self {
        Self {
            rules: vec![SteadyStateRule::GroupMentionOnly, SteadyStateRule::WelcomeEmail],
            group_reply_mode,
            own_email: None,
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        let mut engine = Self::new(config.group_reply_mode);
        engine.own_email = config.email_address.clone();
        engine
    }

    pub fn rules(&self) -> &[SteadyStateRule] {
        &self.rules
    }

    /// Evaluate rules against a message. Returns `None` if no rule matched.
    pub fn evaluate(&self, message: &CanonicalMessage) -> Option<RuleMatch> {
        for rule in &self.rules {
            if let Some(matched) = self.check(*rule, message) {
                debug!(
                    message_id = %message.id,
                    rule = ?rule,
                    matched = ?matched,
                    "Steady-state rule matched"
                );
                return Some(matched);
            }
        }
        None
    }

    fn check(&self, rule: SteadyStateRule, message: &CanonicalMessage) -> Option<RuleMatch> {
        match rule {
            SteadyStateRule::GroupMentionOnly => {
                let muted = message.is_group
                    && self.group_reply_mode == GroupReplyMode::MentionOnly
                    && !message.mentions_agent;
                muted.then(|| RuleMatch::Suppress {
                    reason: "group message without mention".into(),
                })
            }
            SteadyStateRule::WelcomeEmail => {
                let address = bare_email_address(&message.text)?;
                if self.own_email.as_deref() == Some(address.as_str()) {
                    return None;
                }
                Some(RuleMatch::WelcomeEmail { address })
            }
        }
    }
}

/// The address, lowercased, if `text` is nothing but an email address.
pub fn bare_email_address(text: &str) -> Option<String> {
    BARE_EMAIL
        .captures(text.trim())
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_lowercase())
}
