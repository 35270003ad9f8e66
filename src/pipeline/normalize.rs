//! Message Normalizer — channel payloads in, one `CanonicalMessage` out.
//!
//! Identity is flattened here: downstream code only ever sees opaque
//! `"<channel>:<id>"` sender and thread ids and never branches on phone
//! or address formats.

use chrono::{DateTime, Utc};
use mail_parser::MessageParser;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::AgentConfig;
use crate::error::NormalizeError;
use crate::pipeline::types::{CanonicalMessage, Channel};

// ── Payloads ────────────────────────────────────────────────────────

/// A WhatsApp webhook message as delivered by the gateway.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WhatsAppPayload {
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub chat_id: Option<String>,
    /// `"user"` or `"group"`.
    #[serde(default)]
    pub chat_type: Option<String>,
    #[serde(default)]
    pub sender_phone: Option<String>,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub from_me: bool,
    /// Unix seconds (number or numeric string) or RFC 3339.
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub message_content: Option<WhatsAppContent>,
    #[serde(default)]
    pub mentioned_numbers: Vec<String>,
}

/// Structured content of a rich WhatsApp message.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WhatsAppContent {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
}

/// SMS provider webhook form fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SmsPayload {
    #[serde(rename = "MessageSid", default)]
    pub message_sid: Option<String>,
    #[serde(rename = "From", default)]
    pub from: Option<String>,
    #[serde(rename = "To", default)]
    pub to: Option<String>,
    #[serde(rename = "Body", default)]
    pub body: Option<String>,
    #[serde(rename = "ProfileName", default)]
    pub profile_name: Option<String>,
}

/// In-app web chat message.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebPayload {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub is_from_agent: bool,
}

/// Any inbound payload.
#[derive(Debug, Clone)]
pub enum InboundPayload {
    WhatsApp(WhatsAppPayload),
    Sms(SmsPayload),
    /// Raw RFC 5322 message.
    Email(Vec<u8>),
    Web(WebPayload),
}

// ── Normalizer ──────────────────────────────────────────────────────

/// Converts channel payloads using the agent's configured identity.
#[derive(Debug, Clone)]
pub struct Normalizer {
    whatsapp_number: Option<String>,
    sms_number: Option<String>,
    email_address: Option<String>,
    name_pattern: Option<Regex>,
}

impl Normalizer {
    pub fn new(config: &AgentConfig) -> Self {
        let name = config.name.trim();
        let name_pattern = (!name.is_empty())
            .then(|| Regex::new(&format!(r"(?i)(^|[^\w])@?{}\b", regex::escape(name))).ok())
            .flatten();
        Self {
            whatsapp_number: config.whatsapp_number.clone(),
            sms_number: config.sms_number.clone(),
            email_address: config.email_address.clone(),
            name_pattern,
        }
    }

    pub fn normalize(&self, payload: InboundPayload) -> Result<CanonicalMessage, NormalizeError> {
        let message = match payload {
            InboundPayload::WhatsApp(p) => self.normalize_whatsapp(&p),
            InboundPayload::Sms(p) => self.normalize_sms(&p),
            InboundPayload::Email(raw) => self.normalize_email(&raw),
            InboundPayload::Web(p) => self.normalize_web(&p),
        }?;
        debug!(
            channel = %message.channel,
            thread_id = %message.thread_id,
            message_id = %message.id,
            agent = message.sender_is_agent,
            "Normalized inbound message"
        );
        Ok(message)
    }

    pub fn normalize_whatsapp(
        &self,
        p: &WhatsAppPayload,
    ) -> Result<CanonicalMessage, NormalizeError> {
        const CH: &str = "whatsapp";
        let id = required(CH, "message_id", p.message_id.as_deref())?;
        let chat_id = required(CH, "chat_id", p.chat_id.as_deref())?;
        let is_group = p.chat_type.as_deref() == Some("group") || chat_id.ends_with("@g.us");

        let mut digits = digits_only(p.sender_phone.as_deref().unwrap_or_default());
        let mut repaired = false;
        if digits.is_empty() {
            // The gateway reports agent-sent group messages with a bare "+".
            match (&self.whatsapp_number, is_group) {
                (Some(agent), true) => {
                    warn!(message_id = %id, chat_id = %chat_id, "Repairing placeholder group sender");
                    digits = agent.clone();
                    repaired = true;
                }
                _ => return Err(NormalizeError::malformed(CH, "missing sender_phone")),
            }
        }

        let sender_is_agent =
            p.from_me || repaired || self.whatsapp_number.as_deref() == Some(digits.as_str());

        let text = p
            .body
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .or_else(|| {
                p.message_content
                    .as_ref()
                    .and_then(|c| c.text.as_deref().or(c.caption.as_deref()))
            })
            .unwrap_or_default()
            .trim()
            .to_string();

        let created_at = match &p.timestamp {
            Some(value) => parse_timestamp(value).ok_or_else(|| {
                NormalizeError::malformed(CH, format!("unparseable timestamp: {value}"))
            })?,
            None => Utc::now(),
        };

        let mentions_agent = self.whatsapp_number.as_deref().is_some_and(|agent| {
            p.mentioned_numbers.iter().any(|n| digits_only(n) == agent)
                || text.contains(&format!("@{agent}"))
        }) || self.mentions_name(&text);

        Ok(CanonicalMessage {
            id: id.to_string(),
            thread_id: format!("{CH}:{chat_id}"),
            sender_id: Some(format!("{CH}:{digits}")),
            sender_name: non_blank(p.sender_name.as_deref())
                .or_else(|| Some(display_name_from_phone(&digits))),
            sender_is_agent,
            text,
            channel: Channel::WhatsApp,
            created_at,
            reply_to: chat_id.to_string(),
            subject: None,
            is_group,
            mentions_agent,
        })
    }

    pub fn normalize_sms(&self, p: &SmsPayload) -> Result<CanonicalMessage, NormalizeError> {
        const CH: &str = "sms";
        let id = required(CH, "MessageSid", p.message_sid.as_deref())?;
        let from = digits_only(required(CH, "From", p.from.as_deref())?);
        let to = digits_only(p.to.as_deref().unwrap_or_default());
        if from.is_empty() {
            return Err(NormalizeError::malformed(CH, "From has no digits"));
        }

        let sender_is_agent = self.sms_number.as_deref() == Some(from.as_str());
        // The thread is keyed by the user's number whichever side sent.
        let user = if sender_is_agent { to } else { from.clone() };
        if user.is_empty() {
            return Err(NormalizeError::malformed(CH, "To has no digits"));
        }

        Ok(CanonicalMessage {
            id: id.to_string(),
            thread_id: format!("{CH}:{user}"),
            sender_id: Some(format!("{CH}:{from}")),
            sender_name: non_blank(p.profile_name.as_deref())
                .or_else(|| Some(display_name_from_phone(&from))),
            sender_is_agent,
            text: p.body.as_deref().unwrap_or_default().trim().to_string(),
            channel: Channel::Sms,
            created_at: Utc::now(),
            reply_to: format!("+{user}"),
            subject: None,
            is_group: false,
            mentions_agent: false,
        })
    }

    pub fn normalize_email(&self, raw: &[u8]) -> Result<CanonicalMessage, NormalizeError> {
        const CH: &str = "email";
        let parsed = MessageParser::default()
            .parse(raw)
            .ok_or_else(|| NormalizeError::malformed(CH, "not an RFC 5322 message"))?;

        let id = required(CH, "Message-ID", parsed.message_id())?.to_string();
        let from = parsed
            .from()
            .and_then(|addr| addr.first())
            .ok_or_else(|| NormalizeError::malformed(CH, "missing From"))?;
        let address = from
            .address()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| NormalizeError::malformed(CH, "From has no address"))?;

        let root = parsed
            .references()
            .as_text_list()
            .and_then(|refs| refs.first().map(|r| r.to_string()))
            .or_else(|| parsed.in_reply_to().as_text().map(str::to_string))
            .unwrap_or_else(|| id.clone());

        let sender_is_agent = self.email_address.as_deref() == Some(address.as_str());
        let reply_to = if sender_is_agent {
            parsed
                .to()
                .and_then(|addr| addr.first())
                .and_then(|a| a.address())
                .map(|s| s.to_lowercase())
                .unwrap_or_else(|| address.clone())
        } else {
            address.clone()
        };

        let created_at = parsed
            .date()
            .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
            .unwrap_or_else(Utc::now);

        Ok(CanonicalMessage {
            id,
            thread_id: format!("{CH}:{root}"),
            sender_id: Some(format!("{CH}:{address}")),
            sender_name: non_blank(from.name()).or_else(|| Some(display_name_from_email(&address))),
            sender_is_agent,
            text: email_text(&parsed),
            channel: Channel::Email,
            created_at,
            reply_to,
            subject: parsed.subject().map(str::to_string),
            is_group: false,
            mentions_agent: false,
        })
    }

    pub fn normalize_web(&self, p: &WebPayload) -> Result<CanonicalMessage, NormalizeError> {
        const CH: &str = "web";
        let session = required(CH, "session_id", p.session_id.as_deref())?;
        let id = required(CH, "message_id", p.message_id.as_deref())?;
        let user = required(CH, "user_id", p.user_id.as_deref())?;

        Ok(CanonicalMessage {
            id: id.to_string(),
            thread_id: format!("{CH}:{session}"),
            sender_id: Some(format!("{CH}:{user}")),
            sender_name: non_blank(p.user_name.as_deref()),
            sender_is_agent: p.is_from_agent,
            text: p.text.trim().to_string(),
            channel: Channel::Web,
            // Ordered by ingestion; client clocks are ignored.
            created_at: Utc::now(),
            reply_to: session.to_string(),
            subject: None,
            is_group: false,
            mentions_agent: false,
        })
    }

    fn mentions_name(&self, text: &str) -> bool {
        self.name_pattern.as_ref().is_some_and(|re| re.is_match(text))
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn required<'a>(
    channel: &str,
    field: &str,
    value: Option<&'a str>,
) -> Result<&'a str, NormalizeError> {
    non_blank_str(value).ok_or_else(|| NormalizeError::malformed(channel, format!("missing {field}")))
}

fn non_blank_str(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

fn non_blank(value: Option<&str>) -> Option<String> {
    non_blank_str(value).map(str::to_string)
}

/// Keep only ASCII digits.
pub fn digits_only(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_digit).collect()
}

fn parse_timestamp(value: &serde_json::Value) -> Option<DateTime<Utc>> {
    match value {
        serde_json::Value::Number(n) => DateTime::from_timestamp(n.as_i64()?, 0),
        serde_json::Value::String(s) => {
            let s = s.trim();
            if let Ok(secs) = s.parse::<i64>() {
                return DateTime::from_timestamp(secs, 0);
            }
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }
        _ => None,
    }
}

/// `+<digits>`.
pub fn display_name_from_phone(digits: &str) -> String {
    format!("+{digits}")
}

/// `jane.doe+news@example.com` → `Jane Doe News`.
pub fn display_name_from_email(address: &str) -> String {
    let local = address.split('@').next().unwrap_or(address);
    local
        .split(['.', '_', '-', '+'])
        .filter(|part| !part.is_empty())
        .map(title_case)
        .collect::<Vec<_>>()
        .join(" ")
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

/// Readable body of an email with quoted replies removed.
fn email_text(parsed: &mail_parser::Message) -> String {
    let body = parsed
        .body_text(0)
        .map(|t| t.to_string())
        .or_else(|| parsed.body_html(0).map(|h| strip_html(&h)))
        .unwrap_or_default();
    strip_quoted_text(&body).trim().to_string()
}

/// Remove `>` quoted lines and everything after an attribution or
/// original-message separator.
pub fn strip_quoted_text(body: &str) -> String {
    let mut kept = Vec::new();
    for line in body.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with('>') {
            continue;
        }
        if (trimmed.starts_with("On ") && trimmed.ends_with("wrote:"))
            || (trimmed.starts_with("---") && trimmed.contains("Original Message"))
        {
            break;
        }
        kept.push(line);
    }
    while kept.last().is_some_and(|l| l.trim().is_empty()) {
        kept.pop();
    }
    kept.join("\n")
}

/// Drop tags and collapse whitespace.
pub fn strip_html(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                text.push(' ');
            }
            _ if !in_tag => text.push(ch),
            _ => {}
        }
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
