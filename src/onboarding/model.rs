//! Onboarding field definitions and the derived collected-field snapshot.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

fn default_required() -> bool {
    true
}

/// One piece of information the agent collects before general assistance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    /// Stable identifier, e.g. "name", "email", "big_dream".
    pub field_key: String,
    /// Human description used to phrase the question.
    pub prompt_hint: String,
    #[serde(default = "default_required")]
    pub required: bool,
    /// Position in the single canonical request sequence.
    pub order: u32,
    /// Terms that identify an agent message as asking for this field.
    /// Empty means the field key with `_` replaced by spaces.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
}

impl FieldDefinition {
    pub fn new(field_key: impl Into<String>, prompt_hint: impl Into<String>, order: u32) -> Self {
        Self {
            field_key: field_key.into(),
            prompt_hint: prompt_hint.into(),
            required: true,
            order,
            keywords: Vec::new(),
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    /// Lowercased terms used for question detection.
    pub fn match_terms(&self) -> Vec<String> {
        if self.keywords.is_empty() {
            vec![self.field_key.replace('_', " ").to_lowercase()]
        } else {
            self.keywords
                .iter()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty())
                .collect()
        }
    }
}

/// The ordered, validated list of onboarding fields.
///
/// Keys and orders are unique, so there is exactly one "next missing
/// field" for any snapshot, or none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldSet {
    fields: Vec<FieldDefinition>,
}

impl FieldSet {
    pub fn new(mut fields: Vec<FieldDefinition>) -> Result<Self, ConfigError> {
        let mut keys = HashSet::new();
        let mut orders = HashSet::new();
        for field in &fields {
            if field.field_key.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "onboarding_fields".into(),
                    message: "field_key must not be empty".into(),
                });
            }
            if !keys.insert(field.field_key.as_str()) {
                return Err(ConfigError::InvalidValue {
                    key: "onboarding_fields".into(),
                    message: format!("duplicate field_key {:?}", field.field_key),
                });
            }
            if !orders.insert(field.order) {
                return Err(ConfigError::InvalidValue {
                    key: "onboarding_fields".into(),
                    message: format!("duplicate order {}", field.order),
                });
            }
        }
        fields.sort_by_key(|f| f.order);
        Ok(Self { fields })
    }

    pub fn empty() -> Self {
        Self { fields: Vec::new() }
    }

    /// The built-in onboarding sequence: name, email, big dream.
    pub fn default_fields() -> Self {
        Self {
            fields: vec![
                FieldDefinition::new("name", "the user's name", 1)
                    .with_keywords(["name", "call you"]),
                FieldDefinition::new("email", "the user's email address", 2)
                    .with_keywords(["email", "e-mail"]),
                FieldDefinition::new("big_dream", "the big dream the user is working toward", 3)
                    .with_keywords(["big dream", "dream"]),
            ],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, field_key: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.field_key == field_key)
    }

    pub fn has_required(&self) -> bool {
        self.fields.iter().any(|f| f.required)
    }

    /// Lowest-order required field with no value in `snapshot`.
    pub fn next_missing(&self, snapshot: &CollectedFields) -> Option<&FieldDefinition> {
        self.fields
            .iter()
            .find(|f| f.required && !snapshot.is_collected(&f.field_key))
    }

    pub fn all_required_collected(&self, snapshot: &CollectedFields) -> bool {
        self.next_missing(snapshot).is_none()
    }
}

/// Field key → inferred answer, recomputed from history on every turn.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectedFields {
    values: BTreeMap<String, String>,
}

impl CollectedFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field_key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(field_key.into(), value.into());
    }

    pub fn get(&self, field_key: &str) -> Option<&str> {
        self.values.get(field_key).map(String::as_str)
    }

    /// Present and non-empty.
    pub fn is_collected(&self, field_key: &str) -> bool {
        self.get(field_key).is_some_and(|v| !v.trim().is_empty())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Render as a markdown section for system prompt injection, in field order.
    pub fn to_prompt_section(&self, fields: &FieldSet) -> String {
        let mut parts = vec!["# What you know about the user".to_string()];
        for field in fields.iter() {
            if let Some(value) = self.get(&field.field_key) {
                parts.push(format!("- **{}:** {}", field.prompt_hint, value));
            }
        }
        parts.join("\n")
    }
}

/// Where a thread is in the onboarding sequence (derived, never stored).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnboardingStatus {
    NotStarted,
    InProgress,
    Complete,
}

impl fmt::Display for OnboardingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
        };
        write!(f, "{s}")
    }
}
