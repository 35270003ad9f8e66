//! Heuristics that stand in for intent parsing during field extraction.
//!
//! Kept behind [`QuestionClassifier`] so a model-based classifier can replace
//! the keyword rules without touching the extractor or router.

use std::sync::LazyLock;

use regex::Regex;

use super::model::{CollectedFields, FieldDefinition, FieldSet};

/// Leading interrogative words that mark a user message as a question even
/// without a trailing `?`.
static INTERROGATIVE_START: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(what|why|how|who|whom|whose|where|which|huh|pardon|come again)\b")
        .expect("valid interrogative regex")
});

/// Clarification requests anywhere in the message.
static CLARIFICATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(what do you mean|what does that mean|i don'?t understand|not sure what you mean|(can|could) you (repeat|explain|clarify|rephrase))",
    )
    .expect("valid clarification regex")
});

/// Classifies agent questions and user replies for the field extractor.
pub trait QuestionClassifier: Send + Sync {
    /// Fields an agent message asks for, in field order.
    ///
    /// `snapshot` is the state before this message, so an implementation can
    /// tell a recap of known answers from a fresh question.
    fn field_asked<'a>(
        &self,
        agent_text: &str,
        fields: &'a FieldSet,
        snapshot: &CollectedFields,
    ) -> Option<&'a FieldDefinition>;

    /// Whether a user message is itself a question (a clarifying detour).
    fn is_question(&self, user_text: &str) -> bool;
}

/// Keyword and pattern based classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Every field whose terms appear in `text`, in field order.
    pub fn matching_fields<'a>(&self, text: &str, fields: &'a FieldSet) -> Vec<&'a FieldDefinition> {
        let haystack = text.to_lowercase();
        fields
            .iter()
            .filter(|f| f.match_terms().iter().any(|t| contains_term(&haystack, t)))
            .collect()
    }
}

impl QuestionClassifier for KeywordClassifier {
    fn field_asked<'a>(
        &self,
        agent_text: &str,
        fields: &'a FieldSet,
        snapshot: &CollectedFields,
    ) -> Option<&'a FieldDefinition> {
        let questions = question_sentences(agent_text);
        let scope = if questions.is_empty() {
            agent_text.to_string()
        } else {
            questions.join(" ")
        };

        let matched = self.matching_fields(&scope, fields);
        if let Some(field) = matched
            .iter()
            .find(|f| !snapshot.is_collected(&f.field_key))
        {
            return Some(field);
        }

        // Only an explicit question re-opens a collected field (a reminder).
        // A statement mentioning known fields is an acknowledgement.
        if questions.is_empty() {
            None
        } else {
            matched.first().copied()
        }
    }

    fn is_question(&self, user_text: &str) -> bool {
        let trimmed = user_text.trim();
        if trimmed.is_empty() {
            return false;
        }
        trimmed.ends_with('?')
            || INTERROGATIVE_START.is_match(trimmed)
            || CLARIFICATION.is_match(trimmed)
    }
}

/// Sentences of `text` that end with a question mark.
pub fn question_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        match ch {
            '?' => {
                current.push(ch);
                let sentence = current.trim();
                if sentence.len() > 1 {
                    sentences.push(sentence.to_string());
                }
                current.clear();
            }
            '.' | '!' | '\n' => current.clear(),
            _ => current.push(ch),
        }
    }
    sentences
}

/// Case-sensitive whole-word containment; callers lowercase both sides.
fn contains_term(haystack: &str, term: &str) -> bool {
    if term.is_empty() {
        return false;
    }
    haystack.match_indices(term).any(|(start, _)| {
        let end = start + term.len();
        let before_ok = haystack[..start]
            .chars()
            .next_back()
            .is_none_or(|c| !c.is_alphanumeric());
        let after_ok = haystack[end..]
            .chars()
            .next()
            .is_none_or(|c| !c.is_alphanumeric());
        before_ok && after_ok
    })
}
