//! Field extraction — reconstructs onboarding progress from thread history.
//!
//! No onboarding state is stored anywhere. Every triage decision re-reads
//! the thread and pairs each agent question with the user reply that
//! follows it. The result is a pure function of (history, fields).

use std::sync::Arc;

use tracing::trace;

use super::classifier::{KeywordClassifier, QuestionClassifier};
use super::model::{CollectedFields, FieldSet, OnboardingStatus};
use crate::pipeline::types::CanonicalMessage;

/// Everything the router needs to know about onboarding progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub snapshot: CollectedFields,
    /// Field asked by the agent and not yet answered, if any.
    pub pending: Option<String>,
    pub status: OnboardingStatus,
    /// History index of the reply that first made every required field present.
    pub completed_at: Option<usize>,
}

impl Extraction {
    /// Whether an agent message follows the completing reply, i.e. the
    /// completion message has already gone out.
    pub fn completion_emitted(&self, history: &[CanonicalMessage]) -> bool {
        match self.completed_at {
            Some(index) => history
                .iter()
                .skip(index + 1)
                .any(|m| m.sender_is_agent),
            None => false,
        }
    }
}

/// Walks thread history with an injected field list and classifier.
#[derive(Clone)]
pub struct FieldExtractor {
    fields: Arc<FieldSet>,
    classifier: Arc<dyn QuestionClassifier>,
}

impl FieldExtractor {
    pub fn new(fields: Arc<FieldSet>, classifier: Arc<dyn QuestionClassifier>) -> Self {
        Self { fields, classifier }
    }

    /// Extractor using [`KeywordClassifier`].
    pub fn with_keywords(fields: Arc<FieldSet>) -> Self {
        Self::new(fields, Arc::new(KeywordClassifier::new()))
    }

    pub fn fields(&self) -> &FieldSet {
        &self.fields
    }

    pub fn classifier(&self) -> &dyn QuestionClassifier {
        self.classifier.as_ref()
    }

    pub fn extract(&self, history: &[CanonicalMessage]) -> Extraction {
        extract_collected_fields(history, &self.fields, self.classifier.as_ref())
    }
}

/// Infer which onboarding fields already have a satisfactory answer.
///
/// Rules, applied in history order:
/// - an agent message asking for a field makes it the single pending field,
///   replacing any earlier pending one;
/// - a non-empty, non-interrogative user message answers the pending field
///   and clears it;
/// - a user question leaves the pending field untouched;
/// - a later answer to the same field overwrites the earlier one, so a
///   collected field never disappears as history grows.
pub fn extract_collected_fields(
    history: &[CanonicalMessage],
    fields: &FieldSet,
    classifier: &dyn QuestionClassifier,
) -> Extraction {
    let mut snapshot = CollectedFields::new();
    let mut pending: Option<&str> = None;
    let mut started = false;
    let mut completed_at = None;

    for (index, message) in history.iter().enumerate() {
        if message.sender_is_agent {
            if let Some(field) = classifier.field_asked(&message.text, fields, &snapshot) {
                trace!(index, field = %field.field_key, "Agent asked for field");
                started = true;
                pending = Some(field.field_key.as_str());
            }
            continue;
        }

        let text = message.text.trim();
        if text.is_empty() {
            continue;
        }
        let Some(field_key) = pending else {
            continue;
        };
        if classifier.is_question(text) {
            trace!(index, field = field_key, "User asked a question; field stays pending");
            continue;
        }

        snapshot.insert(field_key, text);
        pending = None;
        if completed_at.is_none() && fields.has_required() && fields.all_required_collected(&snapshot)
        {
            completed_at = Some(index);
        }
    }

    let status = if !started {
        OnboardingStatus::NotStarted
    } else if fields.all_required_collected(&snapshot) {
        OnboardingStatus::Complete
    } else {
        OnboardingStatus::InProgress
    };

    Extraction {
        snapshot,
        pending: pending.map(str::to_string),
        status,
        completed_at,
    }
}
