//! System instructions for onboarding, completion, and steady-state replies.

use serde::Serialize;

use super::model::{CollectedFields, FieldDefinition, FieldSet};

/// What a system instruction asks the model to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InstructionKind {
    /// Ask for exactly this field.
    AskField { field_key: String },
    /// All required fields collected; acknowledge and move on.
    Completion,
    /// General assistance with full history as context.
    Default,
}

/// A system prompt plus the decision it encodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemInstruction {
    pub kind: InstructionKind,
    pub text: String,
}

impl SystemInstruction {
    /// Append an extra guideline paragraph.
    pub fn with_note(mut self, note: &str) -> Self {
        self.text.push_str("\n\n");
        self.text.push_str(note);
        self
    }

    pub fn asks_for(&self) -> Option<&str> {
        match &self.kind {
            InstructionKind::AskField { field_key } => Some(field_key),
            _ => None,
        }
    }
}

/// Builds system instructions from injected persona settings.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    agent_name: String,
    base_prompt: String,
}

impl PromptBuilder {
    pub fn new(agent_name: impl Into<String>, base_prompt: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            base_prompt: base_prompt.into(),
        }
    }

    /// Instruction for the next onboarding turn.
    ///
    /// Asks for the lowest-order required field missing from `snapshot`, or
    /// produces the one-time completion instruction when none is missing.
    pub fn build_prompt(&self, fields: &FieldSet, snapshot: &CollectedFields) -> SystemInstruction {
        match fields.next_missing(snapshot) {
            Some(field) => self.ask_field(field, fields, snapshot),
            None => self.completion(fields, snapshot),
        }
    }

    fn ask_field(
        &self,
        field: &FieldDefinition,
        fields: &FieldSet,
        snapshot: &CollectedFields,
    ) -> SystemInstruction {
        let mut text = format!(
            "\
You are {name}, a friendly assistant getting to know a new user over chat.

Guidelines:
- Be concise: 1-3 sentences.
- Ask ONLY for {hint}. Do not ask for anything else in this message.
- Phrase it naturally and conversationally, not like a form.
- If the user just told you something, acknowledge it briefly first.
- Never ask again for information you already know.",
            name = self.agent_name,
            hint = field.prompt_hint,
        );

        if !snapshot.is_empty() {
            text.push_str("\n\n");
            text.push_str(&snapshot.to_prompt_section(fields));
        }

        SystemInstruction {
            kind: InstructionKind::AskField {
                field_key: field.field_key.clone(),
            },
            text,
        }
    }

    fn completion(&self, fields: &FieldSet, snapshot: &CollectedFields) -> SystemInstruction {
        let text = format!(
            "\
You are {name}. The user has just finished onboarding.

Thank them warmly, briefly confirm what you learned (without asking for any of it again), \
and let them know you're ready to help with whatever they need. Keep it to 2-4 sentences.

{known}",
            name = self.agent_name,
            known = snapshot.to_prompt_section(fields),
        );
        SystemInstruction {
            kind: InstructionKind::Completion,
            text,
        }
    }

    /// Instruction for a general reply once onboarding is behind us.
    pub fn steady_state(&self, fields: &FieldSet, snapshot: &CollectedFields) -> SystemInstruction {
        let mut text = self.base_prompt.replace("{agent_name}", &self.agent_name);
        if !snapshot.is_empty() {
            text.push_str("\n\n");
            text.push_str(&snapshot.to_prompt_section(fields));
        }
        SystemInstruction {
            kind: InstructionKind::Default,
            text,
        }
    }
}

/// Note added when the user answered a field question with a question.
pub fn clarification_note(field: &FieldDefinition) -> String {
    format!(
        "The user replied with a question instead of an answer. Answer it briefly and \
         kindly, then ask again for {}.",
        field.prompt_hint
    )
}
