//! Bridges a rig `CompletionModel` to our `LlmProvider` trait.

use async_trait::async_trait;
use rig::agent::AgentBuilder;
use rig::completion::{CompletionModel, Prompt, PromptError};
use rig::message::{AssistantContent, Message, UserContent};
use rig::one_or_many::OneOrMany;
use rust_decimal::Decimal;

use super::costs;
use super::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};
use crate::error::LlmError;

/// `LlmProvider` over any rig completion model.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
}

impl<M: CompletionModel + 'static> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }
}

/// Split a request into rig history plus the final user prompt.
///
/// System messages are dropped here; they travel as the agent preamble.
fn to_rig_conversation(messages: &[ChatMessage]) -> (Vec<Message>, String) {
    let mut conversation: Vec<&ChatMessage> =
        messages.iter().filter(|m| m.role != Role::System).collect();

    let prompt = match conversation.last() {
        Some(last) if last.role == Role::User => {
            let text = last.content.clone();
            conversation.pop();
            text
        }
        _ => String::new(),
    };

    let history = conversation
        .into_iter()
        .map(|m| match m.role {
            Role::Assistant => Message::Assistant {
                id: None,
                content: OneOrMany::one(AssistantContent::text(m.content.clone())),
            },
            _ => Message::User {
                content: OneOrMany::one(UserContent::text(m.content.clone())),
            },
        })
        .collect();

    (history, prompt)
}

fn map_prompt_error(provider: &str, err: PromptError) -> LlmError {
    let reason = err.to_string();
    let lowered = reason.to_ascii_lowercase();
    if lowered.contains("401") || lowered.contains("unauthorized") || lowered.contains("api key") {
        LlmError::AuthFailed {
            provider: provider.to_string(),
        }
    } else {
        LlmError::RequestFailed {
            provider: provider.to_string(),
            reason,
        }
    }
}

#[async_trait]
impl<M: CompletionModel + 'static> LlmProvider for RigAdapter<M> {
    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        costs::model_cost(&self.model_name)
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let system = request.system_prompt();
        let (mut history, prompt) = to_rig_conversation(&request.messages);

        let mut builder = AgentBuilder::new(self.model.clone()).preamble(&system);
        if let Some(temperature) = request.temperature {
            builder = builder.temperature(temperature);
        }
        if let Some(max_tokens) = request.max_tokens {
            builder = builder.max_tokens(max_tokens);
        }
        let agent = builder.build();

        let content = agent
            .prompt(prompt)
            .with_history(&mut history)
            .await
            .map_err(|e| map_prompt_error(&self.model_name, e))?;

        if content.trim().is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.model_name.clone(),
                reason: "empty completion".to_string(),
            });
        }

        Ok(CompletionResponse {
            content,
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: FinishReason::Stop,
            response_id: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_user_message_becomes_prompt() {
        let (history, prompt) = to_rig_conversation(&[
            ChatMessage::system("You are Ada."),
            ChatMessage::user("Hi"),
            ChatMessage::assistant("Hello! What's your name?"),
            ChatMessage::user("Jane"),
        ]);
        assert_eq!(prompt, "Jane");
        assert_eq!(history.len(), 2);
        assert!(matches!(history[0], Message::User { .. }));
        assert!(matches!(history[1], Message::Assistant { .. }));
    }

    #[test]
    fn trailing_assistant_message_stays_in_history() {
        let (history, prompt) = to_rig_conversation(&[
            ChatMessage::user("Hi"),
            ChatMessage::assistant("Hello!"),
        ]);
        assert!(prompt.is_empty());
        assert_eq!(history.len(), 2);
    }
}
