//! Triage router — decides what to do with each inbound message.
//!
//! Flow for one message:
//! 1. Agent-authored messages go to the loop guard and are never triaged.
//! 2. The message is appended to history; a re-delivery that was already
//!    handled stops here.
//! 3. History through the message is read and onboarding state derived.
//! 4. New thread / onboarding → ask for the next field (or complete once);
//!    steady state → rules, then a default reply.
//! 5. LLM or workflow failures degrade to the fallback reply.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::channels::ChannelRegistry;
use crate::config::AgentConfig;
use crate::error::{Error, LlmError, TriageError};
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::onboarding::prompts::clarification_note;
use crate::onboarding::{
    Extraction, FieldExtractor, FieldSet, OnboardingStatus, PromptBuilder, QuestionClassifier,
    SystemInstruction,
};
use crate::pipeline::dispatcher::{DispatchOutcome, ReplyDispatcher};
use crate::pipeline::history::{PriorAttempt, ThreadHistory};
use crate::pipeline::rules::{RuleMatch, RulesEngine};
use crate::pipeline::types::{CanonicalMessage, TriageOutcome};
use crate::pipeline::workflows::WelcomeEmailWorkflow;
use crate::store::Database;

const REPLY_TEMPERATURE: f64 = 0.7;
const REPLY_MAX_TOKENS: u64 = 512;

/// Where a thread stands, derived from its history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteState {
    /// No agent message yet.
    NewThread,
    /// Required fields missing, or completion not yet acknowledged.
    Onboarding,
    /// Onboarding behind us (or nothing to collect).
    SteadyState,
}

/// Derive the route state. Pure; same history always gives the same state.
pub fn route_state(
    fields: &FieldSet,
    extraction: &Extraction,
    history: &[CanonicalMessage],
) -> RouteState {
    if !fields.has_required() {
        return RouteState::SteadyState;
    }
    if !history.iter().any(|m| m.sender_is_agent) {
        return RouteState::NewThread;
    }
    match extraction.status {
        OnboardingStatus::Complete if extraction.completion_emitted(history) => {
            RouteState::SteadyState
        }
        _ => RouteState::Onboarding,
    }
}

#[derive(Debug)]
enum Decision {
    Generate {
        state: RouteState,
        instruction: SystemInstruction,
    },
    Suppress {
        reason: String,
    },
    WelcomeEmail {
        address: String,
        display_name: Option<String>,
    },
}

/// Routes inbound messages to a reply, a suppression, or a workflow.
pub struct TriageRouter {
    history: ThreadHistory,
    extractor: FieldExtractor,
    prompts: PromptBuilder,
    rules: RulesEngine,
    llm: Arc<dyn LlmProvider>,
    dispatcher: ReplyDispatcher,
    welcome: WelcomeEmailWorkflow,
    llm_timeout: Duration,
    fallback_reply: String,
}

impl TriageRouter {
    pub fn new(
        config: &AgentConfig,
        db: Arc<dyn Database>,
        channels: ChannelRegistry,
        llm: Arc<dyn LlmProvider>,
    ) -> Self {
        Self {
            history: ThreadHistory::new(Arc::clone(&db), config.history_limit),
            extractor: FieldExtractor::with_keywords(Arc::new(config.fields.clone())),
            prompts: PromptBuilder::new(config.name.clone(), config.system_prompt.clone()),
            rules: RulesEngine::from_config(config),
            llm,
            dispatcher: ReplyDispatcher::new(Arc::clone(&db), channels.clone()),
            welcome: WelcomeEmailWorkflow::new(db, channels, config.name.clone()),
            llm_timeout: config.llm_timeout,
            fallback_reply: config.fallback_reply.clone(),
        }
    }

    /// Swap the keyword classifier for another implementation.
    pub fn with_classifier(mut self, classifier: Arc<dyn QuestionClassifier>) -> Self {
        let fields = Arc::new(self.extractor.fields().clone());
        self.extractor = FieldExtractor::new(fields, classifier);
        self
    }

    pub fn history(&self) -> &ThreadHistory {
        &self.history
    }

    pub fn dispatcher(&self) -> &ReplyDispatcher {
        &self.dispatcher
    }

    /// Onboarding progress of a thread as of its latest message.
    pub async fn extraction(&self, thread_id: &str) -> Result<Extraction, TriageError> {
        let history = self.history.get_history(thread_id).await?;
        Ok(self.extractor.extract(&history))
    }

    /// Triage one inbound message.
    ///
    /// Errors mean the message was not answered and the caller should let
    /// the provider retry.
    pub async fn triage(&self, message: CanonicalMessage) -> Result<TriageOutcome, TriageError> {
        if message.sender_is_agent {
            let echo = self.dispatcher.ingest_agent_message(&message).await?;
            debug!(
                thread_id = %message.thread_id,
                message_id = %message.id,
                echo = ?echo,
                "Agent-authored message, not triaged"
            );
            return Ok(TriageOutcome::suppressed());
        }

        let appended = self.history.append(&message).await?;
        if appended.is_duplicate() {
            match self.history.prior_attempt(&message).await? {
                PriorAttempt::Handled => {
                    info!(
                        thread_id = %message.thread_id,
                        message_id = %message.id,
                        "Duplicate delivery already handled, skipping"
                    );
                    return Ok(TriageOutcome::suppressed());
                }
                PriorAttempt::Unsent(reply) => return Ok(self.resend(&message, reply).await),
                PriorAttempt::None => {}
            }
        }

        let history = self.history.history_through(&message).await?;
        let decision = match self.decide(&message, &history).await {
            Ok(decision) => decision,
            Err(e) => {
                warn!(thread_id = %message.thread_id, error = %e, "Failed to derive route");
                return self.fallback(&message, e.to_string()).await;
            }
        };

        match decision {
            Decision::Suppress { reason } => {
                info!(thread_id = %message.thread_id, reason = %reason, "Reply suppressed");
                Ok(TriageOutcome::suppressed())
            }
            Decision::WelcomeEmail {
                address,
                display_name,
            } => match self
                .welcome
                .run(&message, &address, display_name.as_deref())
                .await
            {
                Ok(run) => {
                    info!(thread_id = %message.thread_id, run_id = %run.id, "Handed off to welcome email");
                    Ok(TriageOutcome::handed_off())
                }
                Err(e) => self.fallback(&message, e.to_string()).await,
            },
            Decision::Generate { state, instruction } => {
                info!(
                    thread_id = %message.thread_id,
                    state = ?state,
                    instruction = ?instruction.kind,
                    "Generating reply"
                );
                match self.generate(&instruction, &history).await {
                    Ok(text) => self.send(&message, text).await,
                    Err(e) => {
                        warn!(thread_id = %message.thread_id, error = %e, "LLM reply failed");
                        self.fallback(&message, e.to_string()).await
                    }
                }
            }
        }
    }

    async fn decide(
        &self,
        message: &CanonicalMessage,
        history: &[CanonicalMessage],
    ) -> Result<Decision, Error> {
        let fields = self.extractor.fields();
        let extraction = self.extractor.extract(history);
        let state = route_state(fields, &extraction, history);
        debug!(
            thread_id = %message.thread_id,
            state = ?state,
            status = ?extraction.status,
            pending = ?extraction.pending,
            collected = extraction.snapshot.len(),
            "Derived onboarding state"
        );

        if state == RouteState::SteadyState {
            return self.steady_state(message, &extraction).await;
        }

        let mut instruction = self.prompts.build_prompt(fields, &extraction.snapshot);
        let clarify = match (extraction.pending.as_deref(), instruction.asks_for()) {
            (Some(pending), Some(asked))
                if pending == asked && self.extractor.classifier().is_question(&message.text) =>
            {
                fields.get(asked)
            }
            _ => None,
        };
        if let Some(field) = clarify {
            instruction = instruction.with_note(&clarification_note(field));
        }
        Ok(Decision::Generate { state, instruction })
    }

    async fn steady_state(
        &self,
        message: &CanonicalMessage,
        extraction: &Extraction,
    ) -> Result<Decision, Error> {
        match self.rules.evaluate(message) {
            Some(RuleMatch::Suppress { reason }) => return Ok(Decision::Suppress { reason }),
            Some(RuleMatch::WelcomeEmail { address }) => {
                if !self.welcome.is_pending(&message.thread_id).await? {
                    let display_name = extraction
                        .snapshot
                        .get("name")
                        .map(str::to_string)
                        .or_else(|| message.sender_name.clone());
                    return Ok(Decision::WelcomeEmail {
                        address,
                        display_name,
                    });
                }
                debug!(thread_id = %message.thread_id, "Welcome email already pending");
            }
            None => {}
        }

        Ok(Decision::Generate {
            state: RouteState::SteadyState,
            instruction: self
                .prompts
                .steady_state(self.extractor.fields(), &extraction.snapshot),
        })
    }

    async fn generate(
        &self,
        instruction: &SystemInstruction,
        history: &[CanonicalMessage],
    ) -> Result<String, LlmError> {
        let context = self.history.context(history);
        let mut messages = Vec::with_capacity(context.len() + 1);
        messages.push(ChatMessage::system(instruction.text.clone()));
        messages.extend(context.iter().filter(|m| !m.is_blank()).map(to_chat_message));

        let request = CompletionRequest::new(messages)
            .with_temperature(REPLY_TEMPERATURE)
            .with_max_tokens(REPLY_MAX_TOKENS);

        let provider = self.llm.model_name().to_string();
        let response = tokio::time::timeout(self.llm_timeout, self.llm.complete(request))
            .await
            .map_err(|_| LlmError::Timeout {
                provider: provider.clone(),
                timeout: self.llm_timeout,
            })??;

        let text = response.content.trim();
        if text.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider,
                reason: "empty completion".into(),
            });
        }

        let (input_rate, output_rate) = self.llm.cost_per_token();
        let cost = input_rate * Decimal::from(response.input_tokens)
            + output_rate * Decimal::from(response.output_tokens);
        debug!(
            model = %provider,
            input_tokens = response.input_tokens,
            output_tokens = response.output_tokens,
            cost_usd = %cost,
            "Reply generated"
        );
        Ok(text.to_string())
    }

    async fn send(
        &self,
        trigger: &CanonicalMessage,
        text: String,
    ) -> Result<TriageOutcome, TriageError> {
        match self.dispatcher.dispatch(trigger, &text).await? {
            DispatchOutcome::AlreadyDispatched => Ok(TriageOutcome::suppressed()),
            DispatchOutcome::Sent { .. } | DispatchOutcome::Failed { .. } => {
                Ok(TriageOutcome::reply(text))
            }
        }
    }

    async fn resend(&self, trigger: &CanonicalMessage, reply: CanonicalMessage) -> TriageOutcome {
        match self.dispatcher.resend(trigger, &reply).await {
            DispatchOutcome::AlreadyDispatched => TriageOutcome::suppressed(),
            DispatchOutcome::Sent { .. } | DispatchOutcome::Failed { .. } => {
                if reply.text == self.fallback_reply {
                    TriageOutcome::fallback(reply.text, "resent after interrupted delivery")
                } else {
                    TriageOutcome::reply(reply.text)
                }
            }
        }
    }

    async fn fallback(
        &self,
        trigger: &CanonicalMessage,
        cause: String,
    ) -> Result<TriageOutcome, TriageError> {
        match self.dispatcher.dispatch(trigger, &self.fallback_reply).await? {
            DispatchOutcome::AlreadyDispatched => Ok(TriageOutcome::suppressed()),
            DispatchOutcome::Sent { .. } | DispatchOutcome::Failed { .. } => {
                Ok(TriageOutcome::fallback(self.fallback_reply.clone(), cause))
            }
        }
    }
}

/// History entry as model input. Group messages carry the sender's name.
fn to_chat_message(message: &CanonicalMessage) -> ChatMessage {
    if message.sender_is_agent {
        return ChatMessage::assistant(message.text.clone());
    }
    match (&message.sender_name, message.is_group) {
        (Some(name), true) => ChatMessage::user(format!("{name}: {}", message.text)),
        _ => ChatMessage::user(message.text.clone()),
    }
}
