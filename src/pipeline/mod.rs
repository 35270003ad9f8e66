//! Inbound message pipeline.
//!
//! Every inbound message from any channel flows through:
//! 1. `Normalizer::normalize()` — channel payload → `CanonicalMessage`
//! 2. `TriageRouter::triage()` — append to history, derive onboarding state
//! 3. `RulesEngine::evaluate()` — steady-state shortcuts (no LLM)
//! 4. `ReplyDispatcher::dispatch()` — persist the reply, then send it
//!
//! Onboarding progress is never stored; it is re-derived from history on
//! every message.

pub mod dispatcher;
pub mod history;
pub mod normalize;
pub mod router;
pub mod rules;
pub mod types;
pub mod workflows;

pub use dispatcher::{DispatchOutcome, ReplyDispatcher, SmsStatusPayload};
pub use history::{PriorAttempt, ThreadHistory};
pub use normalize::{InboundPayload, Normalizer};
pub use router::{RouteState, TriageRouter, route_state};
pub use rules::RulesEngine;
pub use types::{CanonicalMessage, Channel, TriageAction, TriageOutcome};
pub use workflows::WelcomeEmailWorkflow;
