//! Onboarding — a stateful-feeling wizard rebuilt from history on every turn.
//!
//! The agent collects an ordered list of fields from each new thread. There
//! is no stored "current step": progress is derived by the extractor from
//! the thread's messages, and the prompt builder turns that into the next
//! system instruction.

pub mod classifier;
pub mod extractor;
pub mod model;
pub mod prompts;

pub use classifier::{KeywordClassifier, QuestionClassifier};
pub use extractor::{Extraction, FieldExtractor, extract_collected_fields};
pub use model::{CollectedFields, FieldDefinition, FieldSet, OnboardingStatus};
pub use prompts::{InstructionKind, PromptBuilder, SystemInstruction};
