pub mod message;
pub mod processing_outcome;

pub use message::{Message, OutgoingMessage, ResubmitPayload};
pub use processing_outcome::{CompletionAction, ProcessingOutcome};
