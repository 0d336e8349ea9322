use crate::contracts::{CompletionAction, ProcessingOutcome, ResubmitPayload};

/// Failure policy a consumer is built with.
///
/// | Policy   | Success     | Failure                                   |
/// |----------|-------------|-------------------------------------------|
/// | Resubmit | acknowledge | submit replacement, then acknowledge      |
/// | Drop     | acknowledge | log, acknowledge without resubmission     |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPolicy {
    Resubmit(ResubmitPayload),
    Drop,
}

impl CompletionPolicy {
    pub fn decide(&self, outcome: &ProcessingOutcome) -> CompletionAction {
        match (self, outcome) {
            (_, ProcessingOutcome::Success) => CompletionAction::Acknowledge,
            (Self::Resubmit(_), ProcessingOutcome::Failure { .. }) => {
                CompletionAction::ResubmitThenAcknowledge
            }
            (Self::Drop, ProcessingOutcome::Failure { .. }) => {
                CompletionAction::AcknowledgeWithoutResubmit
            }
        }
    }

    /// Payload mode for replacements, `None` for policies that never resubmit.
    pub fn resubmit_payload(&self) -> Option<ResubmitPayload> {
        match self {
            Self::Resubmit(payload) => Some(*payload),
            Self::Drop => None,
        }
    }
}

impl std::fmt::Display for CompletionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resubmit(payload) => write!(f, "resubmit ({})", payload),
            Self::Drop => f.write_str("drop"),
        }
    }
}
