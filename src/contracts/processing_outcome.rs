use serde::{Deserialize, Serialize};

/// Result of running a handler against a single delivered message.
///
/// There is no intermediate state: a message either succeeded or failed, and
/// a failure always carries a human readable reason for the logs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Success,

    /// Handler returned an error, panicked or timed out.
    Failure { reason: String },
}

impl ProcessingOutcome {
    pub fn failure(reason: impl Into<String>) -> Self {
        Self::Failure {
            reason: reason.into(),
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure { .. } => "failure",
        }
    }
}

impl std::fmt::Display for ProcessingOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "Success"),
            Self::Failure { reason } => write!(f, "Failure: {}", reason),
        }
    }
}

/// What the processing loop does with a message once its outcome is known.
///
/// Every delivery gets exactly one of these.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CompletionAction {
    Acknowledge,
    ResubmitThenAcknowledge,
    AcknowledgeWithoutResubmit,
}

impl CompletionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Acknowledge => "acknowledge",
            Self::ResubmitThenAcknowledge => "resubmit_then_acknowledge",
            Self::AcknowledgeWithoutResubmit => "acknowledge_without_resubmit",
        }
    }
}

impl std::fmt::Display for CompletionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
