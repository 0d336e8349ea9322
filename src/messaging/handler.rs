use async_trait::async_trait;

use crate::contracts::Message;

/// User processing logic, invoked once per delivered message.
///
/// A failed message may be resubmitted and handled again later as a new
/// message instance, so implementations must tolerate seeing the same unit of
/// work more than once. Panics are caught by the processing loop and treated
/// like an `Err` return.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Message rejected: {0}")]
    Rejected(String),

    #[error("Processing failed: {0}")]
    Failed(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }
}
