use async_trait::async_trait;
use tokio::sync::mpsc;

use super::channel::ChannelError;
use super::connection::ConnectionError;
use crate::contracts::{Message, OutgoingMessage};

/// The messaging infrastructure a consumer reads from and writes to.
///
/// Implementations must be safe for concurrent use: every in-flight message
/// of a consumer shares one transport.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Queue this transport consumes from.
    fn queue_name(&self) -> &str;

    /// Starts pushing deliveries into a bounded channel and returns its receiving end.
    ///
    /// Returns immediately. The channel closes when the underlying delivery
    /// stream ends.
    async fn start_delivery(&self, buffer: usize) -> Result<mpsc::Receiver<Message>, TransportError>;

    async fn submit(&self, message: OutgoingMessage) -> Result<(), TransportError>;

    /// Removes the message from its queue. Must be called at most once per delivery.
    async fn acknowledge(&self, message: &Message) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("Delivery already started for queue {0}")]
    AlreadyStarted(String),

    #[error("Failed to start consuming from {queue}: {reason}")]
    ConsumeFailed { queue: String, reason: String },

    #[error("Failed to publish to {queue}: {reason}")]
    PublishFailed { queue: String, reason: String },

    #[error("Broker rejected message published to {queue}")]
    PublishNacked { queue: String },

    #[error("Failed to acknowledge delivery {delivery_tag}: {reason}")]
    AcknowledgeFailed { delivery_tag: u64, reason: String },
}
