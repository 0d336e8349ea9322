pub mod amqp;
pub mod channel;
pub mod connection;
pub mod consumer;
pub mod handler;
pub mod policy;
pub mod processor;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use amqp::{AmqpSettings, AmqpTransport};
pub use channel::{ChannelError, ChannelProvider};
pub use connection::{ConnectionError, RabbitMqConnection};
pub use consumer::{Consumer, ConsumerError};
pub use handler::{HandlerError, MessageHandler};
pub use policy::CompletionPolicy;
pub use processor::MessageProcessor;
pub use transport::{QueueTransport, TransportError};
