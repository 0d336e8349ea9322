//! Queue consumer with resubmit and dead-letter completion policies.
//!
//! A [`Consumer`](messaging::Consumer) drains one queue through a
//! [`QueueTransport`](messaging::QueueTransport), runs a
//! [`MessageHandler`](messaging::MessageHandler) once per message and completes
//! every delivery according to its [`CompletionPolicy`](messaging::CompletionPolicy).

pub mod contracts;
pub mod host;
pub mod messaging;
pub mod metrics;
