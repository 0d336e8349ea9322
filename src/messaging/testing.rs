//! In-memory transport and scripted handler used by the messaging tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::handler::{HandlerError, MessageHandler};
use super::transport::{QueueTransport, TransportError};
use crate::contracts::{Message, OutgoingMessage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Submitted(OutgoingMessage),
    Acknowledged { label: String, delivery_tag: u64 },
    Closed,
}

impl TransportEvent {
    pub fn acknowledged(label: &str, delivery_tag: u64) -> Self {
        Self::Acknowledged {
            label: label.to_string(),
            delivery_tag,
        }
    }
}

pub struct MemoryTransport {
    queue: String,
    sender: Mutex<Option<mpsc::Sender<Message>>>,
    receiver: Mutex<Option<mpsc::Receiver<Message>>>,
    events: Mutex<Vec<TransportEvent>>,
    fail_submit: AtomicBool,
    panic_submit: AtomicBool,
    fail_ack: AtomicBool,
}

impl MemoryTransport {
    pub fn new(queue: &str) -> Self {
        let (sender, receiver) = mpsc::channel(64);
        Self {
            queue: queue.to_string(),
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            events: Mutex::new(Vec::new()),
            fail_submit: AtomicBool::new(false),
            panic_submit: AtomicBool::new(false),
            fail_ack: AtomicBool::new(false),
        }
    }

    pub fn fail_submits(&self) {
        self.fail_submit.store(true, Ordering::SeqCst);
    }

    pub fn panic_on_submit(&self) {
        self.panic_submit.store(true, Ordering::SeqCst);
    }

    pub fn fail_acknowledgements(&self) {
        self.fail_ack.store(true, Ordering::SeqCst);
    }

    /// Queues a delivery with the given label and tag.
    pub async fn deliver(&self, label: &str, delivery_tag: u64) {
        let sender = self.sender.lock().unwrap().clone();
        if let Some(sender) = sender {
            sender
                .send(Message::new(label, label.as_bytes().to_vec(), &self.queue, delivery_tag))
                .await
                .unwrap();
        }
    }

    /// Ends the delivery stream, as if the broker connection went away.
    pub fn end_stream(&self) {
        self.sender.lock().unwrap().take();
    }

    pub fn events(&self) -> Vec<TransportEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn submitted(&self) -> Vec<OutgoingMessage> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                TransportEvent::Submitted(message) => Some(message),
                _ => None,
            })
            .collect()
    }

    pub fn acknowledged(&self) -> Vec<u64> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                TransportEvent::Acknowledged { delivery_tag, .. } => Some(delivery_tag),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.events().contains(&TransportEvent::Closed)
    }
}

#[async_trait]
impl QueueTransport for MemoryTransport {
    fn queue_name(&self) -> &str {
        &self.queue
    }

    async fn start_delivery(&self, _buffer: usize) -> Result<mpsc::Receiver<Message>, TransportError> {
        self.receiver
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| TransportError::AlreadyStarted(self.queue.clone()))
    }

    async fn submit(&self, message: OutgoingMessage) -> Result<(), TransportError> {
        if self.panic_submit.load(Ordering::SeqCst) {
            panic!("submit exploded");
        }
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(TransportError::PublishFailed {
                queue: message.queue,
                reason: "connection reset".to_string(),
            });
        }
        self.events
            .lock()
            .unwrap()
            .push(TransportEvent::Submitted(message));
        Ok(())
    }

    async fn acknowledge(&self, message: &Message) -> Result<(), TransportError> {
        if self.fail_ack.load(Ordering::SeqCst) {
            return Err(TransportError::AcknowledgeFailed {
                delivery_tag: message.delivery_tag(),
                reason: "channel closed".to_string(),
            });
        }
        self.events
            .lock()
            .unwrap()
            .push(TransportEvent::acknowledged(message.label(), message.delivery_tag()));
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.sender.lock().unwrap().take();
        self.events.lock().unwrap().push(TransportEvent::Closed);
        Ok(())
    }
}

/// Handler whose behavior is chosen per label.
#[derive(Default)]
pub struct ScriptedHandler {
    failing: HashSet<String>,
    panicking: HashSet<String>,
    delay: Option<Duration>,
    calls: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ScriptedHandler {
    pub fn failing_on(mut self, label: &str) -> Self {
        self.failing.insert(label.to_string());
        self
    }

    pub fn panicking_on(mut self, label: &str) -> Self {
        self.panicking.insert(label.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    /// Highest number of concurrent `handle` calls observed.
    pub fn peak(&self) -> Arc<AtomicUsize> {
        self.peak.clone()
    }
}

#[async_trait]
impl MessageHandler for ScriptedHandler {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(running, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);

        if self.panicking.contains(message.label()) {
            panic!("handler blew up on {}", message.label());
        }
        if self.failing.contains(message.label()) {
            return Err(HandlerError::rejected(format!("cannot handle {}", message.label())));
        }
        Ok(())
    }
}
