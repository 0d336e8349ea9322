use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tracing::{error, info, warn};

use super::handler::MessageHandler;
use super::policy::CompletionPolicy;
use super::transport::{QueueTransport, TransportError};
use crate::contracts::{CompletionAction, Message, OutgoingMessage, ProcessingOutcome, ResubmitPayload};
use crate::metrics::Metrics;

/// Runs one delivered message through handle → decide → resubmit → acknowledge.
///
/// Cloned into every per-message task of a consumer.
#[derive(Clone)]
pub struct MessageProcessor {
    consumer: Arc<str>,
    transport: Arc<dyn QueueTransport>,
    handler: Arc<dyn MessageHandler>,
    policy: CompletionPolicy,
    handler_timeout: Option<Duration>,
    metrics: Arc<Metrics>,
}

impl MessageProcessor {
    pub fn new(
        consumer: impl Into<Arc<str>>,
        transport: Arc<dyn QueueTransport>,
        handler: Arc<dyn MessageHandler>,
        policy: CompletionPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            consumer: consumer.into(),
            transport,
            handler,
            policy,
            handler_timeout: None,
            metrics,
        }
    }

    pub fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn policy(&self) -> CompletionPolicy {
        self.policy
    }

    pub fn transport(&self) -> &Arc<dyn QueueTransport> {
        &self.transport
    }

    /// Processes `message` and acknowledges it exactly once.
    ///
    /// Handler and resubmission faults are absorbed, as is any panic on the
    /// way to the acknowledgement. Only a failed acknowledgement is returned
    /// to the caller.
    pub async fn process(&self, message: Message) -> Result<CompletionAction, TransportError> {
        info!(
            consumer = %self.consumer,
            label = %message.label(),
            delivery_tag = message.delivery_tag(),
            delivery_count = message.delivery_count(),
            resubmit_count = message.resubmit_count(),
            payload_size = message.body().len(),
            "Processing message"
        );

        let action = match AssertUnwindSafe(self.complete(&message)).catch_unwind().await {
            Ok(action) => action,
            Err(panic) => {
                let action = self
                    .policy
                    .decide(&ProcessingOutcome::failure(panic_message(&*panic)));
                error!(
                    consumer = %self.consumer,
                    label = %message.label(),
                    delivery_tag = message.delivery_tag(),
                    panic = %panic_message(&*panic),
                    "Unexpected fault while processing message {}, acknowledging it",
                    message.label()
                );
                action
            }
        };

        self.transport.acknowledge(&message).await.map_err(|e| {
            error!(
                consumer = %self.consumer,
                label = %message.label(),
                delivery_tag = message.delivery_tag(),
                error = %e,
                "Failed to acknowledge message"
            );
            e
        })?;

        Ok(action)
    }

    /// Everything between delivery and acknowledgement: handle, decide, resubmit.
    async fn complete(&self, message: &Message) -> CompletionAction {
        let queue = message.queue();

        let start = Instant::now();
        let outcome = self.run_handler(message).await;
        let action = self.policy.decide(&outcome);
        let duration = start.elapsed().as_secs_f64();

        self.metrics
            .message_processing_duration_seconds
            .with_label_values(&[queue, outcome.status()])
            .observe(duration);

        match &outcome {
            ProcessingOutcome::Success => {
                info!(
                    consumer = %self.consumer,
                    label = %message.label(),
                    duration_ms = duration * 1000.0,
                    "Processing of message complete"
                );
                self.metrics
                    .messages_processed_total
                    .with_label_values(&[queue])
                    .inc();
            }
            ProcessingOutcome::Failure { reason } => {
                error!(
                    consumer = %self.consumer,
                    label = %message.label(),
                    delivery_tag = message.delivery_tag(),
                    reason = %reason,
                    action = %action,
                    "Could not process message {}",
                    message.label()
                );
            }
        }

        match action {
            CompletionAction::ResubmitThenAcknowledge => {
                let payload = self.policy.resubmit_payload().unwrap_or_default();
                self.resubmit(message, payload).await;
            }
            CompletionAction::AcknowledgeWithoutResubmit => {
                warn!(
                    consumer = %self.consumer,
                    label = %message.label(),
                    "Dropping message without resubmission"
                );
                self.metrics
                    .messages_dropped_total
                    .with_label_values(&[queue])
                    .inc();
            }
            CompletionAction::Acknowledge => {}
        }

        action
    }

    async fn run_handler(&self, message: &Message) -> ProcessingOutcome {
        // The handler's error is rendered inside the guard: its Display is user code too.
        let handled = AssertUnwindSafe(async {
            self.handler
                .handle(message)
                .await
                .map_err(|e| e.to_string())
        })
        .catch_unwind();

        let result = match self.handler_timeout {
            Some(limit) => match tokio::time::timeout(limit, handled).await {
                Ok(result) => result,
                Err(_) => {
                    self.record_fault(message, "timeout");
                    return ProcessingOutcome::failure(format!(
                        "handler timed out after {}ms",
                        limit.as_millis()
                    ));
                }
            },
            None => handled.await,
        };

        match result {
            Ok(Ok(())) => ProcessingOutcome::Success,
            Ok(Err(reason)) => {
                self.record_fault(message, "error");
                ProcessingOutcome::failure(reason)
            }
            Err(panic) => {
                self.record_fault(message, "panic");
                ProcessingOutcome::failure(format!("handler panicked: {}", panic_message(&*panic)))
            }
        }
    }

    /// Submits a replacement for `message`. Failures are logged, never returned.
    async fn resubmit(&self, message: &Message, payload: ResubmitPayload) {
        let queue = message.queue();

        let attempt = AssertUnwindSafe(async {
            let replacement = OutgoingMessage::replacing(message, payload);
            let resubmit_count = replacement.resubmit_count;
            self.transport
                .submit(replacement)
                .await
                .map(|()| resubmit_count)
        })
        .catch_unwind()
        .await;

        let reason = match attempt {
            Ok(Ok(resubmit_count)) => {
                info!(
                    consumer = %self.consumer,
                    label = %message.label(),
                    queue = %queue,
                    resubmit_count,
                    payload = %payload,
                    "Message resubmitted"
                );
                self.metrics
                    .messages_resubmitted_total
                    .with_label_values(&[queue])
                    .inc();
                return;
            }
            Ok(Err(e)) => e.to_string(),
            Err(panic) => format!("resubmission panicked: {}", panic_message(&*panic)),
        };

        // The original is still acknowledged, so the unit of work is lost here.
        error!(
            consumer = %self.consumer,
            label = %message.label(),
            queue = %queue,
            error = %reason,
            "Could not resubmit message {}, acknowledging original anyway",
            message.label()
        );
        self.metrics
            .resubmission_failures_total
            .with_label_values(&[queue])
            .inc();
    }

    fn record_fault(&self, message: &Message, fault: &str) {
        self.metrics
            .messages_failed_total
            .with_label_values(&[message.queue(), fault])
            .inc();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "Unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::handler::HandlerError;
    use crate::messaging::testing::{MemoryTransport, ScriptedHandler, TransportEvent};
    use tracing_test::traced_test;

    const QUEUE: &str = "orders";

    fn processor(
        transport: &Arc<MemoryTransport>,
        handler: ScriptedHandler,
        policy: CompletionPolicy,
    ) -> MessageProcessor {
        MessageProcessor::new(
            "test",
            transport.clone(),
            Arc::new(handler),
            policy,
            Metrics::new().unwrap(),
        )
    }

    fn resubmit() -> CompletionPolicy {
        CompletionPolicy::Resubmit(ResubmitPayload::LabelAndBody)
    }

    #[tokio::test]
    async fn test_success_is_acknowledged_without_submit() {
        let transport = Arc::new(MemoryTransport::new(QUEUE));
        let processor = processor(&transport, ScriptedHandler::default(), resubmit());

        let action = processor
            .process(Message::new("order-42", b"{}".to_vec(), QUEUE, 1))
            .await
            .unwrap();

        assert_eq!(action, CompletionAction::Acknowledge);
        assert_eq!(transport.events(), vec![TransportEvent::acknowledged("order-42", 1)]);
    }

    #[tokio::test]
    async fn test_panic_under_resubmit_submits_then_acknowledges() {
        let transport = Arc::new(MemoryTransport::new(QUEUE));
        let handler = ScriptedHandler::default().panicking_on("order-43");
        let processor = processor(&transport, handler, resubmit());

        let action = processor
            .process(Message::new("order-43", b"{\"id\":43}".to_vec(), QUEUE, 2))
            .await
            .unwrap();

        assert_eq!(action, CompletionAction::ResubmitThenAcknowledge);
        assert_eq!(
            transport.events(),
            vec![
                TransportEvent::Submitted(OutgoingMessage {
                    label: "order-43".to_string(),
                    body: b"{\"id\":43}".to_vec(),
                    queue: QUEUE.to_string(),
                    resubmit_count: 1,
                }),
                TransportEvent::acknowledged("order-43", 2),
            ]
        );
    }

    #[tokio::test]
    async fn test_error_return_is_treated_like_panic() {
        let transport = Arc::new(MemoryTransport::new(QUEUE));
        let handler = ScriptedHandler::default().failing_on("order-45");
        let processor = processor(&transport, handler, resubmit());

        let action = processor
            .process(Message::new("order-45", Vec::new(), QUEUE, 3))
            .await
            .unwrap();

        assert_eq!(action, CompletionAction::ResubmitThenAcknowledge);
        assert_eq!(transport.submitted().len(), 1);
        assert_eq!(transport.acknowledged(), vec![3]);
    }

    #[tokio::test]
    async fn test_label_only_replacement_has_empty_body() {
        let transport = Arc::new(MemoryTransport::new(QUEUE));
        let handler = ScriptedHandler::default().failing_on("order-46");
        let processor = processor(
            &transport,
            handler,
            CompletionPolicy::Resubmit(ResubmitPayload::LabelOnly),
        );

        processor
            .process(Message::new("order-46", b"payload".to_vec(), QUEUE, 4))
            .await
            .unwrap();

        let submitted = transport.submitted();
        assert_eq!(submitted[0].label, "order-46");
        assert!(submitted[0].body.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_drop_policy_logs_and_acknowledges_without_submit() {
        let transport = Arc::new(MemoryTransport::new("orders.dlq"));
        let handler = ScriptedHandler::default().panicking_on("order-44");
        let processor = processor(&transport, handler, CompletionPolicy::Drop);

        let action = processor
            .process(Message::new("order-44", Vec::new(), "orders.dlq", 5))
            .await
            .unwrap();

        assert_eq!(action, CompletionAction::AcknowledgeWithoutResubmit);
        assert_eq!(transport.events(), vec![TransportEvent::acknowledged("order-44", 5)]);
        assert!(logs_contain("Could not process message order-44"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_resubmission_still_acknowledges() {
        let transport = Arc::new(MemoryTransport::new(QUEUE));
        transport.fail_submits();
        let handler = ScriptedHandler::default().failing_on("order-47");
        let processor = processor(&transport, handler, resubmit());

        let action = processor
            .process(Message::new("order-47", Vec::new(), QUEUE, 6))
            .await
            .unwrap();

        assert_eq!(action, CompletionAction::ResubmitThenAcknowledge);
        assert!(transport.submitted().is_empty());
        assert_eq!(transport.acknowledged(), vec![6]);
        assert!(logs_contain("Could not resubmit message order-47"));
    }

    #[tokio::test]
    async fn test_panicking_submit_still_acknowledges() {
        let transport = Arc::new(MemoryTransport::new(QUEUE));
        transport.panic_on_submit();
        let handler = ScriptedHandler::default().failing_on("order-48");
        let processor = processor(&transport, handler, resubmit());

        processor
            .process(Message::new("order-48", Vec::new(), QUEUE, 7))
            .await
            .unwrap();

        assert_eq!(transport.acknowledged(), vec![7]);
    }

    #[tokio::test]
    async fn test_slow_handler_times_out_as_failure() {
        let transport = Arc::new(MemoryTransport::new(QUEUE));
        let handler = ScriptedHandler::default().with_delay(Duration::from_secs(5));
        let processor = processor(&transport, handler, resubmit())
            .with_handler_timeout(Some(Duration::from_millis(20)));

        let action = processor
            .process(Message::new("order-49", Vec::new(), QUEUE, 8))
            .await
            .unwrap();

        assert_eq!(action, CompletionAction::ResubmitThenAcknowledge);
        assert_eq!(transport.submitted().len(), 1);
        assert_eq!(transport.acknowledged(), vec![8]);
    }

    #[tokio::test]
    async fn test_acknowledge_failure_is_returned() {
        let transport = Arc::new(MemoryTransport::new(QUEUE));
        transport.fail_acknowledgements();
        let processor = processor(&transport, ScriptedHandler::default(), resubmit());

        let result = processor
            .process(Message::new("order-50", Vec::new(), QUEUE, 9))
            .await;

        assert!(matches!(
            result,
            Err(TransportError::AcknowledgeFailed { delivery_tag: 9, .. })
        ));
    }

    #[tokio::test]
    async fn test_handler_runs_once_per_message() {
        let transport = Arc::new(MemoryTransport::new(QUEUE));
        let handler = ScriptedHandler::default().failing_on("order-51");
        let calls = handler.calls();
        let processor = processor(&transport, handler, resubmit());

        processor
            .process(Message::new("order-51", Vec::new(), QUEUE, 10))
            .await
            .unwrap();

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[derive(Debug)]
    struct UnprintableError;

    impl std::fmt::Display for UnprintableError {
        fn fmt(&self, _: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            panic!("error display blew up")
        }
    }

    impl std::error::Error for UnprintableError {}

    struct UnprintableErrorHandler;

    #[async_trait::async_trait]
    impl MessageHandler for UnprintableErrorHandler {
        async fn handle(&self, _: &Message) -> Result<(), HandlerError> {
            Err(HandlerError::Failed(Box::new(UnprintableError)))
        }
    }

    fn unprintable(transport: &Arc<MemoryTransport>, policy: CompletionPolicy) -> MessageProcessor {
        MessageProcessor::new(
            "test",
            transport.clone(),
            Arc::new(UnprintableErrorHandler),
            policy,
            Metrics::new().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_panicking_error_display_under_drop_still_acknowledges_once() {
        let transport = Arc::new(MemoryTransport::new(QUEUE));
        let processor = unprintable(&transport, CompletionPolicy::Drop);

        let action = processor
            .process(Message::new("order-52", Vec::new(), "orders.dlq", 11))
            .await
            .unwrap();

        assert_eq!(action, CompletionAction::AcknowledgeWithoutResubmit);
        assert_eq!(transport.events(), vec![TransportEvent::acknowledged("order-52", 11)]);
    }

    #[tokio::test]
    async fn test_panicking_error_display_under_resubmit_submits_then_acknowledges() {
        let transport = Arc::new(MemoryTransport::new(QUEUE));
        let processor = unprintable(&transport, resubmit());

        let action = processor
            .process(Message::new("order-53", b"x".to_vec(), QUEUE, 12))
            .await
            .unwrap();

        assert_eq!(action, CompletionAction::ResubmitThenAcknowledge);
        assert_eq!(transport.submitted().len(), 1);
        assert_eq!(transport.acknowledged(), vec![12]);
    }
}
