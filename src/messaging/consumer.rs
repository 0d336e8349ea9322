use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::handler::MessageHandler;
use super::policy::CompletionPolicy;
use super::processor::MessageProcessor;
use super::transport::{QueueTransport, TransportError};
use crate::contracts::{CompletionAction, ResubmitPayload};
use crate::metrics::Metrics;

const DEFAULT_CONCURRENCY: usize = 12;
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// A queue consumer: one transport, one handler, one completion policy.
///
/// `run` receives deliveries until the shutdown token fires, processing up to
/// `concurrency` messages at once, each on its own task.
pub struct Consumer {
    name: String,
    processor: MessageProcessor,
    metrics: Arc<Metrics>,
    concurrency: usize,
    grace_period: Duration,
}

impl Consumer {
    pub fn new(
        name: impl Into<String>,
        transport: Arc<dyn QueueTransport>,
        handler: Arc<dyn MessageHandler>,
        policy: CompletionPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        let name = name.into();
        let processor =
            MessageProcessor::new(name.as_str(), transport, handler, policy, metrics.clone());

        Self {
            name,
            processor,
            metrics,
            concurrency: DEFAULT_CONCURRENCY,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    /// Consumer for the main queue: failed messages are resubmitted.
    pub fn primary(
        transport: Arc<dyn QueueTransport>,
        handler: Arc<dyn MessageHandler>,
        payload: ResubmitPayload,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self::new(
            "primary",
            transport,
            handler,
            CompletionPolicy::Resubmit(payload),
            metrics,
        )
    }

    /// Consumer for the dead-letter queue: failed messages are logged and dropped.
    pub fn dead_letter(
        transport: Arc<dyn QueueTransport>,
        handler: Arc<dyn MessageHandler>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self::new(
            "dead-letter",
            transport,
            handler,
            CompletionPolicy::Drop,
            metrics,
        )
    }

    /// Maximum number of messages in flight. Values below 1 are raised to 1.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// How long in-flight messages may keep running after shutdown is requested.
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.processor = self.processor.with_handler_timeout(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> CompletionPolicy {
        self.processor.policy()
    }

    /// Closes the transport of a consumer that will never run.
    pub async fn close(self) -> Result<(), TransportError> {
        self.processor.transport().close().await
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ConsumerError> {
        let transport = self.processor.transport().clone();
        let queue = transport.queue_name().to_string();

        info!(
            consumer = %self.name,
            queue = %queue,
            policy = %self.policy(),
            concurrency = self.concurrency,
            "Starting processing of messages"
        );

        let mut deliveries = match transport.start_delivery(self.concurrency).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                error!(consumer = %self.name, error = %e, "Failed to start delivery");
                if let Err(close_err) = transport.close().await {
                    warn!(consumer = %self.name, error = %close_err, "Failed to close transport");
                }
                return Err(e.into());
            }
        };

        self.metrics.active_consumers.inc();
        let in_flight_gauge = self.metrics.in_flight_messages.with_label_values(&[&queue]);

        let mut in_flight: JoinSet<Result<CompletionAction, TransportError>> = JoinSet::new();
        let mut fault: Option<ConsumerError> = None;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!(consumer = %self.name, "Shutdown signal received, stopping consumer");
                    break;
                }

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    in_flight_gauge.set(in_flight.len() as f64);
                    if let Err(e) = self.settle(joined) {
                        fault = Some(e);
                        break;
                    }
                }

                delivery = deliveries.recv(), if in_flight.len() < self.concurrency => {
                    match delivery {
                        Some(message) => {
                            let processor = self.processor.clone();
                            in_flight.spawn(async move { processor.process(message).await });
                            in_flight_gauge.set(in_flight.len() as f64);
                        }
                        None => {
                            warn!(consumer = %self.name, queue = %queue, "Delivery stream ended");
                            fault = Some(ConsumerError::DeliveryStreamEnded(queue.clone()));
                            break;
                        }
                    }
                }
            }
        }

        // Stop accepting; anything buffered but not started is redelivered by the broker.
        deliveries.close();

        if !in_flight.is_empty() {
            info!(
                consumer = %self.name,
                in_flight = in_flight.len(),
                grace_period_ms = self.grace_period.as_millis() as u64,
                "Waiting for in-flight messages"
            );

            let drained = tokio::time::timeout(self.grace_period, async {
                while let Some(joined) = in_flight.join_next().await {
                    if let Err(e) = self.settle(joined) {
                        fault.get_or_insert(e);
                    }
                }
            })
            .await;

            if drained.is_err() {
                warn!(
                    consumer = %self.name,
                    abandoned = in_flight.len(),
                    "Grace period elapsed, abandoning in-flight messages"
                );
                in_flight.shutdown().await;
            }
        }
        in_flight_gauge.set(0.0);

        let closed = transport.close().await;
        self.metrics.active_consumers.dec();
        info!(consumer = %self.name, "Consumer stopped");

        match (fault, closed) {
            (Some(fault), _) => Err(fault),
            (None, Err(e)) => Err(e.into()),
            (None, Ok(())) => Ok(()),
        }
    }

    fn settle(
        &self,
        joined: Result<Result<CompletionAction, TransportError>, JoinError>,
    ) -> Result<(), ConsumerError> {
        match joined {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e.into()),
            Err(e) if e.is_panic() => {
                error!(consumer = %self.name, error = %e, "Message task panicked");
                Ok(())
            }
            Err(_) => Ok(()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("Delivery stream for {0} ended unexpectedly")]
    DeliveryStreamEnded(String),
}
