use prometheus::{
    CounterVec, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry,
};
use std::sync::Arc;

pub mod server;

pub struct Metrics {
    pub messages_processed_total: CounterVec,
    pub messages_failed_total: CounterVec,
    pub messages_resubmitted_total: CounterVec,
    pub messages_dropped_total: CounterVec,
    pub resubmission_failures_total: CounterVec,
    pub message_processing_duration_seconds: HistogramVec,
    pub in_flight_messages: GaugeVec,
    pub active_consumers: Gauge,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let messages_processed_total = CounterVec::new(
            Opts::new(
                "consumer_messages_processed_total",
                "Total number of messages successfully processed",
            ),
            &["queue"],
        )?;

        let messages_failed_total = CounterVec::new(
            Opts::new(
                "consumer_messages_failed_total",
                "Total number of messages whose handler failed, by fault kind",
            ),
            &["queue", "fault"],
        )?;

        let messages_resubmitted_total = CounterVec::new(
            Opts::new(
                "consumer_messages_resubmitted_total",
                "Total number of replacement messages submitted after a failure",
            ),
            &["queue"],
        )?;

        let messages_dropped_total = CounterVec::new(
            Opts::new(
                "consumer_messages_dropped_total",
                "Total number of failed messages acknowledged without resubmission",
            ),
            &["queue"],
        )?;

        let resubmission_failures_total = CounterVec::new(
            Opts::new(
                "consumer_resubmission_failures_total",
                "Total number of replacement messages that could not be submitted",
            ),
            &["queue"],
        )?;

        let message_processing_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "consumer_message_processing_duration_seconds",
                "Time taken to process a message",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["queue", "status"],
        )?;

        let in_flight_messages = GaugeVec::new(
            Opts::new(
                "consumer_in_flight_messages",
                "Number of messages currently being processed",
            ),
            &["queue"],
        )?;

        let active_consumers = Gauge::new(
            "consumer_active_consumers",
            "Number of active consumer loops",
        )?;

        registry.register(Box::new(messages_processed_total.clone()))?;
        registry.register(Box::new(messages_failed_total.clone()))?;
        registry.register(Box::new(messages_resubmitted_total.clone()))?;
        registry.register(Box::new(messages_dropped_total.clone()))?;
        registry.register(Box::new(resubmission_failures_total.clone()))?;
        registry.register(Box::new(message_processing_duration_seconds.clone()))?;
        registry.register(Box::new(in_flight_messages.clone()))?;
        registry.register(Box::new(active_consumers.clone()))?;

        Ok(Arc::new(Self {
            messages_processed_total,
            messages_failed_total,
            messages_resubmitted_total,
            messages_dropped_total,
            resubmission_failures_total,
            message_processing_duration_seconds,
            in_flight_messages,
            active_consumers,
            registry,
        }))
    }
}
