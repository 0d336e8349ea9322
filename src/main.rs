use std::sync::Arc;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;
use queue_consumer::contracts::Message;
use queue_consumer::host::ConsumerHost;
use queue_consumer::messaging::{
    AmqpSettings, AmqpTransport, Consumer, HandlerError, MessageHandler, QueueTransport,
    TransportError,
};
use queue_consumer::metrics::{server::start_metrics_server, Metrics};

/// Handles messages from the main queue. Bodies must be JSON.
struct WorkHandler;

#[async_trait]
impl MessageHandler for WorkHandler {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        info!(label = %message.label(), "Processing message: {}", message.label());

        if message.body().is_empty() {
            return Ok(());
        }

        let payload: serde_json::Value = serde_json::from_slice(message.body())
            .map_err(|e| HandlerError::rejected(format!("Invalid JSON payload: {}", e)))?;

        if payload.get("fail").and_then(|v| v.as_bool()) == Some(true) {
            return Err(HandlerError::rejected("Payload requested failure"));
        }

        Ok(())
    }
}

/// Handles messages that ended up on the dead-letter queue.
struct DeadLetterHandler;

#[async_trait]
impl MessageHandler for DeadLetterHandler {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError> {
        info!(
            label = %message.label(),
            delivery_count = message.delivery_count(),
            resubmit_count = message.resubmit_count(),
            payload_preview = %String::from_utf8_lossy(message.body()).chars().take(100).collect::<String>(),
            "Dead letter {} received",
            message.label()
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    setup_panic_handler();
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    setup_logging(&config.rust_log);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        service_name = %config.service_name,
        queue = %config.queue_name,
        dead_letter_queue = %config.dead_letter_queue,
        connection_limit = config.connection_limit,
        resubmit_payload = %config.resubmit_payload,
        "Queue consumer starting"
    );

    let metrics = match Metrics::new() {
        Ok(metrics) => metrics,
        Err(e) => {
            error!(error = %e, "Failed to create metrics");
            std::process::exit(1);
        }
    };

    let shutdown = CancellationToken::new();

    if let Some(port) = config.metrics_port {
        let metrics = metrics.clone();
        let token = shutdown.child_token();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(metrics, port, token).await {
                error!(error = %e, "Metrics server error");
            }
        });
    }

    let mut host = ConsumerHost::new();

    if config.consumers.primary() {
        let transport = match connect(&config, &config.queue_name, "primary").await {
            Ok(transport) => transport,
            Err(e) => {
                error!(error = %e, queue = %config.queue_name, "Failed to connect transport");
                host.close().await;
                std::process::exit(1);
            }
        };
        host.add(
            Consumer::primary(
                transport,
                Arc::new(WorkHandler),
                config.resubmit_payload,
                metrics.clone(),
            )
            .with_concurrency(config.connection_limit)
            .with_grace_period(config.shutdown_grace)
            .with_handler_timeout(config.handler_timeout),
        );
    }

    if config.consumers.dead_letter() {
        let transport = match connect(&config, &config.dead_letter_queue, "dead-letter").await {
            Ok(transport) => transport,
            Err(e) => {
                error!(error = %e, queue = %config.dead_letter_queue, "Failed to connect transport");
                host.close().await;
                std::process::exit(1);
            }
        };
        host.add(
            Consumer::dead_letter(transport, Arc::new(DeadLetterHandler), metrics.clone())
                .with_concurrency(config.connection_limit)
                .with_grace_period(config.shutdown_grace)
                .with_handler_timeout(config.handler_timeout),
        );
    }

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        warn!("Shutdown signal received, cleaning up...");
        signal_token.cancel();
    });

    info!("Ready to process messages");

    if let Err(e) = host.run(shutdown).await {
        error!(error = %e, "Queue consumer stopped with error");
        std::process::exit(1);
    }

    info!("Queue consumer stopped");
}

async fn connect(
    config: &Config,
    queue: &str,
    role: &str,
) -> Result<Arc<dyn QueueTransport>, TransportError> {
    let settings = AmqpSettings {
        url: config.amqp_url.clone(),
        queue_name: queue.to_string(),
        consumer_tag: format!("{}-{}", config.service_name, role),
        prefetch_count: u16::try_from(config.connection_limit).unwrap_or(u16::MAX),
    };

    let transport = AmqpTransport::connect(settings).await?;
    Ok(Arc::new(transport))
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn setup_logging(rust_log: &str) {
    let filter = EnvFilter::try_new(rust_log).unwrap_or_else(|_| EnvFilter::new("info"));

    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .try_init();

    if let Err(e) = result {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            panic = %message,
            location = %location,
            thread = ?std::thread::current().name(),
            "Panic"
        );
    }));
}
