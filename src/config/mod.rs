use std::env;
use std::time::Duration;

use queue_consumer::contracts::ResubmitPayload;

const DEFAULT_SERVICE_NAME: &str = "queue-consumer";
const DEFAULT_CONNECTION_LIMIT: usize = 12;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;
const DEFAULT_METRICS_PORT: u16 = 9090;

#[derive(Debug, Clone)]
pub struct Config {
    pub amqp_url: String,
    pub queue_name: String,
    pub dead_letter_queue: String,
    pub service_name: String,
    pub rust_log: String,
    pub connection_limit: usize,
    pub resubmit_payload: ResubmitPayload,
    pub handler_timeout: Option<Duration>,
    pub shutdown_grace: Duration,
    /// `None` disables the metrics server.
    pub metrics_port: Option<u16>,
    pub consumers: ConsumerSelection,
}

/// Which consumers this process runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerSelection {
    Primary,
    DeadLetter,
    All,
}

impl ConsumerSelection {
    pub fn primary(&self) -> bool {
        matches!(self, Self::Primary | Self::All)
    }

    pub fn dead_letter(&self) -> bool {
        matches!(self, Self::DeadLetter | Self::All)
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let amqp_url = lookup("AMQP_URL").ok_or(ConfigError::MissingRequired("AMQP_URL"))?;

        let queue_name = lookup("QUEUE_NAME").ok_or(ConfigError::MissingRequired("QUEUE_NAME"))?;

        let dead_letter_queue =
            lookup("DEAD_LETTER_QUEUE").unwrap_or_else(|| format!("{}.dlq", queue_name));

        let service_name =
            lookup("SERVICE_NAME").unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string());

        let rust_log = lookup("RUST_LOG").unwrap_or_else(|| "info".to_string());

        let connection_limit = match lookup("CONNECTION_LIMIT") {
            Some(value) => match value.trim().parse::<usize>() {
                Ok(limit) if limit >= 1 && limit <= usize::from(u16::MAX) => limit,
                _ => return Err(ConfigError::invalid("CONNECTION_LIMIT", value)),
            },
            None => DEFAULT_CONNECTION_LIMIT,
        };

        let resubmit_payload = match lookup("RESUBMIT_PAYLOAD") {
            Some(value) => value
                .parse()
                .map_err(|_| ConfigError::invalid("RESUBMIT_PAYLOAD", value))?,
            None => ResubmitPayload::default(),
        };

        let handler_timeout = lookup("HANDLER_TIMEOUT_SECS")
            .map(|value| parse_secs("HANDLER_TIMEOUT_SECS", value))
            .transpose()?;

        let shutdown_grace = lookup("SHUTDOWN_GRACE_SECS")
            .map(|value| parse_secs("SHUTDOWN_GRACE_SECS", value))
            .transpose()?
            .unwrap_or(Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS));

        let metrics_port = match lookup("METRICS_PORT") {
            Some(value) => match value.trim().parse::<u16>() {
                Ok(0) => None,
                Ok(port) => Some(port),
                Err(_) => return Err(ConfigError::invalid("METRICS_PORT", value)),
            },
            None => Some(DEFAULT_METRICS_PORT),
        };

        let consumers = match lookup("CONSUMERS").as_deref().map(str::trim) {
            None | Some("all") => ConsumerSelection::All,
            Some("primary") => ConsumerSelection::Primary,
            Some("dead-letter") | Some("dead_letter") => ConsumerSelection::DeadLetter,
            Some(other) => return Err(ConfigError::invalid("CONSUMERS", other)),
        };

        Ok(Self {
            amqp_url,
            queue_name,
            dead_letter_queue,
            service_name,
            rust_log,
            connection_limit,
            resubmit_payload,
            handler_timeout,
            shutdown_grace,
            metrics_port,
            consumers,
        })
    }
}

fn parse_secs(name: &'static str, value: String) -> Result<Duration, ConfigError> {
    value
        .trim()
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| ConfigError::invalid(name, value))
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("Invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}

impl ConfigError {
    fn invalid(name: &'static str, value: impl Into<String>) -> Self {
        Self::Invalid {
            name,
            value: value.into(),
        }
    }
}
