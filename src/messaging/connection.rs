use lapin::{Connection, ConnectionProperties};
use tracing::{error, info};

pub struct RabbitMqConnection {
    connection: Connection,
    url: String,
}

impl RabbitMqConnection {
    pub async fn connect(url: &str) -> Result<Self, ConnectionError> {
        let target = redact_url(url);
        info!(url = %target, "Connecting to RabbitMQ");

        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| {
                error!(error = %e, url = %target, "Failed to connect to RabbitMQ");
                ConnectionError::ConnectionFailed(e.to_string())
            })?;

        info!(url = %target, "Successfully connected to RabbitMQ");

        Ok(Self {
            connection,
            url: target,
        })
    }

    pub fn get_connection(&self) -> &Connection {
        &self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    pub async fn shutdown(&self) -> Result<(), ConnectionError> {
        if !self.is_connected() {
            return Ok(());
        }

        info!(url = %self.url, "Shutting down RabbitMQ connection");

        self.connection
            .close(200, "Normal shutdown")
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to close RabbitMQ connection gracefully");
                ConnectionError::ShutdownFailed(e.to_string())
            })?;

        info!("RabbitMQ connection closed successfully");
        Ok(())
    }
}

/// Strips credentials from an AMQP URL before it is logged.
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Failed to connect to RabbitMQ: {0}")]
    ConnectionFailed(String),

    #[error("Failed to shutdown connection gracefully: {0}")]
    ShutdownFailed(String),
}
