use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::messaging::{Consumer, ConsumerError};

/// Runs a set of consumers for the lifetime of the process.
#[derive(Default)]
pub struct ConsumerHost {
    consumers: Vec<Consumer>,
}

impl ConsumerHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, consumer: Consumer) -> &mut Self {
        self.consumers.push(consumer);
        self
    }

    /// Closes every registered consumer without running it.
    ///
    /// Used when startup is abandoned after some transports are already open.
    pub async fn close(self) {
        for consumer in self.consumers {
            let name = consumer.name().to_string();
            if let Err(e) = consumer.close().await {
                warn!(consumer = %name, error = %e, "Failed to close transport");
            }
        }
    }

    /// Blocks until `shutdown` is cancelled and every consumer has stopped.
    ///
    /// The first consumer to fail cancels the others; its error is returned.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ConsumerError> {
        let mut running = JoinSet::new();
        for consumer in self.consumers {
            let name = consumer.name().to_string();
            let token = shutdown.child_token();
            running.spawn(async move { (name, consumer.run(token).await) });
        }

        info!(consumers = running.len(), "Consumer host running");

        let mut first_error = None;
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((name, Ok(()))) => info!(consumer = %name, "Consumer finished"),
                Ok((name, Err(e))) => {
                    error!(consumer = %name, error = %e, "Consumer failed, stopping host");
                    shutdown.cancel();
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "Consumer task panicked, stopping host");
                    shutdown.cancel();
                }
            }
        }

        info!("Consumer host stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
