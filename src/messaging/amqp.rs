use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions},
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel,
};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::channel::ChannelProvider;
use super::connection::RabbitMqConnection;
use super::transport::{QueueTransport, TransportError};
use crate::contracts::{Message, OutgoingMessage};

const LABEL_HEADER: &str = "x-label";
const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";
const RESUBMIT_COUNT_HEADER: &str = "x-resubmit-count";
const PERSISTENT: u8 = 2;

#[derive(Debug, Clone)]
pub struct AmqpSettings {
    pub url: String,
    pub queue_name: String,
    pub consumer_tag: String,
    pub prefetch_count: u16,
}

/// RabbitMQ transport: one connection and one channel per consumer.
///
/// Queues are expected to exist already; nothing is declared here.
pub struct AmqpTransport {
    connection: RabbitMqConnection,
    channel: Channel,
    queue_name: String,
    consumer_tag: String,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl AmqpTransport {
    pub async fn connect(settings: AmqpSettings) -> Result<Self, TransportError> {
        let connection = RabbitMqConnection::connect(&settings.url).await?;
        let channel =
            ChannelProvider::create_channel(connection.get_connection(), settings.prefetch_count)
                .await?;

        info!(
            queue = %settings.queue_name,
            consumer_tag = %settings.consumer_tag,
            prefetch_count = settings.prefetch_count,
            "AMQP transport ready"
        );

        Ok(Self {
            connection,
            channel,
            queue_name: settings.queue_name,
            consumer_tag: settings.consumer_tag,
            pump: Mutex::new(None),
        })
    }
}

#[async_trait]
impl QueueTransport for AmqpTransport {
    fn queue_name(&self) -> &str {
        &self.queue_name
    }

    async fn start_delivery(&self, buffer: usize) -> Result<mpsc::Receiver<Message>, TransportError> {
        let mut pump = self.pump.lock().await;
        if pump.is_some() {
            return Err(TransportError::AlreadyStarted(self.queue_name.clone()));
        }

        let consumer = self
            .channel
            .basic_consume(
                &self.queue_name,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                error!(error = %e, queue = %self.queue_name, "Failed to start consumer");
                TransportError::ConsumeFailed {
                    queue: self.queue_name.clone(),
                    reason: e.to_string(),
                }
            })?;

        info!(
            queue = %self.queue_name,
            consumer_tag = %self.consumer_tag,
            "Consumer started successfully"
        );

        let (sender, receiver) = mpsc::channel(buffer.max(1));
        *pump = Some(tokio::spawn(pump_deliveries(
            consumer,
            self.queue_name.clone(),
            sender,
        )));

        Ok(receiver)
    }

    async fn submit(&self, message: OutgoingMessage) -> Result<(), TransportError> {
        let publish_failed = |e: lapin::Error| TransportError::PublishFailed {
            queue: message.queue.clone(),
            reason: e.to_string(),
        };

        let properties = BasicProperties::default()
            .with_message_id(Uuid::new_v4().to_string().into())
            .with_delivery_mode(PERSISTENT)
            .with_headers(outgoing_headers(&message));

        let confirmation = self
            .channel
            .basic_publish(
                "",
                &message.queue,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(publish_failed)?
            .await
            .map_err(publish_failed)?;

        if confirmation.is_nack() {
            return Err(TransportError::PublishNacked {
                queue: message.queue.clone(),
            });
        }

        debug!(
            queue = %message.queue,
            label = %message.label,
            resubmit_count = message.resubmit_count,
            "Message published"
        );
        Ok(())
    }

    async fn acknowledge(&self, message: &Message) -> Result<(), TransportError> {
        self.channel
            .basic_ack(message.delivery_tag(), BasicAckOptions::default())
            .await
            .map_err(|e| TransportError::AcknowledgeFailed {
                delivery_tag: message.delivery_tag(),
                reason: e.to_string(),
            })
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(pump) = self.pump.lock().await.take() {
            if self.channel.status().connected() {
                if let Err(e) = self
                    .channel
                    .basic_cancel(&self.consumer_tag, BasicCancelOptions::default())
                    .await
                {
                    warn!(error = %e, consumer_tag = %self.consumer_tag, "Failed to cancel consumer");
                }
            }
            pump.abort();
        }

        ChannelProvider::close_channel(&self.channel).await?;
        self.connection.shutdown().await?;

        info!(queue = %self.queue_name, "AMQP transport closed");
        Ok(())
    }
}

async fn pump_deliveries(
    mut consumer: lapin::Consumer,
    queue: String,
    sender: mpsc::Sender<Message>,
) {
    while let Some(delivery) = consumer.next().await {
        match delivery {
            Ok(mut delivery) => {
                let data = std::mem::take(&mut delivery.data);
                let message = message_from_parts(
                    &queue,
                    delivery.delivery_tag,
                    delivery.redelivered,
                    &delivery.properties,
                    data,
                );
                if sender.send(message).await.is_err() {
                    debug!(queue = %queue, "Delivery receiver dropped, stopping pump");
                    return;
                }
            }
            Err(e) => {
                error!(error = %e, queue = %queue, "Error receiving message from RabbitMQ");
                break;
            }
        }
    }

    warn!(queue = %queue, "Consumer stream ended");
}

fn message_from_parts(
    queue: &str,
    delivery_tag: u64,
    redelivered: bool,
    properties: &BasicProperties,
    data: Vec<u8>,
) -> Message {
    let headers = properties.headers().as_ref();

    let label = header_string(headers, LABEL_HEADER)
        .or_else(|| {
            properties
                .message_id()
                .as_ref()
                .map(|id| id.as_str().to_string())
        })
        .unwrap_or_else(|| format!("delivery-{}", delivery_tag));

    // Quorum queues count previous deliveries in x-delivery-count.
    let delivery_count = header_u32(headers, DELIVERY_COUNT_HEADER)
        .map(|previous| previous.saturating_add(1))
        .unwrap_or(if redelivered { 2 } else { 1 });

    let resubmit_count = header_u32(headers, RESUBMIT_COUNT_HEADER).unwrap_or(0);

    Message::new(label, data, queue, delivery_tag)
        .with_delivery_count(delivery_count)
        .with_resubmit_count(resubmit_count)
}

fn outgoing_headers(message: &OutgoingMessage) -> FieldTable {
    let mut headers = FieldTable::default();
    headers.insert(
        LABEL_HEADER.into(),
        AMQPValue::LongString(message.label.clone().into()),
    );
    headers.insert(
        RESUBMIT_COUNT_HEADER.into(),
        AMQPValue::LongLongInt(i64::from(message.resubmit_count)),
    );
    headers
}

fn header_string(headers: Option<&FieldTable>, key: &str) -> Option<String> {
    match headers?.inner().get(key)? {
        AMQPValue::LongString(value) => Some(String::from_utf8_lossy(value.as_bytes()).into_owned()),
        AMQPValue::ShortString(value) => Some(value.as_str().to_string()),
        _ => None,
    }
}

fn header_u32(headers: Option<&FieldTable>, key: &str) -> Option<u32> {
    match headers?.inner().get(key)? {
        AMQPValue::ShortShortUInt(value) => Some(u32::from(*value)),
        AMQPValue::ShortUInt(value) => Some(u32::from(*value)),
        AMQPValue::LongUInt(value) => Some(*value),
        AMQPValue::ShortInt(value) => u32::try_from(*value).ok(),
        AMQPValue::LongInt(value) => u32::try_from(*value).ok(),
        AMQPValue::LongLongInt(value) => u32::try_from(*value).ok(),
        _ => None,
    }
}
