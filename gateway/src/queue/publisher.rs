//! Async RabbitMQ publisher for canonical events.
//!
//! The publisher keeps one connection and one confirm-mode channel that are
//! shared by every request handler, reconnecting lazily after a failure.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use lapin::{
    options::{
        BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::types::{
    InboundMessage, StatusUpdate, INBOUND_QUEUE, INBOUND_ROUTING_PREFIX, STATUS_QUEUE,
    STATUS_ROUTING_PREFIX,
};

/// The only way canonical events leave the gateway.
///
/// Implementations must be safe to call from many requests at once.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_inbound(&self, message: &InboundMessage) -> Result<()>;

    async fn publish_status_update(&self, update: &StatusUpdate) -> Result<()>;
}

/// RabbitMQ publisher with connection management.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    url: String,
    exchange: String,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
}

impl Publisher {
    pub fn new(url: String, exchange: String) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                url,
                exchange,
                connection: RwLock::new(None),
                channel: RwLock::new(None),
            }),
        }
    }

    pub fn exchange(&self) -> &str {
        &self.inner.exchange
    }

    async fn ensure_connected(&self) -> Result<Channel> {
        {
            let channel = self.inner.channel.read().await;
            if let Some(ch) = channel.as_ref() {
                if ch.status().connected() {
                    return Ok(ch.clone());
                }
            }
        }

        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        // Another task may have reconnected while we waited for the lock.
        if let Some(ch) = channel.as_ref() {
            if ch.status().connected() {
                return Ok(ch.clone());
            }
        }

        info!(exchange = %self.inner.exchange, "rabbitmq_publisher_connecting");

        let conn = Connection::connect(&self.inner.url, ConnectionProperties::default())
            .await
            .context("Failed to connect to RabbitMQ")?;

        let ch = conn
            .create_channel()
            .await
            .context("Failed to create channel")?;

        ch.confirm_select(ConfirmSelectOptions::default())
            .await
            .context("Failed to enable publisher confirms")?;

        self.declare_topology(&ch).await?;

        info!(
            exchange = %self.inner.exchange,
            inbound_queue = INBOUND_QUEUE,
            status_queue = STATUS_QUEUE,
            "rabbitmq_publisher_connected"
        );

        *connection = Some(conn);
        *channel = Some(ch.clone());

        Ok(ch)
    }

    /// Declare the exchange and the two durable queues (idempotent).
    async fn declare_topology(&self, ch: &Channel) -> Result<()> {
        ch.exchange_declare(
            &self.inner.exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .context("Failed to declare exchange")?;

        for (queue, prefix) in [
            (INBOUND_QUEUE, INBOUND_ROUTING_PREFIX),
            (STATUS_QUEUE, STATUS_ROUTING_PREFIX),
        ] {
            ch.queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("Failed to declare queue {}", queue))?;

            ch.queue_bind(
                queue,
                &self.inner.exchange,
                &format!("{}.#", prefix),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("Failed to bind queue {}", queue))?;
        }

        Ok(())
    }

    async fn publish(
        &self,
        routing_key: &str,
        message_id: String,
        tenant_id: &str,
        channel_id: &str,
        body: Vec<u8>,
    ) -> Result<()> {
        let channel = self.ensure_connected().await?;

        let mut headers = FieldTable::default();
        headers.insert(
            "tenant_id".into(),
            AMQPValue::LongString(tenant_id.to_string().into()),
        );
        headers.insert(
            "channel_id".into(),
            AMQPValue::LongString(channel_id.to_string().into()),
        );

        let confirmation = channel
            .basic_publish(
                &self.inner.exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default()
                    .with_delivery_mode(2) // Persistent
                    .with_content_type("application/json".into())
                    .with_message_id(message_id.clone().into())
                    .with_headers(headers),
            )
            .await
            .context("Failed to publish event")?
            .await
            .context("Failed to confirm publish")?;

        if confirmation.is_nack() {
            bail!("Broker rejected event {}", message_id);
        }

        info!(
            routing_key = %routing_key,
            message_id = %message_id,
            body_length = body.len(),
            "rabbitmq_event_published"
        );

        Ok(())
    }

    /// Close the connection gracefully.
    pub async fn close(&self) {
        let mut connection = self.inner.connection.write().await;
        let mut channel = self.inner.channel.write().await;

        if let Some(ch) = channel.take() {
            if let Err(e) = ch.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_channel_close_error");
            }
        }

        if let Some(conn) = connection.take() {
            if let Err(e) = conn.close(200, "Normal shutdown").await {
                warn!(error = %e, "rabbitmq_connection_close_error");
            }
        }

        info!("rabbitmq_publisher_closed");
    }
}

#[async_trait]
impl EventPublisher for Publisher {
    async fn publish_inbound(&self, message: &InboundMessage) -> Result<()> {
        let body = serde_json::to_vec(message).context("Failed to serialize inbound message")?;
        self.publish(
            &message.routing_key(),
            message.id.to_string(),
            &message.tenant_id,
            &message.channel_id,
            body,
        )
        .await
    }

    async fn publish_status_update(&self, update: &StatusUpdate) -> Result<()> {
        let body = serde_json::to_vec(update).context("Failed to serialize status update")?;
        self.publish(
            &update.routing_key(),
            update.bus_message_id(),
            &update.tenant_id,
            &update.channel_id,
            body,
        )
        .await
    }
}
