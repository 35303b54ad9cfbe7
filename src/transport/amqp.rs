use dashmap::DashSet;
use futures::{StreamExt, future::BoxFuture};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{MessageHandler, Transport, TransportError, is_topic_key};

pub const DEFAULT_EXCHANGE: &str = "swarm";

/// Adapter over an AMQP broker: a durable topic exchange with one durable
/// queue per mailbox. Messages are acked after the handler returns, so
/// delivery is at-least-once and flow control is left to the broker.
///
/// Publishing to a direct key declares its queue first, so messages for an
/// agent that has not attached yet wait in its mailbox. Topic keys with no
/// bound queue are dropped by the broker.
pub struct AmqpTransport {
    url: String,
    exchange: String,
    state: RwLock<Option<AmqpState>>,
    declared: DashSet<String>,
}

struct AmqpState {
    connection: Connection,
    channel: Channel,
}

impl AmqpTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_exchange(url, DEFAULT_EXCHANGE)
    }

    pub fn with_exchange(url: impl Into<String>, exchange: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            exchange: exchange.into(),
            state: RwLock::new(None),
            declared: DashSet::new(),
        }
    }

    async fn channel(&self) -> Result<Channel, TransportError> {
        self.state
            .read()
            .await
            .as_ref()
            .map(|state| state.channel.clone())
            .ok_or(TransportError::NotConnected)
    }

    /// Declare `queue_name` and bind it to its own name on the exchange.
    async fn declare_queue(&self, channel: &Channel, queue_name: &str) -> Result<(), TransportError> {
        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        channel
            .queue_bind(
                queue_name,
                &self.exchange,
                queue_name,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        self.declared.insert(queue_name.to_owned());
        Ok(())
    }
}

impl Transport for AmqpTransport {
    fn connect(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            if state.is_some() {
                return Ok(());
            }

            let connection = Connection::connect(&self.url, ConnectionProperties::default()).await?;
            let channel = connection.create_channel().await?;
            channel
                .exchange_declare(
                    &self.exchange,
                    ExchangeKind::Topic,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            tracing::info!("| amqp transport | connected, exchange: {}", self.exchange);

            *state = Some(AmqpState {
                connection,
                channel,
            });
            Ok(())
        })
    }

    fn publish<'a>(
        &'a self,
        routing_key: &'a str,
        message: String,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let channel = self.channel().await?;
            if !is_topic_key(routing_key) && !self.declared.contains(routing_key) {
                self.declare_queue(&channel, routing_key).await?;
            }
            channel
                .basic_publish(
                    &self.exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    message.as_bytes(),
                    BasicProperties::default(),
                )
                .await?
                .await?;
            Ok(())
        })
    }

    fn bind<'a>(
        &'a self,
        queue_name: &'a str,
        routing_key: &'a str,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let channel = self.channel().await?;
            self.declare_queue(&channel, queue_name).await?;
            channel
                .queue_bind(
                    queue_name,
                    &self.exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            Ok(())
        })
    }

    fn unbind<'a>(
        &'a self,
        queue_name: &'a str,
        routing_key: &'a str,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let channel = self.channel().await?;
            channel
                .queue_unbind(queue_name, &self.exchange, routing_key, FieldTable::default())
                .await?;
            Ok(())
        })
    }

    fn consume<'a>(
        &'a self,
        queue_name: &'a str,
        handler: MessageHandler,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let channel = self.channel().await?;
            self.declare_queue(&channel, queue_name).await?;

            let consumer_tag = format!("{queue_name}-{}", Uuid::new_v4());
            let mut consumer = channel
                .basic_consume(
                    queue_name,
                    &consumer_tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await?;

            while let Some(delivery) = consumer.next().await {
                let delivery = delivery?;
                let message = String::from_utf8_lossy(&delivery.data).into_owned();
                handler(message).await;
                delivery.ack(BasicAckOptions::default()).await?;
            }
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.declared.clear();
            if let Some(state) = self.state.write().await.take() {
                state.channel.close(200, "swarm closing").await?;
                state.connection.close(200, "swarm closing").await?;
            }
            Ok(())
        })
    }
}
