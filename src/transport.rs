use std::sync::Arc;

use futures::future::BoxFuture;
use thiserror::Error;

pub mod local;

#[cfg(feature = "amqp")]
pub mod amqp;

/// Routing key every attached agent's mailbox is bound to.
pub const BROADCAST_KEY: &str = "broadcast";

/// Mailbox queue name for an agent.
pub fn mailbox_key(agent_name: &str) -> String {
    format!("agent.{agent_name}")
}

/// Topic keys only reach queues bound to them; with no bindings the message is
/// dropped. Every other key addresses the queue of the same name.
pub fn is_topic_key(routing_key: &str) -> bool {
    routing_key == BROADCAST_KEY
}

/// Invoked once per consumed message, in delivery order.
pub type MessageHandler = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Queue '{queue}' is full (capacity {capacity})")]
    QueueFull { queue: String, capacity: usize },
    #[error("Transport is closed")]
    Closed,
    #[error("Queue '{0}' already has a consumer")]
    ConsumerExists(String),
    #[error("Transport is not connected")]
    NotConnected,
    #[cfg(feature = "amqp")]
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),
}

/// Point-to-point publish/consume primitive underneath all swarm messaging.
///
/// `publish` never blocks on a full buffer; backends either fail fast or rely
/// on the broker's own flow control.
pub trait Transport: Send + Sync {
    fn connect(&self) -> BoxFuture<'_, Result<(), TransportError>>;

    fn publish<'a>(
        &'a self,
        routing_key: &'a str,
        message: String,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Route messages published under `routing_key` into `queue_name` as well.
    fn bind<'a>(
        &'a self,
        queue_name: &'a str,
        routing_key: &'a str,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    fn unbind<'a>(
        &'a self,
        queue_name: &'a str,
        routing_key: &'a str,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    /// Runs until the queue is torn down or the returned future is dropped.
    fn consume<'a>(
        &'a self,
        queue_name: &'a str,
        handler: MessageHandler,
    ) -> BoxFuture<'a, Result<(), TransportError>>;

    fn close(&self) -> BoxFuture<'_, Result<(), TransportError>>;
}
