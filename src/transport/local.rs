use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use dashmap::{DashMap, mapref::entry::Entry};
use futures::future::BoxFuture;
use tokio::sync::{Mutex, mpsc, mpsc::error::TrySendError};
use tokio_util::sync::CancellationToken;

use super::{MessageHandler, Transport, TransportError, is_topic_key};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// In-process backend: one bounded FIFO per queue name, created lazily.
///
/// A routing key with bindings delivers to every bound queue. Without bindings
/// a topic key drops the message, as a broker exchange would, and any other
/// key delivers to the queue of the same name. A full queue rejects the
/// message with [`TransportError::QueueFull`] instead of waiting.
///
/// Queues created by publishes to names nobody ever consumes stay around
/// until [`LocalTransport::prune_unclaimed`] removes them.
pub struct LocalTransport {
    capacity: usize,
    queues: DashMap<String, Arc<LocalQueue>>,
    bindings: DashMap<String, HashSet<String>>,
    closed: AtomicBool,
}

struct LocalQueue {
    sender: mpsc::Sender<String>,
    receiver: Mutex<mpsc::Receiver<String>>,
    torn_down: CancellationToken,
}

impl LocalQueue {
    fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Mutex::new(receiver),
            torn_down: CancellationToken::new(),
        }
    }
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            queues: DashMap::new(),
            bindings: DashMap::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of undelivered messages sitting in `queue_name`.
    pub fn pending(&self, queue_name: &str) -> usize {
        self.queues
            .get(queue_name)
            .map(|queue| queue.sender.max_capacity() - queue.sender.capacity())
            .unwrap_or(0)
    }

    pub fn has_queue(&self, queue_name: &str) -> bool {
        self.queues.contains_key(queue_name)
    }

    /// Drop a queue and its bindings. Its consumer, if any, returns.
    pub fn teardown(&self, queue_name: &str) -> bool {
        let Some((_, queue)) = self.queues.remove(queue_name) else {
            return false;
        };
        queue.torn_down.cancel();
        self.bindings.retain(|_, bound| {
            bound.remove(queue_name);
            !bound.is_empty()
        });
        tracing::debug!("| local transport | queue torn down: {}", queue_name);
        true
    }

    /// Drop every queue that no key is bound to and no consumer is reading,
    /// along with its undelivered messages. Returns how many were removed.
    pub fn prune_unclaimed(&self) -> usize {
        let bound = self
            .bindings
            .iter()
            .flat_map(|entry| entry.value().iter().cloned().collect::<Vec<_>>())
            .collect::<HashSet<_>>();
        let mut pruned = 0;
        self.queues.retain(|name, queue| {
            // Consumers and in-flight publishes hold their own handle.
            let claimed = bound.contains(name) || Arc::strong_count(queue) > 1;
            if !claimed {
                queue.torn_down.cancel();
                pruned += 1;
            }
            claimed
        });
        if pruned > 0 {
            tracing::debug!("| local transport | pruned {} unclaimed queue(s)", pruned);
        }
        pruned
    }

    fn queue(&self, queue_name: &str) -> Result<Arc<LocalQueue>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let capacity = self.capacity;
        Ok(self
            .queues
            .entry(queue_name.to_owned())
            .or_insert_with(|| Arc::new(LocalQueue::new(capacity)))
            .value()
            .clone())
    }

    fn deliver(&self, queue_name: &str, message: String) -> Result<(), TransportError> {
        let queue = self.queue(queue_name)?;
        queue.sender.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => {
                tracing::warn!(
                    "| local transport | queue {} is full, message rejected",
                    queue_name
                );
                TransportError::QueueFull {
                    queue: queue_name.to_owned(),
                    capacity: self.capacity,
                }
            }
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for LocalTransport {
    fn connect(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move { Ok(()) })
    }

    fn publish<'a>(
        &'a self,
        routing_key: &'a str,
        message: String,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }
            let targets = match self.bindings.get(routing_key) {
                Some(bound) if !bound.is_empty() => bound.iter().cloned().collect::<Vec<_>>(),
                _ if is_topic_key(routing_key) => {
                    tracing::debug!(
                        "| local transport | no queue bound to '{}', message dropped",
                        routing_key
                    );
                    return Ok(());
                }
                _ => vec![routing_key.to_owned()],
            };

            // Every bound queue gets its copy even if one of them is full.
            let mut outcome = Ok(());
            for target in targets {
                if let Err(e) = self.deliver(&target, message.clone()) {
                    outcome = Err(e);
                }
            }
            outcome
        })
    }

    fn bind<'a>(
        &'a self,
        queue_name: &'a str,
        routing_key: &'a str,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            self.queue(queue_name)?;
            self.bindings
                .entry(routing_key.to_owned())
                .or_default()
                .insert(queue_name.to_owned());
            Ok(())
        })
    }

    fn unbind<'a>(
        &'a self,
        queue_name: &'a str,
        routing_key: &'a str,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            if let Entry::Occupied(mut bound) = self.bindings.entry(routing_key.to_owned()) {
                bound.get_mut().remove(queue_name);
                if bound.get().is_empty() {
                    bound.remove();
                }
            }
            Ok(())
        })
    }

    fn consume<'a>(
        &'a self,
        queue_name: &'a str,
        handler: MessageHandler,
    ) -> BoxFuture<'a, Result<(), TransportError>> {
        Box::pin(async move {
            let queue = self.queue(queue_name)?;
            let Ok(mut receiver) = queue.receiver.try_lock() else {
                return Err(TransportError::ConsumerExists(queue_name.to_owned()));
            };

            loop {
                tokio::select! {
                    biased;
                    _ = queue.torn_down.cancelled() => break,
                    message = receiver.recv() => match message {
                        Some(message) => handler(message).await,
                        None => break,
                    },
                }
            }
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::Release);
            let names = self
                .queues
                .iter()
                .map(|entry| entry.key().clone())
                .collect::<Vec<_>>();
            for name in names {
                self.teardown(&name);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::FutureExt;

    use super::*;
    use crate::transport::BROADCAST_KEY;

    fn collecting_handler() -> (MessageHandler, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: MessageHandler = Arc::new(move |message: String| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message);
            }
            .boxed()
        });
        (handler, rx)
    }

    #[tokio::test]
    async fn test_publish_before_consume_is_buffered_in_order() {
        let transport = Arc::new(LocalTransport::new());
        transport.publish("agent.a", "one".into()).await.unwrap();
        transport.publish("agent.a", "two".into()).await.unwrap();
        assert_eq!(transport.pending("agent.a"), 2);

        let (handler, mut rx) = collecting_handler();
        let consumer = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.consume("agent.a", handler).await })
        };

        assert_eq!(rx.recv().await.unwrap(), "one");
        assert_eq!(rx.recv().await.unwrap(), "two");

        assert!(transport.teardown("agent.a"));
        consumer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bound_queues_each_receive_a_copy() {
        let transport = LocalTransport::new();
        transport.bind("agent.a", "broadcast").await.unwrap();
        transport.bind("agent.b", "broadcast").await.unwrap();

        transport.publish("broadcast", "hello".into()).await.unwrap();

        assert_eq!(transport.pending("agent.a"), 1);
        assert_eq!(transport.pending("agent.b"), 1);
        assert!(!transport.has_queue("broadcast"));

        transport.unbind("agent.b", "broadcast").await.unwrap();
        transport.publish("broadcast", "again".into()).await.unwrap();
        assert_eq!(transport.pending("agent.a"), 2);
        assert_eq!(transport.pending("agent.b"), 1);
    }

    #[tokio::test]
    async fn test_unbound_broadcast_is_dropped() {
        let transport = LocalTransport::with_capacity(2);
        for _ in 0..3 {
            transport.publish(BROADCAST_KEY, "anyone?".into()).await.unwrap();
        }
        assert!(!transport.has_queue(BROADCAST_KEY));

        transport.bind("agent.late", BROADCAST_KEY).await.unwrap();
        transport.publish(BROADCAST_KEY, "hello".into()).await.unwrap();
        assert_eq!(transport.pending("agent.late"), 1);
    }

    #[tokio::test]
    async fn test_prune_unclaimed_keeps_bound_and_consumed_queues() {
        let transport = Arc::new(LocalTransport::new());
        transport.bind("agent.a", BROADCAST_KEY).await.unwrap();
        transport.publish("agent.ghost", "lost".into()).await.unwrap();
        let (handler, _rx) = collecting_handler();
        let consumer = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.consume("agent.b", handler).await })
        };
        while !transport.has_queue("agent.b") {
            tokio::task::yield_now().await;
        }

        assert_eq!(transport.prune_unclaimed(), 1);
        assert!(!transport.has_queue("agent.ghost"));
        assert!(transport.has_queue("agent.a"));
        assert!(transport.has_queue("agent.b"));

        transport.close().await.unwrap();
        consumer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_fails_fast() {
        let transport = LocalTransport::with_capacity(2);
        transport.publish("q", "1".into()).await.unwrap();
        transport.publish("q", "2".into()).await.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(1), transport.publish("q", "3".into()))
            .await
            .expect("publish must not block")
            .unwrap_err();
        assert!(matches!(err, TransportError::QueueFull { capacity: 2, .. }));
    }

    #[tokio::test]
    async fn test_second_consumer_is_rejected() {
        let transport = Arc::new(LocalTransport::new());
        let (handler, _rx) = collecting_handler();
        let first = {
            let transport = Arc::clone(&transport);
            let handler = handler.clone();
            tokio::spawn(async move { transport.consume("q", handler).await })
        };
        // Let the first consumer take the receiver.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let err = transport.consume("q", handler).await.unwrap_err();
        assert!(matches!(err, TransportError::ConsumerExists(_)));

        transport.close().await.unwrap();
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_publish_after_close_fails() {
        let transport = LocalTransport::new();
        transport.publish("q", "before".into()).await.unwrap();
        transport.close().await.unwrap();

        assert!(!transport.has_queue("q"));
        assert!(matches!(
            transport.publish("q", "after".into()).await,
            Err(TransportError::Closed)
        ));
    }
}
