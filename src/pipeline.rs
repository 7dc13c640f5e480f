//! Producer, broker, and consumer pipeline
//!
//! `Producer` stamps each payload with its idempotency key and an ordering
//! key, `MessageBroker` fans messages out to every `Subscriber`, and
//! `Consumer` composes the idempotency guard with the ordered buffer: a
//! message reaches the buffer only when its handler actually ran.

use crate::error::{EdaError, Result};
use crate::idempotency::{IdempotencyGuard, Outcome};
use crate::ordering::OrderedEventBuffer;
use crate::state::StateStore;
use crate::types::Message;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Business logic run for each fresh message
#[async_trait]
pub trait Handler: Send + Sync {
    /// Process the message data, returning the result to cache
    async fn handle(&self, data: &serde_json::Value) -> Result<serde_json::Value>;
}

/// Handler that returns the data unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

#[async_trait]
impl Handler for EchoHandler {
    async fn handle(&self, data: &serde_json::Value) -> Result<serde_json::Value> {
        Ok(data.clone())
    }
}

/// How a subscriber disposed of a delivered message
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// First delivery; the handler ran and produced this result
    Processed(serde_json::Value),
    /// Redelivery; the cached result was returned
    Duplicate(serde_json::Value),
}

impl Delivery {
    pub fn result(&self) -> &serde_json::Value {
        match self {
            Delivery::Processed(v) | Delivery::Duplicate(v) => v,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Delivery::Duplicate(_))
    }
}

/// Receiving end of the broker
#[async_trait]
pub trait Subscriber: Send + Sync {
    /// Handle one delivery of `message`
    async fn deliver(&self, message: Message) -> Result<Delivery>;

    /// Subscriber name used in logs
    fn name(&self) -> &str;
}

/// In-memory fan-out broker
///
/// Every published message is delivered to every subscriber, in
/// subscription order. Failures are returned per subscriber and do not
/// stop delivery to the rest.
#[derive(Default)]
pub struct MessageBroker {
    subscribers: RwLock<Vec<Arc<dyn Subscriber>>>,
}

impl MessageBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber
    pub async fn subscribe(&self, subscriber: Arc<dyn Subscriber>) {
        tracing::info!(subscriber = %subscriber.name(), "Subscriber registered");
        self.subscribers.write().await.push(subscriber);
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Deliver `message` to every subscriber
    pub async fn publish(&self, message: &Message) -> Vec<Result<Delivery>> {
        let subscribers = self.subscribers.read().await.clone();
        let mut deliveries = Vec::with_capacity(subscribers.len());

        for subscriber in subscribers {
            let delivery = subscriber.deliver(message.clone()).await;
            if let Err(e) = &delivery {
                tracing::warn!(
                    subscriber = %subscriber.name(),
                    key = %message.idempotency_key(),
                    error = %e,
                    retryable = e.is_retryable(),
                    "Delivery failed"
                );
            }
            deliveries.push(delivery);
        }

        deliveries
    }
}

/// Result of one `Producer::publish`
///
/// Holds the stamped message, for verbatim redelivery, and one delivery
/// result per subscriber in subscription order.
#[derive(Debug)]
pub struct Publication {
    pub message: Message,
    pub deliveries: Vec<Result<Delivery>>,
}

impl Publication {
    /// True when every subscriber accepted the message
    pub fn is_fully_delivered(&self) -> bool {
        self.deliveries.iter().all(|d| d.is_ok())
    }

    /// Errors from subscribers that rejected the message
    pub fn failures(&self) -> impl Iterator<Item = &EdaError> {
        self.deliveries.iter().filter_map(|d| d.as_ref().err())
    }
}

/// Publishing side: attaches metadata once, then hands off to the broker
pub struct Producer {
    broker: Arc<MessageBroker>,
}

impl Producer {
    pub fn new(broker: Arc<MessageBroker>) -> Self {
        Self { broker }
    }

    /// Build a message for `data` and publish it
    ///
    /// Only message construction fails the call. Subscriber failures are
    /// reported in `Publication::deliveries`.
    pub async fn publish(
        &self,
        data: serde_json::Value,
        ordering_key: DateTime<Utc>,
    ) -> Result<Publication> {
        let message = Message::new(data, ordering_key)?;
        let deliveries = self.broker.publish(&message).await;
        let failed = deliveries.iter().filter(|d| d.is_err()).count();

        tracing::debug!(
            key = %message.idempotency_key(),
            subscribers = deliveries.len(),
            failed,
            "Message published"
        );
        Ok(Publication {
            message,
            deliveries,
        })
    }

    /// Publish an already-built message again, as a redelivery would
    pub async fn redeliver(&self, message: &Message) -> Vec<Result<Delivery>> {
        self.broker.publish(message).await
    }
}

/// Idempotent, re-sequencing consumer
pub struct Consumer {
    name: String,
    guard: IdempotencyGuard,
    handler: Arc<dyn Handler>,
    buffer: OrderedEventBuffer<DateTime<Utc>, serde_json::Value>,
}

impl Consumer {
    /// Create a consumer running `EchoHandler` over the given store
    pub fn new(name: impl Into<String>, store: Arc<dyn StateStore>) -> Self {
        Self::with_handler(name, store, Arc::new(EchoHandler))
    }

    pub fn with_handler(
        name: impl Into<String>,
        store: Arc<dyn StateStore>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        Self {
            name: name.into(),
            guard: IdempotencyGuard::new(store),
            handler,
            buffer: OrderedEventBuffer::new(),
        }
    }

    pub fn guard(&self) -> &IdempotencyGuard {
        &self.guard
    }

    pub fn buffer(&self) -> &OrderedEventBuffer<DateTime<Utc>, serde_json::Value> {
        &self.buffer
    }

    /// Processed message data sorted by ordering key
    pub fn ordered_events(&self) -> Vec<serde_json::Value> {
        self.buffer.ordered_view()
    }

    /// Processed message data in receipt order
    pub fn received_events(&self) -> Vec<serde_json::Value> {
        self.buffer.arrival_view()
    }
}

#[async_trait]
impl Subscriber for Consumer {
    async fn deliver(&self, message: Message) -> Result<Delivery> {
        let key = message.idempotency_key();
        let outcome = self
            .guard
            .run_with_outcome(key, || self.handler.handle(&message.data))
            .await?;

        match outcome {
            Outcome::Executed(result) => {
                self.buffer
                    .receive(message.ordering_key(), message.data.clone());
                tracing::info!(
                    consumer = %self.name,
                    key = %key,
                    buffered = self.buffer.len(),
                    "Message processed"
                );
                Ok(Delivery::Processed(result))
            }
            Outcome::Cached(result) => Ok(Delivery::Duplicate(result)),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStateStore;
    use chrono::Duration;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Handler for CountingHandler {
        async fn handle(&self, data: &serde_json::Value) -> Result<serde_json::Value> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(json!({"seen": data, "call": n}))
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl Handler for FailingHandler {
        async fn handle(&self, _data: &serde_json::Value) -> Result<serde_json::Value> {
            Err(EdaError::Handler("downstream rejected".to_string()))
        }
    }

    fn consumer() -> Consumer {
        Consumer::new("test", Arc::new(MemoryStateStore::new()))
    }

    #[tokio::test]
    async fn test_echo_handler() {
        let data = json!({"name": "John"});
        assert_eq!(EchoHandler.handle(&data).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_consumer_processes_then_dedups() {
        let consumer = consumer();
        let msg = Message::new(json!({"name": "Jane Doe"}), Utc::now()).unwrap();

        let first = consumer.deliver(msg.clone()).await.unwrap();
        let second = consumer.deliver(msg).await.unwrap();

        assert_eq!(first, Delivery::Processed(json!({"name": "Jane Doe"})));
        assert!(second.is_duplicate());
        assert_eq!(second.result(), first.result());
        assert_eq!(consumer.received_events().len(), 1);
    }

    #[tokio::test]
    async fn test_consumer_runs_handler_once() {
        let handler = Arc::new(CountingHandler {
            calls: AtomicUsize::new(0),
        });
        let consumer = Consumer::with_handler(
            "counting",
            Arc::new(MemoryStateStore::new()),
            handler.clone(),
        );
        let msg = Message::new(json!({"x": 1}), Utc::now()).unwrap();

        for _ in 0..3 {
            let delivery = consumer.deliver(msg.clone()).await.unwrap();
            assert_eq!(delivery.result()["call"], 1);
        }
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_consumer_failed_handler_not_buffered() {
        let consumer = Consumer::with_handler(
            "failing",
            Arc::new(MemoryStateStore::new()),
            Arc::new(FailingHandler),
        );
        let msg = Message::new(json!({"x": 1}), Utc::now()).unwrap();

        let err = consumer.deliver(msg.clone()).await.unwrap_err();
        assert!(matches!(err, EdaError::Handler(_)));
        assert!(consumer.buffer().is_empty());

        // Stuck key surfaces as retryable on redelivery
        let err = consumer.deliver(msg).await.unwrap_err();
        assert!(matches!(err, EdaError::OperationInProgress { .. }));
    }

    #[tokio::test]
    async fn test_broker_fans_out() {
        let broker = Arc::new(MessageBroker::new());
        let a = Arc::new(consumer());
        let b = Arc::new(consumer());
        broker.subscribe(a.clone()).await;
        broker.subscribe(b.clone()).await;
        assert_eq!(broker.subscriber_count().await, 2);

        let producer = Producer::new(broker);
        let publication = producer.publish(json!({"n": 1}), Utc::now()).await.unwrap();
        assert!(publication.is_fully_delivered());
        assert_eq!(publication.deliveries.len(), 2);

        assert_eq!(a.received_events(), vec![json!({"n": 1})]);
        assert_eq!(b.received_events(), vec![json!({"n": 1})]);
    }

    #[tokio::test]
    async fn test_broker_reports_failures_per_subscriber() {
        let broker = MessageBroker::new();
        broker
            .subscribe(Arc::new(Consumer::with_handler(
                "failing",
                Arc::new(MemoryStateStore::new()),
                Arc::new(FailingHandler),
            )))
            .await;
        let healthy = Arc::new(consumer());
        broker.subscribe(healthy.clone()).await;

        let msg = Message::new(json!({"n": 1}), Utc::now()).unwrap();
        let deliveries = broker.publish(&msg).await;

        assert!(deliveries[0].is_err());
        assert!(deliveries[1].is_ok());
        assert_eq!(healthy.received_events().len(), 1);
    }

    #[tokio::test]
    async fn test_producer_surfaces_subscriber_failures() {
        let broker = Arc::new(MessageBroker::new());
        broker
            .subscribe(Arc::new(Consumer::with_handler(
                "failing",
                Arc::new(MemoryStateStore::new()),
                Arc::new(FailingHandler),
            )))
            .await;
        let healthy = Arc::new(consumer());
        broker.subscribe(healthy.clone()).await;
        let producer = Producer::new(broker);

        let publication = producer.publish(json!({"n": 1}), Utc::now()).await.unwrap();

        assert!(!publication.is_fully_delivered());
        let failures: Vec<_> = publication.failures().collect();
        assert_eq!(failures.len(), 1);
        assert!(matches!(failures[0], EdaError::Handler(_)));
        assert_eq!(
            publication.deliveries[1].as_ref().unwrap(),
            &Delivery::Processed(json!({"n": 1}))
        );

        // The failed subscriber now holds the key in progress
        let redelivered = producer.redeliver(&publication.message).await;
        assert!(matches!(
            redelivered[0],
            Err(EdaError::OperationInProgress { .. })
        ));
        assert!(redelivered[1].as_ref().unwrap().is_duplicate());
    }

    #[tokio::test]
    async fn test_producer_redeliver_is_deduplicated() {
        let broker = Arc::new(MessageBroker::new());
        let consumer = Arc::new(consumer());
        broker.subscribe(consumer.clone()).await;
        let producer = Producer::new(broker);

        let t0 = Utc::now();
        let msg = producer
            .publish(json!({"event": "takeoff"}), t0)
            .await
            .unwrap()
            .message;
        producer
            .publish(json!({"event": "boarding"}), t0 - Duration::seconds(1000))
            .await
            .unwrap();

        let redelivered = producer.redeliver(&msg).await;
        assert!(redelivered[0].as_ref().unwrap().is_duplicate());

        assert_eq!(
            consumer.ordered_events(),
            vec![json!({"event": "boarding"}), json!({"event": "takeoff"})]
        );
    }
}
