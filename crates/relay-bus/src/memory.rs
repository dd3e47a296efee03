//! # In-Memory Broker
//!
//! Process-local topics and subscriptions with Pub/Sub delivery semantics:
//! a topic fans out to every attached subscription, consumers of one
//! subscription compete for its messages, and a nacked message is
//! redelivered after a delay with its attempt count bumped.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::transport::{
    AckDecision, Delivery, DeliveryHandler, PublishReceipt, Transport, TransportError,
};
use crate::DEFAULT_REDELIVERY_DELAY_MS;

/// Counters for the whole broker.
#[derive(Debug, Default)]
pub struct BrokerStats {
    pub published: AtomicU64,
    pub delivered: AtomicU64,
    pub acked: AtomicU64,
    pub nacked: AtomicU64,
    /// Published to a topic with no subscription attached.
    pub dropped: AtomicU64,
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    message_id: String,
    data: Vec<u8>,
    attempt: u32,
}

struct SubscriptionQueue {
    name: String,
    messages: Mutex<VecDeque<QueuedMessage>>,
    notify: Notify,
    /// Injected failure, consumed by the next receive.
    failure: Mutex<Option<String>>,
}

impl SubscriptionQueue {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            failure: Mutex::new(None),
        }
    }

    fn push(&self, message: QueuedMessage) {
        self.messages.lock().push_back(message);
        self.notify.notify_one();
    }
}

struct BrokerInner {
    /// Topic name to attached subscription names.
    topics: Mutex<HashMap<String, Vec<String>>>,
    subscriptions: Mutex<HashMap<String, Arc<SubscriptionQueue>>>,
    publish_failure: Mutex<Option<String>>,
    redelivery_delay: Duration,
    next_message_id: AtomicU64,
    stats: BrokerStats,
}

/// Shared handle to an in-memory broker. Clones share the same topics.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::with_redelivery_delay(Duration::from_millis(DEFAULT_REDELIVERY_DELAY_MS))
    }

    #[must_use]
    pub fn with_redelivery_delay(redelivery_delay: Duration) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                topics: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(HashMap::new()),
                publish_failure: Mutex::new(None),
                redelivery_delay,
                next_message_id: AtomicU64::new(1),
                stats: BrokerStats::default(),
            }),
        }
    }

    /// Create a topic. Creating an existing topic is a no-op.
    pub fn create_topic(&self, topic: &str) {
        self.inner
            .topics
            .lock()
            .entry(topic.to_string())
            .or_default();
    }

    /// Attach a new subscription to an existing topic.
    pub fn create_subscription(&self, subscription: &str, topic: &str) -> Result<(), TransportError> {
        let mut topics = self.inner.topics.lock();
        let attached = topics.get_mut(topic).ok_or_else(|| TransportError::NotFound {
            kind: "topic",
            name: topic.to_string(),
        })?;

        let mut subscriptions = self.inner.subscriptions.lock();
        if !subscriptions.contains_key(subscription) {
            subscriptions.insert(
                subscription.to_string(),
                Arc::new(SubscriptionQueue::new(subscription)),
            );
            attached.push(subscription.to_string());
            debug!(subscription, topic, "Created in-memory subscription");
        }
        Ok(())
    }

    /// Create a topic with a single subscription attached, the usual shape
    /// of one direction of a relay.
    pub fn create_channel(&self, topic: &str, subscription: &str) -> Result<(), TransportError> {
        self.create_topic(topic);
        self.create_subscription(subscription, topic)
    }

    /// Build a transport publishing to `topic` and receiving from `subscription`.
    #[must_use]
    pub fn transport(&self, topic: &str, subscription: &str) -> InMemoryTransport {
        InMemoryTransport {
            broker: self.clone(),
            topic: topic.to_string(),
            subscription: subscription.to_string(),
        }
    }

    /// Make every publish fail until cleared with `None`.
    pub fn set_publish_failure(&self, reason: Option<&str>) {
        *self.inner.publish_failure.lock() = reason.map(str::to_string);
    }

    /// Make the next receive on `subscription` fail with `reason`.
    pub fn fail_subscription(&self, subscription: &str, reason: &str) -> Result<(), TransportError> {
        let queue = self.queue(subscription)?;
        *queue.failure.lock() = Some(reason.to_string());
        queue.notify.notify_one();
        Ok(())
    }

    /// Messages currently waiting on a subscription (excluding delayed redeliveries).
    pub fn backlog(&self, subscription: &str) -> usize {
        self.queue(subscription)
            .map(|queue| queue.messages.lock().len())
            .unwrap_or(0)
    }

    #[must_use]
    pub fn stats(&self) -> &BrokerStats {
        &self.inner.stats
    }

    fn queue(&self, subscription: &str) -> Result<Arc<SubscriptionQueue>, TransportError> {
        self.inner
            .subscriptions
            .lock()
            .get(subscription)
            .cloned()
            .ok_or_else(|| TransportError::NotFound {
                kind: "subscription",
                name: subscription.to_string(),
            })
    }

    fn publish_to(&self, topic: &str, data: Vec<u8>) -> Result<PublishReceipt, TransportError> {
        if let Some(reason) = self.inner.publish_failure.lock().clone() {
            return Err(TransportError::Publish(reason));
        }

        let targets: Vec<Arc<SubscriptionQueue>> = {
            let topics = self.inner.topics.lock();
            let attached = topics.get(topic).ok_or_else(|| TransportError::NotFound {
                kind: "topic",
                name: topic.to_string(),
            })?;
            let subscriptions = self.inner.subscriptions.lock();
            attached
                .iter()
                .filter_map(|name| subscriptions.get(name).cloned())
                .collect()
        };

        let message_id = self
            .inner
            .next_message_id
            .fetch_add(1, Ordering::Relaxed)
            .to_string();
        self.inner.stats.published.fetch_add(1, Ordering::Relaxed);

        if targets.is_empty() {
            self.inner.stats.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(topic, message_id = %message_id, "No subscription attached, message dropped");
        }

        for queue in targets {
            queue.push(QueuedMessage {
                message_id: message_id.clone(),
                data: data.clone(),
                attempt: 1,
            });
        }

        Ok(PublishReceipt { message_id })
    }

    fn redeliver(&self, queue: Arc<SubscriptionQueue>, mut message: QueuedMessage) {
        message.attempt += 1;
        let delay = self.inner.redelivery_delay;
        if delay.is_zero() {
            queue.push(message);
            return;
        }
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.push(message);
        });
    }

    async fn receive(
        &self,
        subscription: &str,
        cancel: CancellationToken,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), TransportError> {
        let queue = self.queue(subscription)?;
        let stats = &self.inner.stats;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if let Some(reason) = queue.failure.lock().take() {
                warn!(subscription = %queue.name, reason = %reason, "Injected receive failure");
                return Err(TransportError::Receive(reason));
            }

            let next = queue.messages.lock().pop_front();
            let Some(message) = next else {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = queue.notify.notified() => {}
                }
                continue;
            };

            stats.delivered.fetch_add(1, Ordering::Relaxed);
            let delivery = Delivery {
                message_id: message.message_id.clone(),
                data: message.data.clone(),
                attempt: message.attempt,
            };

            match handler.handle(delivery) {
                AckDecision::Ack => {
                    stats.acked.fetch_add(1, Ordering::Relaxed);
                    trace!(subscription = %queue.name, message_id = %message.message_id, "Acked");
                }
                AckDecision::Nack => {
                    stats.nacked.fetch_add(1, Ordering::Relaxed);
                    trace!(
                        subscription = %queue.name,
                        message_id = %message.message_id,
                        attempt = message.attempt,
                        "Nacked, scheduling redelivery"
                    );
                    self.redeliver(queue.clone(), message);
                }
            }
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// One direction pair on an [`InMemoryBroker`].
#[derive(Clone)]
pub struct InMemoryTransport {
    broker: InMemoryBroker,
    topic: String,
    subscription: String,
}

impl InMemoryTransport {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, payload: Vec<u8>) -> Result<PublishReceipt, TransportError> {
        self.broker.publish_to(&self.topic, payload)
    }

    async fn subscribe(
        &self,
        cancel: CancellationToken,
        handler: Arc<dyn DeliveryHandler>,
    ) -> Result<(), TransportError> {
        self.broker.receive(&self.subscription, cancel, handler).await
    }
}
