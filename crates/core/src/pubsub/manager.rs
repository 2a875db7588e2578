//! Per-connection subscription manager.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::consumer::{ConsumerHandle, TopicConsumer};
use super::{ConsumerConfig, Subscription, SubscriptionRequest, SubscriptionResponse};
use crate::error::SubscriptionError;
use crate::metrics;
use crate::models::{Block, Event, Topic, Transaction};
use crate::ports::{Broker, ClientConnection, ConnectionId};

/// Subscribers and consumers of one connection.
///
/// A topic has an entry in `subscribers` exactly when it has one in
/// `consumers`.
#[derive(Debug, Default)]
pub(crate) struct TopicRegistry {
    pub(crate) subscribers: HashMap<Topic, HashMap<String, Subscription>>,
    pub(crate) consumers: HashMap<Topic, ConsumerHandle>,
}

pub(crate) type SharedRegistry = Arc<RwLock<TopicRegistry>>;

/// Reference-counts broker subscriptions for one client connection.
///
/// The first subscriber of a topic starts a [`TopicConsumer`]; removing the
/// last one tears it down. The registry lock is never held across an await.
pub struct SubscriptionManager {
    connection: Arc<dyn ClientConnection>,
    broker: Arc<dyn Broker>,
    registry: SharedRegistry,
    config: ConsumerConfig,
    shutdown: watch::Receiver<bool>,
    next_consumer_id: AtomicU64,
}

impl SubscriptionManager {
    pub fn new(
        connection: Arc<dyn ClientConnection>,
        broker: Arc<dyn Broker>,
        config: ConsumerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            connection,
            broker,
            registry: Arc::new(RwLock::new(TopicRegistry::default())),
            config,
            shutdown,
            next_consumer_id: AtomicU64::new(0),
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection.id()
    }

    /// Register a subscriber, replacing any previous one with the same name.
    ///
    /// Invalid requests are rejected before touching the registry.
    pub async fn subscribe(&self, request: &SubscriptionRequest) -> Result<(), SubscriptionError> {
        let subscription = request.parse()?;
        let topic = subscription.topic;

        let started = {
            let mut registry = self.registry.write();
            let started = !registry.subscribers.contains_key(&topic);
            registry
                .subscribers
                .entry(topic)
                .or_default()
                .insert(subscription.name.clone(), subscription);
            if started {
                let consumer = self.spawn_consumer(topic);
                registry.consumers.insert(topic, consumer);
            }
            started
        };

        debug!(
            connection = self.connection.id(),
            topic = %topic,
            name = %request.name,
            started,
            "Subscribed"
        );

        // A new consumer acknowledges once the broker confirms.
        if !started {
            self.send(&SubscriptionResponse::subscribed(topic)).await;
        }
        Ok(())
    }

    /// Remove a subscriber. Returns `false` when the topic or name is not
    /// registered.
    pub async fn unsubscribe(&self, request: &SubscriptionRequest) -> bool {
        let Some(topic) = request.topic() else {
            return false;
        };

        let last = {
            let mut registry = self.registry.write();
            let Some(subscribers) = registry.subscribers.get_mut(&topic) else {
                return false;
            };
            if subscribers.remove(&request.name).is_none() {
                return false;
            }
            if subscribers.is_empty() {
                registry.subscribers.remove(&topic);
                Some(registry.consumers.remove(&topic))
            } else {
                None
            }
        };

        debug!(
            connection = self.connection.id(),
            topic = %topic,
            name = %request.name,
            "Unsubscribed"
        );

        match last {
            // The consumer sends the final acknowledgement.
            Some(Some(consumer)) => consumer.stop().await,
            Some(None) => {
                warn!(topic = %topic, "Topic had subscribers but no consumer");
                self.send(&SubscriptionResponse::unsubscribed(topic)).await;
            }
            None => self.send(&SubscriptionResponse::unsubscribed(topic)).await,
        }
        true
    }

    /// Tear down every topic of this connection. Returns the number of
    /// consumers stopped.
    pub async fn unsubscribe_all(&self) -> usize {
        let consumers: Vec<ConsumerHandle> = {
            let mut registry = self.registry.write();
            registry.subscribers.clear();
            registry.consumers.drain().map(|(_, consumer)| consumer).collect()
        };

        let count = consumers.len();
        for consumer in consumers {
            consumer.stop().await;
        }
        count
    }

    /// Topics with at least one subscriber.
    pub fn topics(&self) -> Vec<Topic> {
        let mut topics: Vec<Topic> = self.registry.read().subscribers.keys().copied().collect();
        topics.sort();
        topics
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.registry
            .read()
            .subscribers
            .get(&topic)
            .map_or(0, HashMap::len)
    }

    fn spawn_consumer(&self, topic: Topic) -> ConsumerHandle {
        let id = self.next_consumer_id.fetch_add(1, Ordering::Relaxed);
        let broker = Arc::clone(&self.broker);
        let connection = Arc::clone(&self.connection);
        let registry = Arc::clone(&self.registry);
        let config = self.config.clone();
        let shutdown = self.shutdown.clone();

        match topic {
            Topic::Block => {
                TopicConsumer::<Block>::new(id, broker, connection, registry, config, shutdown)
                    .spawn()
            }
            Topic::Transaction => TopicConsumer::<Transaction>::new(
                id, broker, connection, registry, config, shutdown,
            )
            .spawn(),
            Topic::Event => {
                TopicConsumer::<Event>::new(id, broker, connection, registry, config, shutdown)
                    .spawn()
            }
        }
    }

    async fn send(&self, response: &SubscriptionResponse) {
        if let Err(e) = self.connection.send_json(&response.to_json()).await {
            warn!(
                connection = self.connection.id(),
                error = %e,
                "Failed to send subscription status"
            );
            metrics::record_send_failure();
        }
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        // Consumers hold the registry; dropping their handles is what stops
        // them.
        let mut registry = self.registry.write();
        registry.subscribers.clear();
        registry.consumers.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::pubsub::testing::{RecordingBroker, RecordingConnection, assert_silent, next_message};

    fn manager(
        broker: &Arc<RecordingBroker>,
        connection: Arc<RecordingConnection>,
    ) -> (SubscriptionManager, watch::Sender<bool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let manager = SubscriptionManager::new(
            connection,
            broker.clone(),
            ConsumerConfig::default(),
            shutdown_rx,
        );
        (manager, shutdown_tx)
    }

    fn transaction(from: &str, to: &str) -> Transaction {
        Transaction {
            hash: format!("0x{}", "01".repeat(32)),
            from: from.into(),
            to: to.into(),
            contract_address: String::new(),
            value: "10".into(),
            data: vec![],
            gas: 21_000,
            gas_price: "1".into(),
            cost: "21000".into(),
            nonce: 1,
            state: 1,
            block_hash: format!("0x{}", "02".repeat(32)),
            block_number: 100,
            timestamp: 1_700_000_000,
        }
    }

    async fn publish(broker: &RecordingBroker, tx: &Transaction) {
        broker
            .publish(Topic::Transaction, serde_json::to_string(tx).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_second_subscriber_acked_by_manager() {
        let broker = Arc::new(RecordingBroker::default());
        let (conn, mut rx) = RecordingConnection::new(7);
        let (manager, _shutdown) = manager(&broker, conn);

        manager
            .subscribe(&SubscriptionRequest::new("block", "block"))
            .await
            .unwrap();
        assert_eq!(next_message(&mut rx).await["msg"], "Subscribed to block topic");

        manager
            .subscribe(&SubscriptionRequest::new("transaction/*", "transaction"))
            .await
            .unwrap();
        assert_eq!(next_message(&mut rx).await["msg"], "Subscribed to transaction topic");

        manager
            .subscribe(&SubscriptionRequest::new(
                format!("transaction/0x{}", "ab".repeat(20)),
                "transaction",
            ))
            .await
            .unwrap();
        assert_eq!(next_message(&mut rx).await["code"], 1);

        assert_eq!(broker.subscribe_count(), 2);
        assert_eq!(manager.topics(), vec![Topic::Block, Topic::Transaction]);
        assert_eq!(manager.subscriber_count(Topic::Transaction), 2);
    }

    #[tokio::test]
    async fn test_transaction_from_filter_scenario() {
        let broker = Arc::new(RecordingBroker::default());
        let (conn, mut rx) = RecordingConnection::new(1);
        let (manager, _shutdown) = manager(&broker, conn);

        let dead = format!("0x{}", "DEAD".repeat(10));
        manager
            .subscribe(&SubscriptionRequest::new(
                format!("transaction/{dead}/*"),
                "transaction",
            ))
            .await
            .unwrap();
        next_message(&mut rx).await;

        let matching = transaction(&dead.to_lowercase(), &format!("0x{}", "11".repeat(20)));
        publish(&broker, &matching).await;
        let delivered = next_message(&mut rx).await;
        assert_eq!(delivered["hash"], matching.hash);

        publish(&broker, &transaction(&format!("0x{}", "be".repeat(20)), "")).await;
        assert_silent(&mut rx).await;
    }

    #[tokio::test]
    async fn test_overlapping_patterns_deliver_once() {
        let broker = Arc::new(RecordingBroker::default());
        let (conn, mut rx) = RecordingConnection::new(1);
        let (manager, _shutdown) = manager(&broker, conn);

        let from = format!("0x{}", "aa".repeat(20));
        manager
            .subscribe(&SubscriptionRequest::new("transaction", "transaction"))
            .await
            .unwrap();
        next_message(&mut rx).await;
        manager
            .subscribe(&SubscriptionRequest::new(format!("transaction/{from}"), "transaction"))
            .await
            .unwrap();
        next_message(&mut rx).await;

        publish(&broker, &transaction(&from, "")).await;
        next_message(&mut rx).await;
        assert_silent(&mut rx).await;
    }

    #[tokio::test]
    async fn test_resubscribe_creates_fresh_consumer() {
        let broker = Arc::new(RecordingBroker::default());
        let (conn, mut rx) = RecordingConnection::new(1);
        let (manager, _shutdown) = manager(&broker, conn);
        let request = SubscriptionRequest::new("event/*", "event");

        manager.subscribe(&request).await.unwrap();
        assert_eq!(next_message(&mut rx).await["msg"], "Subscribed to event topic");

        assert!(manager.unsubscribe(&request).await);
        assert_eq!(next_message(&mut rx).await["msg"], "Unsubscribed from event topic");
        assert!(manager.topics().is_empty());
        assert!(manager.registry.read().consumers.is_empty());
        assert_eq!(broker.unsubscribe_count(), 1);

        manager.subscribe(&request).await.unwrap();
        assert_eq!(next_message(&mut rx).await["msg"], "Subscribed to event topic");
        assert_eq!(broker.subscribe_count(), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_keeps_consumer_while_subscribers_remain() {
        let broker = Arc::new(RecordingBroker::default());
        let (conn, mut rx) = RecordingConnection::new(1);
        let (manager, _shutdown) = manager(&broker, conn);

        manager
            .subscribe(&SubscriptionRequest::new("event", "event"))
            .await
            .unwrap();
        next_message(&mut rx).await;
        manager
            .subscribe(&SubscriptionRequest::new("event/*", "event"))
            .await
            .unwrap();
        next_message(&mut rx).await;

        assert!(manager.unsubscribe(&SubscriptionRequest::new("event", "event")).await);
        assert_eq!(next_message(&mut rx).await["msg"], "Unsubscribed from event topic");
        assert_eq!(manager.topics(), vec![Topic::Event]);
        assert_eq!(broker.unsubscribe_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_unsubscribe_is_silent() {
        let broker = Arc::new(RecordingBroker::default());
        let (conn, mut rx) = RecordingConnection::new(1);
        let (manager, _shutdown) = manager(&broker, conn);

        assert!(!manager.unsubscribe(&SubscriptionRequest::new("block", "block")).await);
        assert!(!manager.unsubscribe(&SubscriptionRequest::new("x", "receipt")).await);

        manager
            .subscribe(&SubscriptionRequest::new("block", "block"))
            .await
            .unwrap();
        next_message(&mut rx).await;
        assert!(!manager.unsubscribe(&SubscriptionRequest::new("other", "block")).await);
        assert_silent(&mut rx).await;
    }

    #[tokio::test]
    async fn test_invalid_request_leaves_registry_untouched() {
        let broker = Arc::new(RecordingBroker::default());
        let (conn, mut rx) = RecordingConnection::new(1);
        let (manager, _shutdown) = manager(&broker, conn);

        let err = manager
            .subscribe(&SubscriptionRequest::new("event/0x12", "event"))
            .await
            .unwrap_err();
        assert!(matches!(err, SubscriptionError::InvalidPattern(_)));
        assert!(manager.topics().is_empty());
        assert_eq!(broker.subscribe_count(), 0);
        assert_silent(&mut rx).await;
    }

    #[tokio::test]
    async fn test_send_failure_keeps_subscription() {
        let broker = Arc::new(RecordingBroker::default());
        let (conn, mut rx) = RecordingConnection::new(1);
        let (manager, _shutdown) = manager(&broker, conn.clone());

        manager
            .subscribe(&SubscriptionRequest::new("transaction", "transaction"))
            .await
            .unwrap();
        next_message(&mut rx).await;

        conn.broken.store(true, Ordering::SeqCst);
        publish(&broker, &transaction(&format!("0x{}", "aa".repeat(20)), "")).await;
        assert_silent(&mut rx).await;
        assert_eq!(manager.subscriber_count(Topic::Transaction), 1);

        conn.broken.store(false, Ordering::SeqCst);
        publish(&broker, &transaction(&format!("0x{}", "aa".repeat(20)), "")).await;
        assert_eq!(next_message(&mut rx).await["blockNumber"], 100);
    }

    #[tokio::test]
    async fn test_failed_broker_subscribe_releases_topic() {
        let broker = Arc::new(RecordingBroker::default());
        broker.refuse_subscribe.store(true, Ordering::SeqCst);
        let (conn, mut rx) = RecordingConnection::new(1);
        let (manager, _shutdown) = manager(&broker, conn);

        manager
            .subscribe(&SubscriptionRequest::new("block", "block"))
            .await
            .unwrap();
        let reply = next_message(&mut rx).await;
        assert_eq!(reply["code"], 0);
        assert!(manager.topics().is_empty());

        broker.refuse_subscribe.store(false, Ordering::SeqCst);
        manager
            .subscribe(&SubscriptionRequest::new("block", "block"))
            .await
            .unwrap();
        assert_eq!(next_message(&mut rx).await["msg"], "Subscribed to block topic");
    }

    #[tokio::test]
    async fn test_failed_broker_subscribe_rejects_acknowledged_subscribers() {
        let broker = Arc::new(RecordingBroker::default());
        broker.refuse_subscribe.store(true, Ordering::SeqCst);
        *broker.subscribe_delay.lock() = Some(Duration::from_millis(100));
        let (conn, mut rx) = RecordingConnection::new(1);
        let (manager, _shutdown) = manager(&broker, conn);

        manager
            .subscribe(&SubscriptionRequest::new("event", "event"))
            .await
            .unwrap();
        // Joins while the consumer is still waiting on the broker.
        manager
            .subscribe(&SubscriptionRequest::new("event/*", "event"))
            .await
            .unwrap();
        assert_eq!(next_message(&mut rx).await["code"], 1);

        let mut rejected = Vec::new();
        for _ in 0..2 {
            let reply = next_message(&mut rx).await;
            assert_eq!(reply["code"], 0);
            rejected.push(reply["msg"].as_str().unwrap().to_string());
        }
        assert_eq!(
            rejected,
            vec![
                "Failed to subscribe event to event topic",
                "Failed to subscribe event/* to event topic",
            ]
        );
        assert!(manager.topics().is_empty());
        assert_silent(&mut rx).await;
    }

    #[tokio::test]
    async fn test_unsubscribe_all_stops_every_consumer() {
        let broker = Arc::new(RecordingBroker::default());
        let (conn, mut rx) = RecordingConnection::new(1);
        let (manager, _shutdown) = manager(&broker, conn);

        for (name, class) in [("block", "block"), ("event", "event")] {
            manager
                .subscribe(&SubscriptionRequest::new(name, class))
                .await
                .unwrap();
            next_message(&mut rx).await;
        }

        assert_eq!(manager.unsubscribe_all().await, 2);
        assert!(manager.topics().is_empty());
        assert_eq!(broker.unsubscribe_count(), 2);
    }
}
