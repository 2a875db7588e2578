//! Broker topic consumer.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::manager::SharedRegistry;
use super::{ConsumerConfig, Filter, SubscriptionResponse};
use crate::error::BrokerError;
use crate::metrics;
use crate::models::{Block, Event, Topic, Transaction};
use crate::ports::{Broker, BrokerMessage, ClientConnection};

/// A record published on one broker topic.
pub trait TopicRecord: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TOPIC: Topic;

    /// Whether a subscription filter selects this record.
    fn matched_by(&self, filter: &Filter) -> bool;
}

impl TopicRecord for Block {
    const TOPIC: Topic = Topic::Block;

    fn matched_by(&self, filter: &Filter) -> bool {
        filter.matches_block(self)
    }
}

impl TopicRecord for Transaction {
    const TOPIC: Topic = Topic::Transaction;

    fn matched_by(&self, filter: &Filter) -> bool {
        filter.matches_transaction(self)
    }
}

impl TopicRecord for Event {
    const TOPIC: Topic = Topic::Event;

    fn matched_by(&self, filter: &Filter) -> bool {
        filter.matches_event(self)
    }
}

/// Owner side of a running consumer, kept in the registry.
///
/// Dropping the handle also stops the consumer.
#[derive(Debug)]
pub(crate) struct ConsumerHandle {
    id: u64,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Stop the consumer and wait for its broker teardown and final
    /// acknowledgement.
    pub(crate) async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!(consumer = self.id, error = %e, "Topic consumer task failed");
        }
    }
}

/// Forwards one broker topic to one client connection.
///
/// The consumer opens its own broker subscription and acknowledges the
/// subscriber that created it once the broker confirms. Payloads are decoded
/// into `R`; a record is written to the connection once if any registered
/// pattern of the topic matches it.
pub struct TopicConsumer<R> {
    id: u64,
    broker: Arc<dyn Broker>,
    connection: Arc<dyn ClientConnection>,
    registry: SharedRegistry,
    config: ConsumerConfig,
    shutdown: watch::Receiver<bool>,
    _record: PhantomData<fn() -> R>,
}

impl<R: TopicRecord> TopicConsumer<R> {
    pub(crate) fn new(
        id: u64,
        broker: Arc<dyn Broker>,
        connection: Arc<dyn ClientConnection>,
        registry: SharedRegistry,
        config: ConsumerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            broker,
            connection,
            registry,
            config,
            shutdown,
            _record: PhantomData,
        }
    }

    pub(crate) fn spawn(self) -> ConsumerHandle {
        let (stop_tx, stop_rx) = oneshot::channel();
        let id = self.id;
        let task = tokio::spawn(self.run(stop_rx));
        ConsumerHandle {
            id,
            stop: Some(stop_tx),
            task,
        }
    }

    async fn run(self, mut stop: oneshot::Receiver<()>) {
        let topic = R::TOPIC;
        let connection = self.connection.id();

        let mut subscription = match self.broker.subscribe(topic).await {
            Ok(subscription) => subscription,
            Err(e) => {
                warn!(topic = %topic, connection, error = %e, "Failed to subscribe to broker topic");
                // Subscribers that joined while the broker call was pending
                // were already acknowledged; every one of them is rejected.
                for name in self.release() {
                    self.send(&SubscriptionResponse::error(format!(
                        "Failed to subscribe {name} to {topic} topic"
                    )))
                    .await;
                }
                return;
            }
        };

        metrics::record_consumer_started();
        debug!(topic = %topic, connection, consumer = self.id, "Topic consumer started");

        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = &mut stop => break,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                received = subscription.receive_timeout(self.config.poll_timeout) => match received {
                    Ok(None) => {}
                    Ok(Some(BrokerMessage::Subscribed(_))) => {
                        self.send(&SubscriptionResponse::subscribed(topic)).await;
                    }
                    Ok(Some(BrokerMessage::Unsubscribed(_))) => {
                        self.release();
                        break;
                    }
                    Ok(Some(BrokerMessage::Payload { payload, .. })) => {
                        self.deliver(&payload).await;
                    }
                    Err(BrokerError::Closed) => {
                        warn!(topic = %topic, connection, "Broker subscription closed");
                        self.release();
                        break;
                    }
                    Err(e) => {
                        debug!(topic = %topic, error = %e, "Broker receive failed");
                    }
                },
            }
        }

        if let Err(e) = subscription.unsubscribe().await {
            warn!(topic = %topic, connection, error = %e, "Failed to unsubscribe from broker topic");
        }
        self.send(&SubscriptionResponse::unsubscribed(topic)).await;

        metrics::record_consumer_stopped();
        debug!(topic = %topic, connection, consumer = self.id, "Topic consumer stopped");
    }

    async fn deliver(&self, payload: &str) {
        let record: R = match serde_json::from_str(payload) {
            Ok(record) => record,
            Err(e) => {
                warn!(topic = %R::TOPIC, error = %e, "Dropping undecodable broker payload");
                metrics::record_decode_error(R::TOPIC.as_str());
                return;
            }
        };

        if !self.is_wanted(&record) {
            return;
        }

        let message = match serde_json::to_value(&record) {
            Ok(message) => message,
            Err(e) => {
                warn!(topic = %R::TOPIC, error = %e, "Failed to encode record");
                return;
            }
        };

        match self.connection.send_json(&message).await {
            Ok(()) => metrics::record_delivered(R::TOPIC.as_str()),
            Err(e) => {
                warn!(
                    topic = %R::TOPIC,
                    connection = self.connection.id(),
                    error = %e,
                    "Failed to send record to client"
                );
                metrics::record_send_failure();
            }
        }
    }

    fn is_wanted(&self, record: &R) -> bool {
        let registry = self.registry.read();
        registry
            .subscribers
            .get(&R::TOPIC)
            .is_some_and(|subscribers| subscribers.values().any(|s| record.matched_by(&s.filter)))
    }

    async fn send(&self, response: &SubscriptionResponse) {
        if let Err(e) = self.connection.send_json(&response.to_json()).await {
            warn!(
                connection = self.connection.id(),
                error = %e,
                msg = %response.msg,
                "Failed to send subscription status"
            );
            metrics::record_send_failure();
        }
    }

    /// Drop this consumer's topic from the registry, unless a newer consumer
    /// already replaced it. Returns the names of the dropped subscribers.
    fn release(&self) -> Vec<String> {
        let mut registry = self.registry.write();
        if !registry
            .consumers
            .get(&R::TOPIC)
            .is_some_and(|handle| handle.id == self.id)
        {
            return Vec::new();
        }
        registry.consumers.remove(&R::TOPIC);
        let mut names: Vec<String> = registry
            .subscribers
            .remove(&R::TOPIC)
            .map(|subscribers| subscribers.into_keys().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::manager::TopicRegistry;
    use crate::pubsub::testing::{RecordingBroker, RecordingConnection, assert_silent, next_message};
    use crate::pubsub::{Subscription, parse_pattern};

    fn registry_with(pattern: &str) -> SharedRegistry {
        let (topic, filter) = parse_pattern(pattern).unwrap();
        let mut registry = TopicRegistry::default();
        registry.subscribers.entry(topic).or_default().insert(
            pattern.to_string(),
            Subscription {
                name: pattern.to_string(),
                topic,
                filter,
            },
        );
        Arc::new(parking_lot::RwLock::new(registry))
    }

    fn sample_event(origin: &str) -> Event {
        Event {
            origin: origin.to_string(),
            index: 0,
            topics: vec![],
            data: vec![0xab],
            transaction_hash: "0x01".into(),
            block_hash: "0x02".into(),
            block_number: 9,
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let broker = Arc::new(RecordingBroker::default());
        let (conn, mut rx) = RecordingConnection::new(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let consumer = TopicConsumer::<Event>::new(
            1,
            broker.clone(),
            conn,
            registry_with("event/*"),
            ConsumerConfig::default(),
            shutdown_rx,
        );
        let handle = consumer.spawn();

        assert_eq!(next_message(&mut rx).await["msg"], "Subscribed to event topic");

        broker
            .publish(Topic::Event, "{not json".into())
            .await
            .unwrap();
        let event = sample_event(&format!("0x{}", "aa".repeat(20)));
        broker
            .publish(Topic::Event, serde_json::to_string(&event).unwrap())
            .await
            .unwrap();

        let delivered = next_message(&mut rx).await;
        assert_eq!(delivered["data"], "0xab");
        assert_eq!(delivered["blockNumber"], 9);

        handle.stop().await;
        assert_eq!(next_message(&mut rx).await["msg"], "Unsubscribed from event topic");
        assert_eq!(broker.unsubscribe_count(), 1);
    }

    #[tokio::test]
    async fn test_unmatched_records_are_not_sent() {
        let broker = Arc::new(RecordingBroker::default());
        let (conn, mut rx) = RecordingConnection::new(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let origin = format!("0x{}", "aa".repeat(20));

        let handle = TopicConsumer::<Event>::new(
            1,
            broker.clone(),
            conn,
            registry_with(&format!("event/{origin}")),
            ConsumerConfig::default(),
            shutdown_rx,
        )
        .spawn();
        next_message(&mut rx).await;

        let other = sample_event(&format!("0x{}", "bb".repeat(20)));
        broker
            .publish(Topic::Event, serde_json::to_string(&other).unwrap())
            .await
            .unwrap();
        assert_silent(&mut rx).await;

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_consumer() {
        let broker = Arc::new(RecordingBroker::default());
        let (conn, mut rx) = RecordingConnection::new(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = TopicConsumer::<Block>::new(
            1,
            broker.clone(),
            conn,
            registry_with("block"),
            ConsumerConfig::default(),
            shutdown_rx,
        )
        .spawn();
        next_message(&mut rx).await;

        shutdown_tx.send(true).unwrap();
        // Best-effort notification still reaches the client.
        assert_eq!(next_message(&mut rx).await["msg"], "Unsubscribed from block topic");
        handle.stop().await;
        assert_eq!(broker.unsubscribe_count(), 1);
    }
}
