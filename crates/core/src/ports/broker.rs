//! Port traits for the message broker.
//!
//! The broker offers topic publish and topic subscribe with at-least-once,
//! possibly lossy delivery. A subscription yields confirmation events and
//! payloads on one inbound stream.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::BrokerResult;
use crate::models::Topic;

/// Inbound item on a broker subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerMessage {
    /// The broker confirmed the subscription.
    Subscribed(Topic),
    /// The broker confirmed an unsubscribe; no more payloads follow.
    Unsubscribed(Topic),
    /// A published payload (JSON wire form of the topic's record).
    Payload { topic: Topic, payload: String },
}

/// Publish/subscribe broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a payload. Fire-and-forget: success only means the broker
    /// accepted it.
    async fn publish(&self, topic: Topic, payload: String) -> BrokerResult<()>;

    /// Open a subscription to a topic.
    async fn subscribe(&self, topic: Topic) -> BrokerResult<Box<dyn BrokerSubscription>>;
}

/// A live broker subscription owned by one consumer loop.
#[async_trait]
pub trait BrokerSubscription: Send {
    /// Wait up to `timeout` for the next inbound item.
    ///
    /// Returns `Ok(None)` when the timeout elapses without a message.
    async fn receive_timeout(&mut self, timeout: Duration) -> BrokerResult<Option<BrokerMessage>>;

    /// Stop receiving payloads for this subscription.
    async fn unsubscribe(&mut self) -> BrokerResult<()>;
}
