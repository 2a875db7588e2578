//! In-process broadcast broker.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{trace, warn};

use lantern_core::error::{BrokerError, BrokerResult};
use lantern_core::models::Topic;
use lantern_core::ports::{Broker, BrokerMessage, BrokerSubscription};

/// Messages buffered per topic before slow subscribers start lagging.
pub const DEFAULT_TOPIC_CAPACITY: usize = 1024;

/// Broker backed by one `tokio::sync::broadcast` channel per topic.
///
/// Publishing with no live subscriber drops the payload.
pub struct MemoryBroker {
    channels: HashMap<Topic, broadcast::Sender<String>>,
}

impl MemoryBroker {
    pub fn new(capacity: usize) -> Self {
        let channels = Topic::ALL
            .into_iter()
            .map(|topic| (topic, broadcast::channel(capacity.max(1)).0))
            .collect();
        Self { channels }
    }

    fn channel(&self, topic: Topic) -> BrokerResult<&broadcast::Sender<String>> {
        self.channels.get(&topic).ok_or(BrokerError::Closed)
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_TOPIC_CAPACITY)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: Topic, payload: String) -> BrokerResult<()> {
        let receivers = self.channel(topic)?.send(payload).unwrap_or(0);
        trace!(topic = %topic, receivers, "Published");
        Ok(())
    }

    async fn subscribe(&self, topic: Topic) -> BrokerResult<Box<dyn BrokerSubscription>> {
        let rx = self.channel(topic)?.subscribe();
        Ok(Box::new(MemorySubscription {
            topic,
            rx: Some(rx),
            confirmed: false,
        }))
    }
}

struct MemorySubscription {
    topic: Topic,
    rx: Option<broadcast::Receiver<String>>,
    confirmed: bool,
}

#[async_trait]
impl BrokerSubscription for MemorySubscription {
    async fn receive_timeout(&mut self, timeout: Duration) -> BrokerResult<Option<BrokerMessage>> {
        if !self.confirmed {
            self.confirmed = true;
            return Ok(Some(BrokerMessage::Subscribed(self.topic)));
        }

        let topic = self.topic;
        let Some(rx) = self.rx.as_mut() else {
            return Err(BrokerError::Closed);
        };

        let received = tokio::time::timeout(timeout, async {
            loop {
                match rx.recv().await {
                    Ok(payload) => return Ok(payload),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(topic = %topic, skipped = n, "Subscriber lagged, payloads dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(BrokerError::Closed),
                }
            }
        })
        .await;

        match received {
            Ok(Ok(payload)) => Ok(Some(BrokerMessage::Payload { topic, payload })),
            Ok(Err(e)) => Err(e),
            Err(_) => Ok(None),
        }
    }

    async fn unsubscribe(&mut self) -> BrokerResult<()> {
        self.rx = None;
        Ok(())
    }
}
