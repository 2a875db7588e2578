//! Subscription engine.
//!
//! Clients register patterns ([`SubscriptionRequest`]) on a per-connection
//! [`SubscriptionManager`]. The manager keeps one broker subscription per topic
//! class that has at least one live subscriber, each drained by a
//! [`TopicConsumer`] that decodes broker payloads and forwards the records
//! matching any of the connection's patterns.

mod consumer;
mod manager;
mod pattern;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::models::Topic;

pub use consumer::{TopicConsumer, TopicRecord};
pub use manager::SubscriptionManager;
pub use pattern::{
    ADDRESS_HEX_LEN, FieldFilter, Filter, LOG_TOPIC_HEX_LEN, MAX_EVENT_TOPICS, Subscription,
    SubscriptionRequest, parse_pattern,
};

/// Default broker poll timeout of a topic consumer.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Topic consumer configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Upper bound on a single broker receive. Only a wake-up interval; it
    /// has no effect on what gets delivered.
    pub poll_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

/// Status message pushed to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionResponse {
    pub code: u8,
    pub msg: String,
}

impl SubscriptionResponse {
    pub const CODE_ERROR: u8 = 0;
    pub const CODE_OK: u8 = 1;

    pub fn subscribed(topic: Topic) -> Self {
        Self {
            code: Self::CODE_OK,
            msg: format!("Subscribed to {topic} topic"),
        }
    }

    pub fn unsubscribed(topic: Topic) -> Self {
        Self {
            code: Self::CODE_OK,
            msg: format!("Unsubscribed from {topic} topic"),
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            code: Self::CODE_ERROR,
            msg: msg.into(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({ "code": self.code, "msg": self.msg })
    }
}
