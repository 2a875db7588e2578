//! PostgreSQL `LISTEN`/`NOTIFY` broker.
//!
//! Payloads that fit a notification travel inline. Larger ones are written
//! to the `broker_payloads` table (created by the storage migrations) and the
//! notification only carries `spill:<id>`; listeners load the row on receipt.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgListener;
use tracing::{debug, instrument, trace, warn};

use lantern_core::error::{BrokerError, BrokerResult};
use lantern_core::models::Topic;
use lantern_core::ports::{Broker, BrokerMessage, BrokerSubscription};

/// Prefix of the notification channel names (`lantern_block`, ...).
pub const DEFAULT_CHANNEL_PREFIX: &str = "lantern_";

/// PostgreSQL rejects notification payloads of 8000 bytes or more.
pub const MAX_NOTIFY_PAYLOAD: usize = 7999;

/// Spilled payloads older than this are pruned on the next spill.
pub const DEFAULT_SPILL_RETENTION: Duration = Duration::from_secs(3600);

const SPILL_PREFIX: &str = "spill:";

/// Broker publishing through `pg_notify` and subscribing with one dedicated
/// listener connection per subscription.
#[derive(Clone)]
pub struct PgBroker {
    pool: PgPool,
    prefix: String,
    spill_retention: Duration,
}

impl PgBroker {
    pub fn new(pool: PgPool) -> Self {
        Self::with_prefix(pool, DEFAULT_CHANNEL_PREFIX)
    }

    pub fn with_prefix(pool: PgPool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
            spill_retention: DEFAULT_SPILL_RETENTION,
        }
    }

    fn channel(&self, topic: Topic) -> String {
        channel_name(&self.prefix, topic)
    }

    /// Store an oversized payload and notify its row id. The notification is
    /// sent on commit, so listeners always find the row.
    async fn publish_spilled(&self, topic: Topic, payload: &str) -> BrokerResult<()> {
        let failed = |e: sqlx::Error| BrokerError::PublishFailed {
            topic: topic.to_string(),
            message: e.to_string(),
        };

        let mut tx = self.pool.begin().await.map_err(failed)?;

        sqlx::query(
            "DELETE FROM broker_payloads WHERE created_at < NOW() - make_interval(secs => $1)",
        )
        .bind(self.spill_retention.as_secs_f64())
        .execute(&mut *tx)
        .await
        .map_err(failed)?;

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO broker_payloads (topic, payload) VALUES ($1, $2) RETURNING id",
        )
        .bind(topic.as_str())
        .bind(payload)
        .fetch_one(&mut *tx)
        .await
        .map_err(failed)?;

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(self.channel(topic))
            .bind(spill_reference(id))
            .execute(&mut *tx)
            .await
            .map_err(failed)?;

        tx.commit().await.map_err(failed)?;
        trace!(topic = %topic, id, bytes = payload.len(), "Spilled oversized payload");
        Ok(())
    }
}

fn channel_name(prefix: &str, topic: Topic) -> String {
    format!("{prefix}{topic}")
}

fn needs_spill(payload: &str) -> bool {
    payload.len() > MAX_NOTIFY_PAYLOAD
}

fn spill_reference(id: i64) -> String {
    format!("{SPILL_PREFIX}{id}")
}

/// What a notification carries. Records are JSON objects, so an inline
/// payload never starts with the spill prefix.
#[derive(Debug, PartialEq, Eq)]
enum Notice<'a> {
    Inline(&'a str),
    Spilled(i64),
}

fn parse_notice(payload: &str) -> Notice<'_> {
    match payload
        .strip_prefix(SPILL_PREFIX)
        .and_then(|id| id.parse().ok())
    {
        Some(id) => Notice::Spilled(id),
        None => Notice::Inline(payload),
    }
}

#[async_trait]
impl Broker for PgBroker {
    async fn publish(&self, topic: Topic, payload: String) -> BrokerResult<()> {
        if needs_spill(&payload) {
            return self.publish_spilled(topic, &payload).await;
        }

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(self.channel(topic))
            .bind(&payload)
            .execute(&self.pool)
            .await
            .map_err(|e| BrokerError::PublishFailed {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;

        Ok(())
    }

    #[instrument(skip(self), fields(topic = %topic))]
    async fn subscribe(&self, topic: Topic) -> BrokerResult<Box<dyn BrokerSubscription>> {
        let channel = self.channel(topic);
        let failed = |e: sqlx::Error| BrokerError::SubscriptionFailed {
            topic: topic.to_string(),
            message: e.to_string(),
        };

        let mut listener = PgListener::connect_with(&self.pool).await.map_err(failed)?;
        listener.listen(&channel).await.map_err(failed)?;
        debug!(channel = %channel, "Listening");

        Ok(Box::new(PgSubscription {
            topic,
            channel,
            pool: self.pool.clone(),
            listener,
            confirmed: false,
            closed: false,
        }))
    }
}

struct PgSubscription {
    topic: Topic,
    channel: String,
    pool: PgPool,
    listener: PgListener,
    confirmed: bool,
    closed: bool,
}

impl PgSubscription {
    async fn load_spilled(&self, id: i64) -> BrokerResult<Option<String>> {
        let payload: Option<String> =
            sqlx::query_scalar("SELECT payload FROM broker_payloads WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| BrokerError::ConnectionError(e.to_string()))?;

        if payload.is_none() {
            warn!(topic = %self.topic, id, "Spilled payload already pruned");
        }
        Ok(payload)
    }
}

#[async_trait]
impl BrokerSubscription for PgSubscription {
    async fn receive_timeout(&mut self, timeout: Duration) -> BrokerResult<Option<BrokerMessage>> {
        if self.closed {
            return Err(BrokerError::Closed);
        }
        // LISTEN already succeeded in `subscribe`
        if !self.confirmed {
            self.confirmed = true;
            return Ok(Some(BrokerMessage::Subscribed(self.topic)));
        }

        let notification = match tokio::time::timeout(timeout, self.listener.recv()).await {
            Ok(Ok(notification)) => notification,
            Ok(Err(e)) => return Err(BrokerError::ConnectionError(e.to_string())),
            Err(_) => return Ok(None),
        };

        let payload = match parse_notice(notification.payload()) {
            Notice::Inline(payload) => payload.to_string(),
            Notice::Spilled(id) => match self.load_spilled(id).await? {
                Some(payload) => payload,
                None => return Ok(None),
            },
        };

        Ok(Some(BrokerMessage::Payload {
            topic: self.topic,
            payload,
        }))
    }

    async fn unsubscribe(&mut self) -> BrokerResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.listener
            .unlisten(&self.channel)
            .await
            .map_err(|e| BrokerError::ConnectionError(e.to_string()))
    }
}
