//! Broker adapters for the lantern indexer.
//!
//! Both adapters implement the `Broker` port from `lantern-core`:
//!
//! - [`MemoryBroker`] - per-topic broadcast channels inside one process
//! - [`PgBroker`] - PostgreSQL `LISTEN`/`NOTIFY`, shared by every process
//!   connected to the same database; records too large for a notification
//!   are passed through the `broker_payloads` table
//!
//! Delivery is at-least-once and lossy for both: a slow subscriber may miss
//! payloads, and nothing published before a subscription is replayed.

mod memory;
mod postgres;

pub use memory::{DEFAULT_TOPIC_CAPACITY, MemoryBroker};
pub use postgres::{
    DEFAULT_CHANNEL_PREFIX, DEFAULT_SPILL_RETENTION, MAX_NOTIFY_PAYLOAD, PgBroker,
};
