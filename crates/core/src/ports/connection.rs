//! Port trait for client connections.
//!
//! The transport (e.g., `lantern-ws`) owns the socket; the subscription
//! engine only needs to push JSON messages to it.

use async_trait::async_trait;

use crate::error::TransportResult;

/// Process-unique connection identifier.
pub type ConnectionId = u64;

/// A long-lived client connection that accepts JSON messages.
///
/// Implementations must serialize concurrent writes: several topic consumers
/// may deliver to the same connection at once.
#[async_trait]
pub trait ClientConnection: Send + Sync {
    /// Connection identifier.
    fn id(&self) -> ConnectionId;

    /// Write one JSON message.
    async fn send_json(&self, message: &serde_json::Value) -> TransportResult<()>;
}
