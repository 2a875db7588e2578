//! Socket write half as a `ClientConnection`.

use std::fmt::Display;

use async_trait::async_trait;
use axum::extract::ws::Message;
use futures::{Sink, SinkExt};
use tokio::sync::Mutex as AsyncMutex;

use lantern_core::error::{TransportError, TransportResult};
use lantern_core::ports::{ClientConnection, ConnectionId};

/// Write half of a client socket.
///
/// Consumers of several topics deliver concurrently; the async mutex keeps
/// each JSON message in its own frame.
pub struct WsConnection<S> {
    id: ConnectionId,
    sink: AsyncMutex<S>,
}

impl<S> WsConnection<S> {
    pub fn new(id: ConnectionId, sink: S) -> Self {
        Self {
            id,
            sink: AsyncMutex::new(sink),
        }
    }
}

impl<S> WsConnection<S>
where
    S: Sink<Message> + Unpin + Send,
    S::Error: Display,
{
    /// Send a close frame. Errors are ignored; the peer may already be gone.
    pub async fn close(&self) {
        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    }
}

#[async_trait]
impl<S> ClientConnection for WsConnection<S>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display,
{
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn send_json(&self, message: &serde_json::Value) -> TransportResult<()> {
        let text = serde_json::to_string(message)
            .map_err(|e| TransportError::Serialization(e.to_string()))?;

        self.sink
            .lock()
            .await
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}
