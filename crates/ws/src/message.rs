//! Inbound client messages.

use serde::{Deserialize, Serialize};
use tracing::debug;

use lantern_core::ports::ClientConnection;
use lantern_core::pubsub::{SubscriptionManager, SubscriptionRequest, SubscriptionResponse};

/// What the client asks for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[default]
    Subscribe,
    Unsubscribe,
}

/// `{"name": "...", "type": "...", "action": "subscribe" | "unsubscribe"}`.
///
/// `action` defaults to `subscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    #[serde(flatten)]
    pub request: SubscriptionRequest,
    #[serde(default)]
    pub action: Action,
}

/// Apply one text frame to the connection's subscriptions.
///
/// Rejections are reported to the client with `code: 0`; successful
/// requests are acknowledged by the subscription engine itself.
pub async fn handle_text(
    manager: &SubscriptionManager,
    connection: &dyn ClientConnection,
    text: &str,
) {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            reply(connection, SubscriptionResponse::error(format!("Invalid message: {e}"))).await;
            return;
        }
    };

    match message.action {
        Action::Subscribe => {
            if let Err(e) = manager.subscribe(&message.request).await {
                reply(connection, SubscriptionResponse::error(e.to_string())).await;
            }
        }
        Action::Unsubscribe => {
            if !manager.unsubscribe(&message.request).await {
                debug!(
                    connection = connection.id(),
                    name = %message.request.name,
                    "Unsubscribe for unknown subscription ignored"
                );
            }
        }
    }
}

async fn reply(connection: &dyn ClientConnection, response: SubscriptionResponse) {
    if let Err(e) = connection.send_json(&response.to_json()).await {
        debug!(connection = connection.id(), error = %e, "Failed to send error response");
    }
}
