//! Client-facing WebSocket server.
//!
//! Every accepted socket gets its own [`SubscriptionManager`] scope: clients
//! send subscribe/unsubscribe requests as JSON text frames and receive status
//! messages and matching records on the same socket.
//!
//! [`SubscriptionManager`]: lantern_core::pubsub::SubscriptionManager

mod connection;
mod message;
mod server;

pub use connection::WsConnection;
pub use message::{Action, ClientMessage, handle_text};
pub use server::{ServerConfig, WsState, router, serve_with_shutdown};
