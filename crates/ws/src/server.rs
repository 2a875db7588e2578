//! WebSocket HTTP server.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info};

use lantern_core::ports::Broker;
use lantern_core::pubsub::{ConsumerConfig, SubscriptionManager};

use crate::connection::WsConnection;
use crate::message::handle_text;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7000,
        }
    }
}

/// Shared state of the socket handlers.
#[derive(Clone)]
pub struct WsState {
    broker: Arc<dyn Broker>,
    consumer: ConsumerConfig,
    shutdown: watch::Receiver<bool>,
    next_connection_id: Arc<AtomicU64>,
}

impl WsState {
    pub fn new(
        broker: Arc<dyn Broker>,
        consumer: ConsumerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            broker,
            consumer,
            shutdown,
            next_connection_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

/// Routes: `GET /ws` (upgrade) and `GET /health`.
pub fn router(state: WsState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_check))
        .with_state(state)
}

/// Start the WebSocket server with graceful shutdown support.
pub async fn serve_with_shutdown<F>(
    state: WsState,
    config: ServerConfig,
    shutdown_signal: F,
) -> Result<(), std::io::Error>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    debug!(addr = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: WsState) {
    let id = state.next_connection_id.fetch_add(1, Ordering::Relaxed);
    let (sink, mut stream) = socket.split();
    let connection = Arc::new(WsConnection::new(id, sink));
    let manager = SubscriptionManager::new(
        connection.clone(),
        Arc::clone(&state.broker),
        state.consumer.clone(),
        state.shutdown.clone(),
    );

    info!(connection = id, "🔌 Client connected");

    let mut shutdown = state.shutdown.clone();
    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    handle_text(&manager, connection.as_ref(), &text).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                // Pings are answered by axum
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(connection = id, error = %e, "Socket read failed");
                    break;
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    let stopped = manager.unsubscribe_all().await;
    connection.close().await;

    info!(connection = id, topics = stopped, "Client disconnected");
}

/// Health check endpoint.
async fn health_check() -> &'static str {
    "OK"
}
