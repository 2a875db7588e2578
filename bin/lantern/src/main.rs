//! Lantern - Ethereum block indexer with live subscriptions.
//!
//! # Usage
//!
//! ```bash
//! # Start with default config
//! lantern
//!
//! # Start with environment overrides
//! DATABASE_URL=postgres://localhost/lantern RPC_URL=http://localhost:8545 lantern
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};
use tracing_subscriber::{EnvFilter, fmt};

use lantern_broker::{MemoryBroker, PgBroker};
use lantern_core::error::IndexerError;
use lantern_core::metrics::init_metrics;
use lantern_core::ports::{BlockSource, Broker};
use lantern_core::pubsub::ConsumerConfig;
use lantern_core::queue::{BlockProcessorQueue, QueueConfig, parse_confirmation_depth};
use lantern_core::services::{Pipeline, PipelineConfig};
use lantern_evm::{EvmClient, EvmClientConfig};
use lantern_storage::{Database, DatabaseConfig, PgRepositories};
use lantern_ws::{ServerConfig, WsState, serve_with_shutdown};

/// Broker backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BrokerKind {
    /// PostgreSQL LISTEN/NOTIFY on the indexer database.
    Postgres,
    /// In-process broadcast channels (single process only).
    Memory,
}

/// Lantern CLI - Ethereum block indexer.
#[derive(Parser, Debug)]
#[command(name = "lantern")]
#[command(about = "Lantern - Ethereum block indexer with live WebSocket subscriptions")]
#[command(version)]
struct Cli {
    /// Node HTTP JSON-RPC URL.
    #[arg(long, env = "RPC_URL", default_value = "http://127.0.0.1:8545")]
    rpc_url: String,

    /// PostgreSQL database URL.
    #[arg(
        long,
        env = "DATABASE_URL",
        default_value = "postgres://localhost/lantern"
    )]
    database_url: String,

    /// Broker used to fan out indexed records to clients.
    #[arg(long, env = "BROKER", value_enum, default_value = "postgres")]
    broker: BrokerKind,

    /// Client WebSocket server port.
    #[arg(long, env = "WS_PORT", default_value = "7000")]
    ws_port: u16,

    /// Prometheus metrics port.
    #[arg(long, env = "METRICS_PORT", default_value = "9090")]
    metrics_port: u16,

    /// Blocks required on top of a block before it is confirmed.
    ///
    /// Missing or unparsable values mean 0.
    #[arg(long, env = "BLOCK_CONFIRMATIONS")]
    block_confirmations: Option<String>,

    /// First block to index when the database is empty.
    #[arg(long, env = "START_BLOCK", default_value = "0")]
    start_block: u64,

    /// Maximum blocks processed in parallel.
    #[arg(long, env = "CONCURRENCY", default_value = "8")]
    concurrency: usize,

    /// Chain head polling interval in milliseconds.
    #[arg(long, env = "POLL_INTERVAL_MS", default_value = "2000")]
    poll_interval_ms: u64,

    /// Enable JSON log output.
    #[arg(long, env = "JSON_LOGS")]
    json_logs: bool,

    /// Run database migrations and exit.
    #[arg(long)]
    migrate_only: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    // Prometheus metrics exporter (optional - failures don't crash the app)
    let metrics_enabled = match format!("0.0.0.0:{}", cli.metrics_port).parse::<std::net::SocketAddr>() {
        Ok(metrics_addr) => {
            match PrometheusBuilder::new()
                .with_http_listener(metrics_addr)
                .install()
            {
                Ok(()) => {
                    init_metrics();
                    true
                }
                Err(e) => {
                    warn!("⚠️  Failed to start metrics exporter: {}. Continuing without metrics.", e);
                    false
                }
            }
        }
        Err(e) => {
            warn!("⚠️  Invalid metrics address: {}. Continuing without metrics.", e);
            false
        }
    };

    // ─────────────────────────────────────────────────────────────────────────
    // 🚀 STARTUP
    // ─────────────────────────────────────────────────────────────────────────
    info!("🚀 Starting Lantern Indexer");
    debug!(rpc_url = %cli.rpc_url, "Node endpoint");
    debug!(database_url = %mask_password(&cli.database_url), "Database endpoint");

    let confirmation_depth = parse_confirmation_depth(cli.block_confirmations.as_deref());

    // ─────────────────────────────────────────────────────────────────────────
    // 🗄️ DATABASE
    // ─────────────────────────────────────────────────────────────────────────
    info!("🗄️  Connecting to database...");
    let db = Database::connect(&DatabaseConfig::for_indexer(&cli.database_url, cli.concurrency))
        .await
        .context("Failed to connect to database")?;

    db.migrate().await.context("Failed to run migrations")?;
    info!("🗄️  Database ready (migrations applied)");

    if cli.migrate_only {
        info!("🛑 --migrate-only flag set, exiting");
        return Ok(());
    }

    let db = Arc::new(db);
    let repositories = Arc::new(PgRepositories::new(db.clone()));

    let broker: Arc<dyn Broker> = match cli.broker {
        BrokerKind::Postgres => Arc::new(PgBroker::new(db.pool().clone())),
        BrokerKind::Memory => Arc::new(MemoryBroker::default()),
    };
    info!(broker = ?cli.broker, "📨 Broker ready");

    // ─────────────────────────────────────────────────────────────────────────
    // 📡 NODE CONNECTION
    // ─────────────────────────────────────────────────────────────────────────
    info!("📡 Connecting to node...");
    let evm_client = EvmClient::new(EvmClientConfig {
        rpc_url: cli.rpc_url.clone(),
        ..Default::default()
    })
    .context("Failed to create RPC client")?;

    let head = evm_client
        .latest_block_number()
        .await
        .context("Failed to reach node")?;

    info!(head, confirmations = confirmation_depth, "🔗 Chain connected");

    let evm_client = Arc::new(evm_client);

    // ─────────────────────────────────────────────────────────────────────────
    // ⚡ SERVICES START
    // ─────────────────────────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    // The queue outlives the pipeline so in-flight blocks can still report
    let (queue_shutdown_tx, queue_shutdown_rx) = watch::channel(false);

    let (queue, queue_handle) = BlockProcessorQueue::spawn(
        QueueConfig::with_confirmation_depth(confirmation_depth),
        queue_shutdown_rx,
    );

    let pipeline_config = PipelineConfig {
        start_block: cli.start_block,
        concurrency: cli.concurrency,
        poll_interval: Duration::from_millis(cli.poll_interval_ms.max(1)),
        ..Default::default()
    };
    let pipeline = Pipeline::new(
        pipeline_config,
        evm_client,
        repositories,
        broker.clone(),
        queue,
    );

    let ws_state = WsState::new(broker, ConsumerConfig::default(), shutdown_rx.clone());
    let ws_config = ServerConfig {
        host: "0.0.0.0".to_string(),
        port: cli.ws_port,
    };
    let mut ws_shutdown_rx = shutdown_tx.subscribe();
    let ws_handle = tokio::spawn(
        async move {
            let shutdown_signal = async move {
                while !*ws_shutdown_rx.borrow() {
                    if ws_shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            };

            if let Err(e) = serve_with_shutdown(ws_state, ws_config, shutdown_signal).await {
                error!(error = %e, "❌ Server error");
            }
            debug!("Server stopped");
        }
        .instrument(info_span!("ws")),
    );

    let pipeline_shutdown_tx = shutdown_tx.clone();
    let pipeline_handle = tokio::spawn(
        async move {
            match pipeline.run(shutdown_rx).await {
                Ok(()) | Err(IndexerError::ShutdownRequested) => {}
                Err(e) => {
                    error!(error = ?e, "❌ Pipeline error");
                    let _ = pipeline_shutdown_tx.send(true);
                }
            }
        }
        .instrument(info_span!("pipeline")),
    );

    // ─────────────────────────────────────────────────────────────────────────
    // ✅ READY
    // ─────────────────────────────────────────────────────────────────────────
    info!("✅ Lantern ready");
    info!("   🔌 WebSocket: ws://localhost:{}/ws", cli.ws_port);
    if metrics_enabled {
        info!(
            "   📊 Metrics:   http://localhost:{}/metrics",
            cli.metrics_port
        );
    } else {
        info!("   📊 Metrics:   disabled");
    }
    info!("   Press Ctrl+C to stop");

    let mut fatal_rx = shutdown_tx.subscribe();
    tokio::select! {
        _ = shutdown_signal() => {}
        _ = fatal_rx.wait_for(|stop| *stop) => warn!("⚠️  Pipeline stopped, shutting down"),
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 🛑 SHUTDOWN
    // ─────────────────────────────────────────────────────────────────────────
    info!("🛑 Shutting down...");
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(Duration::from_secs(30), pipeline_handle).await {
        Ok(_) => debug!("Pipeline stopped"),
        Err(_) => warn!("⚠️  Pipeline shutdown timed out"),
    }

    let _ = queue_shutdown_tx.send(true);
    if tokio::time::timeout(Duration::from_secs(5), queue_handle)
        .await
        .is_err()
    {
        warn!("⚠️  Block queue shutdown timed out");
    }

    match tokio::time::timeout(Duration::from_secs(10), ws_handle).await {
        Ok(_) => debug!("WebSocket server stopped"),
        Err(_) => warn!("⚠️  WebSocket server shutdown timed out"),
    }

    db.close().await;

    info!("🛑 Shutdown complete");
    Ok(())
}

/// Initialize tracing subscriber.
fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init();
    }
}

/// Mask password in database URL for logging.
fn mask_password(url_str: &str) -> String {
    match url::Url::parse(url_str) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("****"));
            }
            url.to_string()
        }
        Err(_) => url_str.to_string(),
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
