//! Core domain layer for the lantern block indexer.
//!
//! This crate contains the domain models, port traits (interfaces), the
//! block-lifecycle queue, the subscription engine and the ingestion pipeline.
//! It follows hexagonal architecture principles - this is the innermost layer
//! with no dependencies on infrastructure.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     lantern (binary)                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │   lantern-ws      │   lantern-evm      │  lantern-broker    │
//! │   (clients)       │     (RPC)          │  (pub/sub)         │
//! ├───────────────────┴────────────────────┴────────────────────┤
//! │                    lantern-storage                          │
//! │                     (PostgreSQL)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │                     lantern-core  ← YOU ARE HERE            │
//! │          (models, ports, queue, pubsub, services)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`models`] - Domain models (Block, Transaction, Event, Topic)
//! - [`ports`] - Interface traits for adapters to implement
//! - [`queue`] - Block-lifecycle actor with retry backoff
//! - [`pubsub`] - Subscription patterns, manager and topic consumers
//! - [`services`] - Ingestion pipeline
//! - [`error`] - Domain error types
//! - [`metrics`] - Prometheus metrics definitions
//!
//! # Key Concepts
//!
//! ## Ports
//!
//! - [`ports::BlockSource`] - Read the chain head and fetch blocks
//! - [`ports::Repositories`] - Persist and query indexed data
//! - [`ports::Broker`] - Publish records and subscribe to topics
//! - [`ports::ClientConnection`] - Push JSON messages to a client
//!
//! ## Block Lifecycle
//!
//! Every block goes through an unconfirmed phase (fetch, persist, publish
//! once) and, once the chain is `confirmation_depth` blocks past it, a
//! confirmed phase (re-fetch, replace on hash change). Failures in either
//! phase are retried with a golden-ratio backoff. All lifecycle state is
//! owned by a single actor task behind [`queue::QueueHandle`].
//!
//! ## Subscriptions
//!
//! Clients subscribe with a pattern such as `event/<origin>/<topic0>`.
//! Each connection's [`pubsub::SubscriptionManager`] keeps one broker
//! subscription per topic class with live subscribers and forwards the
//! matching records.

pub mod error;
pub mod metrics;
pub mod models;
pub mod ports;
pub mod pubsub;
pub mod queue;
pub mod services;
