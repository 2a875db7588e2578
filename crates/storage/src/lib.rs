//! Storage layer for the lantern indexer.
//!
//! This crate provides PostgreSQL implementations of the repository traits
//! defined in `lantern-core`: connection pooling, migrations, and the atomic
//! write of a block together with its transactions and events.
//!
//! # Usage
//!
//! ```ignore
//! use lantern_storage::{Database, DatabaseConfig, PgRepositories};
//!
//! let config = DatabaseConfig::for_indexer(&database_url);
//! let db = Database::connect(&config).await?;
//! db.migrate().await?;
//!
//! let repositories = Arc::new(PgRepositories::new(Arc::new(db)));
//! ```

pub mod postgres;

pub use postgres::{Database, DatabaseConfig, PgBlockRepository, PgRepositories};
