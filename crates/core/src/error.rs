//! Error types for the indexer domain layer.
//!
//! This module defines a hierarchy of error types:
//!
//! - [`SubscriptionError`] - Subscription pattern rejections
//! - [`StorageError`] - Database/repository errors
//! - [`ChainError`] - Blockchain RPC errors
//! - [`BrokerError`] - Message broker errors
//! - [`TransportError`] - Client connection errors
//! - [`IndexerError`] - Top-level orchestration errors
//!
//! Error conversion is automatic via `From` implementations,
//! allowing `?` to work across error boundaries.
//!
//! Note that the block queue never returns errors: unknown blocks and a
//! stopped queue are reported as `false` / `None` results.

use thiserror::Error;

// =============================================================================
// Subscription Errors
// =============================================================================

/// Rejections produced while parsing a client subscription request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    /// The pattern does not follow the subscription grammar.
    #[error("Invalid subscription pattern: {0}")]
    InvalidPattern(String),

    /// The `type` field does not name a known topic class.
    #[error("Unknown topic class: {0}")]
    UnknownTopic(String),

    /// The pattern's topic class differs from the declared `type`.
    #[error("Pattern topic `{pattern}` does not match declared type `{declared}`")]
    TopicMismatch {
        /// Topic class found in the pattern.
        pattern: String,
        /// Topic class declared by the `type` field.
        declared: String,
    },
}

// =============================================================================
// Storage Errors
// =============================================================================

/// Database and repository errors.
///
/// These errors originate from storage operations like queries,
/// transactions, and data serialization.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Failed to establish database connection.
    #[error("Database connection error: {0}")]
    ConnectionError(String),

    /// SQL query execution failed.
    #[error("Query execution error: {0}")]
    QueryError(String),

    /// Database migration failed.
    #[error("Migration error: {0}")]
    MigrationError(String),

    /// Transaction commit/rollback failed.
    #[error("Transaction error: {0}")]
    TransactionError(String),

    /// Data serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

// =============================================================================
// Chain Errors
// =============================================================================

/// Blockchain RPC and connectivity errors.
#[derive(Debug, Error)]
pub enum ChainError {
    /// Connection to the node failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// RPC request failed.
    #[error("RPC error: {0}")]
    RpcError(String),

    /// Node returned a payload we could not interpret.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// The node does not know the requested block (yet).
    #[error("Block not found: {0}")]
    BlockNotFound(u64),
}

// =============================================================================
// Broker Errors
// =============================================================================

/// Message broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Broker connection failed or was lost.
    #[error("Broker connection error: {0}")]
    ConnectionError(String),

    /// Publishing a message failed.
    #[error("Publish to `{topic}` failed: {message}")]
    PublishFailed {
        /// Broker topic.
        topic: String,
        /// Error details.
        message: String,
    },

    /// Subscribing or unsubscribing failed.
    #[error("Subscription error on `{topic}`: {message}")]
    SubscriptionFailed {
        /// Broker topic.
        topic: String,
        /// Error details.
        message: String,
    },

    /// Subscription stream has been closed.
    #[error("Broker subscription closed")]
    Closed,
}

// =============================================================================
// Transport Errors
// =============================================================================

/// Errors writing to a client connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection has been closed by the peer or the server.
    #[error("Connection closed")]
    Closed,

    /// Serializing the outbound message failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Writing to the socket failed.
    #[error("Send failed: {0}")]
    SendFailed(String),
}

// =============================================================================
// Indexer Errors
// =============================================================================

/// Top-level indexer orchestration errors.
///
/// This is the main error type returned by [`crate::services::Pipeline`].
/// It wraps all lower-level errors and adds indexer-specific variants.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// Storage/database error.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Blockchain connectivity error.
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    /// Broker error.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The block queue rejected or no longer answers a transition.
    #[error("Block queue rejected {operation} for block {block}")]
    QueueRejected {
        /// Queue operation name.
        operation: &'static str,
        /// Block number.
        block: u64,
    },

    /// Graceful shutdown was requested.
    ///
    /// This is not really an error but uses the error type for control flow.
    #[error("Indexer shutdown requested")]
    ShutdownRequested,
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for indexer operations.
pub type IndexerResult<T> = Result<T, IndexerError>;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type for chain operations.
pub type ChainResult<T> = Result<T, ChainError>;

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Result type for client transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    // Permet d'utiliser ? à travers les couches
    #[test]
    fn test_error_conversion_chain() {
        let storage_err = StorageError::QueryError("db failed".into());
        let indexer_err: IndexerError = storage_err.into();
        assert!(indexer_err.to_string().contains("db failed"));

        let chain_err = ChainError::RpcError("rpc failed".into());
        let indexer_err: IndexerError = chain_err.into();
        assert!(indexer_err.to_string().contains("rpc failed"));

        let broker_err = BrokerError::PublishFailed {
            topic: "block".into(),
            message: "payload too large".into(),
        };
        let indexer_err: IndexerError = broker_err.into();
        assert!(indexer_err.to_string().contains("payload too large"));
    }

    #[test]
    fn test_topic_mismatch_names_both_sides() {
        let err = SubscriptionError::TopicMismatch {
            pattern: "event".into(),
            declared: "block".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("event") && msg.contains("block"));
    }
}
