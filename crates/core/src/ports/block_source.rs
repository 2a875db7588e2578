//! Port trait for blockchain data source.
//!
//! This trait defines the interface for reading the chain head and fetching
//! full blocks. Implementations live in the infrastructure layer
//! (e.g., `lantern-evm`).

use async_trait::async_trait;

use crate::error::ChainResult;
use crate::models::BlockPackage;

/// Port trait for blockchain data source.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Current head block number as reported by the node.
    async fn latest_block_number(&self) -> ChainResult<u64>;

    /// Fetch a block with its transactions and events.
    ///
    /// Returns [`crate::error::ChainError::BlockNotFound`] when the node does
    /// not know the block yet.
    async fn fetch_block(&self, number: u64) -> ChainResult<BlockPackage>;
}
