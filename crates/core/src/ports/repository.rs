//! Port traits for data repositories.
//!
//! These traits define the storage interface used by the domain layer.
//! Implementations live in the infrastructure layer (e.g., `lantern-storage`).

use async_trait::async_trait;

use crate::error::StorageResult;
use crate::models::{Block, BlockPackage};

/// Read access to stored blocks.
#[async_trait]
pub trait BlockRepository: Send + Sync {
    /// Get block by number.
    async fn get_block(&self, number: u64) -> StorageResult<Option<Block>>;

    /// Get latest stored block number.
    async fn latest_block_number(&self) -> StorageResult<Option<u64>>;
}

/// Combined repository access for the pipeline.
#[async_trait]
pub trait Repositories: Send + Sync {
    /// Access the block repository.
    fn blocks(&self) -> &dyn BlockRepository;

    /// Persist a block with its transactions and events in a single
    /// transaction.
    ///
    /// Rows previously stored for the same height are replaced, so a block
    /// re-fetched after a reorg overwrites the stale one. If any operation
    /// fails, everything is rolled back.
    async fn persist_block_atomic(&self, package: &BlockPackage) -> StorageResult<()>;
}
