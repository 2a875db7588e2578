//! Block repository implementation for PostgreSQL.

use async_trait::async_trait;
use sqlx::PgPool;

use lantern_core::error::{StorageError, StorageResult};
use lantern_core::models::Block;
use lantern_core::ports::BlockRepository;

use super::database::Database;
use super::helpers::{from_bigint, to_bigint};

/// PostgreSQL implementation of BlockRepository.
pub struct PgBlockRepository {
    pool: PgPool,
}

impl PgBlockRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

#[async_trait]
impl BlockRepository for PgBlockRepository {
    async fn get_block(&self, number: u64) -> StorageResult<Option<Block>> {
        let row = sqlx::query_as::<_, BlockRow>(
            r#"
            SELECT number, hash, time, parent_hash, difficulty::TEXT AS difficulty,
                   gas_used, gas_limit, nonce, miner, size, state_root_hash,
                   uncle_hash, tx_root_hash, receipt_root_hash, extra_data
            FROM blocks
            WHERE number = $1
            "#,
        )
        .bind(to_bigint(number, "block.number")?)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::QueryError(e.to_string()))?;

        row.map(BlockRow::into_block).transpose()
    }

    async fn latest_block_number(&self) -> StorageResult<Option<u64>> {
        // MAX returns NULL when table is empty, so we need Option<i64> in the tuple
        let row: (Option<i64>,) = sqlx::query_as("SELECT MAX(number) FROM blocks")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::QueryError(e.to_string()))?;

        row.0.map(|n| from_bigint(n, "block.number")).transpose()
    }
}

/// Database row representation for Block.
#[derive(sqlx::FromRow)]
struct BlockRow {
    number: i64,
    hash: String,
    time: i64,
    parent_hash: String,
    difficulty: String,
    gas_used: i64,
    gas_limit: i64,
    nonce: String,
    miner: String,
    size: f64,
    state_root_hash: String,
    uncle_hash: String,
    tx_root_hash: String,
    receipt_root_hash: String,
    extra_data: Vec<u8>,
}

impl BlockRow {
    fn into_block(self) -> StorageResult<Block> {
        Ok(Block {
            number: from_bigint(self.number, "block.number")?,
            hash: self.hash,
            time: from_bigint(self.time, "block.time")?,
            parent_hash: self.parent_hash,
            difficulty: self.difficulty,
            gas_used: from_bigint(self.gas_used, "block.gas_used")?,
            gas_limit: from_bigint(self.gas_limit, "block.gas_limit")?,
            nonce: self.nonce,
            miner: self.miner,
            size: self.size,
            state_root_hash: self.state_root_hash,
            uncle_hash: self.uncle_hash,
            transaction_root_hash: self.tx_root_hash,
            receipt_root_hash: self.receipt_root_hash,
            extra_data: self.extra_data,
        })
    }
}
