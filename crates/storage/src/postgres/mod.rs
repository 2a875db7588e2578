//! PostgreSQL storage adapter.
//!
//! - [`Database`] - Connection pool and migrations
//! - [`PgRepositories`] - Composite repository implementing `Repositories` trait
//! - [`PgBlockRepository`] - Block reads

mod block_repo;
mod database;
mod helpers;

pub use block_repo::PgBlockRepository;
pub use database::{Database, DatabaseConfig};

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use lantern_core::error::{StorageError, StorageResult};
use lantern_core::models::BlockPackage;
use lantern_core::ports::{BlockRepository, Repositories};

use helpers::to_bigint;

// =============================================================================
// Composite Repository
// =============================================================================

/// Aggregated PostgreSQL repositories implementing the `Repositories` trait.
pub struct PgRepositories {
    db: Arc<Database>,
    blocks: PgBlockRepository,
}

impl PgRepositories {
    /// Create a new repository aggregate from a database connection.
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            blocks: PgBlockRepository::new(&db),
            db,
        }
    }
}

#[async_trait]
impl Repositories for PgRepositories {
    fn blocks(&self) -> &dyn BlockRepository {
        &self.blocks
    }

    async fn persist_block_atomic(&self, package: &BlockPackage) -> StorageResult<()> {
        let block = &package.block;
        let number = to_bigint(block.number, "block.number")?;

        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| StorageError::TransactionError(e.to_string()))?;

        // Children of a previous version of this height go first
        sqlx::query("DELETE FROM events WHERE block_number = $1")
            .bind(number)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::QueryError(e.to_string()))?;

        sqlx::query("DELETE FROM transactions WHERE block_number = $1")
            .bind(number)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::QueryError(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO blocks (
                number, hash, time, parent_hash, difficulty, gas_used, gas_limit,
                nonce, miner, size, state_root_hash, uncle_hash, tx_root_hash,
                receipt_root_hash, extra_data, indexed_at
            )
            VALUES ($1, $2, $3, $4, $5::NUMERIC, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, NOW())
            ON CONFLICT (number) DO UPDATE SET
                hash = EXCLUDED.hash,
                time = EXCLUDED.time,
                parent_hash = EXCLUDED.parent_hash,
                difficulty = EXCLUDED.difficulty,
                gas_used = EXCLUDED.gas_used,
                gas_limit = EXCLUDED.gas_limit,
                nonce = EXCLUDED.nonce,
                miner = EXCLUDED.miner,
                size = EXCLUDED.size,
                state_root_hash = EXCLUDED.state_root_hash,
                uncle_hash = EXCLUDED.uncle_hash,
                tx_root_hash = EXCLUDED.tx_root_hash,
                receipt_root_hash = EXCLUDED.receipt_root_hash,
                extra_data = EXCLUDED.extra_data,
                indexed_at = EXCLUDED.indexed_at
            "#,
        )
        .bind(number)
        .bind(&block.hash)
        .bind(to_bigint(block.time, "block.time")?)
        .bind(&block.parent_hash)
        .bind(&block.difficulty)
        .bind(to_bigint(block.gas_used, "block.gas_used")?)
        .bind(to_bigint(block.gas_limit, "block.gas_limit")?)
        .bind(&block.nonce)
        .bind(&block.miner)
        .bind(block.size)
        .bind(&block.state_root_hash)
        .bind(&block.uncle_hash)
        .bind(&block.transaction_root_hash)
        .bind(&block.receipt_root_hash)
        .bind(&block.extra_data)
        .execute(&mut *tx)
        .await
        .map_err(|e| StorageError::QueryError(e.to_string()))?;

        for transaction in &package.transactions {
            sqlx::query(
                r#"
                INSERT INTO transactions (
                    hash, block_number, block_hash, "from", "to", contract_address,
                    value, data, gas, gas_price, cost, nonce, state, timestamp
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7::NUMERIC, $8, $9, $10::NUMERIC, $11::NUMERIC, $12, $13, $14)
                ON CONFLICT (block_number, hash) DO NOTHING
                "#,
            )
            .bind(&transaction.hash)
            .bind(number)
            .bind(&transaction.block_hash)
            .bind(&transaction.from)
            .bind(&transaction.to)
            .bind(&transaction.contract_address)
            .bind(&transaction.value)
            .bind(&transaction.data)
            .bind(to_bigint(transaction.gas, "transaction.gas")?)
            .bind(&transaction.gas_price)
            .bind(&transaction.cost)
            .bind(to_bigint(transaction.nonce, "transaction.nonce")?)
            .bind(to_bigint(transaction.state, "transaction.state")?)
            .bind(to_bigint(transaction.timestamp, "transaction.timestamp")?)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::QueryError(e.to_string()))?;
        }

        for event in &package.events {
            sqlx::query(
                r#"
                INSERT INTO events (
                    block_number, index, origin, topics, data, tx_hash, block_hash, timestamp
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                ON CONFLICT (block_number, index) DO NOTHING
                "#,
            )
            .bind(number)
            .bind(i64::from(event.index))
            .bind(&event.origin)
            .bind(&event.topics)
            .bind(&event.data)
            .bind(&event.transaction_hash)
            .bind(&event.block_hash)
            .bind(to_bigint(event.timestamp, "event.timestamp")?)
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::QueryError(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::TransactionError(e.to_string()))?;

        debug!(
            block = block.number,
            transactions = package.transactions.len(),
            events = package.events.len(),
            "Block persisted"
        );

        Ok(())
    }
}
