//! JSON-RPC wire types and their conversion into indexed records.

use std::collections::HashMap;

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use lantern_core::error::{ChainError, ChainResult};
use lantern_core::models::{Block, BlockPackage, Event, Transaction};

// =============================================================================
// Envelope
// =============================================================================

#[derive(Debug, Serialize)]
pub(crate) struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
}

#[derive(Debug, Deserialize)]
pub(crate) struct JsonRpcResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

// =============================================================================
// Payloads
// =============================================================================

/// `eth_getBlockByNumber` result with full transaction objects.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RpcBlock {
    pub number: String,
    pub hash: String,
    pub parent_hash: String,
    #[serde(default)]
    pub nonce: Option<String>,
    pub sha3_uncles: String,
    pub transactions_root: String,
    pub state_root: String,
    pub receipts_root: String,
    pub miner: String,
    #[serde(default)]
    pub difficulty: Option<String>,
    pub extra_data: String,
    pub size: String,
    pub gas_limit: String,
    pub gas_used: String,
    pub timestamp: String,
    #[serde(default)]
    pub transactions: Vec<RpcTransaction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RpcTransaction {
    pub hash: String,
    pub from: String,
    #[serde(default)]
    pub to: Option<String>,
    pub value: String,
    pub input: String,
    pub gas: String,
    #[serde(default)]
    pub gas_price: Option<String>,
    pub nonce: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RpcReceipt {
    pub transaction_hash: String,
    #[serde(default)]
    pub contract_address: Option<String>,
    pub gas_used: String,
    #[serde(default)]
    pub effective_gas_price: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub logs: Vec<RpcLog>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RpcLog {
    pub address: String,
    #[serde(default)]
    pub topics: Vec<String>,
    pub data: String,
    pub log_index: String,
    pub transaction_hash: String,
    pub block_hash: String,
}

// =============================================================================
// Field parsing
// =============================================================================

fn malformed(field: &str, value: &str) -> ChainError {
    ChainError::MalformedResponse(format!("{field}: invalid value {value:?}"))
}

fn digits(value: &str) -> &str {
    value.strip_prefix("0x").unwrap_or(value)
}

/// Parse a hex quantity that fits in 64 bits.
pub(crate) fn quantity(value: &str, field: &str) -> ChainResult<u64> {
    u64::from_str_radix(digits(value), 16).map_err(|_| malformed(field, value))
}

/// Parse a 256-bit hex quantity.
pub(crate) fn big_quantity(value: &str, field: &str) -> ChainResult<U256> {
    U256::from_str_radix(digits(value), 16).map_err(|_| malformed(field, value))
}

/// Parse `0x`-prefixed hex data.
pub(crate) fn bytes(value: &str, field: &str) -> ChainResult<Vec<u8>> {
    hex::decode(digits(value)).map_err(|_| malformed(field, value))
}

// =============================================================================
// Conversion
// =============================================================================

/// Build the indexed records of one block from its RPC block and receipts.
pub(crate) fn into_package(block: RpcBlock, receipts: Vec<RpcReceipt>) -> ChainResult<BlockPackage> {
    let number = quantity(&block.number, "block.number")?;
    let time = quantity(&block.timestamp, "block.timestamp")?;

    let mut receipts: HashMap<String, RpcReceipt> = receipts
        .into_iter()
        .map(|receipt| (receipt.transaction_hash.to_lowercase(), receipt))
        .collect();

    let mut transactions = Vec::with_capacity(block.transactions.len());
    let mut events = Vec::new();

    for tx in &block.transactions {
        let receipt = receipts.remove(&tx.hash.to_lowercase()).ok_or_else(|| {
            ChainError::MalformedResponse(format!("missing receipt for transaction {}", tx.hash))
        })?;

        let gas_price = match tx.gas_price.as_deref().or(receipt.effective_gas_price.as_deref()) {
            Some(price) => big_quantity(price, "transaction.gasPrice")?,
            None => U256::ZERO,
        };
        let effective_price = match receipt.effective_gas_price.as_deref() {
            Some(price) => big_quantity(price, "receipt.effectiveGasPrice")?,
            None => gas_price,
        };
        let gas_used = big_quantity(&receipt.gas_used, "receipt.gasUsed")?;
        // Pre-Byzantium receipts carry a state root instead of a status
        let state = match receipt.status.as_deref() {
            Some(status) => quantity(status, "receipt.status")?,
            None => 0,
        };

        transactions.push(Transaction {
            hash: tx.hash.clone(),
            from: tx.from.clone(),
            to: tx.to.clone().unwrap_or_default(),
            contract_address: receipt.contract_address.clone().unwrap_or_default(),
            value: big_quantity(&tx.value, "transaction.value")?.to_string(),
            data: bytes(&tx.input, "transaction.input")?,
            gas: quantity(&tx.gas, "transaction.gas")?,
            gas_price: gas_price.to_string(),
            cost: gas_used.saturating_mul(effective_price).to_string(),
            nonce: quantity(&tx.nonce, "transaction.nonce")?,
            state,
            block_hash: block.hash.clone(),
            block_number: number,
            timestamp: time,
        });

        for log in receipt.logs {
            let index = quantity(&log.log_index, "log.logIndex")?;
            events.push(Event {
                origin: log.address,
                index: u32::try_from(index).map_err(|_| malformed("log.logIndex", &log.log_index))?,
                topics: log.topics,
                data: bytes(&log.data, "log.data")?,
                transaction_hash: log.transaction_hash,
                block_hash: log.block_hash,
                block_number: number,
                timestamp: time,
            });
        }
    }

    let block = Block {
        number,
        time,
        difficulty: match block.difficulty.as_deref() {
            Some(difficulty) => big_quantity(difficulty, "block.difficulty")?.to_string(),
            None => "0".to_string(),
        },
        gas_used: quantity(&block.gas_used, "block.gasUsed")?,
        gas_limit: quantity(&block.gas_limit, "block.gasLimit")?,
        nonce: block
            .nonce
            .unwrap_or_else(|| "0x0000000000000000".to_string()),
        size: quantity(&block.size, "block.size")? as f64,
        extra_data: bytes(&block.extra_data, "block.extraData")?,
        hash: block.hash,
        parent_hash: block.parent_hash,
        miner: block.miner,
        state_root_hash: block.state_root,
        uncle_hash: block.sha3_uncles,
        transaction_root_hash: block.transactions_root,
        receipt_root_hash: block.receipts_root,
    };

    Ok(BlockPackage {
        block,
        transactions,
        events,
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    fn package() -> BlockPackage {
        let block: RpcBlock = serde_json::from_value(fixtures::block()).unwrap();
        let receipts: Vec<RpcReceipt> = serde_json::from_value(fixtures::receipts()).unwrap();
        into_package(block, receipts).unwrap()
    }

    #[test]
    fn test_quantities() {
        assert_eq!(quantity("0x10d4f", "n").unwrap(), 68_943);
        assert_eq!(quantity("0x0", "n").unwrap(), 0);
        assert!(quantity("0xzz", "n").is_err());
        assert_eq!(
            big_quantity("0xde0b6b3a7640000", "v").unwrap().to_string(),
            "1000000000000000000"
        );
        assert_eq!(bytes("0x", "d").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_block_fields() {
        let block = package().block;
        assert_eq!(block.number, 68_943);
        assert_eq!(block.hash, fixtures::BLOCK_HASH);
        assert_eq!(block.difficulty, "131072");
        assert_eq!(block.size, 676.0);
        assert_eq!(block.gas_used, 42_000);
        assert_eq!(block.extra_data, vec![0xd8, 0x83]);
        assert_eq!(block.time, 1_700_000_000);
    }

    #[test]
    fn test_transactions_merge_receipts() {
        let package = package();
        let [transfer, deploy] = package.transactions.as_slice() else {
            panic!("expected two transactions");
        };

        assert_eq!(transfer.value, "1000000000000000000");
        assert_eq!(transfer.gas_price, "1000000000");
        assert_eq!(transfer.cost, "21000000000000");
        assert_eq!(transfer.state, 1);
        assert_eq!(transfer.nonce, 7);
        assert!(transfer.contract_address.is_empty());
        assert_eq!(transfer.block_number, 68_943);

        assert!(deploy.to.is_empty());
        assert_eq!(deploy.contract_address, "0x5fbdb2315678afecb367f032d93f642f64180aa3");
        assert_eq!(deploy.state, 0);
        assert_eq!(deploy.data, vec![0x60, 0x80]);
    }

    #[test]
    fn test_logs_become_events() {
        let package = package();
        assert_eq!(package.events.len(), 1);

        let event = &package.events[0];
        assert_eq!(event.origin, "0x5fbdb2315678afecb367f032d93f642f64180aa3");
        assert_eq!(event.transaction_hash, fixtures::DEPLOY_HASH);
        assert_eq!(event.topics.len(), 1);
        assert_eq!(event.data.len(), 32);
        assert_eq!(event.timestamp, package.block.time);
    }

    #[test]
    fn test_missing_receipt_is_malformed() {
        let block: RpcBlock = serde_json::from_value(fixtures::block()).unwrap();
        let mut receipts: Vec<RpcReceipt> = serde_json::from_value(fixtures::receipts()).unwrap();
        receipts.pop();

        let err = into_package(block, receipts).unwrap_err();
        assert!(matches!(err, ChainError::MalformedResponse(msg) if msg.contains(fixtures::DEPLOY_HASH)));
    }
}
