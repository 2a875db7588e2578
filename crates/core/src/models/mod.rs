//! Domain models representing indexed chain data.
//!
//! These records are both the persistence shape and the wire shape. The same
//! camelCase JSON form is published on the broker and delivered to clients.
//! Binary payloads are hex-encoded with a `0x` prefix and empty payloads
//! serialize as an empty string.

use std::fmt;

use serde::{Deserialize, Serialize};

mod hex_serde;

// =============================================================================
// Topics
// =============================================================================

/// Broad record class, used both as broker topic and subscription class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    Block,
    Transaction,
    Event,
}

impl Topic {
    /// Every topic, in publication order.
    pub const ALL: [Topic; 3] = [Topic::Block, Topic::Transaction, Topic::Event];

    /// Broker topic name.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Topic::Block => "block",
            Topic::Transaction => "transaction",
            Topic::Event => "event",
        }
    }

    /// Exact topic name lookup.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    /// Resolve a client-declared topic class.
    ///
    /// Any string starting with a topic name selects that topic, so `"blocks"`
    /// resolves to [`Topic::Block`].
    pub fn from_class(class: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| class.starts_with(t.as_str()))
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Block
// =============================================================================

/// Indexed block header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Block hash.
    pub hash: String,
    /// Block number (height).
    pub number: u64,
    /// Block timestamp (unix seconds).
    pub time: u64,
    pub parent_hash: String,
    /// Difficulty as a decimal string.
    pub difficulty: String,
    pub gas_used: u64,
    pub gas_limit: u64,
    pub nonce: String,
    pub miner: String,
    /// Encoded block size in bytes.
    pub size: f64,
    pub state_root_hash: String,
    pub uncle_hash: String,
    #[serde(rename = "txRootHash")]
    pub transaction_root_hash: String,
    pub receipt_root_hash: String,
    #[serde(with = "hex_serde::bytes")]
    pub extra_data: Vec<u8>,
}

// =============================================================================
// Transaction
// =============================================================================

/// Indexed transaction, merged with its receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub hash: String,
    pub from: String,
    /// Recipient, empty for contract creations.
    #[serde(default)]
    pub to: String,
    /// Created contract, only present for contract creations.
    #[serde(default, skip_serializing_if = "is_not_address")]
    pub contract_address: String,
    /// Transferred value in wei, decimal string.
    pub value: String,
    #[serde(with = "hex_serde::bytes")]
    pub data: Vec<u8>,
    pub gas: u64,
    /// Gas price in wei, decimal string.
    pub gas_price: String,
    /// Gas used times effective gas price, decimal string.
    pub cost: String,
    pub nonce: u64,
    /// Receipt status (1 success, 0 failure).
    pub state: u64,
    pub block_hash: String,
    pub block_number: u64,
    pub timestamp: u64,
}

fn is_not_address(value: &String) -> bool {
    !value.starts_with("0x")
}

// =============================================================================
// Event
// =============================================================================

/// Indexed log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Emitting contract address.
    pub origin: String,
    /// Log index within the block.
    pub index: u32,
    /// Log topics, 32-byte hex values.
    pub topics: Vec<String>,
    /// Log data; 32 zero bytes are treated as empty.
    #[serde(with = "hex_serde::event_data")]
    pub data: Vec<u8>,
    #[serde(rename = "txHash")]
    pub transaction_hash: String,
    pub block_hash: String,
    pub block_number: u64,
    pub timestamp: u64,
}

// =============================================================================
// Block Package
// =============================================================================

/// Everything the pipeline derives from one block.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockPackage {
    pub block: Block,
    pub transactions: Vec<Transaction>,
    pub events: Vec<Event>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event(data: Vec<u8>) -> Event {
        Event {
            origin: "0x00000000000000000000000000000000000000aa".into(),
            index: 3,
            topics: vec![format!("0x{}", "11".repeat(32))],
            data,
            transaction_hash: "0xfeed".into(),
            block_hash: "0xbeef".into(),
            block_number: 100,
            timestamp: 1_700_000_000,
        }
    }

    fn sample_transaction(contract_address: &str) -> Transaction {
        Transaction {
            hash: "0x01".into(),
            from: "0x00000000000000000000000000000000000000aa".into(),
            to: String::new(),
            contract_address: contract_address.into(),
            value: "0".into(),
            data: vec![0x60, 0x80],
            gas: 21_000,
            gas_price: "1000000000".into(),
            cost: "21000000000000".into(),
            nonce: 7,
            state: 1,
            block_hash: "0xbeef".into(),
            block_number: 100,
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn test_topic_from_class_uses_prefix() {
        assert_eq!(Topic::from_class("block"), Some(Topic::Block));
        assert_eq!(Topic::from_class("transactions"), Some(Topic::Transaction));
        assert_eq!(Topic::from_class("event/0x1"), Some(Topic::Event));
        assert_eq!(Topic::from_class("receipt"), None);
        assert_eq!(Topic::from_name("blocks"), None);
    }

    #[test]
    fn test_event_zero_word_serializes_as_empty() {
        let json = serde_json::to_value(sample_event(vec![0u8; 32])).unwrap();
        assert_eq!(json["data"], "");
    }

    #[test]
    fn test_event_data_is_prefixed_hex() {
        let json = serde_json::to_value(sample_event(vec![0xde, 0xad])).unwrap();
        assert_eq!(json["data"], "0xdead");
        assert_eq!(json["txHash"], "0xfeed");
        assert_eq!(json["blockNumber"], 100);
    }

    #[test]
    fn test_event_decodes_from_wire() {
        let event = sample_event(vec![0xca, 0xfe]);
        let wire = serde_json::to_string(&event).unwrap();
        let decoded: Event = serde_json::from_str(&wire).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_event_rejects_malformed_hex() {
        let mut json = serde_json::to_value(sample_event(vec![])).unwrap();
        json["data"] = "0xzz".into();
        assert!(serde_json::from_value::<Event>(json).is_err());
    }

    #[test]
    fn test_contract_address_only_serialized_when_present() {
        let plain = serde_json::to_value(sample_transaction("")).unwrap();
        assert!(plain.get("contractAddress").is_none());

        let creation = serde_json::to_value(sample_transaction(
            "0x00000000000000000000000000000000000000cc",
        ))
        .unwrap();
        assert_eq!(
            creation["contractAddress"],
            "0x00000000000000000000000000000000000000cc"
        );
        assert_eq!(creation["data"], "0x6080");
    }

    #[test]
    fn test_block_empty_extra_data_is_empty_string() {
        let block = Block {
            hash: "0x01".into(),
            number: 1,
            time: 0,
            parent_hash: "0x00".into(),
            difficulty: "0".into(),
            gas_used: 0,
            gas_limit: 30_000_000,
            nonce: "0x0000000000000000".into(),
            miner: "0x00000000000000000000000000000000000000aa".into(),
            size: 512.0,
            state_root_hash: "0x02".into(),
            uncle_hash: "0x03".into(),
            transaction_root_hash: "0x04".into(),
            receipt_root_hash: "0x05".into(),
            extra_data: vec![],
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["extraData"], "");
        assert_eq!(json["txRootHash"], "0x04");
    }
}
