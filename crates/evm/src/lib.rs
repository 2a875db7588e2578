//! Ethereum JSON-RPC adapter for the lantern indexer.
//!
//! This crate implements the [`BlockSource`] port from `lantern-core` over
//! plain HTTP JSON-RPC:
//!
//! - `eth_blockNumber` for the chain head
//! - `eth_getBlockByNumber` (full transactions) and `eth_getBlockReceipts`
//!   for block contents
//!
//! Receipts are merged into transactions (status, gas used, contract
//! address) and their logs become events.
//!
//! # Usage
//!
//! ```ignore
//! use lantern_evm::{EvmClient, EvmClientConfig};
//!
//! let client = EvmClient::new(EvmClientConfig {
//!     rpc_url: "http://localhost:8545".to_string(),
//!     ..Default::default()
//! })?;
//! let head = client.latest_block_number().await?;
//! let package = client.fetch_block(head).await?;
//! ```
//!
//! [`BlockSource`]: lantern_core::ports::BlockSource

mod client;
mod rpc;

pub use client::{EvmClient, EvmClientConfig};
