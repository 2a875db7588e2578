//! HTTP JSON-RPC client.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, instrument, trace};

use lantern_core::error::{ChainError, ChainResult};
use lantern_core::models::BlockPackage;
use lantern_core::ports::BlockSource;

use crate::rpc::{JsonRpcRequest, JsonRpcResponse, RpcBlock, RpcReceipt, into_package, quantity};

/// Configuration for the EVM client.
#[derive(Debug, Clone)]
pub struct EvmClientConfig {
    /// HTTP JSON-RPC URL (e.g., "http://localhost:8545").
    pub rpc_url: String,
    /// Timeout of a single RPC call.
    pub request_timeout: Duration,
    /// Timeout of establishing a connection.
    pub connect_timeout: Duration,
}

impl Default for EvmClientConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// EVM node adapter implementing the BlockSource port.
#[derive(Clone)]
pub struct EvmClient {
    http: reqwest::Client,
    rpc_url: String,
    request_id: Arc<AtomicU64>,
}

impl EvmClient {
    /// Build a client. No request is made until the first call.
    #[instrument(skip_all, fields(url = %config.rpc_url))]
    pub fn new(config: EvmClientConfig) -> ChainResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| ChainError::ConnectionFailed(e.to_string()))?;

        debug!("RPC client ready");

        Ok(Self {
            http,
            rpc_url: config.rpc_url,
            request_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Call a method. A `null` result is returned as `None`.
    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> ChainResult<Option<T>> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.request_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        trace!(method, id = request.id, "RPC call");

        let response = self
            .http
            .post(&self.rpc_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ChainError::ConnectionFailed(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ChainError::RpcError(format!(
                "{method}: HTTP {}",
                response.status()
            )));
        }

        let response: JsonRpcResponse = response
            .json()
            .await
            .map_err(|e| ChainError::MalformedResponse(format!("{method}: {e}")))?;

        if let Some(error) = response.error {
            return Err(ChainError::RpcError(format!(
                "{method}: {} (code {})",
                error.message, error.code
            )));
        }

        match response.result {
            None | Some(Value::Null) => Ok(None),
            Some(result) => serde_json::from_value(result)
                .map(Some)
                .map_err(|e| ChainError::MalformedResponse(format!("{method}: {e}"))),
        }
    }
}

#[async_trait]
impl BlockSource for EvmClient {
    async fn latest_block_number(&self) -> ChainResult<u64> {
        let head: String = self
            .call("eth_blockNumber", json!([]))
            .await?
            .ok_or_else(|| ChainError::MalformedResponse("eth_blockNumber: null".into()))?;

        quantity(&head, "eth_blockNumber")
    }

    async fn fetch_block(&self, number: u64) -> ChainResult<BlockPackage> {
        let tag = format!("0x{number:x}");

        let (block, receipts) = tokio::try_join!(
            self.call::<RpcBlock>("eth_getBlockByNumber", json!([&tag, true])),
            self.call::<Vec<RpcReceipt>>("eth_getBlockReceipts", json!([&tag])),
        )?;

        let block = block.ok_or(ChainError::BlockNotFound(number))?;
        let receipts = receipts.ok_or(ChainError::BlockNotFound(number))?;

        let package = into_package(block, receipts)?;
        trace!(
            block = number,
            transactions = package.transactions.len(),
            events = package.events.len(),
            "Block fetched"
        );
        Ok(package)
    }
}
