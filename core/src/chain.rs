use std::time::Duration;

use alloy::primitives::{Address, B256, Bytes, U64, U128};
use alloy::rpc::client::RpcClient;
use alloy::transports::http::reqwest::Url;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AlloyRpcErrorToOrchestratorError, OrchestratorError};

/// A chain registered with the orchestration API, including the listener
/// cursor that is persisted back through `update_chain_head`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chain {
    pub uuid: Uuid,
    pub name: String,
    pub tenant_id: String,
    pub chain_id: u64,
    /// JSON-RPC proxy URL for this chain.
    pub proxy_url: String,
    pub listener_current_block: u64,
    /// Finality depth applied before a block is treated as settled.
    pub listener_depth: u64,
    /// Poll interval for the block and pending-job loops.
    pub listener_backoff: Duration,
    /// Observe transactions not originated by this engine via the block feed.
    pub listener_external_tx_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    /// Event name resolved from the contract catalog, best effort.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decoded_event: Option<String>,
}

/// Chain confirmation record for a transaction. Private-receipt variants may
/// carry a `decode_error` while still counting as mined.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub tx_hash: B256,
    pub status: bool,
    pub block_number: u64,
    pub block_hash: B256,
    pub gas_used: u64,
    pub effective_gas_price: Option<u128>,
    pub contract_address: Option<Address>,
    pub logs: Vec<LogEntry>,
    pub revert_reason: Option<String>,
    pub decode_error: Option<String>,
}

/// Minimal view of a block: enough to drive mined-transaction detection.
#[derive(Debug, Clone)]
pub struct BlockSummary {
    pub number: u64,
    pub hash: B256,
    pub tx_hashes: Vec<B256>,
}

/// Capability interface over a chain's JSON-RPC endpoint. The engine only
/// ever performs these calls; dialect-specific payload construction stays
/// with the API layer.
pub trait ChainClient: Send + Sync {
    fn pending_nonce(
        &self,
        account: Address,
    ) -> impl Future<Output = Result<u64, OrchestratorError>> + Send;

    fn send_raw_transaction(
        &self,
        raw: Bytes,
    ) -> impl Future<Output = Result<B256, OrchestratorError>> + Send;

    fn transaction_receipt(
        &self,
        hash: B256,
    ) -> impl Future<Output = Result<Option<Receipt>, OrchestratorError>> + Send;

    fn private_transaction_receipt(
        &self,
        hash: B256,
    ) -> impl Future<Output = Result<Option<Receipt>, OrchestratorError>> + Send;

    fn gas_price(&self) -> impl Future<Output = Result<u128, OrchestratorError>> + Send;

    fn max_priority_fee_per_gas(
        &self,
    ) -> impl Future<Output = Result<u128, OrchestratorError>> + Send;

    fn block_number(&self) -> impl Future<Output = Result<u64, OrchestratorError>> + Send;

    fn block_by_number(
        &self,
        number: u64,
    ) -> impl Future<Output = Result<Option<BlockSummary>, OrchestratorError>> + Send;

    fn code_at(
        &self,
        address: Address,
    ) -> impl Future<Output = Result<Bytes, OrchestratorError>> + Send;
}

/// Resolves a registered chain to a ready client.
pub trait ChainService: Send + Sync {
    type Client: ChainClient + Clone + Send + Sync + 'static;

    fn get_client(&self, chain: &Chain) -> Result<Self::Client, OrchestratorError>;
}

// Wire structs: alloy primitives deserialize hex quantities natively, so the
// receipt shape stays independent of any rpc-types version.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLog {
    address: Address,
    topics: Vec<B256>,
    data: Bytes,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    transaction_hash: B256,
    status: Option<U64>,
    block_number: Option<U64>,
    block_hash: Option<B256>,
    gas_used: U64,
    effective_gas_price: Option<U128>,
    contract_address: Option<Address>,
    #[serde(default)]
    logs: Vec<RawLog>,
    revert_reason: Option<String>,
}

impl RawReceipt {
    fn into_receipt(self, decode_error: Option<String>) -> Receipt {
        Receipt {
            tx_hash: self.transaction_hash,
            // Pre-Byzantium receipts carry no status field; absence is not a
            // failure signal.
            status: self.status.map(|s| s == U64::from(1)).unwrap_or(true),
            block_number: self.block_number.unwrap_or_default().to::<u64>(),
            block_hash: self.block_hash.unwrap_or_default(),
            gas_used: self.gas_used.to::<u64>(),
            effective_gas_price: self.effective_gas_price.map(|p| p.to::<u128>()),
            contract_address: self.contract_address,
            logs: self
                .logs
                .into_iter()
                .map(|log| LogEntry {
                    address: log.address,
                    topics: log.topics,
                    data: log.data,
                    decoded_event: None,
                })
                .collect(),
            revert_reason: self.revert_reason,
            decode_error,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBlock {
    number: U64,
    hash: B256,
    #[serde(default)]
    transactions: Vec<B256>,
}

/// JSON-RPC client over a registered chain's proxy URL.
#[derive(Clone)]
pub struct HttpChainClient {
    client: RpcClient,
    chain_id: u64,
    rpc_url: String,
}

impl HttpChainClient {
    pub fn new(chain: &Chain) -> Result<Self, OrchestratorError> {
        let url: Url =
            chain
                .proxy_url
                .parse()
                .map_err(|e| OrchestratorError::ValidationError {
                    message: format!("invalid proxy URL for chain {}: {e}", chain.uuid),
                })?;

        Ok(Self {
            client: RpcClient::builder().http(url),
            chain_id: chain.chain_id,
            rpc_url: chain.proxy_url.clone(),
        })
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn map_err(
        &self,
        err: alloy::transports::RpcError<alloy::transports::TransportErrorKind>,
    ) -> OrchestratorError {
        err.to_orchestrator_error(self.chain_id, &self.rpc_url)
    }
}

impl ChainClient for HttpChainClient {
    async fn pending_nonce(&self, account: Address) -> Result<u64, OrchestratorError> {
        let count: U64 = self
            .client
            .request("eth_getTransactionCount", (account, "pending"))
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(count.to::<u64>())
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256, OrchestratorError> {
        self.client
            .request("eth_sendRawTransaction", (raw,))
            .await
            .map_err(|e| self.map_err(e))
    }

    async fn transaction_receipt(
        &self,
        hash: B256,
    ) -> Result<Option<Receipt>, OrchestratorError> {
        let raw: Option<RawReceipt> = self
            .client
            .request("eth_getTransactionReceipt", (hash,))
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(raw.map(|r| r.into_receipt(None)))
    }

    async fn private_transaction_receipt(
        &self,
        hash: B256,
    ) -> Result<Option<Receipt>, OrchestratorError> {
        let value: Option<serde_json::Value> = self
            .client
            .request("priv_getTransactionReceipt", (hash,))
            .await
            .map_err(|e| self.map_err(e))?;

        let Some(mut value) = value else {
            return Ok(None);
        };

        // The private payload output can fail to decode even though the
        // marking transaction is mined; carry the error instead of aborting.
        let output = value
            .as_object_mut()
            .and_then(|obj| obj.remove("output"));
        let decode_error = match output {
            Some(out) if !out.is_null() => serde_json::from_value::<Bytes>(out)
                .err()
                .map(|e| format!("invalid private payload output: {e}")),
            _ => None,
        };
        if let Some(err) = &decode_error {
            tracing::debug!(%hash, error = %err, "private receipt payload failed to decode");
        }

        let raw: RawReceipt = serde_json::from_value(value)?;
        Ok(Some(raw.into_receipt(decode_error)))
    }

    async fn gas_price(&self) -> Result<u128, OrchestratorError> {
        let price: U128 = self
            .client
            .request_noparams("eth_gasPrice")
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(price.to::<u128>())
    }

    async fn max_priority_fee_per_gas(&self) -> Result<u128, OrchestratorError> {
        let tip: U128 = self
            .client
            .request_noparams("eth_maxPriorityFeePerGas")
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(tip.to::<u128>())
    }

    async fn block_number(&self) -> Result<u64, OrchestratorError> {
        let number: U64 = self
            .client
            .request_noparams("eth_blockNumber")
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(number.to::<u64>())
    }

    async fn block_by_number(
        &self,
        number: u64,
    ) -> Result<Option<BlockSummary>, OrchestratorError> {
        let raw: Option<RawBlock> = self
            .client
            .request("eth_getBlockByNumber", (U64::from(number), false))
            .await
            .map_err(|e| self.map_err(e))?;
        Ok(raw.map(|block| BlockSummary {
            number: block.number.to::<u64>(),
            hash: block.hash,
            tx_hashes: block.transactions,
        }))
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, OrchestratorError> {
        self.client
            .request("eth_getCode", (address, "latest"))
            .await
            .map_err(|e| self.map_err(e))
    }
}

/// Default service handing out `HttpChainClient`s over each chain's proxy.
#[derive(Debug, Clone, Default)]
pub struct HttpChainService;

impl ChainService for HttpChainService {
    type Client = HttpChainClient;

    fn get_client(&self, chain: &Chain) -> Result<Self::Client, OrchestratorError> {
        HttpChainClient::new(chain)
    }
}
