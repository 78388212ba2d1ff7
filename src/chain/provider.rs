//! Chain provider with multi-RPC support and automatic failover

use super::{Connection, Connector, LogSource};
use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use ethers::prelude::*;
use futures::stream::BoxStream;
use ethers::providers::{Http, Provider, ProviderError, RpcError, Ws};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// WebSocket provider (optional, for event streaming)
    ws_provider: Option<Provider<Ws>>,
    /// Upper bound on a single request
    request_timeout: Duration,
}

impl ChainProvider {
    /// Create a new chain provider and verify it answers
    pub async fn new(config: ChainConfig, request_timeout: Duration) -> RelayerResult<Self> {
        let mut http_providers = Vec::new();

        // Initialize HTTP providers
        for url in &config.rpc_urls {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(100));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for chain {}: {}", config.chain_id, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(RelayerError::ChainConnection {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        // WebSocket is the streaming side of the connection
        let ws_provider = if let Some(ref ws_url) = config.ws_url {
            match timeout(request_timeout, Provider::<Ws>::connect(ws_url.as_str())).await {
                Ok(Ok(provider)) => {
                    info!("WebSocket connected for chain {}", config.chain_id);
                    Some(provider)
                }
                Ok(Err(e)) => {
                    return Err(RelayerError::ChainConnection {
                        chain_id: config.chain_id,
                        message: format!("WebSocket connection failed: {}", e),
                    });
                }
                Err(_) => {
                    return Err(RelayerError::Timeout {
                        operation: format!("WebSocket connect to chain {}", config.chain_id),
                    });
                }
            }
        } else {
            None
        };

        let provider = Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            ws_provider,
            request_timeout,
        };

        // Refuse to hand out a connection that cannot answer
        provider.get_block_number().await?;

        Ok(provider)
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Get WebSocket provider if available
    pub fn ws(&self) -> Option<&Provider<Ws>> {
        self.ws_provider.as_ref()
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    /// Run a request with the configured timeout
    async fn bounded<T, F>(&self, operation: &str, fut: F) -> RelayerResult<T>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        match timeout(self.request_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(map_provider_error(self.config.chain_id, e)),
            Err(_) => Err(RelayerError::Timeout {
                operation: format!("{} on chain {}", operation, self.config.chain_id),
            }),
        }
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> RelayerResult<u64> {
        let mut last_error = None;
        for _ in 0..self.http_providers.len() {
            match self.bounded("eth_blockNumber", self.http().get_block_number()).await {
                Ok(block) => return Ok(block.as_u64()),
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.config.chain_id, e
                    );
                    last_error = Some(e);
                    self.failover();
                }
            }
        }

        Err(last_error.unwrap_or(RelayerError::ChainConnection {
            chain_id: self.config.chain_id,
            message: "All providers failed".to_string(),
        }))
    }

    /// Timestamp of the latest block
    pub async fn latest_timestamp(&self) -> RelayerResult<u64> {
        let block = self
            .bounded("eth_getBlockByNumber", self.http().get_block(BlockNumber::Latest))
            .await?
            .ok_or_else(|| RelayerError::ChainConnection {
                chain_id: self.config.chain_id,
                message: "No latest block".to_string(),
            })?;
        Ok(block.timestamp.as_u64())
    }

    /// Read-only contract call against the latest block
    pub async fn call(&self, to: Address, data: Bytes) -> RelayerResult<Bytes> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        self.bounded("eth_call", self.http().call(&tx, None)).await
    }

    /// Get logs for a filter
    pub async fn get_logs(&self, filter: &Filter) -> RelayerResult<Vec<Log>> {
        let mut last_error = None;
        for _ in 0..self.http_providers.len() {
            match self.bounded("eth_getLogs", self.http().get_logs(filter)).await {
                Ok(logs) => return Ok(logs),
                Err(e) => {
                    warn!("Failed to get logs from chain {}: {}", self.config.chain_id, e);
                    last_error = Some(e);
                    self.failover();
                }
            }
        }

        Err(last_error.unwrap_or(RelayerError::ChainConnection {
            chain_id: self.config.chain_id,
            message: "All providers failed to get logs".to_string(),
        }))
    }

    /// Estimate gas for a transaction; reverts surface here before broadcast
    pub async fn estimate_gas(&self, tx: &TypedTransaction) -> RelayerResult<U256> {
        self.bounded("eth_estimateGas", self.http().estimate_gas(tx, None))
            .await
    }

    /// Pending transaction count for an address
    pub async fn transaction_count(&self, address: Address) -> RelayerResult<u64> {
        let count = self
            .bounded(
                "eth_getTransactionCount",
                self.http()
                    .get_transaction_count(address, Some(BlockNumber::Pending.into())),
            )
            .await
            .map_err(|e| RelayerError::Nonce {
                chain_id: self.config.chain_id,
                message: e.to_string(),
            })?;
        Ok(count.as_u64())
    }

    /// Broadcast a signed transaction
    pub async fn send_raw_transaction(&self, raw: Bytes) -> RelayerResult<H256> {
        let pending = self
            .bounded("eth_sendRawTransaction", self.http().send_raw_transaction(raw))
            .await?;
        Ok(pending.tx_hash())
    }

    /// Wait until a transaction has the required confirmations, bounded by `limit`
    pub async fn wait_for_receipt(
        &self,
        tx_hash: H256,
        limit: Duration,
    ) -> RelayerResult<TransactionReceipt> {
        match timeout(limit, self.poll_receipt(tx_hash)).await {
            Ok(result) => result,
            Err(_) => Err(RelayerError::Timeout {
                operation: format!(
                    "confirmation of {:?} on chain {}",
                    tx_hash, self.config.chain_id
                ),
            }),
        }
    }

    async fn poll_receipt(&self, tx_hash: H256) -> RelayerResult<TransactionReceipt> {
        let poll = Duration::from_secs(1);
        loop {
            let receipt = self
                .bounded(
                    "eth_getTransactionReceipt",
                    self.http().get_transaction_receipt(tx_hash),
                )
                .await?;

            if let Some(receipt) = receipt {
                if let Some(block) = receipt.block_number {
                    let head = self.get_block_number().await?;
                    let confirmations = head.saturating_sub(block.as_u64()) + 1;
                    if confirmations >= self.config.confirmation_blocks {
                        return Ok(receipt);
                    }
                }
            }

            tokio::time::sleep(poll).await;
        }
    }

    /// Get current gas price based on chain strategy
    pub async fn get_gas_price(&self) -> RelayerResult<GasPrice> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self
                    .bounded("eth_gasPrice", self.http().get_gas_price())
                    .await
                    .map_err(|e| RelayerError::GasEstimation(e.to_string()))?;
                Ok(GasPrice::Legacy(self.cap(price)))
            }
            GasPriceStrategy::Eip1559 => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    /// Estimate EIP-1559 fees
    async fn estimate_eip1559_fees(&self) -> RelayerResult<(U256, U256)> {
        let block = self
            .bounded("eth_getBlockByNumber", self.http().get_block(BlockNumber::Latest))
            .await
            .map_err(|e| RelayerError::GasEstimation(e.to_string()))?
            .ok_or_else(|| RelayerError::GasEstimation("No latest block".to_string()))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| RelayerError::GasEstimation("No base fee in block".to_string()))?;

        let priority_fee = U256::from(2_000_000_000u64); // 2 gwei

        // Max fee = 2 * base_fee + priority_fee (buffer for block variability)
        let max_fee = self.cap(base_fee * 2 + priority_fee);
        let priority_fee = std::cmp::min(priority_fee, max_fee);

        Ok((max_fee, priority_fee))
    }

    fn cap(&self, price: U256) -> U256 {
        let max_wei = U256::from(self.config.max_gas_price_gwei) * U256::from(1_000_000_000u64);
        std::cmp::min(price, max_wei)
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }

    /// Get chain ID
    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }
}

/// Translate a provider error, keeping revert payloads
fn map_provider_error(chain_id: u64, e: ProviderError) -> RelayerError {
    if let Some(rpc) = RpcError::as_error_response(&e) {
        if let Some(data) = rpc.as_revert_data() {
            return RelayerError::Revert {
                chain_id,
                message: rpc.message.clone(),
                data: Some(data),
            };
        }
        if rpc.message.to_lowercase().contains("revert") {
            return RelayerError::Revert {
                chain_id,
                message: rpc.message.clone(),
                data: None,
            };
        }
        return RelayerError::Transaction {
            chain_id,
            message: rpc.message.clone(),
        };
    }

    RelayerError::ChainConnection {
        chain_id,
        message: e.to_string(),
    }
}

#[async_trait]
impl Connection for ChainProvider {
    fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    async fn is_alive(&self) -> bool {
        self.health_check().await
    }
}

#[async_trait]
impl LogSource for ChainProvider {
    async fn block_number(&self) -> RelayerResult<u64> {
        self.get_block_number().await
    }

    async fn logs(&self, filter: &Filter) -> RelayerResult<Vec<Log>> {
        self.get_logs(filter).await
    }

    async fn subscribe<'a>(&'a self, filter: &'a Filter) -> RelayerResult<Option<BoxStream<'a, Log>>> {
        let ws = match self.ws() {
            Some(ws) => ws,
            None => return Ok(None),
        };
        let stream = ws
            .subscribe_logs(filter)
            .await
            .map_err(|e| RelayerError::ChainConnection {
                chain_id: self.config.chain_id,
                message: format!("log subscription failed: {}", e),
            })?;
        Ok(Some(Box::pin(stream)))
    }
}

/// Dials ethers HTTP/WebSocket providers
pub struct EthersConnector {
    request_timeout: Duration,
}

impl EthersConnector {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

#[async_trait]
impl Connector for EthersConnector {
    type Conn = ChainProvider;

    async fn connect(&self, endpoint: &ChainConfig) -> RelayerResult<Arc<ChainProvider>> {
        let provider = ChainProvider::new(endpoint.clone(), self.request_timeout).await?;
        Ok(Arc::new(provider))
    }
}

/// Gas price types
#[derive(Debug, Clone)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}
