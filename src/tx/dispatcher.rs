//! Signs and broadcasts writes through the chain connections

use super::gas::GasEstimator;
use super::sender::{Dispatch, TxReceipt, WriteRequest};
use crate::chain::{ChainConnectionManager, EthersConnector};
use crate::config::WalletConfig;
use crate::error::{RelayerError, RelayerResult};

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, U64};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Production dispatcher: estimate, price, sign, broadcast, wait
pub struct EthersDispatcher {
    connections: Arc<ChainConnectionManager<EthersConnector>>,
    wallet: LocalWallet,
    gas_estimator: GasEstimator,
    confirmation_timeout: Duration,
}

impl EthersDispatcher {
    pub fn new(
        connections: Arc<ChainConnectionManager<EthersConnector>>,
        wallet: LocalWallet,
        confirmation_timeout: Duration,
    ) -> Self {
        Self {
            connections,
            wallet,
            gas_estimator: GasEstimator::new(),
            confirmation_timeout,
        }
    }
}

#[async_trait]
impl Dispatch for EthersDispatcher {
    async fn dispatch(
        &self,
        request: &WriteRequest,
        from: Address,
        nonce: u64,
    ) -> RelayerResult<TxReceipt> {
        let chain_id = request.chain_id;
        let provider = self.connections.connection(chain_id)?;

        let tx = self
            .gas_estimator
            .prepare(&provider, from, request.to, request.data.clone(), nonce)
            .await?;

        let wallet = self.wallet.clone().with_chain_id(chain_id);
        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| RelayerError::Wallet(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);

        let tx_hash = provider.send_raw_transaction(raw).await?;
        info!(
            "Transaction sent: {} on chain {} ({:?}, nonce {})",
            request.label, chain_id, tx_hash, nonce
        );

        // From here on the nonce is spent on chain or held by the mempool
        let receipt = provider
            .wait_for_receipt(tx_hash, self.confirmation_timeout)
            .await
            .map_err(|e| RelayerError::Unconfirmed {
                chain_id,
                tx_hash,
                message: e.to_string(),
            })?;

        if receipt.status == Some(U64::zero()) {
            return Err(RelayerError::MinedRevert {
                chain_id,
                tx_hash,
                label: request.label.to_string(),
            });
        }

        let block_number = receipt.block_number.map(|b| b.as_u64()).unwrap_or_default();
        debug!("Receipt for {:?}: block {}", tx_hash, block_number);

        Ok(TxReceipt {
            tx_hash,
            block_number,
        })
    }
}

/// Load the signing wallet from the configured environment variable
pub fn load_wallet(config: &WalletConfig) -> RelayerResult<LocalWallet> {
    let key = std::env::var(&config.private_key_env).map_err(|_| {
        RelayerError::Wallet(format!(
            "No wallet configured. Set {}",
            config.private_key_env
        ))
    })?;

    key.trim()
        .parse::<LocalWallet>()
        .map_err(|e| RelayerError::Wallet(format!("Invalid private key: {}", e)))
}
