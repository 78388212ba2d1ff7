//! Transaction submitter with nonce sequencing and retry logic

use super::nonce::NonceManager;
use crate::config::RelayerConfig;
use crate::error::{ErrorKind, RelayerError, RelayerResult};

use async_trait::async_trait;
use ethers::types::{Address, Bytes, H256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A contract write to issue
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub chain_id: u64,
    pub to: Address,
    pub data: Bytes,
    /// Function name, for logs and metrics
    pub label: &'static str,
}

/// A mined write
#[derive(Debug, Clone, PartialEq)]
pub struct TxReceipt {
    pub tx_hash: H256,
    pub block_number: u64,
}

/// Signs, broadcasts and waits for one write with a fixed nonce
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(
        &self,
        request: &WriteRequest,
        from: Address,
        nonce: u64,
    ) -> RelayerResult<TxReceipt>;
}

/// Issues every write for one signer through the nonce manager, retrying
/// transient failures
pub struct TransactionSubmitter {
    dispatcher: Arc<dyn Dispatch>,
    nonce_manager: Arc<NonceManager>,
    signer: Address,
    max_retries: u32,
    retry_delay: Duration,
}

impl TransactionSubmitter {
    pub fn new(
        dispatcher: Arc<dyn Dispatch>,
        nonce_manager: Arc<NonceManager>,
        signer: Address,
        config: &RelayerConfig,
    ) -> Self {
        info!("Transaction submitter initialized with wallet: {:?}", signer);
        Self {
            dispatcher,
            nonce_manager,
            signer,
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
        }
    }

    /// Get wallet address
    pub fn signer(&self) -> Address {
        self.signer
    }

    /// Submit a write, retrying up to `max_retries` times.
    ///
    /// Deterministic reverts (already done, precondition not met, reverted
    /// once mined) return immediately. A broadcast that was never confirmed
    /// is re-sent with the same nonce. Any other error is re-raised unchanged
    /// once retries are exhausted.
    pub async fn submit(&self, request: WriteRequest) -> RelayerResult<TxReceipt> {
        let chain_id = request.chain_id;
        let mut attempt = 0;
        // Nonce of a broadcast that is still unaccounted for
        let mut held = None;

        loop {
            attempt += 1;

            let nonce = match held.take() {
                Some(nonce) => nonce,
                None => self.nonce_manager.next_nonce(chain_id, self.signer).await?,
            };
            debug!(
                "Submitting {} on chain {} with nonce {} (attempt {}/{})",
                request.label, chain_id, nonce, attempt, self.max_retries
            );

            let error = match self.dispatcher.dispatch(&request, self.signer, nonce).await {
                Ok(receipt) => {
                    self.nonce_manager.confirm(chain_id, self.signer, nonce).await;
                    info!(
                        "{} mined on chain {}: {:?} (block {})",
                        request.label, chain_id, receipt.tx_hash, receipt.block_number
                    );
                    crate::metrics::record_tx_submitted(chain_id, request.label);
                    return Ok(receipt);
                }
                Err(e) => e,
            };

            match &error {
                RelayerError::MinedRevert { .. } => {
                    self.nonce_manager.confirm(chain_id, self.signer, nonce).await;
                    warn!("{} on chain {}: {}", request.label, chain_id, error);
                    crate::metrics::record_tx_failed(chain_id, request.label);
                    return Err(error);
                }
                RelayerError::Unconfirmed { .. } => held = Some(nonce),
                _ => match error.kind() {
                    ErrorKind::SequencingConflict => {
                        warn!(
                            "Sequencing conflict for {} on chain {}: {}",
                            request.label, chain_id, error
                        );
                        self.nonce_manager.reset(chain_id, self.signer).await;
                    }
                    ErrorKind::AlreadyDone | ErrorKind::Precondition => {
                        self.nonce_manager.release(chain_id, self.signer, nonce).await;
                        return Err(error);
                    }
                    _ => {
                        self.nonce_manager.release(chain_id, self.signer, nonce).await;
                    }
                },
            }

            if attempt >= self.max_retries {
                warn!(
                    "{} on chain {} failed after {} attempts: {}",
                    request.label,
                    chain_id,
                    attempt,
                    error.describe()
                );
                if held.is_some() {
                    // The broadcast may still land; re-read the sequence from the chain
                    self.nonce_manager.reset(chain_id, self.signer).await;
                }
                crate::metrics::record_tx_failed(chain_id, request.label);
                return Err(error);
            }

            warn!(
                "{} on chain {} failed (attempt {}/{}): {}",
                request.label,
                chain_id,
                attempt,
                self.max_retries,
                error.describe()
            );
            tokio::time::sleep(self.retry_delay * attempt).await;
        }
    }
}
