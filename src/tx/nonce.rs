//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Lazy per-(chain, signer) base fetch from the chain
//! - Concurrent allocation of gap-free sequence numbers
//! - Out-of-order confirmation
//! - Reset after a sequencing conflict

use crate::chain::{ChainConnectionManager, EthersConnector};
use crate::error::RelayerResult;

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::Address;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Where the base nonce for a signer comes from
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NonceSource: Send + Sync {
    async fn fetch_nonce(&self, chain_id: u64, address: Address) -> RelayerResult<u64>;
}

/// Reads the pending transaction count from the chain
pub struct ProviderNonceSource {
    connections: Arc<ChainConnectionManager<EthersConnector>>,
}

impl ProviderNonceSource {
    pub fn new(connections: Arc<ChainConnectionManager<EthersConnector>>) -> Self {
        Self { connections }
    }
}

#[async_trait]
impl NonceSource for ProviderNonceSource {
    async fn fetch_nonce(&self, chain_id: u64, address: Address) -> RelayerResult<u64> {
        let provider = self.connections.connection(chain_id)?;
        provider.transaction_count(address).await
    }
}

/// Sequence state for one signer on one chain
#[derive(Debug, Default)]
struct SignerNonceState {
    /// Lowest nonce not yet confirmed
    base: u64,
    /// Handed out, not yet confirmed or released
    in_flight: BTreeSet<u64>,
    /// Confirmed above the base, waiting for the gap below to close
    confirmed_ahead: BTreeSet<u64>,
}

type SignerKey = (u64, Address);

/// Manages nonces across chains and signers
pub struct NonceManager {
    source: Arc<dyn NonceSource>,
    /// `None` until the base has been fetched
    signers: DashMap<SignerKey, Arc<Mutex<Option<SignerNonceState>>>>,
}

impl NonceManager {
    pub fn new(source: Arc<dyn NonceSource>) -> Self {
        Self {
            source,
            signers: DashMap::new(),
        }
    }

    fn slot(&self, chain_id: u64, address: Address) -> Arc<Mutex<Option<SignerNonceState>>> {
        self.signers
            .entry((chain_id, address))
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Get the next nonce and mark it in flight
    pub async fn next_nonce(&self, chain_id: u64, address: Address) -> RelayerResult<u64> {
        let slot = self.slot(chain_id, address);
        let mut guard = slot.lock().await;

        if guard.is_none() {
            let base = self.source.fetch_nonce(chain_id, address).await?;
            debug!("Fetched nonce base {} for {:?} on chain {}", base, address, chain_id);
            *guard = Some(SignerNonceState {
                base,
                ..Default::default()
            });
        }

        let state = guard.get_or_insert_with(SignerNonceState::default);

        let mut nonce = state.base;
        while state.in_flight.contains(&nonce) || state.confirmed_ahead.contains(&nonce) {
            nonce += 1;
        }
        state.in_flight.insert(nonce);

        debug!("Allocated nonce {} on chain {}", nonce, chain_id);
        Ok(nonce)
    }

    /// Mark a nonce as mined
    pub async fn confirm(&self, chain_id: u64, address: Address, nonce: u64) {
        let slot = self.slot(chain_id, address);
        let mut guard = slot.lock().await;
        let state = match guard.as_mut() {
            Some(state) => state,
            None => return,
        };

        state.in_flight.remove(&nonce);
        if nonce < state.base {
            return;
        }
        if nonce == state.base {
            state.base += 1;
            while state.confirmed_ahead.remove(&state.base) {
                state.base += 1;
            }
        } else {
            state.confirmed_ahead.insert(nonce);
        }
    }

    /// Return a nonce that was never broadcast
    pub async fn release(&self, chain_id: u64, address: Address, nonce: u64) {
        let slot = self.slot(chain_id, address);
        let mut guard = slot.lock().await;
        if let Some(state) = guard.as_mut() {
            state.in_flight.remove(&nonce);
        }
    }

    /// Discard cached state; the next allocation re-fetches from the chain
    pub async fn reset(&self, chain_id: u64, address: Address) {
        let slot = self.slot(chain_id, address);
        let mut guard = slot.lock().await;
        if guard.take().is_some() {
            warn!("Nonce state reset for {:?} on chain {}", address, chain_id);
            crate::metrics::record_nonce_reset(chain_id);
        }
    }

    /// Number of nonces currently in flight
    #[cfg(test)]
    pub async fn in_flight_count(&self, chain_id: u64, address: Address) -> usize {
        let slot = self.slot(chain_id, address);
        let guard = slot.lock().await;
        guard.as_ref().map(|s| s.in_flight.len()).unwrap_or(0)
    }
}
