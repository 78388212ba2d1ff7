//! Gas estimation and pricing for governance writes

use crate::chain::{ChainProvider, GasPrice};
use crate::error::RelayerResult;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Eip1559TransactionRequest, TransactionRequest, U256};
use tracing::debug;

/// Gas estimator for transactions
pub struct GasEstimator {
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
}

impl GasEstimator {
    /// Create a new gas estimator
    pub fn new() -> Self {
        Self {
            gas_limit_buffer_percent: 20,
            gas_price_buffer_percent: 10,
        }
    }

    /// Build a priced, gas-limited transaction ready for signing.
    ///
    /// Estimation runs the call against pending state, so a deterministic
    /// revert surfaces here with its payload and the nonce is never spent.
    pub async fn prepare(
        &self,
        provider: &ChainProvider,
        from: Address,
        to: Address,
        data: Bytes,
        nonce: u64,
    ) -> RelayerResult<TypedTransaction> {
        let gas_price = self.get_gas_price(provider).await?;

        let mut tx: TypedTransaction = match gas_price {
            GasPrice::Legacy(price) => TransactionRequest::new()
                .from(from)
                .to(to)
                .data(data)
                .nonce(nonce)
                .gas_price(price)
                .chain_id(provider.chain_id())
                .into(),
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => Eip1559TransactionRequest::new()
                .from(from)
                .to(to)
                .data(data)
                .nonce(nonce)
                .max_fee_per_gas(max_fee_per_gas)
                .max_priority_fee_per_gas(max_priority_fee_per_gas)
                .chain_id(provider.chain_id())
                .into(),
        };

        let estimate = provider.estimate_gas(&tx).await?;
        let gas_limit = self.with_limit_buffer(estimate);
        tx.set_gas(gas_limit);

        debug!(
            "Prepared tx on chain {}: nonce {}, gas limit {}, max cost {} wei",
            provider.chain_id(),
            nonce,
            gas_limit,
            Self::calculate_cost(gas_limit, &gas_price)
        );
        Ok(tx)
    }

    fn with_limit_buffer(&self, estimate: U256) -> U256 {
        estimate + estimate * self.gas_limit_buffer_percent / 100
    }

    /// Get buffered gas price for a chain
    pub async fn get_gas_price(&self, provider: &ChainProvider) -> RelayerResult<GasPrice> {
        let gas_price = provider.get_gas_price().await?;
        Ok(self.with_price_buffer(gas_price))
    }

    fn with_price_buffer(&self, gas_price: GasPrice) -> GasPrice {
        match gas_price {
            GasPrice::Legacy(price) => {
                let buffer = price * self.gas_price_buffer_percent / 100;
                GasPrice::Legacy(price + buffer)
            }
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let fee_buffer = max_fee_per_gas * self.gas_price_buffer_percent / 100;
                let priority_buffer =
                    max_priority_fee_per_gas * self.gas_price_buffer_percent / 100;
                GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee_per_gas + fee_buffer,
                    max_priority_fee_per_gas: max_priority_fee_per_gas + priority_buffer,
                }
            }
        }
    }

    /// Calculate total cost in wei
    pub fn calculate_cost(gas_limit: U256, gas_price: &GasPrice) -> U256 {
        match gas_price {
            GasPrice::Legacy(price) => gas_limit * *price,
            GasPrice::Eip1559 { max_fee_per_gas, .. } => gas_limit * *max_fee_per_gas,
        }
    }
}

impl Default for GasEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffers() {
        let estimator = GasEstimator::new();
        assert_eq!(estimator.with_limit_buffer(U256::from(100_000)), U256::from(120_000));

        match estimator.with_price_buffer(GasPrice::Eip1559 {
            max_fee_per_gas: U256::from(1_000),
            max_priority_fee_per_gas: U256::from(100),
        }) {
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                assert_eq!(max_fee_per_gas, U256::from(1_100));
                assert_eq!(max_priority_fee_per_gas, U256::from(110));
            }
            other => panic!("unexpected price {:?}", other),
        }
    }

    #[test]
    fn test_cost_uses_fee_ceiling() {
        let cost = GasEstimator::calculate_cost(
            U256::from(21_000),
            &GasPrice::Eip1559 {
                max_fee_per_gas: U256::from(10),
                max_priority_fee_per_gas: U256::from(1),
            },
        );
        assert_eq!(cost, U256::from(210_000));
    }
}
