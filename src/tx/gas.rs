//! Gas estimation and buffering for different chain types

use crate::chain::{ChainProvider, GasPrice};
use crate::error::ExecutorResult;

use ethers::types::U256;
use tracing::debug;

/// Gas estimator for transactions
#[derive(Debug, Clone)]
pub struct GasEstimator {
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
}

impl GasEstimator {
    pub fn new() -> Self {
        Self {
            gas_limit_buffer_percent: 20,
            gas_price_buffer_percent: 10,
        }
    }

    /// Gas limit for a transaction whose calls declare `declared` gas in total
    pub fn buffered_gas_limit(&self, declared: U256) -> U256 {
        let buffer = declared.saturating_mul(U256::from(self.gas_limit_buffer_percent)) / 100;
        declared.saturating_add(buffer)
    }

    /// Get buffered gas price for a chain
    pub async fn get_gas_price(&self, provider: &ChainProvider) -> ExecutorResult<GasPrice> {
        let gas_price = provider.get_gas_price().await?;
        let buffered = self.buffer_price(gas_price);

        debug!("Gas price for chain {}: {:?}", provider.chain_id(), buffered);
        Ok(buffered)
    }

    fn buffer_price(&self, gas_price: GasPrice) -> GasPrice {
        match gas_price {
            GasPrice::Legacy(price) => {
                GasPrice::Legacy(self.with_buffer(price))
            }
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                GasPrice::Eip1559 {
                    max_fee_per_gas: self.with_buffer(max_fee_per_gas),
                    max_priority_fee_per_gas: self.with_buffer(max_priority_fee_per_gas),
                }
            }
        }
    }

    fn with_buffer(&self, price: U256) -> U256 {
        let buffer = price.saturating_mul(U256::from(self.gas_price_buffer_percent)) / 100;
        price.saturating_add(buffer)
    }

    /// Calculate total cost in wei
    pub fn calculate_cost(gas_limit: U256, gas_price: &GasPrice) -> U256 {
        gas_limit.saturating_mul(gas_price.ceiling())
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
        assert_eq!(
            estimator.buffered_gas_limit(U256::from(100_000u64)),
            U256::from(120_000u64)
        );

        let buffered = estimator.buffer_price(GasPrice::Eip1559 {
            max_fee_per_gas: U256::from(1_000u64),
            max_priority_fee_per_gas: U256::from(100u64),
        });
        assert_eq!(
            buffered,
            GasPrice::Eip1559 {
                max_fee_per_gas: U256::from(1_100u64),
                max_priority_fee_per_gas: U256::from(110u64),
            }
        );
        assert_eq!(
            GasEstimator::calculate_cost(
                U256::from(21_000u64),
                &GasPrice::Legacy(U256::from(2u64)),
            ),
            U256::from(42_000u64)
        );
    }

    #[test]
    fn test_buffers_saturate() {
        let estimator = GasEstimator::new();
        assert_eq!(estimator.buffered_gas_limit(U256::MAX), U256::MAX);
        assert_eq!(
            estimator.buffer_price(GasPrice::Legacy(U256::MAX)),
            GasPrice::Legacy(U256::MAX)
        );
        assert_eq!(
            GasEstimator::calculate_cost(U256::MAX, &GasPrice::Legacy(U256::from(2u64))),
            U256::MAX
        );
    }
}
