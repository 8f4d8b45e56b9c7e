//! Chain provider with multi-RPC support and automatic failover

use crate::config::{ChainConfig, GasPriceStrategy};
use crate::error::{ExecutorError, ExecutorResult};

use ethers::abi::{self, Token};
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
    /// Last known block number
    last_block: RwLock<u64>,
}

impl ChainProvider {
    /// Create a new chain provider
    pub async fn new(config: ChainConfig) -> ExecutorResult<Self> {
        let mut http_providers = Vec::new();

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
            return Err(ExecutorError::ChainConnection {
                chain_id: config.chain_id,
                message: "No valid RPC providers".to_string(),
            });
        }

        let initial_block = http_providers[0]
            .get_block_number()
            .await
            .map(|b| b.as_u64())
            .unwrap_or(0);

        Ok(Self {
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
            last_block: RwLock::new(initial_block),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        warn!("Chain {} failover to provider {}", self.config.chain_id, next);
    }

    fn connection_error(&self, e: impl std::fmt::Display) -> ExecutorError {
        let message = e.to_string();
        if message.contains("429") || message.to_lowercase().contains("rate limit") {
            ExecutorError::RateLimited {
                chain_id: self.config.chain_id,
            }
        } else {
            ExecutorError::ChainConnection {
                chain_id: self.config.chain_id,
                message,
            }
        }
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> ExecutorResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => {
                    let block_num = block.as_u64();
                    *self.last_block.write().await = block_num;
                    return Ok(block_num);
                }
                Err(e) => {
                    warn!(
                        "Failed to get block number from chain {}: {}",
                        self.config.chain_id, e
                    );
                    self.failover();
                }
            }
        }

        Err(ExecutorError::ChainConnection {
            chain_id: self.config.chain_id,
            message: "All providers failed".to_string(),
        })
    }

    /// Last block number seen by any call
    pub async fn last_block(&self) -> u64 {
        *self.last_block.read().await
    }

    pub async fn get_block(&self, block_number: u64) -> ExecutorResult<Option<Block<H256>>> {
        self.http()
            .get_block(block_number)
            .await
            .map_err(|e| self.connection_error(e))
    }

    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> ExecutorResult<Option<TransactionReceipt>> {
        self.http()
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.connection_error(e))
    }

    /// Native balance of `owner`
    pub async fn native_balance(&self, owner: Address) -> ExecutorResult<U256> {
        self.http()
            .get_balance(owner, None)
            .await
            .map_err(|e| self.connection_error(e))
    }

    /// ERC-20 `balanceOf(owner)` via `eth_call`
    pub async fn token_balance(&self, token: Address, owner: Address) -> ExecutorResult<U256> {
        let mut data = ethers::utils::id("balanceOf(address)").to_vec();
        data.extend(abi::encode(&[Token::Address(owner)]));

        let call: TypedTransaction = TransactionRequest::new().to(token).data(data).into();
        let output = self
            .http()
            .call(&call, None)
            .await
            .map_err(|e| self.connection_error(e))?;

        if output.len() < 32 {
            return Err(ExecutorError::ChainConnection {
                chain_id: self.config.chain_id,
                message: format!("balanceOf on {:?} returned {} bytes", token, output.len()),
            });
        }
        Ok(U256::from_big_endian(&output[..32]))
    }

    pub async fn transaction_count(&self, account: Address) -> ExecutorResult<u64> {
        self.http()
            .get_transaction_count(account, Some(BlockNumber::Pending.into()))
            .await
            .map(|n| n.as_u64())
            .map_err(|e| ExecutorError::Nonce {
                chain_id: self.config.chain_id,
                message: e.to_string(),
            })
    }

    /// Broadcast a signed transaction
    ///
    /// A node that already holds the exact transaction answers with an
    /// error; that still means the broadcast landed, so the hash of the raw
    /// bytes is returned.
    pub async fn send_raw_transaction(&self, raw: Bytes) -> ExecutorResult<H256> {
        let tx_hash = H256::from(ethers::utils::keccak256(&raw));
        match self.http().send_raw_transaction(raw).await {
            Ok(pending) => Ok(pending.tx_hash()),
            Err(e) => {
                let message = e.to_string();
                if is_already_known(&message) {
                    debug!(
                        "Transaction {:?} already known on chain {}",
                        tx_hash, self.config.chain_id
                    );
                    return Ok(tx_hash);
                }
                Err(classify_send_error(self.config.chain_id, message))
            }
        }
    }

    /// Whether `tx_hash` is known to the node, pending or mined
    pub async fn has_transaction(&self, tx_hash: H256) -> ExecutorResult<bool> {
        self.http()
            .get_transaction(tx_hash)
            .await
            .map(|tx| tx.is_some())
            .map_err(|e| self.connection_error(e))
    }

    /// Get current gas price based on chain strategy
    pub async fn get_gas_price(&self) -> ExecutorResult<GasPrice> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy | GasPriceStrategy::Arbitrum => {
                let price = self
                    .http()
                    .get_gas_price()
                    .await
                    .map_err(|e| ExecutorError::GasEstimation(e.to_string()))?;
                Ok(GasPrice::Legacy(price))
            }
            GasPriceStrategy::Eip1559 | GasPriceStrategy::Optimism => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    async fn estimate_eip1559_fees(&self) -> ExecutorResult<(U256, U256)> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| ExecutorError::GasEstimation(e.to_string()))?
            .ok_or_else(|| ExecutorError::GasEstimation("No latest block".to_string()))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| ExecutorError::GasEstimation("No base fee in block".to_string()))?;

        // L2 sequencers accept far lower tips than mainnet
        let priority_fee = match self.config.gas_price_strategy {
            GasPriceStrategy::Optimism => U256::from(1_000_000u64),
            _ => U256::from(2_000_000_000u64),
        };

        let max_fee = base_fee.saturating_mul(U256::from(2u64)).saturating_add(priority_fee);

        let max_gwei = U256::from(self.config.max_gas_price_gwei) * U256::from(1_000_000_000u64);
        let max_fee = std::cmp::min(max_fee, max_gwei);

        Ok((max_fee, priority_fee.min(max_fee)))
    }

    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.chain_id, e);
                false
            }
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }
}

/// Node replies meaning the same signed transaction is already in its pool
pub(crate) fn is_already_known(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("already known")
        || lower.contains("known transaction")
        || lower.contains("already imported")
}

/// Map a node's rejection message to an error the coordinator can classify
pub(crate) fn classify_send_error(chain_id: u64, message: String) -> ExecutorError {
    let lower = message.to_lowercase();
    if lower.contains("nonce too low") {
        ExecutorError::Nonce { chain_id, message }
    } else if lower.contains("429") || lower.contains("rate limit") {
        ExecutorError::RateLimited { chain_id }
    } else if lower.contains("timed out") || lower.contains("connection") {
        ExecutorError::ChainConnection { chain_id, message }
    } else {
        ExecutorError::DispatchRejected { chain_id, message }
    }
}

/// Gas price types
#[derive(Debug, Clone, PartialEq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

impl GasPrice {
    /// Highest per-gas price the transaction may pay
    pub fn ceiling(&self) -> U256 {
        match self {
            GasPrice::Legacy(price) => *price,
            GasPrice::Eip1559 { max_fee_per_gas, .. } => *max_fee_per_gas,
        }
    }
}
