//! Chain module - handles multi-chain connections
//!
//! This module provides:
//! - Multi-RPC provider management with automatic failover
//! - Inclusion tracking with reorg detection
//! - Owner balance lookups for the dependency resolver
//! - Live gas prices for quoting

pub mod finality;
pub mod provider;

pub use finality::InclusionTracker;
pub use provider::{ChainProvider, GasPrice};

use crate::config::Settings;
use crate::error::{ExecutorError, ExecutorResult};
use crate::planner::{BalanceSource, GasOracle};
use crate::registry::{ChainId, ChainRegistry, TokenId};
use crate::tx::GasEstimator;

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::{Address, U256};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

/// Manages connections to all configured chains
pub struct ChainManager {
    /// Chain providers indexed by chain ID
    providers: DashMap<u64, Arc<ChainProvider>>,
    /// Inclusion trackers indexed by chain ID
    trackers: DashMap<u64, Arc<InclusionTracker>>,
    registry: Arc<ChainRegistry>,
    gas_estimator: GasEstimator,
    /// Shutdown signal
    shutdown: Arc<RwLock<bool>>,
}

impl ChainManager {
    /// Connect to every enabled chain
    pub async fn new(settings: &Settings, registry: Arc<ChainRegistry>) -> ExecutorResult<Self> {
        let providers = DashMap::new();
        let trackers = DashMap::new();

        for (name, chain_config) in settings.enabled_chains() {
            info!(
                "Initializing chain {} (ID: {})",
                name, chain_config.chain_id
            );

            let provider = Arc::new(ChainProvider::new(chain_config.clone()).await?);
            providers.insert(chain_config.chain_id, provider.clone());
            trackers.insert(
                chain_config.chain_id,
                Arc::new(InclusionTracker::new(chain_config.chain_id, provider)),
            );

            info!("Chain {} initialized successfully", chain_config.name);
        }

        if providers.is_empty() {
            return Err(ExecutorError::Config("no chains connected".to_string()));
        }

        Ok(Self {
            providers,
            trackers,
            registry,
            gas_estimator: GasEstimator::new(),
            shutdown: Arc::new(RwLock::new(false)),
        })
    }

    pub fn get_provider(&self, chain_id: u64) -> ExecutorResult<Arc<ChainProvider>> {
        self.providers
            .get(&chain_id)
            .map(|p| p.clone())
            .ok_or(ExecutorError::ChainNotFound { chain_id })
    }

    pub fn get_tracker(&self, chain_id: u64) -> ExecutorResult<Arc<InclusionTracker>> {
        self.trackers
            .get(&chain_id)
            .map(|t| t.clone())
            .ok_or(ExecutorError::ChainNotFound { chain_id })
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<(u64, bool)> {
        let providers: Vec<Arc<ChainProvider>> =
            self.providers.iter().map(|e| e.value().clone()).collect();

        let mut results = Vec::new();
        for provider in providers {
            let chain_id = provider.chain_id();
            let healthy = provider.health_check().await;
            results.push((chain_id, healthy));

            crate::metrics::record_chain_health(chain_id, healthy);
            if healthy {
                crate::metrics::record_block_height(chain_id, provider.last_block().await);
            }
        }

        results.sort_by_key(|(chain_id, _)| *chain_id);
        results
    }

    /// Periodic health checks until stopped
    pub async fn run_health_checks(&self, period: Duration) {
        let mut ticker = interval(period);

        loop {
            ticker.tick().await;
            if *self.shutdown.read().await {
                break;
            }

            let results = self.health_check().await;
            if results.iter().all(|(_, healthy)| *healthy) {
                crate::metrics::record_health_check();
                debug!("All {} chains healthy", results.len());
            } else {
                crate::metrics::record_health_check_failure();
                for (chain_id, _) in results.iter().filter(|(_, healthy)| !healthy) {
                    warn!("Chain {} unhealthy", chain_id);
                }
            }
        }
    }

    pub fn connected_chains(&self) -> Vec<u64> {
        let mut chains: Vec<u64> = self.providers.iter().map(|e| *e.key()).collect();
        chains.sort_unstable();
        chains
    }

    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Chain manager stopped");
    }
}

#[async_trait]
impl BalanceSource for ChainManager {
    async fn balance_of(
        &self,
        owner: Address,
        chain_id: ChainId,
        token: &TokenId,
    ) -> ExecutorResult<U256> {
        let provider = self.get_provider(chain_id)?;
        let chain = self.registry.chain(chain_id)?;

        if token.as_str() == chain.native_symbol {
            return provider.native_balance(owner).await;
        }

        match self.registry.token_address(chain_id, token) {
            Some(address) => provider.token_balance(address, owner).await,
            None => Ok(U256::zero()),
        }
    }
}

#[async_trait]
impl GasOracle for ChainManager {
    async fn gas_price(&self, chain_id: ChainId) -> ExecutorResult<U256> {
        let provider = self.get_provider(chain_id)?;
        let price = self.gas_estimator.get_gas_price(&provider).await?;
        Ok(price.ceiling())
    }
}
