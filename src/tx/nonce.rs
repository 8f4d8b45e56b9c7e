//! Nonce management for reliable transaction submission
//!
//! Handles:
//! - Local nonce tracking so concurrent nodes on one chain never collide
//! - Nonce gap detection and recovery
//! - Reuse of nonces whose transaction never reached the mempool

use crate::chain::ChainProvider;
use crate::error::{ExecutorError, ExecutorResult};

use dashmap::DashMap;
use ethers::types::{Address, H256};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Per-chain nonce state
#[derive(Debug, Default)]
struct ChainNonceState {
    /// Next nonce to hand out
    current: u64,
    /// In-flight transactions: nonce -> tx_hash
    pending: DashMap<u64, H256>,
    /// Highest nonce known mined
    confirmed: Option<u64>,
}

/// Manages nonces across multiple chains
pub struct NonceManager {
    wallet_address: Address,
    chain_state: DashMap<u64, Mutex<ChainNonceState>>,
}

impl NonceManager {
    pub fn new(wallet_address: Address) -> Self {
        Self {
            wallet_address,
            chain_state: DashMap::new(),
        }
    }

    /// Initialize nonce for a chain from its pending transaction count
    pub async fn init_chain(&self, chain_id: u64, provider: &ChainProvider) -> ExecutorResult<()> {
        let on_chain_nonce = provider.transaction_count(self.wallet_address).await?;
        self.init_at(chain_id, on_chain_nonce);
        debug!("Initialized nonce for chain {}: {}", chain_id, on_chain_nonce);
        Ok(())
    }

    fn init_at(&self, chain_id: u64, next: u64) {
        let state = ChainNonceState {
            current: next,
            pending: DashMap::new(),
            confirmed: next.checked_sub(1),
        };
        self.chain_state.insert(chain_id, Mutex::new(state));
    }

    fn not_initialized(chain_id: u64) -> ExecutorError {
        ExecutorError::Nonce {
            chain_id,
            message: "Chain not initialized".to_string(),
        }
    }

    /// Get the next nonce for a chain
    pub async fn get_nonce(&self, chain_id: u64) -> ExecutorResult<u64> {
        let state = self
            .chain_state
            .get(&chain_id)
            .ok_or_else(|| Self::not_initialized(chain_id))?;

        let mut state = state.lock().await;
        let nonce = state.current;
        state.current += 1;

        debug!("Allocated nonce {} for chain {}", nonce, chain_id);
        Ok(nonce)
    }

    pub async fn mark_pending(
        &self,
        chain_id: u64,
        nonce: u64,
        tx_hash: H256,
    ) -> ExecutorResult<()> {
        let state = self
            .chain_state
            .get(&chain_id)
            .ok_or_else(|| Self::not_initialized(chain_id))?;

        let state = state.lock().await;
        state.pending.insert(nonce, tx_hash);
        Ok(())
    }

    /// Confirm the nonce used by a mined transaction
    pub async fn confirm_tx(&self, chain_id: u64, tx_hash: H256) -> ExecutorResult<()> {
        let state = self
            .chain_state
            .get(&chain_id)
            .ok_or_else(|| Self::not_initialized(chain_id))?;

        let mut state = state.lock().await;
        let nonce = state
            .pending
            .iter()
            .find(|entry| *entry.value() == tx_hash)
            .map(|entry| *entry.key());

        if let Some(nonce) = nonce {
            state.pending.remove(&nonce);
            if state.confirmed.map_or(true, |c| nonce > c) {
                state.confirmed = Some(nonce);
            }
        }
        Ok(())
    }

    /// Release a nonce whose transaction was never broadcast
    pub async fn release_nonce(&self, chain_id: u64, nonce: u64) -> ExecutorResult<()> {
        let state = self
            .chain_state
            .get(&chain_id)
            .ok_or_else(|| Self::not_initialized(chain_id))?;

        let mut state = state.lock().await;
        state.pending.remove(&nonce);

        // Only the most recent allocation can be handed out again
        if nonce + 1 == state.current {
            state.current = nonce;
        }
        Ok(())
    }

    /// Sync nonces with on-chain state
    pub async fn sync(&self, chain_id: u64, provider: &ChainProvider) -> ExecutorResult<()> {
        let on_chain_nonce = provider.transaction_count(self.wallet_address).await?;
        self.sync_to(chain_id, on_chain_nonce).await
    }

    async fn sync_to(&self, chain_id: u64, on_chain_nonce: u64) -> ExecutorResult<()> {
        let state = self
            .chain_state
            .get(&chain_id)
            .ok_or_else(|| Self::not_initialized(chain_id))?;

        let mut state = state.lock().await;

        let expected = state.confirmed.map_or(0, |c| c + 1);
        if on_chain_nonce > expected {
            warn!(
                "Nonce gap detected on chain {}: expected {}, got {}",
                chain_id, expected, on_chain_nonce
            );
        }

        let mined: Vec<u64> = state
            .pending
            .iter()
            .filter(|entry| *entry.key() < on_chain_nonce)
            .map(|entry| *entry.key())
            .collect();
        for nonce in mined {
            state.pending.remove(&nonce);
        }

        state.confirmed = on_chain_nonce.checked_sub(1);
        if state.current < on_chain_nonce {
            state.current = on_chain_nonce;
        }

        Ok(())
    }

    pub async fn pending_count(&self, chain_id: u64) -> usize {
        match self.chain_state.get(&chain_id) {
            Some(state) => state.lock().await.pending.len(),
            None => 0,
        }
    }
}
