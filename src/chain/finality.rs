//! Inclusion tracking with reorg detection
//!
//! The tracker remembers the block hash each transaction was first seen in.
//! A later receipt in a different block, or no receipt at all, means the
//! block was reorganized away.

use crate::chain::ChainProvider;
use crate::coordination::Inclusion;
use crate::error::{ExecutorError, ExecutorResult};

use chrono::{DateTime, TimeZone, Utc};
use ethers::types::{TransactionReceipt, H256, U64};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Block a transaction was observed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Observed {
    block_number: u64,
    block_hash: H256,
    block_time: DateTime<Utc>,
}

/// Tracks inclusion of submitted transactions on one chain
pub struct InclusionTracker {
    chain_id: u64,
    provider: Arc<ChainProvider>,
    observed: RwLock<HashMap<H256, Observed>>,
}

impl InclusionTracker {
    pub fn new(chain_id: u64, provider: Arc<ChainProvider>) -> Self {
        Self {
            chain_id,
            provider,
            observed: RwLock::new(HashMap::new()),
        }
    }

    /// Current inclusion status of `tx_hash`
    pub async fn inclusion(&self, tx_hash: H256) -> ExecutorResult<Inclusion> {
        let receipt = self.provider.get_transaction_receipt(tx_hash).await?;
        let previous = self.observed.read().await.get(&tx_hash).copied();

        let Some(receipt) = receipt else {
            if let Some(seen) = previous {
                warn!(
                    "Reorg detected: tx {:?} no longer included on chain {}",
                    tx_hash, self.chain_id
                );
                self.observed.write().await.remove(&tx_hash);
                return Err(ExecutorError::ReorgDetected {
                    chain_id: self.chain_id,
                    block_number: seen.block_number,
                });
            }
            return Ok(Inclusion::Pending);
        };

        let (Some(block_number), Some(block_hash)) = (receipt.block_number, receipt.block_hash)
        else {
            return Ok(Inclusion::Pending);
        };
        let block_number = block_number.as_u64();

        if let Some(seen) = previous {
            if seen.block_hash != block_hash {
                warn!(
                    "Reorg detected: tx {:?} moved from block {} to {} on chain {}",
                    tx_hash, seen.block_number, block_number, self.chain_id
                );
                self.observed.write().await.remove(&tx_hash);
                return Err(ExecutorError::ReorgDetected {
                    chain_id: self.chain_id,
                    block_number: seen.block_number,
                });
            }
        }

        if is_reverted(&receipt) {
            self.observed.write().await.remove(&tx_hash);
            return Ok(Inclusion::Reverted {
                reason: format!("transaction {:?} reverted in block {}", tx_hash, block_number),
            });
        }

        let observed = match previous {
            Some(seen) => seen,
            None => {
                let block_time = self.block_time(block_number).await?;
                let seen = Observed {
                    block_number,
                    block_hash,
                    block_time,
                };
                self.observed.write().await.insert(tx_hash, seen);
                seen
            }
        };

        let head_block = self.provider.get_block_number().await?;
        debug!(
            "Transaction {:?} on chain {} in block {} (head {})",
            tx_hash, self.chain_id, block_number, head_block
        );

        Ok(Inclusion::Included {
            block_number,
            head_block,
            block_time: observed.block_time,
        })
    }

    /// Stop tracking a transaction that reached a terminal state
    pub async fn forget(&self, tx_hash: H256) {
        self.observed.write().await.remove(&tx_hash);
    }

    async fn block_time(&self, block_number: u64) -> ExecutorResult<DateTime<Utc>> {
        let block = self.provider.get_block(block_number).await?.ok_or_else(|| {
            ExecutorError::ChainConnection {
                chain_id: self.chain_id,
                message: format!("block {} not found", block_number),
            }
        })?;
        Ok(timestamp_to_datetime(block.timestamp.low_u64()))
    }
}

fn is_reverted(receipt: &TransactionReceipt) -> bool {
    receipt.status == Some(U64::zero())
}

fn timestamp_to_datetime(secs: u64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs as i64, 0)
        .single()
        .unwrap_or_else(Utc::now)
}
