//! Submission services the coordinator drives: one dispatcher per chain and
//! one bridge provider per route

use crate::error::{ExecutorError, ExecutorResult};
use crate::instruction::Instruction;
use crate::planner::{BridgeStep, ExecutionPlan, FeeInstruction};
use crate::registry::ChainId;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::{Address, Bytes, H256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// The owner's signature over a plan hash
///
/// Dispatchers execute through the owner's delegated account, which checks
/// this signature before running any call of the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanAuthorization {
    pub owner: Address,
    pub plan_hash: H256,
    pub signature: Bytes,
}

impl PlanAuthorization {
    pub fn new(plan: &ExecutionPlan, signature: &[u8]) -> Self {
        Self {
            owner: plan.owner,
            plan_hash: plan.hash,
            signature: Bytes::from(signature.to_vec()),
        }
    }
}

/// Handle for a dispatched instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchReceipt {
    pub chain_id: ChainId,
    pub tx_hash: H256,
}

/// Observed inclusion status of a dispatched instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inclusion {
    /// Not (or no longer) in the canonical chain
    Pending,
    Included {
        block_number: u64,
        head_block: u64,
        block_time: DateTime<Utc>,
    },
    Reverted {
        reason: String,
    },
}

#[async_trait]
pub trait ChainDispatcher: Send + Sync {
    /// Dispatch the instruction's calls from the owner's account
    async fn submit(
        &self,
        auth: &PlanAuthorization,
        instruction: &Instruction,
    ) -> ExecutorResult<DispatchReceipt>;

    /// Move the plan's fee from the owner's account to the executor
    async fn collect_fee(
        &self,
        auth: &PlanAuthorization,
        fee: &FeeInstruction,
    ) -> ExecutorResult<DispatchReceipt>;

    async fn inclusion(&self, receipt: &DispatchReceipt) -> ExecutorResult<Inclusion>;

    /// Drop tracking state once the coordinator is done with a receipt
    async fn release(&self, _receipt: &DispatchReceipt) {}
}

/// Handle for an initiated bridge transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeTransfer {
    pub route_id: String,
    pub transfer_id: String,
    pub source_tx: Option<H256>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    InFlight,
    Settled,
    Failed { reason: String },
}

#[async_trait]
pub trait BridgeProvider: Send + Sync {
    async fn initiate(
        &self,
        auth: &PlanAuthorization,
        step: &BridgeStep,
    ) -> ExecutorResult<BridgeTransfer>;

    async fn settlement(&self, transfer: &BridgeTransfer) -> ExecutorResult<Settlement>;
}

/// Lookup of dispatch services by chain and bridge route
#[derive(Clone, Default)]
pub struct Dispatchers {
    chains: HashMap<ChainId, Arc<dyn ChainDispatcher>>,
    bridges: HashMap<String, Arc<dyn BridgeProvider>>,
}

impl Dispatchers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chain(mut self, chain_id: ChainId, dispatcher: Arc<dyn ChainDispatcher>) -> Self {
        self.chains.insert(chain_id, dispatcher);
        self
    }

    pub fn with_bridge(
        mut self,
        route_id: impl Into<String>,
        provider: Arc<dyn BridgeProvider>,
    ) -> Self {
        self.bridges.insert(route_id.into(), provider);
        self
    }

    pub fn chain(&self, chain_id: ChainId) -> ExecutorResult<Arc<dyn ChainDispatcher>> {
        self.chains
            .get(&chain_id)
            .cloned()
            .ok_or(ExecutorError::ChainNotFound { chain_id })
    }

    pub fn bridge(&self, route_id: &str) -> ExecutorResult<Arc<dyn BridgeProvider>> {
        self.bridges
            .get(route_id)
            .cloned()
            .ok_or_else(|| ExecutorError::Bridge {
                route_id: route_id.to_string(),
                message: "no provider registered for route".to_string(),
            })
    }

    pub fn chain_ids(&self) -> Vec<ChainId> {
        let mut ids: Vec<ChainId> = self.chains.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
