//! Simulated chains, bridges and stores shared by unit tests

use crate::coordination::{
    BridgeProvider, BridgeTransfer, ChainDispatcher, DispatchReceipt, ExecutionRun, Inclusion,
    PlanAuthorization, Settlement,
};
use crate::error::{ExecutorError, ExecutorResult};
use crate::instruction::{Call, Instruction, ResourceAmount};
use crate::monitor::RunEvent;
use crate::planner::{
    BalanceSource, BridgeStep, ExecutionPlan, FeeInstruction, Holdings, PriceTable,
};
use crate::registry::{
    BridgeRoute, ChainDescriptor, ChainId, ChainRegistry, FinalityPolicy, TokenId, TokenInfo,
};
use crate::state::RunArchive;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use ethers::signers::LocalWallet;
use ethers::types::{Address, H256, U256};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

pub const OPTIMISM: ChainId = 10;
pub const BASE: ChainId = 8453;
pub const ARBITRUM: ChainId = 42161;

/// Behavior and attempt key of the fee transfer on a simulated chain
pub const FEE: &str = "@fee";

const TEST_PRIVATE_KEY: &str = "0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

fn route(id: &str, from: ChainId, to: ChainId) -> BridgeRoute {
    BridgeRoute {
        id: id.to_string(),
        source_chain: from,
        destination_chain: to,
        tokens: [TokenId::from("USDC")].into_iter().collect(),
        base_fee: U256::from(1_000u64),
        fee_bps: 5,
        settlement_secs: 60,
        contract: Address::from_low_u64_be(0xb1d6e),
    }
}

/// Optimism, Base and Arbitrum with USDC everywhere; routes only between
/// Optimism and Base
pub fn registry() -> ChainRegistry {
    let finality = FinalityPolicy::Blocks { confirmations: 1 };
    ChainRegistry::new()
        .with_chain(ChainDescriptor::new(OPTIMISM, "Optimism", finality).with_fee_token("USDC"))
        .with_chain(ChainDescriptor::new(BASE, "Base", finality).with_fee_token("USDC"))
        .with_chain(ChainDescriptor::new(ARBITRUM, "Arbitrum", finality))
        .with_token(TokenInfo {
            symbol: TokenId::from("USDC"),
            decimals: 6,
            deployments: BTreeMap::from([
                (OPTIMISM, Address::from_low_u64_be(0x0a)),
                (BASE, Address::from_low_u64_be(0x2105)),
                (ARBITRUM, Address::from_low_u64_be(0xa4b1)),
            ]),
        })
        .with_route(route("op-base", OPTIMISM, BASE))
        .with_route(route("base-op", BASE, OPTIMISM))
}

pub fn prices() -> PriceTable {
    PriceTable::default()
        .with_price("ETH", 3_000_000_000)
        .with_price("USDC", 1_000_000)
}

pub fn call() -> Call {
    Call::new(Address::from_low_u64_be(0xc0ffee), vec![0xde, 0xad], 100_000)
}

pub fn usdc(amount: u64) -> ResourceAmount {
    ResourceAmount::new("USDC", amount)
}

pub fn wallet() -> LocalWallet {
    TEST_PRIVATE_KEY.parse().unwrap()
}

pub fn sign_plan(plan: &ExecutionPlan) -> Vec<u8> {
    wallet().sign_hash(plan.hash).unwrap().to_vec()
}

/// Fixed holdings
#[derive(Debug, Clone, Default)]
pub struct StaticBalances {
    holdings: Holdings,
}

impl StaticBalances {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, chain_id: ChainId, token: &str, amount: u64) -> Self {
        self.holdings = self.holdings.with(chain_id, token, amount);
        self
    }
}

#[async_trait]
impl BalanceSource for StaticBalances {
    async fn balance_of(
        &self,
        _owner: Address,
        chain_id: ChainId,
        token: &TokenId,
    ) -> ExecutorResult<U256> {
        Ok(self.holdings.get(chain_id, token))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainBehavior {
    Confirm,
    Reject,
    Revert,
    NeverInclude,
    Reorg,
    /// Fail with a retryable error this many times, then accept
    Flaky(u32),
}

/// In-memory chain that includes transactions after a fixed latency
pub struct SimulatedChain {
    chain_id: ChainId,
    latency: Duration,
    behaviors: DashMap<String, ChainBehavior>,
    attempts: DashMap<String, u32>,
    submissions: DashMap<H256, (String, Instant)>,
    released: DashMap<H256, ()>,
    counter: AtomicU64,
}

impl SimulatedChain {
    pub fn new(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            latency: Duration::ZERO,
            behaviors: DashMap::new(),
            attempts: DashMap::new(),
            submissions: DashMap::new(),
            released: DashMap::new(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Submissions the coordinator has not released yet
    pub fn unreleased(&self) -> usize {
        self.submissions
            .iter()
            .filter(|entry| !self.released.contains_key(entry.key()))
            .count()
    }

    pub fn set_behavior(&self, instruction: &str, behavior: ChainBehavior) {
        self.behaviors.insert(instruction.to_string(), behavior);
    }

    pub fn attempts(&self, instruction: &str) -> u32 {
        self.attempts.get(instruction).map(|a| *a).unwrap_or(0)
    }

    fn behavior(&self, instruction: &str) -> ChainBehavior {
        self.behaviors
            .get(instruction)
            .map(|b| *b)
            .unwrap_or(ChainBehavior::Confirm)
    }

    fn dispatch(&self, key: &str) -> ExecutorResult<DispatchReceipt> {
        let attempt = {
            let mut attempts = self.attempts.entry(key.to_string()).or_insert(0);
            *attempts += 1;
            *attempts
        };

        match self.behavior(key) {
            ChainBehavior::Reject => {
                return Err(ExecutorError::DispatchRejected {
                    chain_id: self.chain_id,
                    message: "insufficient funds for gas".to_string(),
                })
            }
            ChainBehavior::Flaky(failures) if attempt <= failures => {
                return Err(ExecutorError::ChainConnection {
                    chain_id: self.chain_id,
                    message: "connection reset".to_string(),
                })
            }
            _ => {}
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let tx_hash = H256::from_low_u64_be((self.chain_id << 32) | n);
        self.submissions
            .insert(tx_hash, (key.to_string(), Instant::now()));

        Ok(DispatchReceipt {
            chain_id: self.chain_id,
            tx_hash,
        })
    }
}

#[async_trait]
impl ChainDispatcher for SimulatedChain {
    async fn submit(
        &self,
        _auth: &PlanAuthorization,
        instruction: &Instruction,
    ) -> ExecutorResult<DispatchReceipt> {
        self.dispatch(&instruction.id)
    }

    async fn collect_fee(
        &self,
        _auth: &PlanAuthorization,
        _fee: &FeeInstruction,
    ) -> ExecutorResult<DispatchReceipt> {
        self.dispatch(FEE)
    }

    async fn inclusion(&self, receipt: &DispatchReceipt) -> ExecutorResult<Inclusion> {
        let Some((instruction, submitted_at)) =
            self.submissions.get(&receipt.tx_hash).map(|e| e.value().clone())
        else {
            return Ok(Inclusion::Pending);
        };
        if submitted_at.elapsed() < self.latency {
            return Ok(Inclusion::Pending);
        }

        match self.behavior(&instruction) {
            ChainBehavior::NeverInclude => Ok(Inclusion::Pending),
            ChainBehavior::Revert => Ok(Inclusion::Reverted {
                reason: "execution reverted".to_string(),
            }),
            ChainBehavior::Reorg => Err(ExecutorError::ReorgDetected {
                chain_id: self.chain_id,
                block_number: 100,
            }),
            _ => Ok(Inclusion::Included {
                block_number: 100,
                head_block: 101,
                block_time: Utc::now(),
            }),
        }
    }

    async fn release(&self, receipt: &DispatchReceipt) {
        self.released.insert(receipt.tx_hash, ());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeBehavior {
    Settle,
    Fail,
    Hang,
}

type Lane = (Address, ChainId, TokenId);

/// In-memory bridge keyed by the consumer each transfer funds
pub struct SimulatedBridge {
    latency: Duration,
    behaviors: DashMap<String, BridgeBehavior>,
    transfers: DashMap<String, (String, Lane, Instant)>,
    in_flight: DashMap<Lane, u32>,
    max_overlap: AtomicU32,
    counter: AtomicU64,
}

impl SimulatedBridge {
    pub fn new() -> Self {
        Self {
            latency: Duration::ZERO,
            behaviors: DashMap::new(),
            transfers: DashMap::new(),
            in_flight: DashMap::new(),
            max_overlap: AtomicU32::new(0),
            counter: AtomicU64::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_behavior(&self, consumer: &str, behavior: BridgeBehavior) {
        self.behaviors.insert(consumer.to_string(), behavior);
    }

    /// Most transfers ever in flight at once into one recipient balance
    pub fn max_overlap(&self) -> u32 {
        self.max_overlap.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BridgeProvider for SimulatedBridge {
    async fn initiate(
        &self,
        _auth: &PlanAuthorization,
        step: &BridgeStep,
    ) -> ExecutorResult<BridgeTransfer> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let transfer_id = format!("transfer-{}", n);
        let lane = (step.recipient, step.destination_chain, step.token.clone());

        let overlap = {
            let mut count = self.in_flight.entry(lane.clone()).or_insert(0);
            *count += 1;
            *count
        };
        self.max_overlap.fetch_max(overlap, Ordering::SeqCst);

        self.transfers
            .insert(transfer_id.clone(), (step.consumer.clone(), lane, Instant::now()));

        Ok(BridgeTransfer {
            route_id: step.route_id.clone(),
            transfer_id,
            source_tx: Some(H256::from_low_u64_be(n)),
        })
    }

    async fn settlement(&self, transfer: &BridgeTransfer) -> ExecutorResult<Settlement> {
        let Some((consumer, lane, initiated_at)) = self
            .transfers
            .get(&transfer.transfer_id)
            .map(|e| e.value().clone())
        else {
            return Err(ExecutorError::Bridge {
                route_id: transfer.route_id.clone(),
                message: format!("unknown transfer {}", transfer.transfer_id),
            });
        };
        if initiated_at.elapsed() < self.latency {
            return Ok(Settlement::InFlight);
        }

        let behavior = self
            .behaviors
            .get(&consumer)
            .map(|b| *b)
            .unwrap_or(BridgeBehavior::Settle);
        let settlement = match behavior {
            BridgeBehavior::Settle => Settlement::Settled,
            BridgeBehavior::Hang => return Ok(Settlement::InFlight),
            BridgeBehavior::Fail => Settlement::Failed {
                reason: "deposit refunded on source chain".to_string(),
            },
        };
        if self.transfers.remove(&transfer.transfer_id).is_some() {
            if let Some(mut count) = self.in_flight.get_mut(&lane) {
                *count = count.saturating_sub(1);
            }
        }
        Ok(settlement)
    }
}

/// Archive kept in memory
#[derive(Default)]
pub struct MemoryArchive {
    plans: DashMap<H256, ExecutionPlan>,
    runs: DashMap<Uuid, ExecutionRun>,
    events: Mutex<Vec<RunEvent>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<RunEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl RunArchive for MemoryArchive {
    async fn store_plan(&self, plan: &ExecutionPlan) -> ExecutorResult<()> {
        self.plans.insert(plan.hash, plan.clone());
        Ok(())
    }

    async fn load_plan(&self, hash: H256) -> ExecutorResult<Option<ExecutionPlan>> {
        Ok(self.plans.get(&hash).map(|p| p.value().clone()))
    }

    async fn store_run(&self, run: &ExecutionRun) -> ExecutorResult<()> {
        self.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> ExecutorResult<Option<ExecutionRun>> {
        Ok(self.runs.get(&run_id).map(|r| r.value().clone()))
    }

    async fn store_event(&self, event: &RunEvent) -> ExecutorResult<()> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}
