//! Execution coordinator: drives signed plans to completion across chains

use super::dispatch::{
    ChainDispatcher, DispatchReceipt, Dispatchers, Inclusion, PlanAuthorization, Settlement,
};
use super::run::{
    ExecutionRun, FailureCode, FailureReason, NodeReceipt, NodeState, RunReport, RunState,
};
use super::signature::SignatureVerifier;
use crate::config::{ExecutorConfig, FailurePolicy};
use crate::error::{ExecutorError, ExecutorResult};
use crate::instruction::Instruction;
use crate::metrics;
use crate::monitor::{RunEvent, RunEventKind, RunSlot, RunSubscription, StatusMonitor};
use crate::planner::{BridgeStep, ExecutionPlan, FeeInstruction, NodeKind};
use crate::registry::{ChainId, ChainRegistry, FinalityPolicy, TokenId};
use crate::state::RunArchive;

use chrono::Utc;
use dashmap::DashMap;
use ethers::types::Address;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, timeout, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Coordinator tuning
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub poll_interval: Duration,
    pub finality_timeout: Duration,
    pub bridge_timeout: Duration,
    pub max_concurrent_nodes: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub failure_policy: FailurePolicy,
    pub run_retention: Duration,
    pub cleanup_interval: Duration,
}

impl From<&ExecutorConfig> for CoordinatorConfig {
    fn from(config: &ExecutorConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            finality_timeout: Duration::from_secs(config.finality_timeout_secs),
            bridge_timeout: Duration::from_secs(config.bridge_timeout_secs),
            max_concurrent_nodes: config.max_concurrent_nodes.max(1),
            max_retries: config.max_retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            failure_policy: config.failure_policy,
            run_retention: Duration::from_secs(config.run_retention_secs),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Plan of a live run with the owner's authorization for it
struct RunPlan {
    plan: ExecutionPlan,
    auth: PlanAuthorization,
}

/// Bridge transfers landing in the same balance run one at a time
type BridgeLane = (Address, ChainId, TokenId);

/// Drives execution runs; the only writer of run state
pub struct Coordinator {
    /// Chain descriptors for finality policies
    registry: Arc<ChainRegistry>,
    /// Per-chain and per-route submission services
    dispatchers: Dispatchers,
    verifier: Arc<dyn SignatureVerifier>,
    monitor: Arc<StatusMonitor>,
    archive: Arc<dyn RunArchive>,
    /// Plans of runs still held in memory
    plans: DashMap<Uuid, Arc<RunPlan>>,
    bridge_lanes: DashMap<BridgeLane, Arc<Mutex<()>>>,
    config: CoordinatorConfig,
    /// Shutdown flag
    shutdown: Arc<RwLock<bool>>,
}

impl Coordinator {
    pub fn new(
        registry: Arc<ChainRegistry>,
        dispatchers: Dispatchers,
        verifier: Arc<dyn SignatureVerifier>,
        monitor: Arc<StatusMonitor>,
        archive: Arc<dyn RunArchive>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            registry,
            dispatchers,
            verifier,
            monitor,
            archive,
            plans: DashMap::new(),
            bridge_lanes: DashMap::new(),
            config,
            shutdown: Arc::new(RwLock::new(false)),
        }
    }

    pub fn monitor(&self) -> &Arc<StatusMonitor> {
        &self.monitor
    }

    /// Verify the signature, check the plan was quoted here and register a
    /// run in Pending state
    pub async fn create_run(&self, plan: ExecutionPlan, signature: &[u8]) -> ExecutorResult<Uuid> {
        if !plan.verify_hash() {
            warn!("Plan contents do not match carried hash {:?}", plan.hash);
            return Err(ExecutorError::SignatureMismatch {
                plan_hash: format!("{:?}", plan.hash),
            });
        }
        if !self.verifier.verify(&plan, signature) {
            warn!("Signature does not verify against plan {:?}", plan.hash);
            return Err(ExecutorError::SignatureMismatch {
                plan_hash: format!("{:?}", plan.hash),
            });
        }
        self.ensure_issued(&plan).await?;
        self.validate_plan(&plan)?;

        let run = ExecutionRun::new(Uuid::new_v4(), &plan);
        let run_id = run.id;

        if let Err(e) = self.archive.store_run(&run).await {
            warn!("Failed to archive run {}: {}", run_id, e);
        }

        info!(
            "Created run {} for plan {:?} ({} nodes)",
            run_id,
            plan.hash,
            plan.nodes.len()
        );

        self.monitor.register(run);
        let auth = PlanAuthorization::new(&plan, signature);
        self.plans.insert(run_id, Arc::new(RunPlan { plan, auth }));
        metrics::set_live_runs(self.monitor.live_runs());

        Ok(run_id)
    }

    /// Start driving a created run in the background
    pub async fn start(self: &Arc<Self>, run_id: Uuid) -> ExecutorResult<()> {
        let slot = self.monitor.slot(run_id)?;

        let event = {
            let mut run = slot.run.write().await;
            match run.state {
                RunState::Pending => {}
                RunState::Cancelled => {
                    return Err(ExecutorError::InvalidStateTransition {
                        from: run.state.to_string(),
                        to: RunState::Running.to_string(),
                    })
                }
                _ => {
                    return Err(ExecutorError::RunAlreadyStarted {
                        run_id: run_id.to_string(),
                    })
                }
            }
            run.state = RunState::Running;
            run.started_at = Some(Utc::now());
            slot.publish(
                run_id,
                RunEventKind::RunStateChanged {
                    from: RunState::Pending,
                    to: RunState::Running,
                },
            )
        };
        self.record(event).await;
        metrics::record_run_started();

        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.drive(run_id, slot).await;
        });

        Ok(())
    }

    /// Create and immediately start a run
    pub async fn execute(
        self: &Arc<Self>,
        plan: ExecutionPlan,
        signature: &[u8],
    ) -> ExecutorResult<Uuid> {
        let run_id = self.create_run(plan, signature).await?;
        self.start(run_id).await?;
        Ok(run_id)
    }

    /// Cancel a run; only allowed while every node is still Pending
    pub async fn cancel(&self, run_id: Uuid) -> ExecutorResult<RunReport> {
        let slot = self.monitor.slot(run_id)?;

        let (report, event, snapshot, was_running) = {
            let mut run = slot.run.write().await;
            if run.state.is_terminal() {
                return Err(ExecutorError::CancellationRejected {
                    run_id: run_id.to_string(),
                    reason: format!("run already {}", run.state),
                });
            }
            if !run.all_pending() {
                return Err(ExecutorError::CancellationRejected {
                    run_id: run_id.to_string(),
                    reason: "nodes already submitted; funds may be in flight".to_string(),
                });
            }

            let from = run.state;
            run.state = RunState::Cancelled;
            run.finished_at = Some(Utc::now());
            let event = slot.publish(
                run_id,
                RunEventKind::RunStateChanged {
                    from,
                    to: RunState::Cancelled,
                },
            );
            (run.report(), event, run.clone(), from == RunState::Running)
        };

        self.record(event).await;
        if let Err(e) = self.archive.store_run(&snapshot).await {
            warn!("Failed to archive cancelled run {}: {}", run_id, e);
        }

        // A running driver settles the run itself once it sees the cancellation
        if !was_running {
            let finished = slot.finish(run_id, report.clone()).await;
            self.record(finished).await;
            metrics::record_run_finished(RunState::Cancelled.as_str(), 0.0);
        }

        info!("Run {} cancelled", run_id);
        Ok(report)
    }

    /// Current state of a run, live or archived
    pub async fn snapshot(&self, run_id: Uuid) -> ExecutorResult<ExecutionRun> {
        match self.monitor.snapshot(run_id).await {
            Ok(run) => Ok(run),
            Err(ExecutorError::RunNotFound { .. }) => self
                .archive
                .load_run(run_id)
                .await?
                .ok_or_else(|| ExecutorError::RunNotFound {
                    run_id: run_id.to_string(),
                }),
            Err(e) => Err(e),
        }
    }

    /// Transition stream for a run; archived runs yield only the final event
    pub async fn subscribe(&self, run_id: Uuid) -> ExecutorResult<RunSubscription> {
        match self.monitor.subscribe(run_id).await {
            Ok(subscription) => Ok(subscription),
            Err(ExecutorError::RunNotFound { .. }) => {
                let run = self
                    .archive
                    .load_run(run_id)
                    .await?
                    .filter(|run| run.state.is_terminal())
                    .ok_or_else(|| ExecutorError::RunNotFound {
                        run_id: run_id.to_string(),
                    })?;
                Ok(RunSubscription::finished(RunEvent {
                    run_id,
                    sequence: 0,
                    at: run.finished_at.unwrap_or_else(Utc::now),
                    kind: RunEventKind::RunFinished {
                        report: run.report(),
                    },
                }))
            }
            Err(e) => Err(e),
        }
    }

    /// Wait for a run to settle
    pub async fn wait(&self, run_id: Uuid) -> ExecutorResult<RunReport> {
        self.subscribe(run_id)
            .await?
            .wait()
            .await
            .ok_or_else(|| ExecutorError::Internal(format!("run {} stream closed early", run_id)))
    }

    /// Maintenance loop evicting settled runs
    pub async fn run(&self) -> ExecutorResult<()> {
        let mut cleanup_interval = interval(self.config.cleanup_interval);

        info!("Coordinator maintenance started");

        loop {
            if *self.shutdown.read().await {
                break;
            }

            cleanup_interval.tick().await;
            self.cleanup().await;
        }

        info!("Coordinator maintenance stopped");
        Ok(())
    }

    /// Stop the maintenance loop
    pub async fn stop(&self) {
        *self.shutdown.write().await = true;
        info!("Coordinator shutdown initiated");
    }

    async fn cleanup(&self) {
        let retention = chrono::Duration::from_std(self.config.run_retention)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let evicted = self.monitor.evict_settled(retention).await;
        for run_id in &evicted {
            self.plans.remove(run_id);
        }
        self.bridge_lanes.retain(|_, lane| Arc::strong_count(lane) > 1);
        if !evicted.is_empty() {
            debug!("Evicted {} settled runs", evicted.len());
        }
        metrics::set_live_runs(self.monitor.live_runs());
    }

    /// The plan must be one this executor quoted, unchanged
    async fn ensure_issued(&self, plan: &ExecutionPlan) -> ExecutorResult<()> {
        match self.archive.load_plan(plan.hash).await? {
            Some(issued) if issued == *plan => Ok(()),
            Some(_) => {
                warn!("Plan {:?} differs from the issued quote", plan.hash);
                Err(ExecutorError::PlanNotIssued {
                    plan_hash: format!("{:?}", plan.hash),
                })
            }
            None => {
                warn!("Plan {:?} was never quoted here", plan.hash);
                Err(ExecutorError::PlanNotIssued {
                    plan_hash: format!("{:?}", plan.hash),
                })
            }
        }
    }

    fn validate_plan(&self, plan: &ExecutionPlan) -> ExecutorResult<()> {
        if !plan.fee.amount.is_zero() {
            self.dispatchers.chain(plan.fee.chain_id)?;
        }
        for (index, node) in plan.nodes.iter().enumerate() {
            if node.depends_on.iter().any(|d| *d >= index) {
                return Err(ExecutorError::InvalidInstructionSet(format!(
                    "plan node {} depends on a node that does not precede it",
                    node.id
                )));
            }
            match &node.kind {
                NodeKind::Instruction(instruction) => {
                    self.registry.chain(instruction.chain_id)?;
                    self.dispatchers.chain(instruction.chain_id)?;
                }
                NodeKind::Bridge(step) => {
                    if self.registry.route(&step.route_id).is_none() {
                        return Err(ExecutorError::NoBridgeRoute {
                            from: step.source_chain,
                            to: step.destination_chain,
                            token: step.token.to_string(),
                        });
                    }
                    self.dispatchers.bridge(&step.route_id)?;
                }
            }
        }
        Ok(())
    }

    /// Schedule ready nodes until nothing is in flight or ready
    async fn drive(self: Arc<Self>, run_id: Uuid, slot: Arc<RunSlot>) {
        let plan = match self.plans.get(&run_id).map(|p| p.value().clone()) {
            Some(plan) => plan,
            None => {
                error!("Run {} has no plan", run_id);
                return;
            }
        };

        if !self.collect_fee(run_id, &slot, &plan).await {
            self.settle(run_id, &slot).await;
            return;
        }

        let permits = Arc::new(Semaphore::new(self.config.max_concurrent_nodes));
        let mut scheduled = HashSet::new();
        let mut tasks = JoinSet::new();

        loop {
            let ready = {
                let run = slot.run.read().await;
                if run.accepts_submissions(self.config.failure_policy) {
                    run.ready_nodes()
                } else {
                    Vec::new()
                }
            };

            for index in ready {
                if scheduled.contains(&index) {
                    continue;
                }
                let Ok(permit) = permits.clone().try_acquire_owned() else {
                    break;
                };
                scheduled.insert(index);

                let coordinator = self.clone();
                let slot = slot.clone();
                let plan = plan.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    coordinator.execute_node(run_id, &slot, &plan, index).await;
                });
            }

            match tasks.join_next().await {
                Some(Ok(())) => {}
                Some(Err(e)) => error!("Node task for run {} aborted: {}", run_id, e),
                None => break,
            }
        }

        self.settle(run_id, &slot).await;
    }

    /// Collect the plan's fee ahead of every node; false if the run must settle
    async fn collect_fee(&self, run_id: Uuid, slot: &RunSlot, plan: &RunPlan) -> bool {
        let fee = &plan.plan.fee;
        let started = {
            let mut run = slot.run.write().await;
            if run.fee.state == NodeState::Confirmed {
                return true;
            }
            if !run.accepts_submissions(self.config.failure_policy)
                || run.fee.state != NodeState::Pending
            {
                None
            } else {
                match fee_locked(&mut run, slot, NodeState::Submitted, None, None) {
                    Ok(events) => Some(events),
                    Err(e) => {
                        error!("Cannot collect fee of run {}: {}", run_id, e);
                        None
                    }
                }
            }
        };
        let Some(events) = started else {
            return false;
        };
        self.record_all(events).await;

        info!(
            "Collecting fee of {} {} on chain {} for run {}",
            fee.amount, fee.token, fee.chain_id, run_id
        );
        if let Err(e) = self.run_fee(slot, &plan.auth, fee).await {
            error!("Fee of run {} could not be tracked: {}", run_id, e);
        }

        slot.run.read().await.fee.state == NodeState::Confirmed
    }

    async fn run_fee(
        &self,
        slot: &RunSlot,
        auth: &PlanAuthorization,
        fee: &FeeInstruction,
    ) -> ExecutorResult<()> {
        let dispatcher = match self.dispatchers.chain(fee.chain_id) {
            Ok(dispatcher) => dispatcher,
            Err(e) => {
                return self
                    .fail_fee(slot, FailureCode::DispatchRejected, e.to_string())
                    .await
            }
        };

        let receipt = match self
            .with_retry(fee.chain_id, || dispatcher.collect_fee(auth, fee))
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                return self
                    .fail_fee(slot, FailureCode::DispatchRejected, e.to_string())
                    .await
            }
        };

        self.advance_fee(
            slot,
            NodeState::AwaitingConfirmation,
            Some(NodeReceipt::Transaction {
                chain_id: fee.chain_id,
                tx_hash: receipt.tx_hash,
                block_number: None,
            }),
        )
        .await?;

        match self.confirm(dispatcher.as_ref(), &receipt).await {
            Ok(block_number) => {
                self.advance_fee(
                    slot,
                    NodeState::Confirmed,
                    Some(NodeReceipt::Transaction {
                        chain_id: fee.chain_id,
                        tx_hash: receipt.tx_hash,
                        block_number: Some(block_number),
                    }),
                )
                .await
            }
            Err(reason) => self.fail_fee(slot, reason.code, reason.message).await,
        }
    }

    async fn execute_node(&self, run_id: Uuid, slot: &RunSlot, plan: &RunPlan, index: usize) {
        let Some(node) = plan.plan.nodes.get(index) else {
            error!("Run {} has no node {}", run_id, index);
            return;
        };

        // One transfer per destination balance; waits happen before the gate
        let _lane = match &node.kind {
            NodeKind::Bridge(step) => Some(self.bridge_lane(step).lock_owned().await),
            NodeKind::Instruction(_) => None,
        };

        // Gate: the node must still be ready and the run still accepting work
        let submitted = {
            let mut run = slot.run.write().await;
            if !run.accepts_submissions(self.config.failure_policy)
                || !run.ready_nodes().contains(&index)
            {
                None
            } else {
                match advance_locked(&mut run, slot, index, NodeState::Submitted, None, None) {
                    Ok(events) => Some(events),
                    Err(e) => {
                        error!("Cannot submit node {} of run {}: {}", node.id, run_id, e);
                        None
                    }
                }
            }
        };
        let Some(events) = submitted else {
            debug!("Node {} of run {} left pending", node.id, run_id);
            return;
        };
        self.record_all(events).await;

        info!(
            "Submitting {} node {} of run {} on chain {}",
            node.kind_label(),
            node.id,
            run_id,
            node.chain_id()
        );

        let result = match &node.kind {
            NodeKind::Instruction(instruction) => {
                self.run_instruction(slot, &plan.auth, index, instruction).await
            }
            NodeKind::Bridge(step) => self.run_bridge(slot, &plan.auth, index, step).await,
        };

        if let Err(e) = result {
            error!("Node {} of run {} could not be tracked: {}", node.id, run_id, e);
        }
    }

    fn bridge_lane(&self, step: &BridgeStep) -> Arc<Mutex<()>> {
        self.bridge_lanes
            .entry((step.recipient, step.destination_chain, step.token.clone()))
            .or_default()
            .clone()
    }

    async fn run_instruction(
        &self,
        slot: &RunSlot,
        auth: &PlanAuthorization,
        index: usize,
        instruction: &Instruction,
    ) -> ExecutorResult<()> {
        let chain_id = instruction.chain_id;
        let dispatcher = match self.dispatchers.chain(chain_id) {
            Ok(dispatcher) => dispatcher,
            Err(e) => {
                return self
                    .fail_node(slot, index, FailureCode::DispatchRejected, e.to_string())
                    .await
            }
        };

        let receipt = match self
            .with_retry(chain_id, || dispatcher.submit(auth, instruction))
            .await
        {
            Ok(receipt) => receipt,
            Err(e) => {
                return self
                    .fail_node(slot, index, FailureCode::DispatchRejected, e.to_string())
                    .await
            }
        };

        self.advance(
            slot,
            index,
            NodeState::AwaitingConfirmation,
            Some(NodeReceipt::Transaction {
                chain_id,
                tx_hash: receipt.tx_hash,
                block_number: None,
            }),
        )
        .await?;

        match self.confirm(dispatcher.as_ref(), &receipt).await {
            Ok(block_number) => {
                self.advance(
                    slot,
                    index,
                    NodeState::Confirmed,
                    Some(NodeReceipt::Transaction {
                        chain_id,
                        tx_hash: receipt.tx_hash,
                        block_number: Some(block_number),
                    }),
                )
                .await
            }
            Err(reason) => self.fail_node(slot, index, reason.code, reason.message).await,
        }
    }

    /// Wait, bounded, for the chain's finality policy, then release the receipt
    async fn confirm(
        &self,
        dispatcher: &dyn ChainDispatcher,
        receipt: &DispatchReceipt,
    ) -> Result<u64, FailureReason> {
        let finality = self
            .registry
            .chain(receipt.chain_id)
            .map(|chain| chain.finality)
            .map_err(|e| FailureReason::new(FailureCode::DispatchRejected, e.to_string()))?;

        let waited = timeout(
            self.config.finality_timeout,
            self.await_finality(dispatcher, receipt, finality),
        )
        .await;
        dispatcher.release(receipt).await;

        match waited {
            Ok(result) => result,
            Err(_) => Err(FailureReason::new(
                FailureCode::FinalityTimeout,
                format!(
                    "{} not reached within {:?}",
                    finality, self.config.finality_timeout
                ),
            )),
        }
    }

    async fn await_finality(
        &self,
        dispatcher: &dyn ChainDispatcher,
        receipt: &DispatchReceipt,
        finality: FinalityPolicy,
    ) -> Result<u64, FailureReason> {
        let mut ticker = interval(self.config.poll_interval);
        let mut included_in: Option<u64> = None;

        loop {
            ticker.tick().await;

            match dispatcher.inclusion(receipt).await {
                Ok(Inclusion::Pending) => {
                    if let Some(block) = included_in {
                        return Err(FailureReason::new(
                            FailureCode::Reorg,
                            format!(
                                "transaction {:?} dropped from block {}",
                                receipt.tx_hash, block
                            ),
                        ));
                    }
                }
                Ok(Inclusion::Included {
                    block_number,
                    head_block,
                    block_time,
                }) => {
                    included_in = Some(block_number);
                    let confirmations = head_block.saturating_sub(block_number);
                    let age = Utc::now() - block_time;
                    if finality.is_satisfied(confirmations, age) {
                        return Ok(block_number);
                    }
                    debug!(
                        "Transaction {:?} on chain {} has {} confirmations",
                        receipt.tx_hash, receipt.chain_id, confirmations
                    );
                }
                Ok(Inclusion::Reverted { reason }) => {
                    return Err(FailureReason::new(FailureCode::Reverted, reason));
                }
                Err(e @ ExecutorError::ReorgDetected { .. }) => {
                    return Err(FailureReason::new(FailureCode::Reorg, e.to_string()));
                }
                Err(e) => {
                    warn!(
                        "Inclusion check for {:?} on chain {} failed: {}",
                        receipt.tx_hash, receipt.chain_id, e
                    );
                }
            }
        }
    }

    async fn run_bridge(
        &self,
        slot: &RunSlot,
        auth: &PlanAuthorization,
        index: usize,
        step: &BridgeStep,
    ) -> ExecutorResult<()> {
        let provider = match self.dispatchers.bridge(&step.route_id) {
            Ok(provider) => provider,
            Err(e) => {
                return self
                    .fail_node(slot, index, FailureCode::DispatchRejected, e.to_string())
                    .await
            }
        };

        let transfer = match self
            .with_retry(step.source_chain, || provider.initiate(auth, step))
            .await
        {
            Ok(transfer) => transfer,
            Err(e) => {
                return self
                    .fail_node(slot, index, FailureCode::DispatchRejected, e.to_string())
                    .await
            }
        };

        self.advance(
            slot,
            index,
            NodeState::AwaitingBridge,
            Some(NodeReceipt::Bridge {
                route_id: transfer.route_id.clone(),
                transfer_id: transfer.transfer_id.clone(),
                source_tx: transfer.source_tx,
            }),
        )
        .await?;

        let waited = timeout(self.config.bridge_timeout, async {
            let mut ticker = interval(self.config.poll_interval);
            loop {
                ticker.tick().await;
                match provider.settlement(&transfer).await {
                    Ok(Settlement::InFlight) => {
                        debug!(
                            "Transfer {} on {} in flight",
                            transfer.transfer_id, transfer.route_id
                        );
                    }
                    Ok(Settlement::Settled) => return Ok(()),
                    Ok(Settlement::Failed { reason }) => return Err(reason),
                    Err(e) => warn!(
                        "Settlement check for transfer {} failed: {}",
                        transfer.transfer_id, e
                    ),
                }
            }
        })
        .await;

        match waited {
            Ok(Ok(())) => self.advance(slot, index, NodeState::Confirmed, None).await,
            Ok(Err(reason)) => {
                self.fail_node(slot, index, FailureCode::BridgeFailed, reason)
                    .await
            }
            Err(_) => {
                self.fail_node(
                    slot,
                    index,
                    FailureCode::BridgeTimeout,
                    format!(
                        "transfer {} not settled within {:?}",
                        transfer.transfer_id, self.config.bridge_timeout
                    ),
                )
                .await
            }
        }
    }

    /// Retry retryable infrastructure errors with a fixed delay
    async fn with_retry<T, F, Fut>(&self, chain_id: ChainId, mut operation: F) -> ExecutorResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ExecutorResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(
                        "Retryable error on chain {} (attempt {}/{}): {}",
                        chain_id, attempt, self.config.max_retries, e
                    );
                    metrics::record_dispatch_retry(chain_id);
                    sleep(self.config.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn advance(
        &self,
        slot: &RunSlot,
        index: usize,
        next: NodeState,
        receipt: Option<NodeReceipt>,
    ) -> ExecutorResult<()> {
        let events = {
            let mut run = slot.run.write().await;
            advance_locked(&mut run, slot, index, next, receipt, None)?
        };
        self.record_all(events).await;
        Ok(())
    }

    async fn advance_fee(
        &self,
        slot: &RunSlot,
        next: NodeState,
        receipt: Option<NodeReceipt>,
    ) -> ExecutorResult<()> {
        let events = {
            let mut run = slot.run.write().await;
            fee_locked(&mut run, slot, next, receipt, None)?
        };
        self.record_all(events).await;
        Ok(())
    }

    async fn fail_fee(
        &self,
        slot: &RunSlot,
        code: FailureCode,
        message: impl Into<String>,
    ) -> ExecutorResult<()> {
        let reason = FailureReason::new(code, message);
        let events = {
            let mut run = slot.run.write().await;
            warn!(
                "Fee of run {} failed ({}): {}",
                run.id,
                code.as_str(),
                reason.message
            );
            fee_locked(&mut run, slot, NodeState::Failed, None, Some(reason))?
        };
        self.record_all(events).await;
        Ok(())
    }

    async fn fail_node(
        &self,
        slot: &RunSlot,
        index: usize,
        code: FailureCode,
        message: impl Into<String>,
    ) -> ExecutorResult<()> {
        let reason = FailureReason::new(code, message);
        let events = {
            let mut run = slot.run.write().await;
            warn!(
                "Node {} of run {} failed ({}): {}",
                run.node(index).map(|n| n.id.as_str()).unwrap_or("?"),
                run.id,
                code.as_str(),
                reason.message
            );
            advance_locked(&mut run, slot, index, NodeState::Failed, None, Some(reason))?
        };
        self.record_all(events).await;
        Ok(())
    }

    async fn settle(&self, run_id: Uuid, slot: &RunSlot) {
        let (report, events, snapshot, duration) = {
            let mut run = slot.run.write().await;
            let final_state = if run.state == RunState::Cancelled {
                RunState::Cancelled
            } else if run.all_confirmed() {
                RunState::Confirmed
            } else {
                RunState::Failed
            };

            let mut events = Vec::new();
            if run.state != final_state {
                let from = run.state;
                run.state = final_state;
                events.push(slot.publish(
                    run_id,
                    RunEventKind::RunStateChanged {
                        from,
                        to: final_state,
                    },
                ));
            }

            let now = Utc::now();
            run.finished_at = Some(now);
            let duration = run
                .started_at
                .map(|started| (now - started).num_milliseconds() as f64 / 1000.0)
                .unwrap_or(0.0);
            (run.report(), events, run.clone(), duration)
        };

        self.record_all(events).await;
        if let Err(e) = self.archive.store_run(&snapshot).await {
            warn!("Failed to archive run {}: {}", run_id, e);
        }

        let finished = slot.finish(run_id, report.clone()).await;
        self.record(finished).await;
        metrics::record_run_finished(report.state.as_str(), duration);

        match report.state {
            RunState::Confirmed => info!(
                "Run {} confirmed: {} nodes in {:.1}s",
                run_id,
                report.confirmed.len(),
                duration
            ),
            _ => warn!(
                "Run {} {}: {} confirmed, {} failed, {} never submitted{}",
                run_id,
                report.state,
                report.confirmed.len(),
                report.failed.len(),
                report.never_submitted.len(),
                match &report.fee_failure {
                    Some(reason) => format!(", fee {}", reason.code.as_str()),
                    None => String::new(),
                }
            ),
        }
    }

    async fn record(&self, event: RunEvent) {
        if let Err(e) = self.archive.store_event(&event).await {
            warn!("Failed to archive event {} of run {}: {}", event.sequence, event.run_id, e);
        }
    }

    async fn record_all(&self, events: Vec<RunEvent>) {
        for event in events {
            self.record(event).await;
        }
    }
}

/// Apply a node transition under the run lock and publish the resulting events
fn advance_locked(
    run: &mut ExecutionRun,
    slot: &RunSlot,
    index: usize,
    next: NodeState,
    receipt: Option<NodeReceipt>,
    failure: Option<FailureReason>,
) -> ExecutorResult<Vec<RunEvent>> {
    if let Some(receipt) = receipt {
        run.set_receipt(index, receipt)?;
    }
    let from = match &failure {
        Some(reason) => run.fail(index, reason.clone())?,
        None => run.transition(index, next)?,
    };

    let node = run.node(index)?;
    let (node_id, kind, chain_id) = (node.id.clone(), node.kind.clone(), node.chain_id);
    let latency = match (node.submitted_at, node.confirmed_at) {
        (Some(submitted), Some(confirmed)) if next == NodeState::Confirmed => {
            Some((confirmed - submitted).num_milliseconds() as f64 / 1000.0)
        }
        _ => None,
    };

    metrics::record_node_transition(&kind, next.as_str());
    if let Some(latency) = latency {
        metrics::record_node_latency(&kind, chain_id, latency);
    }

    let mut events = vec![slot.publish(
        run.id,
        RunEventKind::NodeTransition {
            index,
            node: node_id,
            from,
            to: next,
            failure: failure.clone(),
        },
    )];

    if let Some(reason) = &failure {
        metrics::record_node_failure(chain_id, reason.code.as_str());
        events.extend(mark_failed_locked(run, slot));
    }

    Ok(events)
}

/// Apply a fee transition under the run lock and publish the resulting events
fn fee_locked(
    run: &mut ExecutionRun,
    slot: &RunSlot,
    next: NodeState,
    receipt: Option<NodeReceipt>,
    failure: Option<FailureReason>,
) -> ExecutorResult<Vec<RunEvent>> {
    if let Some(receipt) = receipt {
        run.fee.receipt = Some(receipt);
    }
    let from = match &failure {
        Some(reason) => run.fail_fee(reason.clone())?,
        None => run.transition_fee(next)?,
    };
    metrics::record_node_transition("fee", next.as_str());

    let mut events = vec![slot.publish(
        run.id,
        RunEventKind::FeeTransition {
            from,
            to: next,
            failure: failure.clone(),
        },
    )];

    if let Some(reason) = &failure {
        metrics::record_node_failure(run.fee.chain_id, reason.code.as_str());
        events.extend(mark_failed_locked(run, slot));
    }

    Ok(events)
}

/// First failure moves a running run to Failed
fn mark_failed_locked(run: &mut ExecutionRun, slot: &RunSlot) -> Option<RunEvent> {
    if run.state != RunState::Running {
        return None;
    }
    run.state = RunState::Failed;
    Some(slot.publish(
        run.id,
        RunEventKind::RunStateChanged {
            from: RunState::Running,
            to: RunState::Failed,
        },
    ))
}
